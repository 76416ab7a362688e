//! Line-search based unconstrained minimization using [nalgebra](https://nalgebra.org).
//!
//! This crate solves
//! ```math
//! \min_{\vec{x}\in\R^n} f(\vec{x})
//! ```
//! for a caller-supplied objective `$f\!:\R^n\to\R$` with three related
//! local methods:
//!
//! - [`ConjugateGradient`]: Polak-Ribiere conjugate gradient for objectives
//!   with an exact gradient. Once consecutive line searches behave
//!   quadratically it switches to a gradient-only stepping mode that avoids
//!   function evaluations entirely.
//! - [`ConjugateDirection`]: a Powell-style derivative-free method. Sweeps
//!   coordinate directions plus accumulated "acceleration" directions,
//!   warm-starting each one-dimensional search with the step width and
//!   curvature remembered from the previous sweep.
//! - [`NoisyConjugateDirection`]: a derivative-free method for objectives
//!   whose evaluations carry random noise (Monte-Carlo likelihoods and the
//!   like). Each probe regresses a local quadratic over many samples,
//!   separates random from systematic error, and adapts both the sampling
//!   width and the global sample count to the measured signal/noise ratio.
//!
//! The shared machinery is public as well: the one-dimensional
//! bracket-and-refine minimizer ([`LineSearch`], [`minimize_scalar`]), the
//! local parabola/cubic fits ([`fit_parabola_3p`] and friends), and the
//! permutation-pivoted Gauss-Jordan inversion ([`invert_in_place`],
//! [`least_squares_inverse`]) used by the noise regression, and the
//! [`linalg`] vector kernels the inner loops run on.
//!
//! # Usage Example
//!
//! ```
//! use conjmin::{ConjugateGradient, Gradient, Objective, Status};
//! use nalgebra::{dvector, DVector};
//!
//! struct Quadratic;
//!
//! impl Objective for Quadratic {
//!     fn evaluate(&mut self, p: &DVector<f64>) -> f64 {
//!         (p[0] - 1.0).powi(2) + 10.0 * (p[1] - 2.0).powi(2)
//!     }
//! }
//!
//! impl Gradient for Quadratic {
//!     fn gradient(&mut self, grad: &mut DVector<f64>, p: &DVector<f64>) {
//!         grad[0] = 2.0 * (p[0] - 1.0);
//!         grad[1] = 20.0 * (p[1] - 2.0);
//!     }
//! }
//!
//! let mut x = dvector![0.0, 0.0];
//! let report = ConjugateGradient::new().minimize(&mut x, &mut Quadratic);
//! assert_eq!(report.status, Status::Success);
//! assert!((x[0] - 1.0).abs() < 1e-4);
//! assert!((x[1] - 2.0).abs() < 1e-4);
//! ```
//!
//! Derivative-free methods accept plain closures:
//!
//! ```
//! use conjmin::ConjugateDirection;
//! use nalgebra::{dvector, DVector};
//!
//! let mut x = dvector![5.0, 5.0];
//! let mut f = |p: &DVector<f64>| (p[0] - 1.0).powi(2) + 10.0 * (p[1] - 2.0).powi(2);
//! let report = ConjugateDirection::new().minimize(&mut x, &mut f);
//! assert!(report.objective_function < 1e-3);
//! ```
//!
//! # Error model
//!
//! A run always ends with one of four [`Status`] values. Degenerate local
//! fits and singular regression matrices are handled internally by falling
//! back to slower, more robust strategies; they never abort a run. The
//! objective must be total; clamp diverging or undefined values with
//! [`clip_value`] before returning them (see the [`Objective`] contract).

mod bracket;
mod cg;
mod fit;
mod inverse;
pub mod linalg;
mod noisy;
mod powell;
mod problem;
mod utils;

pub use bracket::{minimize_scalar, LineMinimum, LinePoint, LineSearch};
pub use cg::ConjugateGradient;
pub use fit::{
    eval_poly, fit_cubic_2p2d, fit_parabola_2d, fit_parabola_2pa, fit_parabola_2pd,
    fit_parabola_3p, fit_traditional_parabola_2pa, parabola_from_traditional, Parabola,
};
pub use inverse::{invert_in_place, least_squares_inverse};
pub use noisy::{CoordSettings, NoisyConjugateDirection};
pub use powell::ConjugateDirection;
pub use problem::{clip_value, dpenalty, penalty, Gradient, Objective, SequencedObjective, HUGE_VALUE};
pub use utils::differentiate_numerically;

/// Outcome of a minimization run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// A strict local convergence test passed.
    Success,
    /// The budget or a cooperative stop ended the run first; the returned
    /// point is still the best one seen.
    Suboptimal,
    /// A matrix or local fit was degenerate with no fallback left.
    Singular,
    /// The objective diverges to `$-\infty$` or the minimizing `$x$` ran
    /// out of representable range.
    Unbounded,
}

/// Error tag for degenerate fit and inversion primitives.
///
/// Always recoverable: callers answer it with a slower fallback strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Singular;

/// Information about a minimization run.
#[derive(Clone, Copy, Debug)]
pub struct MinimizationReport {
    pub status: Status,
    /// Number of objective evaluations consumed by the run.
    pub number_of_evaluations: usize,
    /// Contains the value of `$f(\vec{x})$` at the returned point.
    pub objective_function: f64,
}
