use nalgebra::DVector;

/// Sentinel for values outside the range the minimizers reason about.
///
/// Anything at or beyond this magnitude is treated as divergent.
pub const HUGE_VALUE: f64 = 1.0e50;

/// Clamp an objective value so the minimizers never see `NaN`.
///
/// Anything that is not strictly below `$+\infty$` (including `NaN`)
/// becomes `$+\infty$`. The derivative-free minimizers apply this to every
/// evaluation; gradient-based callers should apply it themselves if their
/// objective can misbehave.
pub fn clip_value(f: f64) -> f64 {
    if !(f < f64::INFINITY) {
        f64::INFINITY
    } else {
        f
    }
}

/// Quadratic penalty for folding `$x \geq 0$` constraints into an objective.
///
/// Zero for feasible `$x$`, `$x^2$` otherwise. See also [`dpenalty`].
pub fn penalty(x: f64) -> f64 {
    if x >= 0.0 {
        0.0
    } else {
        x * x
    }
}

/// Derivative of [`penalty`].
pub fn dpenalty(x: f64) -> f64 {
    if x >= 0.0 {
        0.0
    } else {
        2.0 * x
    }
}

/// A scalar objective function over an n-dimensional parameter vector.
///
/// This is what every minimizer in this crate consumes. The receiver is
/// mutable so implementations can cache work or draw from their own
/// random state; the minimizers never retain the objective beyond the
/// `minimize` call.
///
/// Implementations must be total: clamp diverging or undefined values with
/// [`clip_value`](crate::clip_value) rather than returning `NaN`.
pub trait Objective {
    /// Evaluate `$f(\vec{x})$`.
    fn evaluate(&mut self, params: &DVector<f64>) -> f64;
}

/// An [`Objective`] with an exact gradient, as required by
/// [`ConjugateGradient`](crate::ConjugateGradient).
///
/// Use [`differentiate_numerically`](crate::differentiate_numerically) in
/// tests to check an implementation against central differences.
pub trait Gradient: Objective {
    /// Write `$\nabla f(\vec{x})$` into `grad`.
    fn gradient(&mut self, grad: &mut DVector<f64>, params: &DVector<f64>);
}

/// A noisy objective sampled by index, as consumed by
/// [`NoisyConjugateDirection`](crate::NoisyConjugateDirection).
///
/// The minimizer passes a monotonically increasing sample index with every
/// evaluation. Implementations that key their randomness off the index get
/// deterministic replay of any given sample.
pub trait SequencedObjective {
    /// Evaluate one noisy sample of `$f(\vec{x})$`.
    fn evaluate_at(&mut self, params: &DVector<f64>, sample: i64) -> f64;
}

impl<F> Objective for F
where
    F: FnMut(&DVector<f64>) -> f64,
{
    fn evaluate(&mut self, params: &DVector<f64>) -> f64 {
        self(params)
    }
}

impl<F> SequencedObjective for F
where
    F: FnMut(&DVector<f64>, i64) -> f64,
{
    fn evaluate_at(&mut self, params: &DVector<f64>, sample: i64) -> f64 {
        self(params, sample)
    }
}
