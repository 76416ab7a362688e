//! Powell-style conjugate-direction minimization without derivatives.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::bracket::{fract_diff, LinePoint, LineSearch};
use crate::fit::{fit_parabola_2pa, fit_parabola_3p};
use crate::linalg::{add_scaled, combine, copy, zero};
use crate::problem::{clip_value, Objective, HUGE_VALUE};
use crate::{MinimizationReport, Status};

/// Largest trusted ratio between a warm-started parabola vertex and the
/// remembered step width.
const MAX_EXPAND: f64 = 100.0;
/// Remembered step widths never contract by more than this per sweep.
const MIN_CONTRACT: f64 = 1.0 / 10.0;

const FULL_SEARCH_PATIENCE: usize = 1;
const FULL_SEARCH_PROBES: usize = 20;

fn is_valid_number(x: f64) -> bool {
    -HUGE_VALUE < x && x < HUGE_VALUE
}

fn too_close(x1: f64, x2: f64, sqrt_tolerance: f64) -> bool {
    if x2 == 0.0 && x1.abs() < sqrt_tolerance {
        true
    } else if x1 == 0.0 && x2.abs() < sqrt_tolerance {
        true
    } else if x1.signum() == x2.signum() && fract_diff(x1, x2) < sqrt_tolerance {
        true
    } else {
        (x1 - x2).abs() < sqrt_tolerance
    }
}

/// Warm-start state a search direction carries from sweep to sweep.
#[derive(Clone, Copy, Debug)]
struct DirectionState {
    /// Remembered step width (vertex offset of the last search).
    x0: f64,
    /// Curvature of the last accepted parabola fit, 0 when unknown.
    a: f64,
}

/// Derivative-free conjugate-direction minimizer for an [`Objective`].
///
/// Each sweep line-minimizes along every remembered acceleration direction
/// and then along every coordinate direction, warm-starting each
/// one-dimensional search with the step width and curvature remembered
/// from the previous sweep (for a quadratic objective the curvature along
/// a fixed direction is constant, so two samples often suffice). The net
/// displacement of the sweep becomes a new acceleration direction, pushed
/// to the front of a list with capacity `$n$`; the oldest is evicted when
/// full.
///
/// Probe placement is jittered from a seeded generator, so runs are
/// deterministic for a fixed seed. A sweep that leaves the objective value
/// unchanged ends the run with [`Status::Success`].
#[derive(Clone, Debug)]
pub struct ConjugateDirection {
    max_function_calls: Option<usize>,
    max_iterations: Option<usize>,
    initial_steps: Option<DVector<f64>>,
    seed: u64,
    stop_flag: Option<Arc<AtomicBool>>,
}

impl Default for ConjugateDirection {
    fn default() -> Self {
        Self::new()
    }
}

impl ConjugateDirection {
    pub fn new() -> Self {
        Self {
            max_function_calls: None,
            max_iterations: None,
            initial_steps: None,
            seed: 0,
            stop_flag: None,
        }
    }

    /// Stop with [`Status::Suboptimal`] once more than this many objective
    /// evaluations have been spent.
    ///
    /// Checked after each line search, so the actual count can overshoot
    /// by one search's worth of probes.
    ///
    /// # Panics
    ///
    /// Panics if `max_function_calls == 0`.
    pub fn with_max_function_calls(self, max_function_calls: usize) -> Self {
        assert!(max_function_calls > 0, "max_function_calls must be > 0");
        Self {
            max_function_calls: Some(max_function_calls),
            ..self
        }
    }

    /// Stop with [`Status::Suboptimal`] after this many full sweeps.
    ///
    /// # Panics
    ///
    /// Panics if `max_iterations == 0`.
    pub fn with_max_iterations(self, max_iterations: usize) -> Self {
        assert!(max_iterations > 0, "max_iterations must be > 0");
        Self {
            max_iterations: Some(max_iterations),
            ..self
        }
    }

    /// Initial per-coordinate step widths.
    ///
    /// Defaults to 1 for every coordinate. Pass the expected distance to
    /// the minimum per coordinate when scales differ wildly.
    pub fn with_initial_steps(self, initial_steps: DVector<f64>) -> Self {
        Self {
            initial_steps: Some(initial_steps),
            ..self
        }
    }

    /// Seed for the probe-placement jitter. Defaults to 0.
    pub fn with_seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }

    /// Stop cooperatively when another thread sets the flag.
    pub fn with_stop_flag(self, stop_flag: Arc<AtomicBool>) -> Self {
        Self {
            stop_flag: Some(stop_flag),
            ..self
        }
    }

    fn out_of_budget(&self, calls: usize) -> bool {
        if let Some(max) = self.max_function_calls {
            if calls > max {
                return true;
            }
        }
        match &self.stop_flag {
            Some(flag) => flag.load(Ordering::Relaxed),
            None => false,
        }
    }

    /// Minimize `target` starting from `x`, overwriting `x` with the best
    /// point found.
    ///
    /// # Panics
    ///
    /// Panics if initial steps were given with a length other than
    /// `x.len()`.
    pub fn minimize<O: Objective>(
        &self,
        x: &mut DVector<f64>,
        target: &mut O,
    ) -> MinimizationReport {
        let n = x.len();
        let mut rng = SmallRng::seed_from_u64(self.seed);

        let mut coord_states: Vec<DirectionState> = match &self.initial_steps {
            Some(steps) => {
                assert_eq!(steps.len(), n, "initial steps must match dimension");
                steps
                    .iter()
                    .map(|&x0| DirectionState { x0, a: 0.0 })
                    .collect()
            }
            None => vec![DirectionState { x0: 0.0, a: 0.0 }; n],
        };

        // acceleration directions, newest first
        let mut accel: VecDeque<(DVector<f64>, DirectionState)> = VecDeque::with_capacity(n);

        let mut coord_direction = DVector::zeros(n);
        let mut old_x = DVector::zeros(n);
        let mut probe = DVector::zeros(n);

        let mut calls = 1usize;
        let mut val = clip_value(target.evaluate(x));

        let report = |status: Status, calls: usize, val: f64| MinimizationReport {
            status,
            number_of_evaluations: calls,
            objective_function: val,
        };

        let mut iteration = 0usize;
        loop {
            let old_val = val;
            copy(&mut old_x, x);
            let mut width_sum = 0.0;

            for entry in accel.iter_mut() {
                let (ref direction, ref mut state) = *entry;
                let (step, width) = line_minimize(
                    x,
                    direction,
                    &mut val,
                    state,
                    target,
                    &mut calls,
                    &mut rng,
                    &mut probe,
                );
                if step != 0.0 {
                    width_sum += step.abs() / width;
                }
                if self.out_of_budget(calls) {
                    return report(Status::Suboptimal, calls, val);
                }
            }

            for i in 0..n {
                zero(&mut coord_direction);
                coord_direction[i] = 1.0;
                let (step, width) = line_minimize(
                    x,
                    &coord_direction,
                    &mut val,
                    &mut coord_states[i],
                    target,
                    &mut calls,
                    &mut rng,
                    &mut probe,
                );
                if step != 0.0 {
                    width_sum += step.abs() / width;
                }
                if self.out_of_budget(calls) {
                    return report(Status::Suboptimal, calls, val);
                }
            }

            if val >= old_val {
                debug_assert!(val == old_val);
                return report(Status::Success, calls, val);
            }

            // the sweep's net displacement becomes a new acceleration
            // direction, sized from how far the sweep moved relative to
            // the widths it searched with
            let new_x0 = if width_sum > 0.0 && width_sum.is_finite() {
                1.0 / width_sum
            } else {
                1.0
            };
            let evicted = if accel.len() == n { accel.pop_back() } else { None };
            let mut new_direction = match evicted {
                Some((v, _)) => v,
                None => DVector::zeros(n),
            };
            combine(&mut new_direction, x, 1.0, &old_x, -1.0);
            accel.push_front((new_direction, DirectionState { x0: new_x0, a: 0.0 }));

            iteration += 1;
            if let Some(max) = self.max_iterations {
                if iteration >= max {
                    return report(Status::Suboptimal, calls, val);
                }
            }
        }
    }
}

/// One warm-started line search along `direction`.
///
/// Updates `val_min`, moves `x` when the search improved on it, and
/// refreshes the direction's remembered width and curvature. Returns the
/// applied step and the width the search probed with, for the sweep's
/// width bookkeeping.
#[allow(clippy::too_many_arguments)]
fn line_minimize<O: Objective>(
    x: &mut DVector<f64>,
    direction: &DVector<f64>,
    val_min: &mut f64,
    state: &mut DirectionState,
    target: &mut O,
    calls: &mut usize,
    rng: &mut SmallRng,
    probe: &mut DVector<f64>,
) -> (f64, f64) {
    let sqrt_tolerance = f64::EPSILON.sqrt();

    let saved_x0 = state.x0;
    let old_a = state.a;
    let mut old_x0 = saved_x0;
    if old_x0 == 0.0 {
        old_x0 = 1.0;
    }

    let mut memo: Option<(f64, f64)> = None;
    let base = &*x;
    let mut line_f = |step: f64, target: &mut O, calls: &mut usize, probe: &mut DVector<f64>| {
        if let Some((memo_x, memo_f)) = memo {
            if step == memo_x {
                return memo_f;
            }
        }
        combine(probe, base, 1.0, direction, step);
        *calls += 1;
        let ret = clip_value(target.evaluate(probe));
        memo = Some((step, ret));
        ret
    };

    let mut bx = 0.0;
    let mut fb = *val_min;

    let mut ax = old_x0 * rng.gen_range(0.9..1.1);
    let mut fa = line_f(ax, target, calls, probe);

    let mut cx = 0.0;
    let mut fc = 0.0;

    // Stages of the search, cheapest first. Each stage either finishes
    // with a bracket (ax,bx,cx) whose middle is the proposed step, or
    // falls through to a more expensive stage.
    #[derive(PartialEq)]
    enum Stage {
        WarmFit,
        SimpleFit,
        EvaluateVertex(f64),
        FullSearch,
        Finish,
    }

    let mut stage = if old_a > 0.0 {
        Stage::WarmFit
    } else {
        Stage::SimpleFit
    };

    while stage != Stage::Finish {
        stage = match stage {
            Stage::WarmFit => {
                // curvature along a direction is constant for a quadratic
                // objective, so reuse the last sweep's estimate
                match fit_parabola_2pa(old_a, (ax, fa), (bx, fb)) {
                    Ok(p)
                        if (p.x0.abs() < MAX_EXPAND * old_x0.abs() || saved_x0 == 0.0)
                            && !too_close(p.x0, ax, sqrt_tolerance)
                            && !too_close(p.x0, bx, sqrt_tolerance)
                            && is_valid_number(p.x0)
                            && is_valid_number(ax)
                            && is_valid_number(bx) =>
                    {
                        cx = p.x0;
                        fc = line_f(cx, target, calls, probe);

                        match fit_parabola_3p((ax, fa), (bx, fb), (cx, fc)) {
                            Ok(p)
                                if p.a > 0.0
                                    && (p.x0.abs() < MAX_EXPAND * old_x0.abs()
                                        || saved_x0 == 0.0) =>
                            {
                                if !(p.b < fb) {
                                    Stage::FullSearch
                                } else if !(fc < fb) || !(fc < fa) {
                                    Stage::EvaluateVertex(p.x0)
                                } else if fb - p.b <= 1.5 * (fb - fc) {
                                    // not worth another evaluation
                                    core::mem::swap(&mut fb, &mut fc);
                                    core::mem::swap(&mut bx, &mut cx);
                                    Stage::Finish
                                } else {
                                    Stage::EvaluateVertex(p.x0)
                                }
                            }
                            _ => Stage::FullSearch,
                        }
                    }
                    _ => Stage::SimpleFit,
                }
            }
            Stage::SimpleFit => {
                cx = if fa < fb {
                    2.0 * ax * rng.gen_range(0.8..1.2)
                } else {
                    -ax * rng.gen_range(0.8..1.2)
                };
                fc = line_f(cx, target, calls, probe);

                match fit_parabola_3p((ax, fa), (bx, fb), (cx, fc)) {
                    Ok(p)
                        if p.a > 0.0
                            && (p.x0.abs() < MAX_EXPAND * old_x0.abs() || saved_x0 == 0.0) =>
                    {
                        Stage::EvaluateVertex(p.x0)
                    }
                    _ => Stage::FullSearch,
                }
            }
            Stage::EvaluateVertex(x0) => {
                let fx0 = line_f(x0, target, calls, probe);
                if !(fx0 <= fb) {
                    Stage::FullSearch
                } else {
                    fb = fx0;
                    bx = x0;
                    if !(fa <= fc) {
                        core::mem::swap(&mut fa, &mut fc);
                        core::mem::swap(&mut ax, &mut cx);
                    }
                    if !(fb <= fa) {
                        core::mem::swap(&mut fb, &mut fa);
                        core::mem::swap(&mut bx, &mut ax);
                    }
                    Stage::Finish
                }
            }
            Stage::FullSearch => {
                // nudge duplicates apart so the bracket search sees three
                // distinct points
                while ax == bx || ax == cx || bx == cx {
                    if ax == bx {
                        if rng.gen::<bool>() {
                            ax += rng.gen_range(-1.0..1.0);
                            fa = line_f(ax, target, calls, probe);
                        } else {
                            bx += rng.gen_range(-1.0..1.0);
                            fb = line_f(bx, target, calls, probe);
                        }
                    }
                    if ax == cx {
                        if rng.gen::<bool>() {
                            ax += rng.gen_range(-1.0..1.0);
                            fa = line_f(ax, target, calls, probe);
                        } else {
                            cx += rng.gen_range(-1.0..1.0);
                            fc = line_f(cx, target, calls, probe);
                        }
                    }
                    if bx == cx {
                        if rng.gen::<bool>() {
                            bx += rng.gen_range(-1.0..1.0);
                            fb = line_f(bx, target, calls, probe);
                        } else {
                            cx += rng.gen_range(-1.0..1.0);
                            fc = line_f(cx, target, calls, probe);
                        }
                    }
                }

                let result = LineSearch::new()
                    .with_improvement_patience(FULL_SEARCH_PATIENCE)
                    .with_max_probes(FULL_SEARCH_PROBES)
                    .minimize(
                        LinePoint { x: ax, f: fa },
                        LinePoint { x: bx, f: fb },
                        LinePoint { x: cx, f: fc },
                        fb,
                        |step| line_f(step, target, calls, probe),
                    );
                ax = result.low.x;
                fa = result.low.f;
                bx = result.best.x;
                fb = result.best.f;
                cx = result.high.x;
                fc = result.high.f;
                Stage::Finish
            }
            Stage::Finish => unreachable!(),
        };
    }

    // remember the step width, floored so it cannot collapse abruptly
    if bx.abs() < MIN_CONTRACT * old_x0.abs() {
        state.x0 = if bx < 0.0 {
            -MIN_CONTRACT * old_x0.abs()
        } else {
            MIN_CONTRACT * old_x0.abs()
        };
    } else {
        state.x0 = bx;
    }

    // remember the curvature
    state.a = match fit_parabola_3p((ax, fa), (bx, fb), (cx, fc)) {
        Ok(p) if p.a > 0.0 => p.a,
        _ => 0.0,
    };

    if *val_min == fb {
        // no improvement, do not move
        return (0.0, old_x0.abs());
    }

    add_scaled(x, direction, bx);
    *val_min = fb;

    (bx, old_x0.abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    fn ellipsoid(p: &DVector<f64>) -> f64 {
        p.iter()
            .enumerate()
            .map(|(i, x)| (i + 1) as f64 * (x - i as f64).powi(2))
            .sum()
    }

    #[test]
    fn converges_on_separable_quadratic() {
        let mut f = |p: &DVector<f64>| (p[0] - 1.0).powi(2) + 10.0 * (p[1] - 2.0).powi(2);
        let mut x = dvector![5.0, 5.0];
        let report = ConjugateDirection::new().minimize(&mut x, &mut f);

        assert_eq!(report.status, Status::Success);
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-2);
        assert_relative_eq!(x[1], 2.0, epsilon = 1e-2);
        assert!(report.objective_function < 1e-3);
    }

    #[test]
    fn converges_with_cross_terms() {
        // coupled coordinates exercise the acceleration directions
        let mut f =
            |p: &DVector<f64>| p[0].powi(2) + 4.0 * p[1].powi(2) + 2.0 * p[0] * p[1] - 2.0 * p[0];
        let mut x = dvector![3.0, -4.0];
        let report = ConjugateDirection::new().minimize(&mut x, &mut f);

        // minimum at (4/3, -1/3)
        assert_eq!(report.status, Status::Success);
        assert_relative_eq!(x[0], 4.0 / 3.0, epsilon = 1e-2);
        assert_relative_eq!(x[1], -1.0 / 3.0, epsilon = 1e-2);
    }

    #[test]
    fn converges_in_higher_dimensions() {
        let mut f = ellipsoid;
        let mut x = DVector::from_element(5, 7.0);
        let report = ConjugateDirection::new().minimize(&mut x, &mut f);
        assert_eq!(report.status, Status::Success);
        for (i, xi) in x.iter().enumerate() {
            assert_relative_eq!(*xi, i as f64, epsilon = 1e-2);
        }
    }

    #[test]
    fn call_budget_is_suboptimal() {
        let mut calls = 0usize;
        let mut f = |p: &DVector<f64>| {
            calls += 1;
            ellipsoid(p)
        };
        let mut x = DVector::from_element(5, 7.0);
        let start_val = ellipsoid(&x);
        let report = ConjugateDirection::new()
            .with_max_function_calls(10)
            .minimize(&mut x, &mut f);

        assert_eq!(report.status, Status::Suboptimal);
        // never worse than the starting point
        assert!(report.objective_function <= start_val);
    }

    #[test]
    fn iteration_budget_is_suboptimal() {
        let mut f = ellipsoid;
        let mut x = DVector::from_element(5, 7.0);
        let report = ConjugateDirection::new()
            .with_max_iterations(1)
            .minimize(&mut x, &mut f);
        assert_eq!(report.status, Status::Suboptimal);
    }

    #[test]
    fn fixed_seed_is_deterministic() {
        let run = |seed: u64| {
            let mut f = |p: &DVector<f64>| (p[0] + 2.0).powi(2) * (p[1] - 1.0).powi(2) + p.norm_squared();
            let mut x = dvector![4.0, -3.0];
            let report = ConjugateDirection::new().with_seed(seed).minimize(&mut x, &mut f);
            (x, report.number_of_evaluations)
        };
        let (x1, n1) = run(9);
        let (x2, n2) = run(9);
        assert_eq!(x1, x2);
        assert_eq!(n1, n2);
    }

    #[test]
    fn initial_steps_are_honored() {
        let mut f = |p: &DVector<f64>| (p[0] - 1000.0).powi(2) + (p[1] - 0.001).powi(2);
        let mut x = dvector![0.0, 0.0];
        let report = ConjugateDirection::new()
            .with_initial_steps(dvector![1000.0, 0.001])
            .minimize(&mut x, &mut f);
        assert_eq!(report.status, Status::Success);
        assert_relative_eq!(x[0], 1000.0, epsilon = 1e-1);
    }

    #[test]
    fn stop_flag_ends_the_run() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut f = ellipsoid;
        let mut x = DVector::from_element(3, 2.0);
        let report = ConjugateDirection::new()
            .with_stop_flag(flag)
            .minimize(&mut x, &mut f);
        assert_eq!(report.status, Status::Suboptimal);
    }
}
