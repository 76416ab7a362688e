//! Polak-Ribiere conjugate gradient with a gradient-only fast path.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::DVector;

use crate::bracket::{LinePoint, LineSearch, GOLDEN_RATIO, GOLDEN_SECTION};
use crate::fit::fit_parabola_2pd;
use crate::linalg::{add_scaled, combine, copy, dot, norm2, scale, sign};
use crate::problem::Gradient;
use crate::{MinimizationReport, Status};

/// Parabolic line-fit steps farther than this ratio of the previous jump
/// are distrusted.
const DEFAULT_MAX_STEP_RATIO: f64 = 10000.0;
/// Tolerated relative error between predicted and actual improvement of a
/// parabolic line fit.
const DEFAULT_PARABOLA_TOLERANCE: f64 = 0.25;
/// Step-ratio window a line search must land in to count as quadratic
/// behavior for the mode switch.
const DEFAULT_STABLE_STEP_RATIO: f64 = 3000.0;
/// Conjugacy-consistency bounds, as a fraction of the previous directional
/// derivative. The gradient-only mode has to re-earn trust each step, so
/// its bound is looser than the one gating entry into that mode.
const KEEP_CONSISTENCY: f64 = 0.4;
const ENTER_CONSISTENCY: f64 = 0.2;
/// Consecutive quadratic-looking line searches before switching to the
/// gradient-only mode.
const STABLE_THRESHOLD: usize = 3;

const FALLBACK_PATIENCE: usize = 3;
const FALLBACK_PROBES: usize = 20;

struct LineMinimizeResult {
    status: Status,
    val: f64,
    jump_len: f64,
    dy1: f64,
    parabola_succeeded: bool,
}

/// Conjugate-gradient minimizer for a [`Gradient`] objective.
///
/// Each iteration line-minimizes along the running Polak-Ribiere conjugate
/// direction
/// ```math
/// \vec{d}_{k+1} = \vec{g}_{k+1} + \beta_k \vec{d}_k, \qquad
/// \beta_k = \frac{\|\vec{g}_{k+1}\|^2 - \vec{g}_{k+1}\cdot\vec{g}_k}
///                {\|\vec{g}_k\|^2}.
/// ```
/// The line search first tries a single parabolic fit from the previous
/// jump length and only falls back to bracket refinement when the fit's
/// predicted improvement disagrees with the measured one. Once several
/// consecutive line searches behave quadratically, the iteration switches
/// to a mode that steps from two gradient evaluations alone, without
/// calling the objective at all; any consistency-test failure drops it
/// back to line searches.
///
/// Runs forever by default; bound it with
/// [`with_max_iterations`](Self::with_max_iterations) or
/// [`with_stop_flag`](Self::with_stop_flag) if the objective might not
/// have a minimum.
#[derive(Clone, Debug)]
pub struct ConjugateGradient {
    max_iterations: Option<usize>,
    stop_flag: Option<Arc<AtomicBool>>,
    parabola_tolerance: f64,
    max_step_ratio: f64,
    stable_step_ratio: f64,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        Self::new()
    }
}

impl ConjugateGradient {
    pub fn new() -> Self {
        Self {
            max_iterations: None,
            stop_flag: None,
            parabola_tolerance: DEFAULT_PARABOLA_TOLERANCE,
            max_step_ratio: DEFAULT_MAX_STEP_RATIO,
            stable_step_ratio: DEFAULT_STABLE_STEP_RATIO,
        }
    }

    /// Tolerated relative error between the improvement a parabolic line
    /// fit predicts and the improvement actually measured, before the fit
    /// is abandoned for a bracket search. Defaults to `0.25`.
    ///
    /// # Panics
    ///
    /// Panics if the tolerance is not in `$(0, 1)$`.
    pub fn with_parabola_tolerance(self, parabola_tolerance: f64) -> Self {
        assert!(
            0.0 < parabola_tolerance && parabola_tolerance < 1.0,
            "parabola tolerance must be in (0, 1)"
        );
        Self {
            parabola_tolerance,
            ..self
        }
    }

    /// Largest trusted ratio between a fitted line-search step and the
    /// previous jump length. Defaults to `10000`.
    ///
    /// # Panics
    ///
    /// Panics if `max_step_ratio <= 1`.
    pub fn with_max_step_ratio(self, max_step_ratio: f64) -> Self {
        assert!(max_step_ratio > 1.0, "max_step_ratio must be > 1");
        Self {
            max_step_ratio,
            ..self
        }
    }

    /// Step-ratio window a line search must land in to count towards the
    /// switch into the gradient-only mode. Defaults to `3000`.
    ///
    /// # Panics
    ///
    /// Panics if `stable_step_ratio <= 1`.
    pub fn with_stable_step_ratio(self, stable_step_ratio: f64) -> Self {
        assert!(stable_step_ratio > 1.0, "stable_step_ratio must be > 1");
        Self {
            stable_step_ratio,
            ..self
        }
    }

    /// Stop with [`Status::Suboptimal`] after this many iterations.
    ///
    /// An iteration is one line search or one gradient-only step, so it
    /// typically costs a gradient evaluation and a few objective
    /// evaluations.
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

    /// Stop cooperatively when another thread sets the flag.
    ///
    /// Checked once per iteration; the run ends with
    /// [`Status::Suboptimal`] at the best point seen.
    pub fn with_stop_flag(self, stop_flag: Arc<AtomicBool>) -> Self {
        Self {
            stop_flag: Some(stop_flag),
            ..self
        }
    }

    fn out_of_budget(&self, iteration: usize) -> bool {
        if let Some(max) = self.max_iterations {
            if iteration >= max {
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
    pub fn minimize<O: Gradient>(&self, x: &mut DVector<f64>, target: &mut O) -> MinimizationReport {
        let len = x.len();
        let mut evaluations = 0usize;

        let mut buffer = DVector::zeros(len);
        let mut g = DVector::zeros(len);
        let mut last_g = DVector::zeros(len);

        let mut val = target.evaluate(x);
        evaluations += 1;
        target.gradient(&mut g, x);

        let mut direction = g.clone();
        let mut norm2_g = norm2(&g);

        let mut function_free = false;
        let mut last_was_function_free = false;
        let mut stable_satisfy_count = 0usize;
        let mut no_move_count = 0usize;
        let mut jump_len: f64 = 1.0;
        let mut beta = 0.0;
        let mut dy1 = 0.0;

        let report = |status: Status, evaluations: usize, val: f64| MinimizationReport {
            status,
            number_of_evaluations: evaluations,
            objective_function: val,
        };

        let mut iteration = 0usize;
        loop {
            let last_dy1 = dy1;
            let last_jump_len = jump_len;
            core::mem::swap(&mut last_g, &mut g);
            let norm2_last_g = norm2_g;

            let mut take_function_based = !function_free;
            let mut g_dot_last_g = 0.0;

            if function_free {
                dy1 = dot(&direction, &last_g);
                let x2 = -sign(dy1) * last_jump_len.abs();

                combine(&mut buffer, x, 1.0, &direction, x2);
                target.gradient(&mut g, &buffer);

                let dot_diff = dy1 - dot(&g, &direction);
                let mut alpha = 0.0;
                let mut ok = dot_diff > 0.0;
                if ok {
                    // jump to the vertex implied by the two slopes
                    alpha = dy1 / dot_diff;
                    ok = 1.0 - self.max_step_ratio < alpha && alpha < 1.0 + self.max_step_ratio;
                }
                if ok {
                    jump_len = alpha * x2;

                    // the gradient at the vertex, interpolated
                    scale(&mut g, alpha);
                    add_scaled(&mut g, &last_g, 1.0 - alpha);

                    g_dot_last_g = dot(&g, &last_g);
                    if beta != 0.0 {
                        let computed_g_dot_dlast = -g_dot_last_g / beta;
                        ok = computed_g_dot_dlast.abs() < KEEP_CONSISTENCY * last_dy1.abs();
                    }
                }

                if ok {
                    add_scaled(x, &direction, alpha * x2);

                    if self.out_of_budget(iteration) {
                        val = target.evaluate(x);
                        evaluations += 1;
                        return report(Status::Suboptimal, evaluations, val);
                    }
                } else {
                    stable_satisfy_count = 0;
                    take_function_based = true;
                }
            }

            if take_function_based {
                if last_was_function_free {
                    // val is stale in the gradient-only mode
                    val = target.evaluate(x);
                    evaluations += 1;
                }
                function_free = false;

                if norm2_last_g == 0.0 {
                    return report(Status::Success, evaluations, val);
                }

                let last_val = val;
                let line = self.line_minimize(
                    x,
                    &mut buffer,
                    &direction,
                    last_val,
                    &last_g,
                    last_jump_len,
                    target,
                    &mut evaluations,
                );
                dy1 = line.dy1;
                val = line.val;
                jump_len = line.jump_len;
                if line.status != Status::Success {
                    return report(line.status, evaluations, val);
                }
                if self.out_of_budget(iteration) {
                    return report(Status::Suboptimal, evaluations, val);
                }

                debug_assert!(val <= last_val);
                if val == last_val {
                    if no_move_count >= 2 {
                        return report(Status::Success, evaluations, val);
                    }
                    no_move_count += 1;
                    jump_len = last_jump_len;
                } else {
                    no_move_count = 0;
                }

                target.gradient(&mut g, x);
                g_dot_last_g = dot(&g, &last_g);

                let mut stable = line.parabola_succeeded && last_jump_len != 0.0;
                if stable {
                    let alpha = jump_len / last_jump_len;
                    stable =
                        1.0 - self.stable_step_ratio < alpha && alpha < 1.0 + self.stable_step_ratio;
                }
                if stable && beta != 0.0 {
                    let computed_g_dot_dlast = -g_dot_last_g / beta;
                    stable = computed_g_dot_dlast.abs() < ENTER_CONSISTENCY * last_dy1.abs();
                }

                if stable {
                    stable_satisfy_count += 1;
                    if stable_satisfy_count > STABLE_THRESHOLD {
                        function_free = true;
                    }
                } else {
                    stable_satisfy_count = 0;
                }
            }

            norm2_g = norm2(&g);
            beta = (norm2_g - g_dot_last_g) / norm2_last_g;

            // direction = g + beta * direction
            direction.axpy(1.0, &g, beta);

            last_was_function_free = function_free;
            iteration += 1;
        }
    }
}

fn eval_at<O: Gradient>(
    target: &mut O,
    buffer: &mut DVector<f64>,
    x: &DVector<f64>,
    direction: &DVector<f64>,
    step: f64,
    evaluations: &mut usize,
) -> f64 {
    combine(buffer, x, 1.0, direction, step);
    *evaluations += 1;
    target.evaluate(buffer)
}

fn improvement_wrong(y1: f64, y0: f64, b: f64, tolerance: f64) -> bool {
    let expected_improvement = y1 - b;
    // weird form to handle NaN
    if !(expected_improvement > 0.0) {
        return true;
    }
    y0 > y1 - (1.0 - tolerance) * expected_improvement
        || y0 < y1 - (1.0 + tolerance) * expected_improvement
}

impl ConjugateGradient {
    /// Minimize along `direction` from `x`, trying one parabolic fit before
    /// falling back to a short bracket search.
    #[allow(clippy::too_many_arguments)]
    fn line_minimize<O: Gradient>(
        &self,
        x: &mut DVector<f64>,
        buffer: &mut DVector<f64>,
        direction: &DVector<f64>,
        last_val: f64,
        last_g: &DVector<f64>,
        last_jump_len: f64,
        target: &mut O,
        evaluations: &mut usize,
    ) -> LineMinimizeResult {
        let y1 = last_val;
        let dy1 = dot(direction, last_g);

        let mut jump = last_jump_len;
        if jump == 0.0 {
            jump = 1.0;
        }
        // step downhill by the previous jump length
        let x2 = -sign(dy1) * jump.abs();
        let y2 = eval_at(target, buffer, x, direction, x2, evaluations);

        // look for excuses to distrust the parabolic fit; each excuse picks
        // its own probe step for the fallback bracket
        let probe = match fit_parabola_2pd(0.0, y1, dy1, x2, y2) {
            Err(_) => Err(x2 + GOLDEN_RATIO * x2),
            Ok(p) => {
                if !(p.a > 0.0) {
                    Err(x2 + GOLDEN_RATIO * x2)
                } else if !(p.x0.abs() < self.max_step_ratio * x2.abs()) {
                    Err(self.max_step_ratio * x2)
                } else if !(p.x0.abs() > x2.abs() / self.max_step_ratio) {
                    Err(x2 / self.max_step_ratio)
                } else if !(p.b < y1) {
                    Err(GOLDEN_SECTION * x2)
                } else {
                    Ok(p)
                }
            }
        };

        let (x0, y0) = match probe {
            Ok(p) => {
                let y0 = eval_at(target, buffer, x, direction, p.x0, evaluations);
                if !improvement_wrong(y1, y0, p.b, self.parabola_tolerance) {
                    // buffer still holds x + x0 * direction
                    copy(x, buffer);
                    return LineMinimizeResult {
                        status: Status::Success,
                        val: y0,
                        jump_len: p.x0,
                        dy1,
                        parabola_succeeded: true,
                    };
                }
                (p.x0, y0)
            }
            Err(px) => {
                let y0 = eval_at(target, buffer, x, direction, px, evaluations);
                (px, y0)
            }
        };

        let result = LineSearch::new()
            .with_improvement_patience(FALLBACK_PATIENCE)
            .with_max_probes(FALLBACK_PROBES)
            .minimize(
                LinePoint { x: 0.0, f: y1 },
                LinePoint { x: x0, f: y0 },
                LinePoint { x: x2, f: y2 },
                y1,
                |step| eval_at(target, buffer, x, direction, step, evaluations),
            );

        match result.status {
            Status::Success | Status::Suboptimal => {}
            status => {
                return LineMinimizeResult {
                    status,
                    val: result.best.f,
                    jump_len: 0.0,
                    dy1,
                    parabola_succeeded: false,
                }
            }
        }

        if result.best.f <= last_val {
            add_scaled(x, direction, result.best.x);
            LineMinimizeResult {
                status: Status::Success,
                val: result.best.f,
                jump_len: result.best.x,
                dy1,
                parabola_succeeded: false,
            }
        } else {
            LineMinimizeResult {
                status: Status::Success,
                val: last_val,
                jump_len: 0.0,
                dy1,
                parabola_succeeded: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::Objective;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    struct Quadratic {
        evaluations: usize,
        gradients: usize,
    }

    impl Objective for Quadratic {
        fn evaluate(&mut self, p: &DVector<f64>) -> f64 {
            self.evaluations += 1;
            (p[0] - 1.0).powi(2) + 10.0 * (p[1] - 2.0).powi(2)
        }
    }

    impl Gradient for Quadratic {
        fn gradient(&mut self, grad: &mut DVector<f64>, p: &DVector<f64>) {
            self.gradients += 1;
            grad[0] = 2.0 * (p[0] - 1.0);
            grad[1] = 20.0 * (p[1] - 2.0);
        }
    }

    #[test]
    fn converges_on_quadratic() {
        let mut target = Quadratic {
            evaluations: 0,
            gradients: 0,
        };
        let mut x = dvector![0.0, 0.0];
        let report = ConjugateGradient::new().minimize(&mut x, &mut target);

        assert_eq!(report.status, Status::Success);
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(x[1], 2.0, epsilon = 1e-4);
        assert!(report.objective_function < 1e-8);
        assert_eq!(report.number_of_evaluations, target.evaluations);
        assert!(target.evaluations < 500);
        assert!(target.gradients < 500);
    }

    #[test]
    fn iteration_budget_is_suboptimal() {
        let mut target = Quadratic {
            evaluations: 0,
            gradients: 0,
        };
        let mut x = dvector![0.0, 0.0];
        let report = ConjugateGradient::new()
            .with_max_iterations(1)
            .minimize(&mut x, &mut target);

        assert_eq!(report.status, Status::Suboptimal);
        // still better than the starting point
        assert!(report.objective_function <= 41.0);
    }

    #[test]
    fn stop_flag_ends_the_run() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut target = Quadratic {
            evaluations: 0,
            gradients: 0,
        };
        let mut x = dvector![0.0, 0.0];
        let report = ConjugateGradient::new()
            .with_stop_flag(flag)
            .minimize(&mut x, &mut target);
        assert_eq!(report.status, Status::Suboptimal);
    }

    #[test]
    fn zero_gradient_start_is_already_optimal() {
        let mut target = Quadratic {
            evaluations: 0,
            gradients: 0,
        };
        let mut x = dvector![1.0, 2.0];
        let report = ConjugateGradient::new().minimize(&mut x, &mut target);
        assert_eq!(report.status, Status::Success);
        assert_eq!(report.objective_function, 0.0);
    }

    #[test]
    fn higher_dimensional_quadratic() {
        let mut f = DimQuadratic;
        let mut x = DVector::from_element(8, -3.0);
        let report = ConjugateGradient::new().minimize(&mut x, &mut f);
        assert_eq!(report.status, Status::Success);
        for (i, xi) in x.iter().enumerate() {
            assert_relative_eq!(*xi, i as f64, epsilon = 1e-3);
        }
        assert!(report.objective_function < 1e-6);
    }

    struct DimQuadratic;

    impl Objective for DimQuadratic {
        fn evaluate(&mut self, p: &DVector<f64>) -> f64 {
            p.iter()
                .enumerate()
                .map(|(i, x)| (i + 1) as f64 * (x - i as f64).powi(2))
                .sum()
        }
    }

    impl Gradient for DimQuadratic {
        fn gradient(&mut self, grad: &mut DVector<f64>, p: &DVector<f64>) {
            for (i, (g, x)) in grad.iter_mut().zip(p.iter()).enumerate() {
                *g = 2.0 * (i + 1) as f64 * (x - i as f64);
            }
        }
    }
}
