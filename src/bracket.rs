//! One-dimensional bracket-and-refine minimization.
//!
//! The workhorse behind every line search in this crate. A small sliding
//! window of samples is kept centered on the best point seen; each probe is
//! chosen by a parabola fit through neighboring samples when possible, with
//! a golden-section bracket step as the fallback.
use crate::fit::fit_parabola_3p;
use crate::problem::{clip_value, HUGE_VALUE};
use crate::Status;

pub(crate) const GOLDEN_RATIO: f64 = 1.618034;
pub(crate) const GOLDEN_SECTION: f64 = 0.3819660;
/// How far past the explored interval a bracket-expansion probe reaches.
pub(crate) const EXPANSION_RATIO: f64 = 20.0;

const RADIUS: isize = 3;
const SIZE: usize = (2 * RADIUS - 1) as usize;
const MID: isize = RADIUS - 1;

/// Relative difference of two magnitudes, in `[0, 1]`.
pub(crate) fn fract_diff(n1: f64, n2: f64) -> f64 {
    let n1 = n1.abs();
    let n2 = n2.abs();

    if n1 > n2 {
        1.0 - n2 / n1
    } else if n2 > n1 {
        1.0 - n1 / n2
    } else if n1 == n2 {
        0.0
    } else {
        // NaN magnitudes never compare close
        1.0
    }
}

fn is_valid_number(x: f64) -> bool {
    -HUGE_VALUE < x && x < HUGE_VALUE
}

/// Next probe decision.
enum Probe {
    At(f64),
    /// Probing cannot add information at this resolution.
    Exhausted,
}

/// Sliding window of up to [`SIZE`] samples, sorted by x with the minimum
/// at the center.
///
/// Points pushed off either edge fold into a per-side "worst spilled value"
/// record, which the golden-section fallback uses to know whether a side
/// has already been explored past a rise.
struct Window {
    xs: [f64; SIZE],
    fs: [f64; SIZE],
    /// Number of stored points at offsets <= 0, center included.
    num_low: isize,
    /// Number of stored points at offsets >= 0, center included.
    num_high: isize,
    low_spill_x: f64,
    low_spill_f: f64,
    high_spill_x: f64,
    high_spill_f: f64,
}

impl Window {
    fn new() -> Self {
        Self {
            xs: [0.0; SIZE],
            fs: [0.0; SIZE],
            num_low: 0,
            num_high: 0,
            low_spill_x: 0.0,
            low_spill_f: f64::NEG_INFINITY,
            high_spill_x: 0.0,
            high_spill_f: f64::NEG_INFINITY,
        }
    }

    fn x(&self, i: isize) -> f64 {
        self.xs[(MID + i) as usize]
    }

    fn f(&self, i: isize) -> f64 {
        self.fs[(MID + i) as usize]
    }

    fn set(&mut self, i: isize, x: f64, f: f64) {
        self.xs[(MID + i) as usize] = x;
        self.fs[(MID + i) as usize] = f;
    }

    /// Move offsets `start..=fin` by `offset`, folding points shifted past
    /// an edge into that side's spill record.
    fn shift(&mut self, start: isize, fin: isize, offset: isize) {
        if start > fin {
            return;
        }
        debug_assert!(-RADIUS + 1 <= start && fin <= RADIUS - 1);

        if offset > 0 {
            for from_i in (start..=fin).rev() {
                let to_i = from_i + offset;
                if to_i <= RADIUS - 1 {
                    let (x, f) = (self.x(from_i), self.f(from_i));
                    self.set(to_i, x, f);
                } else if self.f(from_i) > self.high_spill_f {
                    self.high_spill_f = self.f(from_i);
                    self.high_spill_x = self.x(from_i);
                }
            }
        } else if offset < 0 {
            for from_i in start..=fin {
                let to_i = from_i + offset;
                if to_i >= -RADIUS + 1 {
                    let (x, f) = (self.x(from_i), self.f(from_i));
                    self.set(to_i, x, f);
                } else if self.f(from_i) > self.low_spill_f {
                    self.low_spill_f = self.f(from_i);
                    self.low_spill_x = self.x(from_i);
                }
            }
        }
    }

    /// Offset the new x would occupy; one past the high end if largest.
    fn position_of(&self, x: f64) -> isize {
        for i in -self.num_low + 1..=self.num_high - 1 {
            debug_assert!(x != self.x(i), "duplicate sample in line search");
            if x < self.x(i) {
                return i;
            }
        }
        self.num_high
    }

    fn insert(&mut self, xnew: f64, fnew: f64) {
        if self.num_low == 0 && self.num_high == 0 {
            self.set(0, xnew, fnew);
            self.num_low = 1;
            self.num_high = 1;
            return;
        }

        let index = self.position_of(xnew);

        if fnew < self.f(0) {
            // new center; both sides shift away from it
            let neg_shift = -index;
            let pos_shift = -index + 1;

            self.shift(-self.num_low + 1, index - 1, neg_shift);
            self.shift(index, self.num_high - 1, pos_shift);
            self.set(0, xnew, fnew);

            self.num_low = (self.num_low - neg_shift).clamp(1, RADIUS);
            self.num_high = (self.num_high + pos_shift).clamp(1, RADIUS);
        } else if index > 0 {
            if index <= RADIUS - 1 {
                self.shift(index, self.num_high - 1, 1);
                self.set(index, xnew, fnew);
                if self.num_high < RADIUS {
                    self.num_high += 1;
                }
            } else {
                debug_assert!(index == RADIUS);
                if fnew > self.high_spill_f
                    || (fnew == self.high_spill_f && xnew > self.high_spill_x)
                {
                    self.high_spill_f = fnew;
                    self.high_spill_x = xnew;
                }
            }
        } else if index > -RADIUS + 1 {
            self.shift(-self.num_low + 1, index - 1, -1);
            self.set(index - 1, xnew, fnew);
            if self.num_low < RADIUS {
                self.num_low += 1;
            }
        } else {
            debug_assert!(index == -RADIUS + 1);
            if fnew > self.low_spill_f || (fnew == self.low_spill_f && xnew < self.low_spill_x) {
                self.low_spill_f = fnew;
                self.low_spill_x = xnew;
            }
        }

        self.check();
    }

    fn check(&self) {
        debug_assert!(self.num_low >= 1 && self.num_low <= RADIUS);
        debug_assert!(self.num_high >= 1 && self.num_high <= RADIUS);
        for i in -self.num_low + 1..self.num_high - 1 {
            debug_assert!(self.x(i) < self.x(i + 1));
        }
        for i in -self.num_low + 1..=self.num_high - 1 {
            debug_assert!(self.f(0) <= self.f(i));
        }
    }

    fn pos_greater_found(&self) -> bool {
        if self.high_spill_f > self.f(0) {
            return true;
        }
        (1..=self.num_high - 1).any(|i| self.f(i) > self.f(0))
    }

    fn neg_greater_found(&self) -> bool {
        if self.low_spill_f > self.f(0) {
            return true;
        }
        (1..=self.num_low - 1).any(|i| self.f(-i) > self.f(0))
    }

    fn x_min(&self) -> f64 {
        let edge = self.x(-self.num_low + 1);
        if self.low_spill_f > f64::NEG_INFINITY {
            edge.min(self.low_spill_x)
        } else {
            edge
        }
    }

    fn x_max(&self) -> f64 {
        let edge = self.x(self.num_high - 1);
        if self.high_spill_f > f64::NEG_INFINITY {
            edge.max(self.high_spill_x)
        } else {
            edge
        }
    }

    fn search_width(&self) -> f64 {
        let width = self.x_max() - self.x_min();
        debug_assert!(width >= 0.0);
        width
    }

    fn in_legal_range(&self, x0: f64) -> bool {
        if self.num_low > 1 && !(self.x(-1) < x0) {
            return false;
        }
        if self.num_high > 1 && !(x0 < self.x(1)) {
            return false;
        }
        true
    }

    /// Vertex of the best parabola fit through stored neighbors, if any
    /// fit has usable positive curvature.
    fn quadratic_probe(&self) -> Option<Probe> {
        // (vertex, worst endpoint value) per candidate fit
        let mut candidates: [Option<(f64, f64)>; 3] = [None; 3];

        // center points
        if self.num_low > 1
            && self.num_high > 1
            && is_valid_number(self.f(-1))
            && is_valid_number(self.f(1))
        {
            if let Ok(p) = fit_parabola_3p(
                (self.x(-1), self.f(-1)),
                (self.x(0), self.f(0)),
                (self.x(1), self.f(1)),
            ) {
                if p.a > 0.0 && p.a < HUGE_VALUE && self.x(-1) < p.x0 && p.x0 < self.x(1) {
                    candidates[0] = Some((p.x0, self.f(-1).max(self.f(1))));
                }
            }
        }

        // leftmost points
        if self.num_low > 2
            && self.num_high > 0
            && is_valid_number(self.f(-2))
            && is_valid_number(self.f(-1))
        {
            if let Ok(p) = fit_parabola_3p(
                (self.x(-2), self.f(-2)),
                (self.x(-1), self.f(-1)),
                (self.x(0), self.f(0)),
            ) {
                if p.a > 0.0 && p.a < HUGE_VALUE {
                    candidates[1] = Some((p.x0, self.f(-2)));
                }
            }
        }

        // rightmost points
        if self.num_low > 0
            && self.num_high > 2
            && is_valid_number(self.f(1))
            && is_valid_number(self.f(2))
        {
            if let Ok(p) = fit_parabola_3p(
                (self.x(0), self.f(0)),
                (self.x(1), self.f(1)),
                (self.x(2), self.f(2)),
            ) {
                if p.a > 0.0 && p.a < HUGE_VALUE {
                    candidates[2] = Some((p.x0, self.f(2)));
                }
            }
        }

        // among usable fits, prefer the one whose worst endpoint is lowest
        let mut xnew = None;
        let mut best_worst_f = f64::INFINITY;
        for candidate in candidates.iter().flatten() {
            let (x0, worst_f) = *candidate;
            if self.in_legal_range(x0) && worst_f < best_worst_f {
                best_worst_f = worst_f;
                xnew = Some(x0);
            }
        }
        let mut xnew = xnew?;

        if xnew == self.x(0) {
            // perturb until the probe is distinct from the current best
            let mut fract = 1.0 / EXPANSION_RATIO;

            if self.num_low < 2 {
                while xnew == self.x(0) {
                    xnew += -fract * (self.x(1) - self.x(0));
                    fract *= 2.0;
                }
            } else if self.num_high < 2 {
                while xnew == self.x(0) {
                    xnew += fract * (self.x(0) - self.x(-1));
                    fract *= 2.0;
                }
            } else if self.x(1) - self.x(0) > self.x(0) - self.x(-1) {
                while xnew == self.x(0) {
                    xnew += fract * (self.x(1) - self.x(-1));
                    if xnew >= self.x(1) {
                        return Some(Probe::Exhausted);
                    }
                    fract *= 2.0;
                }
            } else {
                while xnew == self.x(0) {
                    xnew += -fract * (self.x(1) - self.x(-1));
                    if xnew <= self.x(-1) {
                        return Some(Probe::Exhausted);
                    }
                    fract *= 2.0;
                }
            }
        }

        if !(xnew.abs() < HUGE_VALUE) {
            return None;
        }
        Some(Probe::At(xnew))
    }

    /// Golden-section step inside the bracket, or an expansion step out of
    /// whichever side has not risen yet.
    fn golden_probe(&self) -> Probe {
        match (self.pos_greater_found(), self.neg_greater_found()) {
            (true, true) => {
                let dpos = self.x(1) - self.x(0);
                let dneg = self.x(0) - self.x(-1);

                let xnew = if dpos > dneg {
                    self.x(0) + GOLDEN_SECTION * dpos
                } else {
                    self.x(0) - GOLDEN_SECTION * dneg
                };

                if xnew == self.x(0) {
                    Probe::Exhausted
                } else {
                    Probe::At(xnew)
                }
            }
            (true, false) => Probe::At(self.x_min() - EXPANSION_RATIO * self.search_width()),
            (false, true) => Probe::At(self.x_max() + EXPANSION_RATIO * self.search_width()),
            (false, false) => {
                // totally flat so far; expand from the larger span
                let width = EXPANSION_RATIO * self.search_width();
                if self.x_max() - self.x(0) > self.x(0) - self.x_min() {
                    Probe::At(self.x_min() - width)
                } else {
                    Probe::At(self.x_max() + width)
                }
            }
        }
    }

    fn optimum_found(&self, sqrt_tolerance: f64) -> bool {
        if self.num_low < 2 || self.num_high < 2 {
            return false;
        }
        if !(self.f(0) <= self.f(-1)) || !(self.f(0) <= self.f(1)) {
            return false;
        }
        if !(self.neg_greater_found() && self.pos_greater_found()) {
            return false;
        }

        if self.x(0) != 0.0 {
            fract_diff(self.x(1), self.x(0)) <= sqrt_tolerance
                && fract_diff(self.x(-1), self.x(0)) <= sqrt_tolerance
        } else {
            (self.x(1) - self.x(0)).abs() <= sqrt_tolerance
                && (self.x(-1) - self.x(0)).abs() <= sqrt_tolerance
        }
    }
}

/// A sample on the search line.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinePoint {
    pub x: f64,
    pub f: f64,
}

/// Result of a one-dimensional minimization: the best point found and its
/// immediate bracket neighbors (which coincide with `best` when a side was
/// never explored).
#[derive(Clone, Copy, Debug)]
pub struct LineMinimum {
    pub low: LinePoint,
    pub best: LinePoint,
    pub high: LinePoint,
    pub status: Status,
}

/// Bracket-and-refine minimizer for a scalar function.
///
/// Starting from three samples, repeatedly probes the function at the
/// parabola-fit vertex of stored neighbors, falling back to golden-section
/// bracket steps whenever no fit is trustworthy (at most two consecutive
/// parabolic probes are taken before a golden step is forced). Terminates
/// with [`Status::Success`] once both neighbors of the best point agree
/// with it to `$\sqrt{\varepsilon}$` relative tolerance and a rise has been
/// seen on both sides; with [`Status::Unbounded`] when x or f run out of
/// representable range; with [`Status::Suboptimal`] when a budget ends the
/// search first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineSearch {
    improvement_patience: usize,
    max_probes: usize,
}

impl Default for LineSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl LineSearch {
    pub fn new() -> Self {
        Self {
            improvement_patience: usize::MAX,
            max_probes: usize::MAX,
        }
    }

    /// Stop early after this many consecutive probes at or below the
    /// improvement goal passed to [`minimize`](Self::minimize).
    ///
    /// Outer loops use this for cheap line searches: any value at or below
    /// the level they already reached is good enough.
    ///
    /// # Panics
    ///
    /// Panics if `patience == 0`.
    pub fn with_improvement_patience(self, improvement_patience: usize) -> Self {
        assert!(improvement_patience > 0, "patience must be > 0");
        Self {
            improvement_patience,
            ..self
        }
    }

    /// Cap the total number of probes.
    ///
    /// # Panics
    ///
    /// Panics if `max_probes == 0`.
    pub fn with_max_probes(self, max_probes: usize) -> Self {
        assert!(max_probes > 0, "max_probes must be > 0");
        Self { max_probes, ..self }
    }

    /// Minimize `f` starting from three already-evaluated samples.
    ///
    /// The samples need not be ordered; `goal` is the improvement level for
    /// [`with_improvement_patience`](Self::with_improvement_patience)
    /// (pass the best known value, or `-inf` to disable early exit).
    pub fn minimize(
        &self,
        p0: LinePoint,
        p1: LinePoint,
        p2: LinePoint,
        goal: f64,
        mut f: impl FnMut(f64) -> f64,
    ) -> LineMinimum {
        let sqrt_tolerance = f64::EPSILON.sqrt();
        let goal = clip_value(goal);

        let mut window = Window::new();
        window.insert(p1.x, clip_value(p1.f));
        window.insert(p0.x, clip_value(p0.f));
        window.insert(p2.x, clip_value(p2.f));

        let mut improve_count = 0;
        if (window.num_low > 1 && window.f(-1) <= goal)
            || (window.num_high > 1 && window.f(1) <= goal)
        {
            debug_assert!(window.f(0) <= goal);
            improve_count += 1;
        }

        let mut parabola_fit_count = 0;
        let mut total_probes = 0;
        let mut xnew = window.x(0);
        let mut fnew = window.f(0);

        while total_probes < self.max_probes {
            let probe = if parabola_fit_count < 2 {
                window.quadratic_probe()
            } else {
                None
            };

            let x = match probe {
                Some(Probe::Exhausted) => break,
                Some(Probe::At(x)) => {
                    parabola_fit_count += 1;
                    x
                }
                None => {
                    parabola_fit_count = 0;
                    match window.golden_probe() {
                        Probe::Exhausted => break,
                        Probe::At(x) => x,
                    }
                }
            };

            xnew = x;
            fnew = clip_value(f(x));
            total_probes += 1;

            if diverged(xnew, fnew) {
                break;
            }
            window.insert(xnew, fnew);

            if fnew <= goal && window.f(0) <= goal {
                improve_count += 1;
                if improve_count >= self.improvement_patience {
                    break;
                }
            } else {
                improve_count = 0;
            }

            if window.optimum_found(sqrt_tolerance) {
                break;
            }
        }

        extract_solution(&window, xnew, fnew, sqrt_tolerance)
    }
}

fn diverged(xnew: f64, fnew: f64) -> bool {
    xnew.abs() >= HUGE_VALUE || fnew <= -HUGE_VALUE
}

fn extract_solution(window: &Window, xnew: f64, fnew: f64, sqrt_tolerance: f64) -> LineMinimum {
    let best = LinePoint {
        x: window.x(0),
        f: window.f(0),
    };
    let low = if window.num_low > 1 {
        LinePoint {
            x: window.x(-1),
            f: window.f(-1),
        }
    } else {
        best
    };
    let high = if window.num_high > 1 {
        LinePoint {
            x: window.x(1),
            f: window.f(1),
        }
    } else {
        best
    };

    let status = if xnew.abs() >= HUGE_VALUE {
        if fnew == best.f {
            Status::Success
        } else {
            Status::Unbounded
        }
    } else if fnew <= -HUGE_VALUE {
        Status::Unbounded
    } else if window.optimum_found(sqrt_tolerance) {
        Status::Success
    } else {
        Status::Suboptimal
    };

    LineMinimum {
        low,
        best,
        high,
        status,
    }
}

/// Minimize a scalar function from a single starting point.
///
/// Brackets with probes at `$x_0 \pm 1$` and refines without a probe
/// budget; `improvement_patience` gives the early-exit patience relative to
/// the starting value (use `usize::MAX` to always run to convergence).
pub fn minimize_scalar(
    x_start: f64,
    improvement_patience: usize,
    mut f: impl FnMut(f64) -> f64,
) -> LineMinimum {
    let f1 = clip_value(f(x_start));
    let f0 = clip_value(f(x_start - 1.0));
    let f2 = clip_value(f(x_start + 1.0));

    LineSearch::new()
        .with_improvement_patience(improvement_patience)
        .minimize(
            LinePoint {
                x: x_start - 1.0,
                f: f0,
            },
            LinePoint { x: x_start, f: f1 },
            LinePoint {
                x: x_start + 1.0,
                f: f2,
            },
            f1,
            &mut f,
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn points(f: impl Fn(f64) -> f64, xs: [f64; 3]) -> [LinePoint; 3] {
        xs.map(|x| LinePoint { x, f: f(x) })
    }

    #[test]
    fn window_keeps_minimum_centered() {
        let mut window = Window::new();
        for (x, f) in [
            (1.0, 9.0),
            (0.0, 14.0),
            (2.0, 6.0),
            (3.5, 5.3),
            (3.0, 5.0),
            (2.5, 5.2),
            (4.0, 6.1),
        ] {
            window.insert(x, f);
        }
        assert_eq!(window.x(0), 3.0);
        assert_eq!(window.f(0), 5.0);
        assert!(window.x(-1) < window.x(0) && window.x(0) < window.x(1));
        // the overflowing far points fold into the spill records
        assert!(window.low_spill_f >= 9.0);
    }

    #[test]
    fn converges_on_parabola() {
        let f = |x: f64| (x - 3.0) * (x - 3.0) + 5.0;
        let [p0, p1, p2] = points(f, [0.0, 1.0, 2.0]);
        let mut evals = 0;
        let result = LineSearch::new().with_max_probes(100).minimize(
            p0,
            p1,
            p2,
            f64::NEG_INFINITY,
            |x| {
                evals += 1;
                f(x)
            },
        );
        assert_eq!(result.status, Status::Success);
        assert_relative_eq!(result.best.x, 3.0, epsilon = 1e-6);
        assert_relative_eq!(result.best.f, 5.0, epsilon = 1e-9);
        assert!(result.low.x <= result.best.x && result.best.x <= result.high.x);
        assert!(evals < 60);
    }

    #[test]
    fn converges_from_a_distant_bracket() {
        let f = |x: f64| (x - 3.0) * (x - 3.0) + 5.0;
        let [p0, p1, p2] = points(f, [-200.0, -100.0, 50.0]);
        let result = LineSearch::new()
            .with_max_probes(200)
            .minimize(p0, p1, p2, f64::NEG_INFINITY, f);
        assert_eq!(result.status, Status::Success);
        assert_relative_eq!(result.best.x, 3.0, epsilon = 1e-6);
    }

    #[test]
    fn improvement_goal_exits_early() {
        let f = |x: f64| (x - 3.0) * (x - 3.0) + 5.0;
        let [p0, p1, p2] = points(f, [0.0, 1.0, 2.0]);
        let mut evals = 0;
        let result = LineSearch::new()
            .with_improvement_patience(1)
            .with_max_probes(100)
            .minimize(p0, p1, p2, 10.0, |x| {
                evals += 1;
                f(x)
            });
        assert!(result.best.f <= 10.0);
        assert!(evals <= 3);
    }

    #[test]
    fn detects_unbounded_objective() {
        let f = |x: f64| -x;
        let [p0, p1, p2] = points(f, [0.0, 1.0, 2.0]);
        let result = LineSearch::new()
            .with_max_probes(500)
            .minimize(p0, p1, p2, f64::NEG_INFINITY, f);
        assert_eq!(result.status, Status::Unbounded);
    }

    #[test]
    fn scalar_entry_point() {
        let result = minimize_scalar(0.0, usize::MAX, |x| (x - 3.0) * (x - 3.0) + 5.0);
        assert_eq!(result.status, Status::Success);
        assert_relative_eq!(result.best.x, 3.0, epsilon = 1e-6);
    }

    #[test]
    fn fract_diff_is_relative() {
        assert_eq!(fract_diff(2.0, 2.0), 0.0);
        assert_relative_eq!(fract_diff(2.0, 1.0), 0.5);
        assert_relative_eq!(fract_diff(-1.0, 2.0), 0.5);
    }
}
