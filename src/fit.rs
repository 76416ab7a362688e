//! Local polynomial models of the objective.
//!
//! The minimizers use these O(1) fits to jump toward an analytic vertex
//! whenever the objective looks locally quadratic, saving full evaluations.
//! Every fit that can degenerate returns `Err(Singular)` instead of a
//! parabola; callers fall back to a slower probing strategy.
use crate::Singular;

/// A centered parabola `$y = a(x - x_0)^2 + b$`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Parabola {
    /// Curvature. May be zero or negative; callers that need a minimum
    /// check `a > 0` themselves.
    pub a: f64,
    /// Vertex position.
    pub x0: f64,
    /// Vertex value.
    pub b: f64,
}

impl Parabola {
    pub fn value_at(&self, x: f64) -> f64 {
        let d = x - self.x0;
        self.a * d * d + self.b
    }
}

/// Fit a centered parabola through three points.
///
/// The points are sorted by x internally. Fails if any two x's coincide.
/// Collinear points yield `a = 0` with the vertex pinned at `x0 = 0`,
/// which is a valid fit, not an error.
pub fn fit_parabola_3p(
    p1: (f64, f64),
    p2: (f64, f64),
    p3: (f64, f64),
) -> Result<Parabola, Singular> {
    let (mut x1, mut y1) = p1;
    let (mut x2, mut y2) = p2;
    let (mut x3, mut y3) = p3;

    // sort the x's
    if !(x1 < x3) {
        core::mem::swap(&mut x1, &mut x3);
        core::mem::swap(&mut y1, &mut y3);
    }
    if x2 < x1 {
        core::mem::swap(&mut x1, &mut x2);
        core::mem::swap(&mut y1, &mut y2);
    } else if x3 < x2 {
        core::mem::swap(&mut x2, &mut x3);
        core::mem::swap(&mut y2, &mut y3);
    }

    let dx21 = x2 - x1;
    let dx32 = x3 - x2;
    if !(x1 != x3 && dx21 != 0.0 && dx32 != 0.0) {
        return Err(Singular);
    }

    let x12 = 0.5 * (x1 + x2);
    let x23 = 0.5 * (x2 + x3);
    let dx2312 = x23 - x12;
    if dx2312 == 0.0 {
        return Err(Singular);
    }

    let dy12 = (y2 - y1) / dx21;
    let dy23 = (y3 - y2) / dx32;
    let ddy = dy23 - dy12;
    let a = 0.5 * ddy / dx2312;

    if ddy != 0.0 {
        let x0 = (dy23 * x12 - dy12 * x23) / ddy;
        let diff = x2 - x0;
        Ok(Parabola {
            a,
            x0,
            b: y2 - a * diff * diff,
        })
    } else {
        Ok(Parabola { a, x0: 0.0, b: y2 })
    }
}

/// Fit a centered parabola through two points, given the slope at the first.
///
/// Fails if `x1 == x2`.
pub fn fit_parabola_2pd(
    x1: f64,
    y1: f64,
    dy1: f64,
    x2: f64,
    y2: f64,
) -> Result<Parabola, Singular> {
    let dx21 = x2 - x1;
    if dx21 == 0.0 {
        return Err(Singular);
    }

    let x12 = 0.5 * (x1 + x2);
    let dy12 = (y2 - y1) / dx21;
    let ddy = dy12 - dy1;

    let dx121 = x12 - x1;
    if dx121 == 0.0 {
        return Err(Singular);
    }
    let a = 0.5 * ddy / dx121;

    if ddy != 0.0 {
        let x0 = (dy12 * x1 - dy1 * x12) / ddy;
        let diff = x1 - x0;
        Ok(Parabola {
            a,
            x0,
            b: y1 - a * diff * diff,
        })
    } else {
        Ok(Parabola { a, x0: 0.0, b: y1 })
    }
}

/// Fit a parabola to the slopes at two points.
///
/// The vertex value cannot be recovered from slopes alone, so this returns
/// only `(a, x0)`. Fails if `x1 == x2` or the slopes are equal.
pub fn fit_parabola_2d(x1: f64, dy1: f64, x2: f64, dy2: f64) -> Result<(f64, f64), Singular> {
    let dx = x2 - x1;
    if dx == 0.0 {
        return Err(Singular);
    }

    let ddy = dy2 - dy1;
    if ddy == 0.0 {
        return Err(Singular);
    }

    let a = 0.5 * ddy / dx;
    let x0 = (dy2 * x1 - dy1 * x2) / ddy;
    Ok((a, x0))
}

/// Fit `$y = ax^2 + bx + c$` through two points with the curvature `a`
/// already known, returning `(b, c)`.
///
/// Fails if `x1 == x2`.
pub fn fit_traditional_parabola_2pa(
    a: f64,
    p1: (f64, f64),
    p2: (f64, f64),
) -> Result<(f64, f64), Singular> {
    let (mut x1, mut y1) = p1;
    let (mut x2, mut y2) = p2;

    if x2 < x1 {
        core::mem::swap(&mut x1, &mut x2);
        core::mem::swap(&mut y1, &mut y2);
    }

    let dx = x2 - x1;
    if dx == 0.0 {
        return Err(Singular);
    }

    let sx = x2 + x1;
    let b = ((y2 - y1) - a * dx * sx) / dx;
    let c = 0.5 * ((y2 + y1) - a * (x2 * x2 + x1 * x1) - b * sx);
    Ok((b, c))
}

/// Convert `$y = ax^2 + bx + c$` to centered form.
///
/// Fails if `a == 0` (no vertex).
pub fn parabola_from_traditional(a: f64, b: f64, c: f64) -> Result<Parabola, Singular> {
    if a == 0.0 {
        return Err(Singular);
    }
    Ok(Parabola {
        a,
        x0: -0.5 * b / a,
        b: c - 0.25 * b * b / a,
    })
}

/// Fit a centered parabola through two points with a known positive
/// curvature.
///
/// The curvature along a fixed direction of a quadratic objective is
/// constant, so a curvature remembered from an earlier search plus two fresh
/// points pin down the vertex with no extra evaluation. Fails for
/// non-positive curvature or coincident x's.
pub fn fit_parabola_2pa(a: f64, p1: (f64, f64), p2: (f64, f64)) -> Result<Parabola, Singular> {
    if a <= 0.0 {
        return Err(Singular);
    }
    let (b, c) = fit_traditional_parabola_2pa(a, p1, p2)?;
    parabola_from_traditional(a, b, c)
}

/// Fit a cubic `$y = c_3x^3 + c_2x^2 + c_1x + c_0$` to two points and the
/// slopes at both, returning coefficients in ascending-degree order.
///
/// The interval is mapped to `$[-1, 1]$`, the four-coefficient system is
/// solved in closed form there, and the result is mapped back. Fails if
/// `x1 == x2`.
pub fn fit_cubic_2p2d(
    x1: f64,
    y1: f64,
    mut dy1: f64,
    x2: f64,
    y2: f64,
    mut dy2: f64,
) -> Result<[f64; 4], Singular> {
    if x1 == x2 {
        return Err(Singular);
    }

    // mapping from x space to [-1, 1] space
    let m = 2.0 / (x2 - x1);
    let b = 1.0 - m * x2;

    dy1 /= m;
    dy2 /= m;

    // coefficients assuming x1 == -1, x2 == 1
    let mut c = [0.0; 4];
    c[2] = 0.25 * (dy2 - dy1);
    c[0] = 0.5 * (y2 + y1) - c[2];
    c[3] = 0.5 * (y1 + dy1 + c[2] - c[0]);
    c[1] = dy2 - 3.0 * c[3] - 2.0 * c[2];

    // transform back: y(x) = sum_i c_i * (m*x + b)^i
    let xform = [b, m];
    let mut coef = [0.0; 4];
    let mut accum = [0.0; 5];
    accum[0] = 1.0;

    for i in 0..4 {
        for j in 0..=i {
            coef[j] += c[i] * accum[j];
        }
        let mut next = [0.0; 6];
        mult_polys(&mut next[..i + 2], &accum[..i + 1], &xform);
        accum[..i + 2].copy_from_slice(&next[..i + 2]);
    }

    Ok(coef)
}

/// Evaluate a polynomial with ascending-degree coefficients at `x`.
///
/// An empty coefficient slice evaluates to 0.
pub fn eval_poly(x: f64, coefs: &[f64]) -> f64 {
    let len = coefs.len();
    if len >= 2 {
        let mut ret = coefs[len - 2] + x * coefs[len - 1];
        for &c in coefs[..len - 2].iter().rev() {
            ret = c + x * ret;
        }
        ret
    } else if len == 1 {
        coefs[0]
    } else {
        0.0
    }
}

/// Polynomial product; `out` must hold exactly
/// `in1.len() + in2.len() - 1` coefficients.
pub(crate) fn mult_polys(out: &mut [f64], in1: &[f64], in2: &[f64]) {
    debug_assert!(!in1.is_empty() && !in2.is_empty());
    debug_assert_eq!(out.len(), in1.len() + in2.len() - 1);

    out.fill(0.0);
    for (i, a) in in1.iter().enumerate() {
        for (j, b) in in2.iter().enumerate() {
            out[i + j] += a * b;
        }
    }
}
