//! Vector arithmetic kernels shared by every minimizer inner loop.
//!
//! Thin wrappers over nalgebra storage. A zero-length vector degenerates
//! naturally: dot and norm are 0, the updates are no-ops.
use nalgebra::DVector;

pub fn dot(a: &DVector<f64>, b: &DVector<f64>) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Squared Euclidean norm.
pub fn norm2(v: &DVector<f64>) -> f64 {
    v.iter().map(|x| x * x).sum()
}

/// `out += scale * v`
pub fn add_scaled(out: &mut DVector<f64>, v: &DVector<f64>, scale: f64) {
    out.axpy(scale, v, 1.0);
}

/// `out = sa * a + sb * b`
pub fn combine(out: &mut DVector<f64>, a: &DVector<f64>, sa: f64, b: &DVector<f64>, sb: f64) {
    debug_assert_eq!(out.len(), a.len());
    debug_assert_eq!(out.len(), b.len());
    for ((o, x), y) in out.iter_mut().zip(a.iter()).zip(b.iter()) {
        *o = sa * x + sb * y;
    }
}

/// `out = sa * a + sb * b + sc * c`
pub fn combine3(
    out: &mut DVector<f64>,
    a: &DVector<f64>,
    sa: f64,
    b: &DVector<f64>,
    sb: f64,
    c: &DVector<f64>,
    sc: f64,
) {
    debug_assert_eq!(out.len(), a.len());
    debug_assert_eq!(out.len(), b.len());
    debug_assert_eq!(out.len(), c.len());
    for (((o, x), y), z) in out.iter_mut().zip(a.iter()).zip(b.iter()).zip(c.iter()) {
        *o = sa * x + sb * y + sc * z;
    }
}

pub fn scale(v: &mut DVector<f64>, s: f64) {
    *v *= s;
}

pub fn zero(v: &mut DVector<f64>) {
    v.fill(0.0);
}

pub fn copy(out: &mut DVector<f64>, v: &DVector<f64>) {
    out.copy_from(v);
}

/// Sign with `sign(0) = 0`, as the step-direction logic expects.
pub(crate) fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}
