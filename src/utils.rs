use nalgebra::DVector;

use crate::problem::Objective;

/// Compute a [numerical approximation](https://en.wikipedia.org/wiki/Numerical_differentiation)
/// to the gradient for testing.
///
/// You can check a [`Gradient`](crate::Gradient) implementation against this
/// before handing it to [`ConjugateGradient`](crate::ConjugateGradient): a
/// wrong analytic gradient is by far the most common reason the minimizer
/// stalls or reports [`Suboptimal`](crate::Status::Suboptimal) on a smooth
/// objective.
///
/// Central differences with a per-coordinate step of `$\sqrt[3]{\varepsilon}
/// \cdot \max(|x_i|, 0.1)$`. The achieved precision is well below floating
/// point precision, so compare with a tolerance around `$10^{-5}$`, not
/// `$10^{-12}$`.
pub fn differentiate_numerically<O: Objective>(
    x: &DVector<f64>,
    target: &mut O,
) -> DVector<f64> {
    let mut x = x.clone();
    let mut grad = DVector::zeros(x.len());

    for i in 0..x.len() {
        let xi = x[i];
        let h = f64::EPSILON.cbrt() * xi.abs().max(0.1);

        x[i] = xi + h;
        let forward = target.evaluate(&x);
        x[i] = xi - h;
        let backward = target.evaluate(&x);
        x[i] = xi;

        grad[i] = (forward - backward) / (2.0 * h);
    }

    grad
}
