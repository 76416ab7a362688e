//! Permutation-pivoted in-place matrix inversion.
//!
//! Gauss-Jordan elimination with two robustness heuristics: the rows are
//! pre-permuted in random order, and each pivot step picks the
//! largest-magnitude entry of the pivot row among the variable columns not
//! yet used. Bookkeeping permutations are inverted at the end to restore
//! the original row and column order. The noise-regression code uses this
//! through [`least_squares_inverse`].
use nalgebra::DMatrix;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::Singular;

/// Invert a square matrix in place.
///
/// On `Err(Singular)` the matrix contents are unspecified; callers either
/// give up on the fit or fall back to a coarser strategy.
///
/// # Panics
///
/// Panics if the matrix is not square.
pub fn invert_in_place<R: Rng>(mat: &mut DMatrix<f64>, rng: &mut R) -> Result<(), Singular> {
    let n = mat.nrows();
    assert_eq!(n, mat.ncols(), "matrix must be square");
    if n == 0 {
        return Ok(());
    }

    // Random row order. Values >= n in var_permutation mark columns not yet
    // used as pivots.
    let mut row_permutation: Vec<usize> = (0..n).collect();
    row_permutation.shuffle(rng);
    permute_rows(mat, &row_permutation);

    let mut var_permutation: Vec<usize> = (n..2 * n).collect();

    for pivot_row in 0..n {
        let pivot_var = best_unused_var(mat, &var_permutation, pivot_row)?;
        eliminate_var_from_other_rows(mat, pivot_row, pivot_var);
        core::mem::swap(
            &mut row_permutation[pivot_row],
            &mut var_permutation[pivot_var],
        );
    }

    // Each row now carries its pivot column tagged by n.
    for tag in row_permutation.iter_mut() {
        *tag -= n;
    }

    let row_inverse = invert_permutation(&row_permutation);
    let var_inverse = invert_permutation(&var_permutation);

    permute_columns(mat, &var_inverse);
    permute_rows(mat, &row_inverse);

    Ok(())
}

/// Least-squares pseudoinverse `$(A^\top A)^{-1} A^\top$` of a tall matrix.
///
/// Fails if `$A^\top A$` is singular (rank-deficient columns).
///
/// # Panics
///
/// Panics if the matrix has fewer rows than columns.
pub fn least_squares_inverse<R: Rng>(
    m: &DMatrix<f64>,
    rng: &mut R,
) -> Result<DMatrix<f64>, Singular> {
    assert!(m.nrows() >= m.ncols(), "matrix must not be wider than tall");

    let mt = m.transpose();
    let mut mtm = &mt * m;
    invert_in_place(&mut mtm, rng)?;
    Ok(mtm * mt)
}

fn best_unused_var(
    mat: &DMatrix<f64>,
    var_permutation: &[usize],
    pivot_row: usize,
) -> Result<usize, Singular> {
    let n = var_permutation.len();
    let mut best_var = None;
    let mut best_a = 0.0;

    for (var, &tag) in var_permutation.iter().enumerate() {
        if tag >= n {
            let a = mat[(pivot_row, var)].abs();
            if a > best_a {
                best_a = a;
                best_var = Some(var);
            }
        }
    }

    best_var.ok_or(Singular)
}

fn eliminate_var_from_other_rows(mat: &mut DMatrix<f64>, pivot_row: usize, pivot_var: usize) {
    let n = mat.nrows();

    debug_assert!(mat[(pivot_row, pivot_var)] != 0.0);
    let self_multiplier = 1.0 / mat[(pivot_row, pivot_var)];

    // The pivot entry is replaced by 1 before normalizing, so after the
    // scale it holds 1/pivot: the pivot column accumulates the inverse.
    mat[(pivot_row, pivot_var)] = 1.0;
    for col in 0..n {
        mat[(pivot_row, col)] *= self_multiplier;
    }

    for row in 0..n {
        if row == pivot_row {
            continue;
        }
        let multiplier = -mat[(row, pivot_var)];
        mat[(row, pivot_var)] = 0.0;
        if multiplier != 0.0 {
            for col in 0..n {
                let v = mat[(pivot_row, col)];
                mat[(row, col)] += multiplier * v;
            }
        }
    }
}

fn invert_permutation(permutation: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; permutation.len()];
    for (i, &p) in permutation.iter().enumerate() {
        inverse[p] = i;
    }
    inverse
}

/// `mat[i] = old_mat[permutation[i]]`
fn permute_rows(mat: &mut DMatrix<f64>, permutation: &[usize]) {
    let old = mat.clone();
    for (i, &p) in permutation.iter().enumerate() {
        for j in 0..mat.ncols() {
            mat[(i, j)] = old[(p, j)];
        }
    }
}

/// `row[j] = old_row[permutation[j]]` for every row
fn permute_columns(mat: &mut DMatrix<f64>, permutation: &[usize]) {
    let n = mat.ncols();
    let mut tmp = vec![0.0; n];
    for i in 0..mat.nrows() {
        for (j, &p) in permutation.iter().enumerate() {
            tmp[j] = mat[(i, p)];
        }
        for (j, &v) in tmp.iter().enumerate() {
            mat[(i, j)] = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dmatrix;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn inverts_known_matrix() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut m = dmatrix![4.0, 7.0; 2.0, 6.0];
        invert_in_place(&mut m, &mut rng).unwrap();
        let expected = dmatrix![0.6, -0.7; -0.2, 0.4];
        for (a, b) in m.iter().zip(expected.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn double_inversion_round_trips() {
        let mut rng = SmallRng::seed_from_u64(42);
        for n in [2usize, 5, 9] {
            // diagonally dominant, hence well conditioned
            let mut m = DMatrix::from_fn(n, n, |i, j| {
                let v: f64 = rng.gen_range(-1.0..1.0);
                if i == j {
                    v + 5.0
                } else {
                    v
                }
            });
            let original = m.clone();
            invert_in_place(&mut m, &mut rng).unwrap();
            invert_in_place(&mut m, &mut rng).unwrap();
            for (a, b) in m.iter().zip(original.iter()) {
                assert_relative_eq!(a, b, epsilon = 1e-5, max_relative = 1e-5);
            }
        }
    }

    #[test]
    fn rank_deficient_is_singular() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut m = dmatrix![1.0, 2.0; 2.0, 4.0];
        assert_eq!(invert_in_place(&mut m, &mut rng), Err(Singular));

        let mut z = DMatrix::zeros(3, 3);
        assert_eq!(invert_in_place(&mut z, &mut rng), Err(Singular));
    }

    #[test]
    fn pseudoinverse_is_left_inverse() {
        let mut rng = SmallRng::seed_from_u64(11);
        // Vandermonde design matrix of a quadratic fit
        let m = DMatrix::from_fn(6, 3, |i, j| (i as f64).powi(j as i32));
        let pinv = least_squares_inverse(&m, &mut rng).unwrap();
        let eye = &pinv * &m;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(eye[(i, j)], expected, epsilon = 1e-8);
            }
        }
    }
}
