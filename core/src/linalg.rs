//! Linear algebra helpers for the attitude filters.
//!
//! Public API:
//!     pub fn symmetrize(m) -> m
//!     pub fn matrix_square_root(&DMatrix<T>) -> DMatrix<T>
//!     pub fn cross_matrix::<N>(&Vector3<T>) -> Matrix3<T>
//!     pub fn mul_diagonal(&DMatrix<T>, &DVector<T>) -> DMatrix<T>
//!     pub fn to_dynamic / from_dynamic
//!
//! Square root strategy:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp)
//! 4) Symmetric EVD with eigenvalue floor → S = U * sqrt(Λ⁺) * Uᵀ

use nalgebra::allocator::Allocator;
use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector, DefaultAllocator, Dim, Matrix3, OMatrix, SMatrix, Vector3};

use crate::Real;
use crate::config::constant;

/// Symmetrize a square matrix: P ← 0.5 (P + Pᵀ)
///
/// Removes the round-off asymmetry that accumulates in covariance products.
#[inline]
pub fn symmetrize<T: Real, D: Dim>(m: &OMatrix<T, D, D>) -> OMatrix<T, D, D>
where
    DefaultAllocator: Allocator<D, D>,
{
    let mut tr = m.transpose();
    tr += m;
    tr * constant::<T>(0.5)
}

/// Largest absolute difference between a matrix and its transpose.
pub fn asymmetry<T: Real, D: Dim>(m: &OMatrix<T, D, D>) -> T
where
    DefaultAllocator: Allocator<D, D>,
{
    let mut difference = m.transpose();
    difference -= m;
    difference.amax()
}

/// Compute a robust square root `S` such that approximately `matrix ≈ S * Sᵀ`.
///
/// Attempts Cholesky decomposition first (yielding a lower triangular L). If the matrix
/// is not numerically positive definite, a small diagonal jitter is added on a geometric
/// ramp; as a last resort the symmetric eigen decomposition with floored eigenvalues is
/// used (S = V * sqrt(D) * Vᵀ).
///
/// # Panics
/// If the matrix is not square.
pub fn matrix_square_root<T: Real>(matrix: &DMatrix<T>) -> DMatrix<T> {
    assert!(
        matrix.is_square(),
        "matrix_square_root: matrix must be square"
    );
    const INITIAL_JITTER: f64 = 1e-12;
    const MAX_JITTER: f64 = 1e-6;
    const MAX_TRIES: usize = 6;
    const EIGEN_FLOOR: f64 = 1e-12;
    let p = symmetrize(matrix);
    if let Some(s) = chol_sqrt(&p) {
        return s;
    }
    if let Some(s) = chol_sqrt_with_jitter(&p, INITIAL_JITTER, MAX_JITTER, MAX_TRIES) {
        return s;
    }
    evd_symmetric_sqrt_with_floor(&p, constant(EIGEN_FLOOR))
}

/// Plain Cholesky square root, or None if the factorization fails.
fn chol_sqrt<T: Real>(p: &DMatrix<T>) -> Option<DMatrix<T>> {
    Cholesky::new(p.clone()).map(|ch| ch.l())
}

/// Cholesky with diagonal jitter (geometric ramp). Returns None if all tries fail.
fn chol_sqrt_with_jitter<T: Real>(
    p: &DMatrix<T>,
    initial_jitter: f64,
    max_jitter: f64,
    max_tries: usize,
) -> Option<DMatrix<T>> {
    let n = p.nrows();
    let mut jitter = initial_jitter;
    for _ in 0..max_tries {
        let mut pj = p.clone();
        for i in 0..n {
            pj[(i, i)] += constant::<T>(jitter);
        }
        if let Some(ch) = Cholesky::new(pj) {
            return Some(ch.l());
        }
        jitter *= 10.0;
        if jitter > max_jitter {
            break;
        }
    }
    None
}

/// Symmetric EVD square root with eigenvalue flooring:
/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor<T: Real>(p: &DMatrix<T>, floor: T) -> DMatrix<T> {
    let se = SymmetricEigen::new(p.clone());
    let lambdas = se.eigenvalues.map(|l| if l < floor { floor } else { l });
    let u = se.eigenvectors;
    let sigma_half = DMatrix::from_diagonal(&lambdas.map(|l| l.sqrt()));
    &u * sigma_half * u.transpose()
}

/// Matrix of the `N`-fold repeated cross product with `v`, for `N` in 1..=6.
///
/// `cross_matrix::<1>(v) * x == v × x`, `cross_matrix::<2>(v) * x == v × (v × x)` and so
/// on. With `K = [v×]` and `n² = |v|²`:
///
/// $$
/// K^2 = v v^T - n^2 I, \quad K^3 = -n^2 K, \quad K^4 = -n^2 K^2, \quad
/// K^5 = n^4 K, \quad K^6 = n^4 K^2
/// $$
pub fn cross_matrix<const N: usize, T: Real>(v: &Vector3<T>) -> Matrix3<T> {
    const { assert!(N >= 1 && N <= 6, "cross_matrix order must be in 1..=6") };
    match N {
        1 => v.cross_matrix(),
        2 => double_cross_matrix(v),
        3 => v.cross_matrix() * -v.norm_squared(),
        4 => double_cross_matrix(v) * -v.norm_squared(),
        5 => v.cross_matrix() * (v.norm_squared() * v.norm_squared()),
        _ => double_cross_matrix(v) * (v.norm_squared() * v.norm_squared()),
    }
}

fn double_cross_matrix<T: Real>(v: &Vector3<T>) -> Matrix3<T> {
    v * v.transpose() - Matrix3::from_diagonal_element(v.norm_squared())
}

/// `m * diag(d)` without forming the diagonal matrix.
///
/// Only diagonal measurement noise is supported by the filters; this is how `K R Kᵀ` is
/// evaluated.
pub fn mul_diagonal<T: Real>(m: &DMatrix<T>, d: &DVector<T>) -> DMatrix<T> {
    assert_eq!(m.ncols(), d.len(), "mul_diagonal: dimension mismatch");
    let mut res = m.clone();
    for (j, mut column) in res.column_iter_mut().enumerate() {
        column *= d[j];
    }
    res
}

/// Copy a fixed-size matrix into a dynamically sized one.
pub fn to_dynamic<T: Real, const R: usize, const C: usize>(m: &SMatrix<T, R, C>) -> DMatrix<T> {
    DMatrix::from_column_slice(R, C, m.as_slice())
}

/// Copy a dynamically sized matrix into a fixed-size one.
///
/// # Panics
/// If the shapes differ.
pub fn from_dynamic<T: Real, const R: usize, const C: usize>(m: &DMatrix<T>) -> SMatrix<T, R, C> {
    assert_eq!(m.shape(), (R, C), "from_dynamic: shape mismatch");
    SMatrix::from_column_slice(m.as_slice())
}

/* =============================== Tests ==================================== */

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix6;

    fn approx_eq(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) -> bool {
        a.shape() == b.shape() && (a - b).amax() <= tol
    }

    #[test]
    fn t_symmetrize() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let s = symmetrize(&m);
        let s_expected = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]);
        assert!(approx_eq(&s, &s_expected, 1e-15));

        let mut f = Matrix6::<f64>::identity();
        f[(0, 5)] = 4.0;
        let fs = symmetrize(&f);
        assert_eq!(fs[(0, 5)], 2.0);
        assert_eq!(fs[(5, 0)], 2.0);
        assert_eq!(asymmetry(&fs), 0.0);
        assert_eq!(asymmetry(&f), 4.0);
    }

    #[test]
    fn t_chol_sqrt_spd() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.5, 0.0, 1.0, -1.0, 0.0, 0.0, 0.2]);
        let p = &a * a.transpose();
        let s = chol_sqrt(&p).expect("Cholesky should succeed for SPD");
        assert!(approx_eq(&(&s * s.transpose()), &p, 1e-12));
    }

    #[test]
    fn t_chol_sqrt_with_jitter() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 0.2, 0.0, 0.0, 1.0, 0.2, 0.0, 0.0, 1.0]);
        let mut p = &a * a.transpose();
        p[(2, 2)] -= 1e-10;
        let s =
            chol_sqrt_with_jitter(&p, 1e-12, 1e-6, 6).expect("jittered Cholesky should succeed");
        assert!(approx_eq(&(&s * s.transpose()), &symmetrize(&p), 1e-8));
    }

    #[test]
    fn t_square_root_of_semidefinite_matrix() {
        // Rank one: Cholesky fails, EVD fallback floors the null space
        let v = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let p = &v * v.transpose();
        let s = matrix_square_root(&p);
        assert!(approx_eq(&(&s * s.transpose()), &p, 1e-5));
    }

    #[test]
    fn t_square_root_f32() {
        let p = DMatrix::<f32>::from_diagonal(&DVector::from_vec(vec![4.0, 9.0, 16.0]));
        let s = matrix_square_root(&p);
        assert!((s[(0, 0)] - 2.0).abs() < 1e-6);
        assert!((s[(1, 1)] - 3.0).abs() < 1e-6);
        assert!((s[(2, 2)] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn t_cross_matrix_orders() {
        let v = Vector3::new(0.3, -1.2, 0.7);
        let x = Vector3::new(-0.5, 0.25, 2.0);

        let mut expected = x;
        let mut results = Vec::new();
        for _ in 0..6 {
            expected = v.cross(&expected);
            results.push(expected);
        }
        assert!((cross_matrix::<1, f64>(&v) * x - results[0]).norm() < 1e-12);
        assert!((cross_matrix::<2, f64>(&v) * x - results[1]).norm() < 1e-12);
        assert!((cross_matrix::<3, f64>(&v) * x - results[2]).norm() < 1e-12);
        assert!((cross_matrix::<4, f64>(&v) * x - results[3]).norm() < 1e-12);
        assert!((cross_matrix::<5, f64>(&v) * x - results[4]).norm() < 1e-12);
        assert!((cross_matrix::<6, f64>(&v) * x - results[5]).norm() < 1e-12);
    }

    #[test]
    fn t_cross_matrix_is_skew() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let k = cross_matrix::<1, f64>(&v);
        assert_eq!(k, -k.transpose());
        assert_eq!(k[(0, 1)], -3.0);
        assert_eq!(k[(0, 2)], 2.0);
        assert_eq!(k[(1, 2)], -1.0);
        let k2 = cross_matrix::<2, f64>(&v);
        assert_eq!(k2, k2.transpose());
    }

    #[test]
    fn t_mul_diagonal() {
        let m = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let d = DVector::from_vec(vec![2.0, 0.5, -1.0]);
        let expected = &m * DMatrix::from_diagonal(&d);
        assert!(approx_eq(&mul_diagonal(&m, &d), &expected, 1e-15));
    }

    #[test]
    fn t_dynamic_round_trip() {
        let m = Matrix6::<f64>::from_fn(|i, j| (i * 6 + j) as f64);
        let d = to_dynamic(&m);
        assert_eq!(d.shape(), (6, 6));
        assert_eq!(d[(2, 5)], m[(2, 5)]);
        let back: Matrix6<f64> = from_dynamic(&d);
        assert_eq!(back, m);
    }
}
