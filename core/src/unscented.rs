//! Scaled sigma points and the unscented transform.
//!
//! For an `n`-dimensional state with mean $\mu$ and covariance $P$ the `2n + 1` sigma points
//! are $\mu$ and $\mu \pm$ the columns of $\sqrt{(n + \lambda) P}$, with
//! $\lambda = \alpha^2 (n + \kappa) - n$ and weights
//!
//! $$
//! w^m_0 = \frac{\lambda}{n + \lambda}, \quad
//! w^c_0 = w^m_0 + 1 - \alpha^2 + \beta, \quad
//! w^m_i = w^c_i = \frac{1}{2 (n + \lambda)}
//! $$
//!
//! Sigma point sets are stored column-wise in a `DMatrix`, one point per column.
use std::fmt;

use nalgebra::{DMatrix, DVector};

use crate::Real;
use crate::config::{SigmaPointParameters, constant};
use crate::error::{FilterResult, require};
use crate::linalg::{matrix_square_root, symmetrize};

/// Sigma point generator for a fixed state dimension.
#[derive(Clone)]
pub struct SigmaPoints<T: Real> {
    n: usize,
    lambda: T,
    wm: DVector<T>,
    wc: DVector<T>,
}

impl<T: Real> fmt::Debug for SigmaPoints<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigmaPoints")
            .field("n", &self.n)
            .field("lambda", &self.lambda)
            .finish()
    }
}

impl<T: Real> SigmaPoints<T> {
    /// Fails if the parameters make `n + λ` non-positive.
    pub fn new(n: usize, parameters: &SigmaPointParameters) -> FilterResult<Self> {
        require(n > 0, "sigma point dimension must be positive")?;
        let alpha = constant::<T>(parameters.alpha);
        let beta = constant::<T>(parameters.beta);
        let kappa = constant::<T>(parameters.kappa);
        let nt = constant::<T>(n as f64);

        let lambda = alpha * alpha * (nt + kappa) - nt;
        require(nt + lambda > T::zero(), "sigma point spread n + lambda must be positive")?;

        let w = T::one() / (constant::<T>(2.0) * (nt + lambda));
        let mut wm = DVector::from_element(2 * n + 1, w);
        let mut wc = DVector::from_element(2 * n + 1, w);
        wm[0] = lambda / (nt + lambda);
        wc[0] = wm[0] + (T::one() - alpha * alpha + beta);

        Ok(SigmaPoints { n, lambda, wm, wc })
    }

    /// Number of sigma points, `2n + 1`
    pub fn count(&self) -> usize {
        2 * self.n + 1
    }

    /// Mean weights
    pub fn wm(&self) -> &DVector<T> {
        &self.wm
    }

    /// Covariance weights
    pub fn wc(&self) -> &DVector<T> {
        &self.wc
    }

    /// Sigma points of `(mean, covariance)` as the columns of an `n × (2n + 1)` matrix.
    /// Column 0 is the mean itself.
    pub fn points(&self, mean: &DVector<T>, covariance: &DMatrix<T>) -> DMatrix<T> {
        assert_eq!(mean.len(), self.n, "sigma points: mean dimension mismatch");
        let scaled = covariance * (constant::<T>(self.n as f64) + self.lambda);
        let sqrt_p = matrix_square_root(&scaled);
        let mut pts = DMatrix::<T>::zeros(self.n, self.count());
        pts.column_mut(0).copy_from(mean);
        for i in 0..self.n {
            pts.column_mut(i + 1).copy_from(&(mean + sqrt_p.column(i)));
            pts.column_mut(i + 1 + self.n)
                .copy_from(&(mean - sqrt_p.column(i)));
        }
        pts
    }
}

/// Weighted mean and covariance of a sigma point set plus additive `noise`.
pub fn unscented_transform<T: Real>(
    points: &DMatrix<T>,
    wm: &DVector<T>,
    wc: &DVector<T>,
    noise: &DMatrix<T>,
) -> (DVector<T>, DMatrix<T>) {
    let dim = points.nrows();
    let mut mean = DVector::<T>::zeros(dim);
    for (i, point) in points.column_iter().enumerate() {
        mean += point * wm[i];
    }
    let mut covariance = noise.clone();
    for (i, point) in points.column_iter().enumerate() {
        let diff = point - &mean;
        covariance += &diff * diff.transpose() * wc[i];
    }
    (mean, symmetrize(&covariance))
}

/// Weighted cross-covariance between two sigma point sets propagated from the same points.
pub fn cross_covariance<T: Real>(
    wc: &DVector<T>,
    x_points: &DMatrix<T>,
    x_mean: &DVector<T>,
    z_points: &DMatrix<T>,
    z_mean: &DVector<T>,
) -> DMatrix<T> {
    assert_eq!(
        x_points.ncols(),
        z_points.ncols(),
        "cross covariance: sigma point count mismatch"
    );
    let mut pxz = DMatrix::<T>::zeros(x_points.nrows(), z_points.nrows());
    for (i, (x, z)) in x_points.column_iter().zip(z_points.column_iter()).enumerate() {
        let dx = x - x_mean;
        let dz = z - z_mean;
        pxz += dx * dz.transpose() * wc[i];
    }
    pxz
}
