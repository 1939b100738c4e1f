//! Closed-form state transition and process noise matrices for the attitude error models.
//!
//! The error state is the body-frame attitude error $\delta\theta$ and, for the MARG filters,
//! the gyroscope bias error $\Delta b$. With $\hat\omega$ the bias-compensated rate, the
//! continuous error dynamics are
//!
//! $$
//! \begin{aligned}
//! \dot{\delta\theta} &= -[\hat\omega \times]\, \delta\theta - \Delta b - \eta_r \\\\
//! \dot{\Delta b} &= \eta_w
//! \end{aligned}
//! $$
//!
//! where $\eta_r$ is gyroscope white noise with variance `variance_r` and $\eta_w$ drives the
//! bias random walk with variance `variance_w`. For a rate held constant over $\Delta t$ the
//! discrete transition matrix and noise covariance have closed forms in $K = [\hat\omega\times]$,
//! $n = |\hat\omega|$ and $x = n \Delta t$:
//!
//! $$
//! \Phi = \begin{bmatrix} \Phi_{11} & \Psi \\\\ 0 & I \end{bmatrix}, \quad
//! \Phi_{11} = I - \frac{\sin x}{n} K + \frac{1 - \cos x}{n^2} K^2, \quad
//! \Psi = \frac{1 - \cos x}{n^2} K - I \Delta t - \frac{x - \sin x}{n^3} K^2
//! $$
//!
//! $$
//! \begin{aligned}
//! Q_{11} &= \sigma_r^2 \Delta t I + \sigma_w^2 \left( \frac{\Delta t^3}{3} I + \frac{x^3 / 3 + 2 \sin x - 2 x}{n^5} K^2 \right) \\\\
//! Q_{12} &= -\sigma_w^2 \left( \frac{\Delta t^2}{2} I - \frac{x - \sin x}{n^3} K + \frac{x^2 / 2 + \cos x - 1}{n^4} K^2 \right) \\\\
//! Q_{22} &= \sigma_w^2 \Delta t I
//! \end{aligned}
//! $$
//!
//! Every coefficient is a 0/0 limit at $n = 0$. Below [`W_THRESHOLD`] the power series in
//! $\Delta t$ are used instead; the two branches agree at the threshold to floating point
//! precision. The noise coefficients cancel much more severely than the transition ones, so
//! they keep using their series in $x$ up to $x = 1$.
use nalgebra::{Matrix3, Matrix6, Vector3};

use crate::Real;
use crate::config::{W_THRESHOLD, constant};
use crate::linalg::cross_matrix;

/// Largest `|w| dt` for which the noise coefficients are summed as power series. The
/// closed forms lose about `eps / x⁴` of relative precision to cancellation.
const NOISE_SERIES_LIMIT: f64 = 1.0;
const SERIES_TERMS: usize = 10;

fn small_rate<T: Real>(w: &Vector3<T>) -> bool {
    w.norm() < constant(W_THRESHOLD)
}

/// `Σ_j (-x²)^j / (first + 2j)!`, the remainder of the sine or cosine series after its
/// leading terms are cancelled. Accurate to machine precision for `x² <= 1`.
fn alternating_tail<T: Real>(x2: T, first: usize) -> T {
    let mut term = T::one();
    for k in 2..=first {
        term /= constant::<T>(k as f64);
    }
    let mut sum = term;
    let mut k = first;
    for _ in 0..SERIES_TERMS {
        term *= -x2 / constant::<T>(((k + 1) * (k + 2)) as f64);
        sum += term;
        k += 2;
    }
    sum
}

fn attitude_transition<T: Real>(w: &Vector3<T>, dt: T) -> Matrix3<T> {
    let k1 = cross_matrix::<1, T>(w);
    let k2 = cross_matrix::<2, T>(w);
    let i = Matrix3::identity();
    if small_rate(w) {
        let dt2 = dt * dt;
        let k3 = cross_matrix::<3, T>(w);
        return i - k1 * dt + k2 * (dt2 / constant(2.0)) - k3 * (dt2 * dt / constant(6.0));
    }
    let n = w.norm();
    let ndt = n * dt;
    i - k1 * (ndt.sin() / n) + k2 * ((T::one() - ndt.cos()) / (n * n))
}

/// Attitude-only error transition matrix over `dt` for the body rate `w`.
pub fn ekf_state_transition_matrix_3<T: Real>(w: &Vector3<T>, dt: T) -> Matrix3<T> {
    attitude_transition(w, dt)
}

/// Attitude and bias error transition matrix over `dt` for the bias-compensated rate `w`.
pub fn ekf_state_transition_matrix_6<T: Real>(w: &Vector3<T>, dt: T) -> Matrix6<T> {
    let k1 = cross_matrix::<1, T>(w);
    let k2 = cross_matrix::<2, T>(w);
    let i = Matrix3::identity();

    let psi = if small_rate(w) {
        let dt2 = dt * dt;
        let dt3 = dt2 * dt;
        let k3 = cross_matrix::<3, T>(w);
        k1 * (dt2 / constant(2.0))
            - i * dt
            - k2 * (dt3 / constant(6.0))
            + k3 * (dt3 * dt / constant(24.0))
    } else {
        let n = w.norm();
        let n2 = n * n;
        let ndt = n * dt;
        k1 * ((T::one() - ndt.cos()) / n2) - i * dt - k2 * ((ndt - ndt.sin()) / (n2 * n))
    };

    let mut phi = Matrix6::identity();
    phi.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&attitude_transition(w, dt));
    phi.fixed_view_mut::<3, 3>(0, 3).copy_from(&psi);
    phi
}

/// Attitude-only process noise: `variance * dt * I`.
pub fn noise_covariance_matrix_3<T: Real>(variance: T, dt: T) -> Matrix3<T> {
    Matrix3::from_diagonal_element(variance * dt)
}

/// Attitude and bias process noise over `dt` for the bias-compensated rate `w`.
///
/// `variance_r` is the gyroscope noise variance and `variance_w` the bias random walk
/// variance. The off-diagonal block is written together with its transpose, so the result
/// is symmetric by construction.
pub fn noise_covariance_matrix_6<T: Real>(
    w: &Vector3<T>,
    variance_r: T,
    variance_w: T,
    dt: T,
) -> Matrix6<T> {
    let k1 = cross_matrix::<1, T>(w);
    let k2 = cross_matrix::<2, T>(w);
    let i = Matrix3::<T>::identity();

    let dt2 = dt * dt;
    let dt3 = dt2 * dt;

    let n = w.norm();
    let x = n * dt;
    let (c11, c12_1, c12_2) = if small_rate(w) || x < constant(NOISE_SERIES_LIMIT) {
        let x2 = x * x;
        let dt4 = dt3 * dt;
        (
            dt4 * dt * constant(2.0) * alternating_tail(x2, 5),
            dt3 * alternating_tail(x2, 3),
            dt4 * alternating_tail(x2, 4),
        )
    } else {
        let n2 = n * n;
        let n4 = n2 * n2;
        let (sin, cos) = x.sin_cos();
        let two = constant::<T>(2.0);
        (
            (two * (sin - x) + x * x * x / constant(3.0)) / (n4 * n),
            (x - sin) / (n2 * n),
            (x * x / two + cos - T::one()) / n4,
        )
    };

    let q11 = i * (variance_r * dt + variance_w * dt3 / constant(3.0)) + k2 * (variance_w * c11);
    let q12 = (i * (dt2 / constant(2.0)) - k1 * c12_1 + k2 * c12_2) * -variance_w;
    let q22 = i * (variance_w * dt);

    let mut q = Matrix6::zeros();
    q.fixed_view_mut::<3, 3>(0, 0).copy_from(&q11);
    q.fixed_view_mut::<3, 3>(0, 3).copy_from(&q12);
    q.fixed_view_mut::<3, 3>(3, 0).copy_from(&q12.transpose());
    q.fixed_view_mut::<3, 3>(3, 3).copy_from(&q22);
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, UnitQuaternion};

    fn axis() -> Vector3<f64> {
        Vector3::new(0.3, -0.4, 0.5).normalize()
    }

    #[test]
    fn attitude_transition_is_inverse_rotation() {
        // Φ11 = exp(-[w×] dt), the transpose of the body increment rotation
        let w = Vector3::new(0.4, -0.2, 1.1);
        let dt = 0.3;
        let phi = ekf_state_transition_matrix_3(&w, dt);
        let rotation = UnitQuaternion::from_scaled_axis(w * dt).to_rotation_matrix();
        assert!((phi - rotation.matrix().transpose()).amax() < 1e-12);
    }

    #[test]
    fn zero_rate_transition() {
        let dt = 0.5;
        let phi = ekf_state_transition_matrix_6(&Vector3::zeros(), dt);
        let mut expected = Matrix6::<f64>::identity();
        for k in 0..3 {
            expected[(k, k + 3)] = -dt;
        }
        assert!((phi - expected).amax() < 1e-15);
    }

    #[test]
    fn transition_matches_matrix_exponential() {
        // Φ = exp(F dt) with F = [[-K, -I], [0, 0]], evaluated by a long Taylor series
        let w = Vector3::new(0.7, 0.1, -0.9);
        let dt = 0.2;
        let mut f = DMatrix::<f64>::zeros(6, 6);
        f.view_mut((0, 0), (3, 3)).copy_from(&(-w.cross_matrix()));
        f.view_mut((0, 3), (3, 3))
            .copy_from(&(-Matrix3::<f64>::identity()));
        let a = f * dt;
        let mut term = DMatrix::<f64>::identity(6, 6);
        let mut exp = DMatrix::<f64>::identity(6, 6);
        for k in 1..30 {
            term = &term * &a / k as f64;
            exp += &term;
        }
        let phi = ekf_state_transition_matrix_6(&w, dt);
        for r in 0..6 {
            for c in 0..6 {
                assert!((phi[(r, c)] - exp[(r, c)]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn noise_matches_numerical_integral() {
        // Series coefficients (|w| dt < 1) and closed forms (|w| dt > 1)
        noise_matches_integral(&Vector3::new(-0.5, 0.8, 0.3));
        noise_matches_integral(&Vector3::new(-2.5, 4.0, 1.5));
    }

    fn noise_matches_integral(w: &Vector3<f64>) {
        // Q = ∫ Φ(s) G Qc Gᵀ Φ(s)ᵀ ds by the midpoint rule
        let (vr, vw, dt) = (2e-3, 5e-4, 0.4);
        let steps = 4000;
        let h = dt / steps as f64;
        let mut qc = Matrix6::<f64>::zeros();
        for k in 0..3 {
            qc[(k, k)] = vr;
            qc[(k + 3, k + 3)] = vw;
        }
        let mut integral = Matrix6::<f64>::zeros();
        for i in 0..steps {
            let s = (i as f64 + 0.5) * h;
            let phi = ekf_state_transition_matrix_6(w, s);
            integral += phi * qc * phi.transpose() * h;
        }
        let q = noise_covariance_matrix_6(w, vr, vw, dt);
        assert!((q - integral).amax() < 1e-9, "{}", (q - integral).amax());
    }

    #[test]
    fn noise_is_symmetric() {
        let q = noise_covariance_matrix_6(&Vector3::new(1.0, 2.0, 3.0), 1e-3, 1e-4, 0.01);
        assert_eq!(q, q.transpose());
        let q = noise_covariance_matrix_6(&Vector3::new(1e-7, 0.0, 0.0), 1e-3, 1e-4, 0.01);
        assert_eq!(q, q.transpose());
    }

    #[test]
    fn noise_3_is_diagonal() {
        let q = noise_covariance_matrix_3(0.25_f64, 0.1);
        assert_eq!(q, Matrix3::from_diagonal_element(0.025));
    }

    fn relative_gap(a: &Matrix6<f64>, b: &Matrix6<f64>) -> f64 {
        (a - b).amax() / a.amax()
    }

    #[test]
    fn branches_agree_at_threshold() {
        for dt in [1.0, 0.01] {
            for eps in [1e-9, 1e-12] {
                let below = axis() * (W_THRESHOLD * (1.0 - eps));
                let above = axis() * (W_THRESHOLD * (1.0 + eps));

                let a = ekf_state_transition_matrix_3(&below, dt);
                let b = ekf_state_transition_matrix_3(&above, dt);
                assert!((a - b).amax() < 1e-11);

                let a = ekf_state_transition_matrix_6(&below, dt);
                let b = ekf_state_transition_matrix_6(&above, dt);
                assert!((a - b).amax() < 1e-11);

                let a = noise_covariance_matrix_6(&below, 1.0, 1.0, dt);
                let b = noise_covariance_matrix_6(&above, 1.0, 1.0, dt);
                let gap = relative_gap(&a, &b);
                assert!(gap < 1e-12, "dt {dt} eps {eps}: {gap}");
            }
        }
    }

    #[test]
    fn noise_series_meets_closed_form() {
        for dt in [1.0, 0.01] {
            let n = NOISE_SERIES_LIMIT / dt;
            let below = axis() * (n * (1.0 - 1e-13));
            let above = axis() * (n * (1.0 + 1e-13));
            let a = noise_covariance_matrix_6(&below, 1e-3, 1e-4, dt);
            let b = noise_covariance_matrix_6(&above, 1e-3, 1e-4, dt);
            let gap = relative_gap(&a, &b);
            assert!(gap < 1e-12, "dt {dt}: {gap}");
        }
    }

    #[test]
    fn alternating_tails_match_trigonometry() {
        let x = 0.7_f64;
        let x2 = x * x;
        assert!((alternating_tail(x2, 3) - (x - x.sin()) / (x2 * x)).abs() < 1e-14);
        assert!((alternating_tail(x2, 4) - (x2 / 2.0 + x.cos() - 1.0) / (x2 * x2)).abs() < 1e-13);
        assert!((alternating_tail(0.0_f64, 5) - 1.0 / 120.0).abs() < 1e-18);
    }
}
