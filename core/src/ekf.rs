//! Extended Kalman filters over the body-frame attitude error.
//!
//! The filters keep the attitude quaternion `q` outside the state vector and estimate the
//! small body-frame rotation `δθ` that corrects it, `q_true = q ⊗ δq(δθ)`. [`EkfMarg`]
//! additionally estimates the gyroscope bias `b`.
//!
//! Every update observes unit reference directions through the attitude. For a reference
//! direction `r` the predicted body-frame measurement is `h = q⁻¹ r q` and, to first order
//! in the error, the measurement is `h + [h×] δθ`. The stacked Jacobian is therefore built
//! from `cross_matrix::<1>(h)` blocks. The covariance correction uses the Joseph form with
//! diagonal measurement noise:
//!
//! $$
//! P^+ = (I - K H) P (I - K H)^T + K R K^T
//! $$
use log::debug;
use nalgebra::{DMatrix, DVector, Matrix3, Matrix6, SMatrix, SVector, UnitQuaternion, Vector3};

use crate::config::{AttitudeConfig, constant};
use crate::error::{FilterError, FilterResult, require, require_time_step, require_variance};
use crate::integrator::first_order_quaternion_integrator;
use crate::linalg::{cross_matrix, from_dynamic, mul_diagonal, symmetrize, to_dynamic};
use crate::linearize::{
    ekf_state_transition_matrix_3, ekf_state_transition_matrix_6, noise_covariance_matrix_3,
    noise_covariance_matrix_6,
};
use crate::measurements::{Observation, mag_measurement, y_axis, z_axis};
use crate::quaternion::{ekf_delta_quaternion, global_to_local};
use crate::{ImuFilter, MargFilter, Real};

/// Kalman correction of an `N`-dimensional error state whose first three components are the
/// attitude error. Returns the error estimate and the corrected covariance.
fn correct<T: Real, const N: usize>(
    q: &UnitQuaternion<T>,
    p: &SMatrix<T, N, N>,
    data: &[Observation<T>],
) -> FilterResult<(SVector<T, N>, SMatrix<T, N, N>)> {
    require(!data.is_empty(), "update needs at least one observation")?;
    for o in data {
        require_variance(o.variance)?;
    }

    let rows = 3 * data.len();
    let mut z = DVector::<T>::zeros(rows);
    let mut hx = DVector::<T>::zeros(rows);
    let mut h = DMatrix::<T>::zeros(rows, N);
    let mut r = DVector::<T>::zeros(rows);
    for (i, o) in data.iter().enumerate() {
        let offset = 3 * i;
        let hx_i = global_to_local(q, &o.reference);
        let z_i = o.measurement.unwrap_or(hx_i);
        hx.rows_mut(offset, 3).copy_from(&hx_i);
        z.rows_mut(offset, 3).copy_from(&z_i);
        h.view_mut((offset, 0), (3, 3))
            .copy_from(&cross_matrix::<1, T>(&hx_i));
        r.rows_mut(offset, 3).fill(o.variance);
    }

    let p = to_dynamic(p);
    let ht = h.transpose();
    let s = &h * &p * &ht + DMatrix::from_diagonal(&r);
    let s_inversed = s
        .try_inverse()
        .ok_or(FilterError::SingularMatrix("innovation covariance"))?;
    let k = &p * &ht * s_inversed;
    let dx = &k * (z - hx);

    let i_kh = DMatrix::<T>::identity(N, N) - &k * &h;
    let p_new = &i_kh * &p * i_kh.transpose() + mul_diagonal(&k, &r) * k.transpose();

    Ok((
        SVector::<T, N>::from_column_slice(dx.as_slice()),
        from_dynamic(&symmetrize(&p_new)),
    ))
}

/// Attitude-only EKF driven by a gyroscope and an accelerometer.
#[derive(Clone, Debug)]
pub struct EkfImu<T: Real> {
    q: UnitQuaternion<T>,
    p: Matrix3<T>,
    config: AttitudeConfig,
}

impl<T: Real> EkfImu<T> {
    /// Start from attitude `q` with an explicit error covariance.
    pub fn new(q: UnitQuaternion<T>, p: Matrix3<T>, config: &AttitudeConfig) -> Self {
        EkfImu {
            q,
            p: symmetrize(&p),
            config: config.clone(),
        }
    }

    /// Correct the attitude with simultaneous vector observations.
    pub fn update(&mut self, data: &[Observation<T>]) -> FilterResult<()> {
        let (dx, p) = correct(&self.q, &self.p, data)?;
        let dq = ekf_delta_quaternion(&(dx * constant::<T>(0.5)));
        self.q = UnitQuaternion::new_normalize((self.q * dq).into_inner());
        self.p = p;
        Ok(())
    }
}

impl<T: Real> ImuFilter<T> for EkfImu<T> {
    fn validate(config: &AttitudeConfig) -> FilterResult<()> {
        config.validate()
    }

    fn with_attitude(q: UnitQuaternion<T>, config: &AttitudeConfig) -> FilterResult<Self> {
        Self::validate(config)?;
        let p = Matrix3::from_diagonal_element(constant(config.initial_variance_r));
        Ok(EkfImu::new(q, p, config))
    }

    fn predict(
        &mut self,
        w0: &Vector3<T>,
        w1: &Vector3<T>,
        variance: T,
        dt: T,
    ) -> FilterResult<()> {
        require_time_step(dt)?;
        require_variance(variance)?;

        let q = first_order_quaternion_integrator(self.q.quaternion(), w0, w1, dt);
        self.q = UnitQuaternion::new_normalize(q);

        let phi = ekf_state_transition_matrix_3(w1, dt);
        let noise = noise_covariance_matrix_3(variance, dt);
        self.p = symmetrize(&(phi * self.p * phi.transpose() + noise));
        Ok(())
    }

    fn update_acc(
        &mut self,
        a: &Vector3<T>,
        variance: T,
        variance_direction: T,
    ) -> FilterResult<bool> {
        let a_norm = a.norm();
        if !self.config.acc_suitable(a_norm) {
            debug!("accelerometer update skipped: |a| = {a_norm}");
            return Ok(false);
        }
        self.update(&[
            Observation::measured(a / a_norm, z_axis(), variance),
            Observation::constraint(y_axis(), variance_direction),
        ])?;
        Ok(true)
    }

    fn attitude(&self) -> UnitQuaternion<T> {
        self.q
    }

    fn covariance(&self) -> Matrix3<T> {
        self.p
    }
}

/// Attitude and gyroscope bias EKF driven by a gyroscope, an accelerometer and a
/// magnetometer.
#[derive(Clone, Debug)]
pub struct EkfMarg<T: Real> {
    q: UnitQuaternion<T>,
    b: Vector3<T>,
    p: Matrix6<T>,
    config: AttitudeConfig,
}

impl<T: Real> EkfMarg<T> {
    pub fn new(
        q: UnitQuaternion<T>,
        b: Vector3<T>,
        p: Matrix6<T>,
        config: &AttitudeConfig,
    ) -> Self {
        EkfMarg {
            q,
            b,
            p: symmetrize(&p),
            config: config.clone(),
        }
    }

    /// Correct attitude and bias with simultaneous vector observations.
    pub fn update(&mut self, data: &[Observation<T>]) -> FilterResult<()> {
        let (dx, p) = correct(&self.q, &self.p, data)?;
        let dx_q: Vector3<T> = dx.fixed_rows::<3>(0).into_owned();
        let dx_b: Vector3<T> = dx.fixed_rows::<3>(3).into_owned();
        let dq = ekf_delta_quaternion(&(dx_q * constant::<T>(0.5)));
        self.q = UnitQuaternion::new_normalize((self.q * dq).into_inner());
        self.b += dx_b;
        self.p = p;
        Ok(())
    }

    /// Reference up axis seen from the body frame
    pub fn z_local(&self) -> Vector3<T> {
        global_to_local(&self.q, &z_axis())
    }

    /// Observe the up axis; the heading is held by a constraint on the north axis.
    pub fn update_z(
        &mut self,
        z: &Vector3<T>,
        variance: T,
        variance_direction: T,
    ) -> FilterResult<()> {
        self.update(&[
            Observation::measured(*z, z_axis(), variance),
            Observation::constraint(y_axis(), variance_direction),
        ])
    }

    /// Observe the north axis; the tilt is held by a constraint on the up axis.
    pub fn update_y(
        &mut self,
        y: &Vector3<T>,
        variance: T,
        variance_direction: T,
    ) -> FilterResult<()> {
        self.update(&[
            Observation::measured(*y, y_axis(), variance),
            Observation::constraint(z_axis(), variance_direction),
        ])
    }

    /// Observe both the up and the north axes.
    pub fn update_z_y(
        &mut self,
        z: &Vector3<T>,
        z_variance: T,
        y: &Vector3<T>,
        y_variance: T,
    ) -> FilterResult<()> {
        self.update(&[
            Observation::measured(*y, y_axis(), y_variance),
            Observation::measured(*z, z_axis(), z_variance),
        ])
    }
}

impl<T: Real> MargFilter<T> for EkfMarg<T> {
    fn validate(config: &AttitudeConfig) -> FilterResult<()> {
        config.validate()
    }

    fn with_attitude(q: UnitQuaternion<T>, config: &AttitudeConfig) -> FilterResult<Self> {
        Self::validate(config)?;
        let r = constant::<T>(config.initial_variance_r);
        let w = constant::<T>(config.initial_variance_w);
        let p = Matrix6::from_diagonal(&SVector::<T, 6>::from([r, r, r, w, w, w]));
        Ok(EkfMarg::new(q, Vector3::zeros(), p, config))
    }

    fn predict(
        &mut self,
        w0: &Vector3<T>,
        w1: &Vector3<T>,
        variance_r: T,
        variance_w: T,
        dt: T,
    ) -> FilterResult<()> {
        require_time_step(dt)?;
        require_variance(variance_r)?;
        require_variance(variance_w)?;

        let wb0 = w0 - self.b;
        let wb1 = w1 - self.b;
        let q = first_order_quaternion_integrator(self.q.quaternion(), &wb0, &wb1, dt);
        self.q = UnitQuaternion::new_normalize(q);

        let phi = ekf_state_transition_matrix_6(&wb1, dt);
        let noise = noise_covariance_matrix_6(&wb1, variance_r, variance_w, dt);
        self.p = symmetrize(&(phi * self.p * phi.transpose() + noise));
        Ok(())
    }

    fn update_acc(
        &mut self,
        a: &Vector3<T>,
        variance: T,
        variance_direction: T,
    ) -> FilterResult<bool> {
        let a_norm = a.norm();
        if !self.config.acc_suitable(a_norm) {
            debug!("accelerometer update skipped: |a| = {a_norm}");
            return Ok(false);
        }
        self.update_z(&(a / a_norm), variance, variance_direction)?;
        Ok(true)
    }

    fn update_mag(
        &mut self,
        m: &Vector3<T>,
        variance: T,
        variance_direction: T,
    ) -> FilterResult<bool> {
        let m_norm = m.norm();
        if !self.config.mag_suitable(m_norm) {
            debug!("magnetometer update skipped: |m| = {m_norm}");
            return Ok(false);
        }
        let min_sin = constant(self.config.min_sin_z_mag);
        let Some(mag) = mag_measurement(&self.z_local(), &(m / m_norm), variance, min_sin) else {
            debug!("magnetometer update skipped: field too close to vertical");
            return Ok(false);
        };
        self.update_y(&mag.y, mag.variance, variance_direction)?;
        Ok(true)
    }

    fn update_acc_mag(
        &mut self,
        a: &Vector3<T>,
        m: &Vector3<T>,
        a_variance: T,
        m_variance: T,
    ) -> FilterResult<bool> {
        let a_norm = a.norm();
        if !self.config.acc_suitable(a_norm) {
            debug!("accelerometer and magnetometer update skipped: |a| = {a_norm}");
            return Ok(false);
        }
        let m_norm = m.norm();
        if !self.config.mag_suitable(m_norm) {
            debug!("accelerometer and magnetometer update skipped: |m| = {m_norm}");
            return Ok(false);
        }
        let min_sin = constant(self.config.min_sin_z_mag);
        let Some(mag) = mag_measurement(&self.z_local(), &(m / m_norm), m_variance, min_sin) else {
            debug!("accelerometer and magnetometer update skipped: field too close to vertical");
            return Ok(false);
        };
        self.update_z_y(&(a / a_norm), a_variance, &mag.y, mag.variance)?;
        Ok(true)
    }

    fn attitude(&self) -> UnitQuaternion<T> {
        self.q
    }

    fn bias(&self) -> Vector3<T> {
        self.b
    }

    fn covariance(&self) -> Matrix6<T> {
        self.p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::asymmetry;
    use crate::quaternion::angle_between;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    const G: f64 = 9.81;

    fn config() -> AttitudeConfig {
        AttitudeConfig::default()
    }

    fn field(q: &UnitQuaternion<f64>) -> Vector3<f64> {
        let dip = 60.0_f64.to_radians();
        global_to_local(q, &(Vector3::new(0.0, dip.cos(), -dip.sin()) * 50.0))
    }

    #[test]
    fn zero_rate_predict_adds_noise() {
        let mut ekf = EkfImu::with_attitude(UnitQuaternion::identity(), &config()).expect("init");
        ekf.predict(&Vector3::zeros(), &Vector3::zeros(), 1e-3, 0.5)
            .expect("predict");
        assert!(angle_between(&ekf.attitude(), &UnitQuaternion::identity()) < 1e-15);
        let expected = Matrix3::from_diagonal_element(1e-2 + 5e-4);
        assert!((ekf.covariance() - expected).amax() < 1e-15);
    }

    #[test]
    fn predict_rotates_about_body_axis() {
        let q0 = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), PI / 2.0);
        let mut ekf = EkfImu::with_attitude(q0, &config()).expect("init");
        let w = Vector3::new(0.0, 0.0, 0.2);
        for _ in 0..10 {
            ekf.predict(&w, &w, 0.0, 0.1).expect("predict");
        }
        let expected = q0 * UnitQuaternion::from_scaled_axis(w * 1.0);
        assert!(angle_between(&ekf.attitude(), &expected) < 1e-12);
    }

    #[test]
    fn invalid_inputs_leave_state_unchanged() {
        let mut ekf = EkfImu::with_attitude(UnitQuaternion::identity(), &config()).expect("init");
        let before = ekf.clone();
        let w = Vector3::new(0.1, 0.0, 0.0);
        assert_eq!(
            ekf.predict(&w, &w, 1e-3, 0.0),
            Err(FilterError::Precondition("time step must be positive and finite"))
        );
        assert!(matches!(
            ekf.predict(&w, &w, -1.0, 0.1),
            Err(FilterError::Precondition(_))
        ));
        assert!(matches!(
            ekf.update_acc(&Vector3::new(0.0, 0.0, G), -1.0, 1.0),
            Err(FilterError::Precondition(_))
        ));
        assert!(ekf.update(&[]).is_err());
        assert_eq!(ekf.attitude(), before.attitude());
        assert_eq!(ekf.covariance(), before.covariance());
    }

    #[test]
    fn out_of_band_acceleration_is_skipped() {
        let mut ekf = EkfImu::with_attitude(UnitQuaternion::identity(), &config()).expect("init");
        let p = ekf.covariance();
        assert_eq!(ekf.update_acc(&Vector3::new(0.0, 3.0, 15.0), 1e-3, 1e-2), Ok(false));
        assert_eq!(ekf.covariance(), p);
    }

    #[test]
    fn zero_variance_is_singular() {
        let mut ekf = EkfImu::with_attitude(UnitQuaternion::identity(), &config()).expect("init");
        let result = ekf.update_acc(&Vector3::new(0.0, 0.0, G), 0.0, 0.0);
        assert_eq!(
            result,
            Err(FilterError::SingularMatrix("innovation covariance"))
        );
    }

    #[test]
    fn accelerometer_levels_attitude() {
        let tilt = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.1);
        let mut ekf = EkfImu::with_attitude(tilt, &config()).expect("init");
        for _ in 0..20 {
            assert_eq!(ekf.update_acc(&Vector3::new(0.0, 0.0, G), 1e-4, 1e-2), Ok(true));
            assert_approx_eq!(ekf.attitude().as_ref().norm(), 1.0, 1e-12);
            assert!(asymmetry(&ekf.covariance()) < 1e-15);
        }
        let z = global_to_local(&ekf.attitude(), &Vector3::z());
        assert!((z - Vector3::z()).norm() < 5e-4);
        assert!(ekf.covariance()[(0, 0)] < 1e-4);
        assert!(ekf.covariance()[(2, 2)] > ekf.covariance()[(0, 0)]);
    }

    #[test]
    fn marg_tracks_attitude_and_heading() {
        let truth = UnitQuaternion::from_euler_angles(0.1, -0.05, 0.8);
        let start = truth * UnitQuaternion::from_scaled_axis(Vector3::new(0.05, -0.04, 0.1));
        let mut ekf = EkfMarg::with_attitude(start, &config()).expect("init");
        let a = global_to_local(&truth, &(Vector3::z() * G));
        let m = field(&truth);
        for _ in 0..30 {
            assert_eq!(ekf.update_acc_mag(&a, &m, 1e-4, 1e-4), Ok(true));
            assert!(asymmetry(&ekf.covariance()) < 1e-15);
        }
        assert!(angle_between(&ekf.attitude(), &truth) < 1e-3);
    }

    #[test]
    fn marg_separate_updates() {
        let truth = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.5);
        let start = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.4);
        let mut ekf = EkfMarg::with_attitude(start, &config()).expect("init");
        let a = Vector3::z() * G;
        let m = field(&truth);
        for _ in 0..30 {
            assert_eq!(ekf.update_acc(&a, 1e-4, 1e-2), Ok(true));
            assert_eq!(ekf.update_mag(&m, 1e-4, 1e-2), Ok(true));
        }
        assert!(angle_between(&ekf.attitude(), &truth) < 1e-3);
    }

    #[test]
    fn marg_rejects_vertical_field() {
        let mut ekf = EkfMarg::with_attitude(UnitQuaternion::identity(), &config()).expect("init");
        let vertical = Vector3::new(0.0, 1.0, -50.0);
        assert_eq!(ekf.update_mag(&vertical, 1e-3, 1e-2), Ok(false));
        assert_eq!(
            ekf.update_acc_mag(&Vector3::new(0.0, 0.0, G), &vertical, 1e-3, 1e-3),
            Ok(false)
        );
        assert_eq!(ekf.update_mag(&Vector3::new(0.0, 1.0, -1.0), 1e-3, 1e-2), Ok(false));
    }

    #[test]
    fn marg_predict_subtracts_bias() {
        let q0 = UnitQuaternion::identity();
        let b = Vector3::new(0.01, -0.02, 0.03);
        let mut ekf = EkfMarg::new(q0, b, Matrix6::identity() * 1e-3, &config());
        ekf.predict(&b, &b, 1e-4, 1e-8, 0.1).expect("predict");
        assert!(angle_between(&ekf.attitude(), &q0) < 1e-15);
        assert_eq!(ekf.bias(), b);
        assert!(asymmetry(&ekf.covariance()) < 1e-15);
    }

    #[test]
    fn marg_z_local_is_body_up() {
        let q = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), PI / 2.0);
        let ekf = EkfMarg::with_attitude(q, &config()).expect("init");
        assert!((ekf.z_local() - Vector3::new(-1.0, 0.0, 0.0)).norm() < 1e-12);
    }
}
