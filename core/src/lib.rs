//! Attitude and gyroscope bias estimation with Kalman-style filters
//!
//! This crate fuses gyroscope, accelerometer and (optionally) magnetometer samples into a
//! running estimate of a rigid body's orientation, expressed as a unit quaternion. Two
//! families of nonlinear estimators are provided for two sensor suites:
//!
//! | Sensors | Extended Kalman Filter | Unscented Kalman Filter | State (error) dimension |
//! |---------|------------------------|-------------------------|-------------------------|
//! | IMU (gyroscope + accelerometer) | [ekf::EkfImu] | [ukf::UkfImu] | 3 (attitude) |
//! | MARG (IMU + magnetometer) | [ekf::EkfMarg] | [ukf::UkfMarg] | 6 (attitude + gyro bias) |
//!
//! None of the filters keep a covariance over the four quaternion components. The
//! covariance is kept over a three-parameter error about the current estimate, which avoids
//! the rank deficiency of a unit-quaternion covariance. The EKF uses the half-angle small
//! error vector and analytic Jacobians; the UKF uses generalized Rodrigues parameters and
//! propagates sigma points through the full quaternion kinematics.
//!
//! The filters need an initial attitude. [init::Init] and [init::InitMarg] average a fixed
//! number of samples to produce one, and [filter::FilterImu] / [filter::FilterMarg] hide
//! that two-phase lifecycle behind a single object.
//!
//! ## Conventions
//!
//! The reference frame is East-North-Up: `z` points up (an accelerometer at rest measures
//! `+z`), `y` is horizontal magnetic north and `x = y × z`. The attitude quaternion `q`
//! rotates body vectors into the reference frame:
//!
//! $$
//! v^{global} = q \otimes v^{local} \otimes q^{-1}
//! $$
//!
//! Angular rate increments and attitude errors are expressed in the body frame and compose
//! on the right, `q(+) = q(-) ⊗ δq`.
//!
//! ## Crate overview
//!
//! - [config]: tuning constants and the serializable runtime configuration.
//! - [error]: the error taxonomy.
//! - [linalg]: symmetrization, robust square roots and the cross-product matrix utility.
//! - [integrator]: zeroth- and first-order quaternion integrators.
//! - [linearize]: closed-form state transition and process noise matrices.
//! - [quaternion]: error-quaternion encodings and frame rotation helpers.
//! - [measurements]: vector observations and the magnetometer measurement reducer.
//! - [init]: initial attitude determination from averaged samples.
//! - [unscented]: sigma points and the unscented transform.
//! - [ekf], [ukf]: the filters.
//! - [filter]: initialization-aware wrappers.
//!
//! All operations are synchronous and allocate only small matrices. Each filter instance is
//! exclusively owned by its caller; independent instances share no state and can be driven
//! from different threads without locking.
pub mod config;
pub mod ekf;
pub mod error;
pub mod filter;
pub mod init;
pub mod integrator;
pub mod linalg;
pub mod linearize;
pub mod measurements;
pub mod quaternion;
pub mod ukf;
pub mod unscented;

use nalgebra::{Matrix3, Matrix6, RealField, UnitQuaternion, Vector3};

pub use crate::config::AttitudeConfig;
pub use crate::error::{FilterError, FilterResult};

/// Floating point scalar the filters are generic over (`f32`, `f64`).
pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}

/// Common interface of the attitude-only filters ([ekf::EkfImu], [ukf::UkfImu])
pub trait ImuFilter<T: Real>: Sized {
    /// Check that `config` can build this filter.
    fn validate(config: &AttitudeConfig) -> FilterResult<()>;
    /// Build a running filter around a known initial attitude.
    fn with_attitude(q: UnitQuaternion<T>, config: &AttitudeConfig) -> FilterResult<Self>;
    /// Propagate the attitude with the angular rates measured at the start (`w0`) and the
    /// end (`w1`) of the interval `dt`. `variance` is the gyroscope noise variance.
    fn predict(&mut self, w0: &Vector3<T>, w1: &Vector3<T>, variance: T, dt: T)
    -> FilterResult<()>;
    /// Correct the attitude with an accelerometer sample. Returns `Ok(false)` when the
    /// sample was rejected and the estimate left unchanged.
    fn update_acc(&mut self, a: &Vector3<T>, variance: T, variance_direction: T)
    -> FilterResult<bool>;
    /// Current attitude estimate
    fn attitude(&self) -> UnitQuaternion<T>;
    /// Current attitude error covariance
    fn covariance(&self) -> Matrix3<T>;
}

/// Common interface of the attitude and gyroscope bias filters ([ekf::EkfMarg], [ukf::UkfMarg])
pub trait MargFilter<T: Real>: Sized {
    fn validate(config: &AttitudeConfig) -> FilterResult<()>;
    fn with_attitude(q: UnitQuaternion<T>, config: &AttitudeConfig) -> FilterResult<Self>;
    /// Propagate attitude and bias. `variance_r` is the gyroscope noise variance and
    /// `variance_w` the variance of the bias random walk.
    fn predict(
        &mut self,
        w0: &Vector3<T>,
        w1: &Vector3<T>,
        variance_r: T,
        variance_w: T,
        dt: T,
    ) -> FilterResult<()>;
    fn update_acc(&mut self, a: &Vector3<T>, variance: T, variance_direction: T)
    -> FilterResult<bool>;
    fn update_mag(&mut self, m: &Vector3<T>, variance: T, variance_direction: T)
    -> FilterResult<bool>;
    fn update_acc_mag(
        &mut self,
        a: &Vector3<T>,
        m: &Vector3<T>,
        a_variance: T,
        m_variance: T,
    ) -> FilterResult<bool>;
    fn attitude(&self) -> UnitQuaternion<T>;
    fn bias(&self) -> Vector3<T>;
    /// Current attitude and bias error covariance
    fn covariance(&self) -> Matrix6<T>;
}
