//! Initialization-aware attitude filters
//!
//! [`FilterImu`] and [`FilterMarg`] own either an initializer or a running filter, never
//! both. Sensor samples are routed to the initializer until it produces the first attitude,
//! at which point the initializer is dropped and the filter chosen by the type parameter
//! takes over for good. Gyroscope samples that arrive before then are ignored since there is
//! no attitude to integrate.
//!
//! ```
//! use attitude::AttitudeConfig;
//! use attitude::filter::EkfFilterImu;
//! use nalgebra::Vector3;
//!
//! let mut filter = EkfFilterImu::<f64>::new(&AttitudeConfig::default()).unwrap();
//! for _ in 0..10 {
//!     filter.update_acc(&Vector3::new(0.0, 0.0, 9.81), 1e-3, 1e-2).unwrap();
//! }
//! assert!(filter.attitude().is_some());
//! ```
use log::info;
use nalgebra::{Matrix3, Matrix6, UnitQuaternion, Vector3};

use crate::config::AttitudeConfig;
use crate::ekf::{EkfImu, EkfMarg};
use crate::error::FilterResult;
use crate::init::{Init, InitMarg};
use crate::ukf::{UkfImu, UkfMarg};
use crate::{ImuFilter, MargFilter, Real};

/// Lifecycle of a wrapped filter
#[derive(Clone, Debug)]
pub enum State<I, F> {
    Initializing(I),
    Running(F),
}

/// Gyroscope and accelerometer attitude filter with built-in initialization.
#[derive(Clone, Debug)]
pub struct FilterImu<T: Real, F: ImuFilter<T>> {
    state: State<Init<T>, F>,
    config: AttitudeConfig,
}

pub type EkfFilterImu<T> = FilterImu<T, EkfImu<T>>;
pub type UkfFilterImu<T> = FilterImu<T, UkfImu<T>>;

impl<T: Real, F: ImuFilter<T>> FilterImu<T, F> {
    /// Fails if `config` could not build the running filter.
    pub fn new(config: &AttitudeConfig) -> FilterResult<Self> {
        F::validate(config)?;
        Ok(FilterImu {
            state: State::Initializing(Init::new(config)),
            config: config.clone(),
        })
    }

    pub fn state(&self) -> &State<Init<T>, F> {
        &self.state
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// Propagate with a gyroscope sample pair. Does nothing until initialized.
    pub fn update_gyro(
        &mut self,
        w0: &Vector3<T>,
        w1: &Vector3<T>,
        variance: T,
        dt: T,
    ) -> FilterResult<()> {
        match &mut self.state {
            State::Initializing(_) => Ok(()),
            State::Running(filter) => filter.predict(w0, w1, variance, dt),
        }
    }

    /// Feed an accelerometer sample. While initializing, returns `Ok(true)` for the sample
    /// that completes initialization.
    pub fn update_acc(
        &mut self,
        a: &Vector3<T>,
        variance: T,
        variance_direction: T,
    ) -> FilterResult<bool> {
        match &mut self.state {
            State::Initializing(init) => {
                let Some(q) = init.update(a) else {
                    return Ok(false);
                };
                self.state = State::Running(F::with_attitude(q, &self.config)?);
                info!("attitude filter running");
                Ok(true)
            }
            State::Running(filter) => filter.update_acc(a, variance, variance_direction),
        }
    }

    /// Current attitude, `None` while initializing
    pub fn attitude(&self) -> Option<UnitQuaternion<T>> {
        match &self.state {
            State::Initializing(_) => None,
            State::Running(filter) => Some(filter.attitude()),
        }
    }

    pub fn covariance(&self) -> Option<Matrix3<T>> {
        match &self.state {
            State::Initializing(_) => None,
            State::Running(filter) => Some(filter.covariance()),
        }
    }
}

/// Gyroscope, accelerometer and magnetometer attitude and bias filter with built-in
/// initialization.
#[derive(Clone, Debug)]
pub struct FilterMarg<T: Real, F: MargFilter<T>> {
    state: State<InitMarg<T>, F>,
    config: AttitudeConfig,
}

pub type EkfFilterMarg<T> = FilterMarg<T, EkfMarg<T>>;
pub type UkfFilterMarg<T> = FilterMarg<T, UkfMarg<T>>;

impl<T: Real, F: MargFilter<T>> FilterMarg<T, F> {
    /// Fails if `config` could not build the running filter.
    pub fn new(config: &AttitudeConfig) -> FilterResult<Self> {
        F::validate(config)?;
        Ok(FilterMarg {
            state: State::Initializing(InitMarg::new(config)),
            config: config.clone(),
        })
    }

    pub fn state(&self) -> &State<InitMarg<T>, F> {
        &self.state
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    fn start(&mut self, q: Option<UnitQuaternion<T>>) -> FilterResult<bool> {
        let Some(q) = q else {
            return Ok(false);
        };
        self.state = State::Running(F::with_attitude(q, &self.config)?);
        info!("attitude and bias filter running");
        Ok(true)
    }

    /// Propagate with a gyroscope sample pair. Does nothing until initialized.
    pub fn update_gyro(
        &mut self,
        w0: &Vector3<T>,
        w1: &Vector3<T>,
        variance_r: T,
        variance_w: T,
        dt: T,
    ) -> FilterResult<()> {
        match &mut self.state {
            State::Initializing(_) => Ok(()),
            State::Running(filter) => filter.predict(w0, w1, variance_r, variance_w, dt),
        }
    }

    pub fn update_acc(
        &mut self,
        a: &Vector3<T>,
        variance: T,
        variance_direction: T,
    ) -> FilterResult<bool> {
        match &mut self.state {
            State::Initializing(init) => {
                let q = init.update_acc(a);
                self.start(q)
            }
            State::Running(filter) => filter.update_acc(a, variance, variance_direction),
        }
    }

    pub fn update_mag(
        &mut self,
        m: &Vector3<T>,
        variance: T,
        variance_direction: T,
    ) -> FilterResult<bool> {
        match &mut self.state {
            State::Initializing(init) => {
                let q = init.update_mag(m);
                self.start(q)
            }
            State::Running(filter) => filter.update_mag(m, variance, variance_direction),
        }
    }

    pub fn update_acc_mag(
        &mut self,
        a: &Vector3<T>,
        m: &Vector3<T>,
        a_variance: T,
        m_variance: T,
    ) -> FilterResult<bool> {
        match &mut self.state {
            State::Initializing(init) => {
                let q = init.update_acc_mag(a, m);
                self.start(q)
            }
            State::Running(filter) => filter.update_acc_mag(a, m, a_variance, m_variance),
        }
    }

    /// Current attitude, `None` while initializing
    pub fn attitude(&self) -> Option<UnitQuaternion<T>> {
        match &self.state {
            State::Initializing(_) => None,
            State::Running(filter) => Some(filter.attitude()),
        }
    }

    /// Current gyroscope bias estimate, `None` while initializing
    pub fn bias(&self) -> Option<Vector3<T>> {
        match &self.state {
            State::Initializing(_) => None,
            State::Running(filter) => Some(filter.bias()),
        }
    }

    pub fn covariance(&self) -> Option<Matrix6<T>> {
        match &self.state {
            State::Initializing(_) => None,
            State::Running(filter) => Some(filter.covariance()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{INIT_COUNT, SigmaPointParameters};
    use crate::error::FilterError;
    use crate::quaternion::{angle_between, local_to_global};

    const G: f64 = 9.81;

    #[test]
    fn gyro_is_ignored_while_initializing() {
        let mut filter = EkfFilterImu::<f64>::new(&AttitudeConfig::default()).expect("config");
        let w = Vector3::new(0.0, 0.0, 1.0);
        assert_eq!(filter.update_gyro(&w, &w, 1e-4, 0.01), Ok(()));
        // Invalid arguments are not even checked before there is a filter
        assert_eq!(filter.update_gyro(&w, &w, -1.0, -0.01), Ok(()));
        assert!(filter.attitude().is_none());
        assert!(filter.covariance().is_none());
        assert!(!filter.is_initialized());
    }

    #[test]
    fn static_imu_initialization() {
        let mut filter = EkfFilterImu::<f64>::new(&AttitudeConfig::default()).expect("config");
        let a = Vector3::new(0.0, 0.0, G);
        for i in 0..INIT_COUNT {
            let done = filter.update_acc(&a, 1e-3, 1e-2).expect("update");
            assert_eq!(done, i + 1 == INIT_COUNT);
            assert_eq!(filter.attitude().is_some(), i + 1 == INIT_COUNT);
        }
        let q = filter.attitude().expect("initialized");
        let z = local_to_global(&q, &(a / G));
        assert!((z - Vector3::z()).norm() < 1e-6);
        assert!(matches!(filter.state(), State::Running(_)));
    }

    #[test]
    fn running_filter_receives_updates() {
        let mut filter = UkfFilterImu::<f64>::new(&AttitudeConfig::default()).expect("config");
        let a = Vector3::new(0.0, 0.0, G);
        for _ in 0..INIT_COUNT {
            filter.update_acc(&a, 1e-3, 1e-2).expect("update");
        }
        let w = Vector3::new(0.0, 0.0, 0.5);
        filter.update_gyro(&w, &w, 1e-6, 0.1).expect("predict");
        let expected = UnitQuaternion::from_scaled_axis(w * 0.1);
        assert!(angle_between(&filter.attitude().expect("running"), &expected) < 1e-9);
        assert_eq!(filter.update_acc(&a, 1e-3, 1e-2), Ok(true));
        assert!(filter.update_gyro(&w, &w, 1e-6, 0.0).is_err());
    }

    #[test]
    fn marg_initializes_from_separate_samples() {
        let mut filter = EkfFilterMarg::<f64>::new(&AttitudeConfig::default()).expect("config");
        let a = Vector3::new(0.0, 0.0, G);
        let m = Vector3::new(0.0, 25.0, -40.0);
        for _ in 0..INIT_COUNT {
            assert_eq!(filter.update_acc(&a, 1e-3, 1e-2), Ok(false));
        }
        assert!(filter.bias().is_none());
        for i in 0..INIT_COUNT {
            let done = filter.update_mag(&m, 1e-3, 1e-2).expect("update");
            assert_eq!(done, i + 1 == INIT_COUNT);
        }
        let q = filter.attitude().expect("initialized");
        assert!(angle_between(&q, &UnitQuaternion::identity()) < 1e-12);
        assert_eq!(filter.bias(), Some(Vector3::zeros()));
        assert!(filter.covariance().is_some());
    }

    #[test]
    fn marg_paired_initialization_then_run() {
        let mut filter = UkfFilterMarg::<f64>::new(&AttitudeConfig::default()).expect("config");
        let a = Vector3::new(0.0, 0.0, G);
        let m = Vector3::new(0.0, 25.0, -40.0);
        for _ in 0..INIT_COUNT {
            filter.update_acc_mag(&a, &m, 1e-3, 1e-3).expect("update");
        }
        assert!(filter.is_initialized());
        filter
            .update_gyro(&Vector3::zeros(), &Vector3::zeros(), 1e-6, 1e-10, 0.01)
            .expect("predict");
        assert_eq!(filter.update_acc_mag(&a, &m, 1e-3, 1e-3), Ok(true));
        let q = filter.attitude().expect("running");
        assert!(angle_between(&q, &UnitQuaternion::identity()) < 1e-6);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let negative = AttitudeConfig {
            initial_variance_r: -1.0,
            ..AttitudeConfig::default()
        };
        assert!(matches!(
            EkfFilterImu::<f64>::new(&negative),
            Err(FilterError::Precondition(_))
        ));
        let negative_bias = AttitudeConfig {
            initial_variance_w: -1.0,
            ..AttitudeConfig::default()
        };
        assert!(matches!(
            UkfFilterMarg::<f64>::new(&negative_bias),
            Err(FilterError::Precondition(_))
        ));

        // n + lambda = kappa + 3 with alpha = 1
        let spread = SigmaPointParameters {
            alpha: 1.0,
            beta: 0.0,
            kappa: -3.0,
        };
        let collapsed = AttitudeConfig {
            ukf: spread,
            ..AttitudeConfig::default()
        };
        assert!(matches!(
            UkfFilterImu::<f64>::new(&collapsed),
            Err(FilterError::Precondition(_))
        ));
        // The sigma point parameters only concern the unscented filters
        assert!(EkfFilterImu::<f64>::new(&collapsed).is_ok());
        assert!(EkfFilterMarg::<f64>::new(&collapsed).is_ok());
        // kappa = -3 still spreads the six dimensional MARG state
        assert!(UkfFilterMarg::<f64>::new(&collapsed).is_ok());
    }
}
