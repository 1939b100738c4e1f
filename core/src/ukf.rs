//! Unscented Kalman filters over generalized Rodrigues attitude errors.
//!
//! The mean state holds the attitude error about the current attitude `q` as generalized
//! Rodrigues parameters (see [`crate::quaternion`]) and, for [`UkfMarg`], the gyroscope bias.
//! A predict/update cycle runs as follows:
//!
//! 1. The attitude error of the mean is zeroed and `2n + 1` sigma points are drawn.
//! 2. Each point becomes a full attitude `q ⊗ δq(p_i)` that is integrated through the
//!    quaternion kinematics with its own bias.
//! 3. The propagated attitudes are expressed as errors about the propagated center point
//!    and the unscented transform gives the predicted mean and covariance.
//! 4. An update projects the reference directions through every propagated attitude,
//!    forms the Kalman gain from the unscented measurement statistics and folds the
//!    corrected error back into `q`.
//!
//! An update consumes the sigma points of the preceding predict. An update that does not
//! follow a predict is skipped and reports `Ok(false)`.
use log::debug;
use nalgebra::{DMatrix, DVector, Matrix3, Matrix6, UnitQuaternion, Vector3};

use crate::config::{AttitudeConfig, constant};
use crate::error::{FilterError, FilterResult, require, require_time_step, require_variance};
use crate::integrator::first_order_quaternion_integrator;
use crate::linalg::{from_dynamic, symmetrize, to_dynamic};
use crate::linearize::{noise_covariance_matrix_3, noise_covariance_matrix_6};
use crate::measurements::{Observation, mag_measurement, y_axis, z_axis};
use crate::quaternion::{
    error_to_quaternion, error_to_quaternion_about, global_to_local, quaternion_to_error_about,
};
use crate::unscented::{SigmaPoints, cross_covariance, unscented_transform};
use crate::{ImuFilter, MargFilter, Real};

/// Sigma points carried from a predict to the following update.
#[derive(Clone, Debug)]
struct Propagation<T: Real> {
    quaternions: Vec<UnitQuaternion<T>>,
    points: DMatrix<T>,
}

/// State and sigma point machinery shared by both filters. Rows 0..3 of `x` are the
/// attitude error, rows 3..6 (if present) the gyroscope bias.
#[derive(Clone, Debug)]
struct SigmaPointFilter<T: Real> {
    q: UnitQuaternion<T>,
    x: DVector<T>,
    p: DMatrix<T>,
    sigma_points: SigmaPoints<T>,
    propagation: Option<Propagation<T>>,
}

impl<T: Real> SigmaPointFilter<T> {
    fn new(
        q: UnitQuaternion<T>,
        x: DVector<T>,
        p: DMatrix<T>,
        config: &AttitudeConfig,
    ) -> FilterResult<Self> {
        let sigma_points = SigmaPoints::new(x.len(), &config.ukf)?;
        Ok(SigmaPointFilter {
            q,
            x,
            p: symmetrize(&p),
            sigma_points,
            propagation: None,
        })
    }

    fn bias(&self) -> Vector3<T> {
        if self.x.len() == 6 {
            self.x.fixed_rows::<3>(3).into_owned()
        } else {
            Vector3::zeros()
        }
    }

    fn predict(&mut self, w0: &Vector3<T>, w1: &Vector3<T>, noise: &DMatrix<T>, dt: T) {
        let n = self.x.len();
        self.x.fixed_rows_mut::<3>(0).fill(T::zero());

        let points = self.sigma_points.points(&self.x, &self.p);

        let mut quaternions = Vec::with_capacity(points.ncols());
        for point in points.column_iter() {
            let error: Vector3<T> = point.fixed_rows::<3>(0).into_owned();
            let bias: Vector3<T> = if n == 6 {
                point.fixed_rows::<3>(3).into_owned()
            } else {
                Vector3::zeros()
            };
            let point_q = error_to_quaternion_about(&error, &self.q);
            let propagated = first_order_quaternion_integrator(
                point_q.quaternion(),
                &(w0 - bias),
                &(w1 - bias),
                dt,
            );
            quaternions.push(UnitQuaternion::new_normalize(propagated));
        }

        debug_assert!(points.fixed_view::<3, 1>(0, 0).iter().all(|e| *e == T::zero()));
        let zero_inversed = quaternions[0].inverse();
        let mut propagated_points = points;
        for (i, q) in quaternions.iter().enumerate().skip(1) {
            let error = quaternion_to_error_about(q, &zero_inversed);
            propagated_points.fixed_view_mut::<3, 1>(0, i).copy_from(&error);
        }

        let (x, p) = unscented_transform(
            &propagated_points,
            self.sigma_points.wm(),
            self.sigma_points.wc(),
            noise,
        );
        let x_error: Vector3<T> = x.fixed_rows::<3>(0).into_owned();
        self.q = error_to_quaternion_about(&x_error, &quaternions[0]);
        self.x = x;
        self.p = p;
        self.propagation = Some(Propagation {
            quaternions,
            points: propagated_points,
        });
    }

    fn update(&mut self, data: &[Observation<T>]) -> FilterResult<bool> {
        require(!data.is_empty(), "update needs at least one observation")?;
        for o in data {
            require_variance(o.variance)?;
        }
        let Some(propagation) = &self.propagation else {
            debug!("sigma point update skipped: no preceding predict");
            return Ok(false);
        };

        let rows = 3 * data.len();
        let count = self.sigma_points.count();
        let mut r = DVector::<T>::zeros(rows);
        let mut sigmas_h = DMatrix::<T>::zeros(rows, count);
        for (j, o) in data.iter().enumerate() {
            let offset = 3 * j;
            r.rows_mut(offset, 3).fill(o.variance);
            for (i, q) in propagation.quaternions.iter().enumerate() {
                sigmas_h
                    .fixed_view_mut::<3, 1>(offset, i)
                    .copy_from(&global_to_local(q, &o.reference));
            }
        }

        let wc = self.sigma_points.wc();
        let (x_z, p_z) = unscented_transform(
            &sigmas_h,
            self.sigma_points.wm(),
            wc,
            &DMatrix::from_diagonal(&r),
        );
        let p_xz = cross_covariance(wc, &propagation.points, &self.x, &sigmas_h, &x_z);

        // A constraint without a measurement observes its own prediction
        let mut z = x_z.clone();
        for (j, o) in data.iter().enumerate() {
            if let Some(m) = &o.measurement {
                z.fixed_rows_mut::<3>(3 * j).copy_from(m);
            }
        }

        let p_z_inversed = p_z
            .try_inverse()
            .ok_or(FilterError::SingularMatrix("measurement covariance"))?;
        let k = &p_xz * p_z_inversed;
        let x = &self.x + &k * (z - x_z);
        let p = &self.p - &p_xz * k.transpose();
        let center = propagation.quaternions[0];

        let x_error: Vector3<T> = x.fixed_rows::<3>(0).into_owned();
        self.q = center * error_to_quaternion(&x_error);
        self.x = x;
        self.x.fixed_rows_mut::<3>(0).fill(T::zero());
        self.p = symmetrize(&p);
        self.propagation = None;
        Ok(true)
    }
}

/// Attitude-only UKF driven by a gyroscope and an accelerometer.
#[derive(Clone, Debug)]
pub struct UkfImu<T: Real> {
    filter: SigmaPointFilter<T>,
    config: AttitudeConfig,
}

impl<T: Real> UkfImu<T> {
    /// Start from attitude `q` with an explicit error covariance. Fails if the sigma point
    /// parameters in `config` are degenerate.
    pub fn new(
        q: UnitQuaternion<T>,
        p: Matrix3<T>,
        config: &AttitudeConfig,
    ) -> FilterResult<Self> {
        Ok(UkfImu {
            filter: SigmaPointFilter::new(q, DVector::zeros(3), to_dynamic(&p), config)?,
            config: config.clone(),
        })
    }

    /// Correct the attitude with simultaneous vector observations. Returns `Ok(false)` if
    /// no predict preceded the call.
    pub fn update(&mut self, data: &[Observation<T>]) -> FilterResult<bool> {
        self.filter.update(data)
    }
}

impl<T: Real> ImuFilter<T> for UkfImu<T> {
    fn validate(config: &AttitudeConfig) -> FilterResult<()> {
        config.validate()?;
        SigmaPoints::<T>::new(3, &config.ukf).map(|_| ())
    }

    fn with_attitude(q: UnitQuaternion<T>, config: &AttitudeConfig) -> FilterResult<Self> {
        Self::validate(config)?;
        let p = Matrix3::from_diagonal_element(constant(config.initial_variance_r));
        UkfImu::new(q, p, config)
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
        let noise = to_dynamic(&noise_covariance_matrix_3(variance, dt));
        self.filter.predict(w0, w1, &noise, dt);
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
        ])
    }

    fn attitude(&self) -> UnitQuaternion<T> {
        self.filter.q
    }

    fn covariance(&self) -> Matrix3<T> {
        from_dynamic(&self.filter.p)
    }
}

/// Attitude and gyroscope bias UKF driven by a gyroscope, an accelerometer and a
/// magnetometer.
#[derive(Clone, Debug)]
pub struct UkfMarg<T: Real> {
    filter: SigmaPointFilter<T>,
    config: AttitudeConfig,
}

impl<T: Real> UkfMarg<T> {
    pub fn new(
        q: UnitQuaternion<T>,
        b: Vector3<T>,
        p: Matrix6<T>,
        config: &AttitudeConfig,
    ) -> FilterResult<Self> {
        let mut x = DVector::zeros(6);
        x.fixed_rows_mut::<3>(3).copy_from(&b);
        Ok(UkfMarg {
            filter: SigmaPointFilter::new(q, x, to_dynamic(&p), config)?,
            config: config.clone(),
        })
    }

    /// Correct attitude and bias with simultaneous vector observations. Returns `Ok(false)`
    /// if no predict preceded the call.
    pub fn update(&mut self, data: &[Observation<T>]) -> FilterResult<bool> {
        self.filter.update(data)
    }

    /// Reference up axis seen from the body frame
    pub fn z_local(&self) -> Vector3<T> {
        global_to_local(&self.filter.q, &z_axis())
    }
}

impl<T: Real> MargFilter<T> for UkfMarg<T> {
    fn validate(config: &AttitudeConfig) -> FilterResult<()> {
        config.validate()?;
        SigmaPoints::<T>::new(6, &config.ukf).map(|_| ())
    }

    fn with_attitude(q: UnitQuaternion<T>, config: &AttitudeConfig) -> FilterResult<Self> {
        Self::validate(config)?;
        let r = constant::<T>(config.initial_variance_r);
        let w = constant::<T>(config.initial_variance_w);
        let mut p = Matrix6::zeros();
        p.fixed_view_mut::<3, 3>(0, 0).fill_diagonal(r);
        p.fixed_view_mut::<3, 3>(3, 3).fill_diagonal(w);
        UkfMarg::new(q, Vector3::zeros(), p, config)
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
        let wb1 = w1 - self.filter.bias();
        let noise = to_dynamic(&noise_covariance_matrix_6(&wb1, variance_r, variance_w, dt));
        self.filter.predict(w0, w1, &noise, dt);
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
        ])
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
        self.update(&[
            Observation::measured(mag.y, y_axis(), mag.variance),
            Observation::constraint(z_axis(), variance_direction),
        ])
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
        self.update(&[
            Observation::measured(mag.y, y_axis(), mag.variance),
            Observation::measured(a / a_norm, z_axis(), a_variance),
        ])
    }

    fn attitude(&self) -> UnitQuaternion<T> {
        self.filter.q
    }

    fn bias(&self) -> Vector3<T> {
        self.filter.bias()
    }

    fn covariance(&self) -> Matrix6<T> {
        from_dynamic(&self.filter.p)
    }
}
