//! Initial attitude determination from averaged sensor samples.
//!
//! The filters cannot start without an attitude. [`Init`] (accelerometer only) and
//! [`InitMarg`] (accelerometer and magnetometer) sum incoming samples until `init_count`
//! of each have arrived, then average them and check the result:
//!
//! - the averaged specific force must lie in the gravity band,
//! - the averaged magnetic field must lie in the geomagnetic band,
//! - gravity and field must not be nearly parallel.
//!
//! A failed check discards the batch and accumulation starts over. A passing batch yields
//! exactly one quaternion and resets the accumulator.
use log::{info, warn};
use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use crate::Real;
use crate::config::{AttitudeConfig, constant};

/// Attitude whose reference up axis is the body direction `z` (unit).
///
/// Heading is unobservable without a magnetometer: the horizontal axes are completed from
/// the body axis least aligned with `z` (the first one on ties).
pub fn initial_quaternion_imu<T: Real>(z: &Vector3<T>) -> UnitQuaternion<T> {
    let axis = z.iamin();
    let mut e = Vector3::zeros();
    e[axis] = T::one();
    let y = z.cross(&e).normalize();
    let x = y.cross(z);
    frame_to_quaternion(&x, &y, z)
}

/// Attitude from the body directions of up `z` and of the magnetic field `m` (both unit).
pub fn initial_quaternion_marg<T: Real>(z: &Vector3<T>, m: &Vector3<T>) -> UnitQuaternion<T> {
    let x = m.cross(z).normalize();
    let y = z.cross(&x);
    frame_to_quaternion(&x, &y, z)
}

/// Rows of the body-to-reference rotation are the reference axes seen from the body.
fn frame_to_quaternion<T: Real>(
    x: &Vector3<T>,
    y: &Vector3<T>,
    z: &Vector3<T>,
) -> UnitQuaternion<T> {
    let m = Matrix3::from_rows(&[x.transpose(), y.transpose(), z.transpose()]);
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(m))
}

#[derive(Clone, Debug)]
struct Accumulator<T: Real> {
    sum: Vector3<T>,
    count: usize,
}

impl<T: Real> Accumulator<T> {
    fn new() -> Self {
        Accumulator {
            sum: Vector3::zeros(),
            count: 0,
        }
    }

    fn add(&mut self, v: &Vector3<T>) {
        self.sum += v;
        self.count += 1;
    }

    fn average(&self) -> Vector3<T> {
        self.sum / constant::<T>(self.count as f64)
    }
}

/// Accelerometer-only initializer for the IMU filters.
#[derive(Clone, Debug)]
pub struct Init<T: Real> {
    acc: Accumulator<T>,
    config: AttitudeConfig,
}

impl<T: Real> Init<T> {
    pub fn new(config: &AttitudeConfig) -> Self {
        Init {
            acc: Accumulator::new(),
            config: config.clone(),
        }
    }

    /// Number of samples accumulated in the current batch
    pub fn count(&self) -> usize {
        self.acc.count
    }

    /// Accumulate an accelerometer sample. Returns the initial attitude once a suitable
    /// batch is complete.
    pub fn update(&mut self, a: &Vector3<T>) -> Option<UnitQuaternion<T>> {
        self.acc.add(a);
        if self.acc.count < self.config.init_count {
            return None;
        }

        let a_avg = self.acc.average();
        let a_norm = a_avg.norm();
        self.acc = Accumulator::new();

        if !self.config.acc_suitable(a_norm) {
            warn!("initialization rejected: averaged acceleration {a_norm} out of band");
            return None;
        }

        let q = initial_quaternion_imu(&(a_avg / a_norm));
        info!("initial attitude {q}");
        Some(q)
    }
}

/// Accelerometer and magnetometer initializer for the MARG filters.
///
/// Samples of both sensors may arrive separately or together; the batch is complete when
/// each sensor has contributed `init_count` samples.
#[derive(Clone, Debug)]
pub struct InitMarg<T: Real> {
    acc: Accumulator<T>,
    mag: Accumulator<T>,
    config: AttitudeConfig,
}

impl<T: Real> InitMarg<T> {
    pub fn new(config: &AttitudeConfig) -> Self {
        InitMarg {
            acc: Accumulator::new(),
            mag: Accumulator::new(),
            config: config.clone(),
        }
    }

    pub fn acc_count(&self) -> usize {
        self.acc.count
    }

    pub fn mag_count(&self) -> usize {
        self.mag.count
    }

    pub fn update_acc(&mut self, a: &Vector3<T>) -> Option<UnitQuaternion<T>> {
        self.acc.add(a);
        self.init()
    }

    pub fn update_mag(&mut self, m: &Vector3<T>) -> Option<UnitQuaternion<T>> {
        self.mag.add(m);
        self.init()
    }

    pub fn update_acc_mag(&mut self, a: &Vector3<T>, m: &Vector3<T>) -> Option<UnitQuaternion<T>> {
        self.acc.add(a);
        self.mag.add(m);
        self.init()
    }

    fn reset(&mut self) {
        self.acc = Accumulator::new();
        self.mag = Accumulator::new();
    }

    fn init(&mut self) -> Option<UnitQuaternion<T>> {
        let count = self.config.init_count;
        if self.acc.count < count || self.mag.count < count {
            return None;
        }

        let a_avg = self.acc.average();
        let m_avg = self.mag.average();
        self.reset();

        let a_norm = a_avg.norm();
        if !self.config.acc_suitable(a_norm) {
            warn!("initialization rejected: averaged acceleration {a_norm} out of band");
            return None;
        }
        let m_norm = m_avg.norm();
        if !self.config.mag_suitable(m_norm) {
            warn!("initialization rejected: averaged magnetic field {m_norm} out of band");
            return None;
        }

        let z = a_avg / a_norm;
        let m = m_avg / m_norm;
        let cos = z.dot(&m).abs();
        if cos > constant(self.config.mag_inclination_max_cos) {
            warn!("initialization rejected: magnetic field parallel to gravity (cos {cos})");
            return None;
        }

        let q = initial_quaternion_marg(&z, &m);
        info!("initial attitude {q}");
        Some(q)
    }
}
