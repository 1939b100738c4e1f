//! Vector observations consumed by the filter updates.
//!
//! Every correction is expressed as a set of [`Observation`]s: a unit reference direction
//! fixed in the global frame and, optionally, the same direction as measured in the body
//! frame. An observation without a measurement predicts itself, contributing no innovation
//! but still entering the innovation covariance with its variance. It pins the otherwise
//! unobservable rotation about the measured axis.
use nalgebra::Vector3;

use crate::Real;
use crate::config::constant;

/// One vector observation of a reference direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation<T: Real> {
    /// Measured unit direction in the body frame, or `None` for a pure constraint
    pub measurement: Option<Vector3<T>>,
    /// Unit direction in the reference frame
    pub reference: Vector3<T>,
    /// Variance of each measured component
    pub variance: T,
}

impl<T: Real> Observation<T> {
    pub fn measured(measurement: Vector3<T>, reference: Vector3<T>, variance: T) -> Self {
        Observation {
            measurement: Some(measurement),
            reference,
            variance,
        }
    }

    pub fn constraint(reference: Vector3<T>, variance: T) -> Self {
        Observation {
            measurement: None,
            reference,
            variance,
        }
    }
}

/// Reference frame up axis (the direction measured by an accelerometer at rest)
pub fn z_axis<T: Real>() -> Vector3<T> {
    Vector3::z()
}

/// Reference frame horizontal magnetic north
pub fn y_axis<T: Real>() -> Vector3<T> {
    Vector3::y()
}

/// Horizontal heading direction derived from a magnetometer reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MagMeasurement<T: Real> {
    /// Body frame direction of magnetic north projected onto the horizontal plane
    pub y: Vector3<T>,
    /// Variance inflated for the reduced observability at steep dip angles
    pub variance: T,
}

/// Reduce a normalized magnetometer reading to a horizontal heading observation.
///
/// `z_local` is the reference up axis expressed in the body frame. The horizontal component
/// of the field is recovered as `z × (m × z)`. Returns `None` when the sine of the angle
/// between field and vertical is at most `min_sin` or not finite; otherwise the variance
/// is divided by the squared sine.
pub fn mag_measurement<T: Real>(
    z_local: &Vector3<T>,
    m_unit: &Vector3<T>,
    variance: T,
    min_sin: T,
) -> Option<MagMeasurement<T>> {
    let x = m_unit.cross(z_local);
    let sin2 = x.norm_squared();
    if !sin2.is_finite() || sin2 <= min_sin * min_sin {
        return None;
    }
    Some(MagMeasurement {
        y: z_local.cross(&x).normalize(),
        variance: variance / sin2,
    })
}

/// [`mag_measurement`] with the default threshold [`crate::config::MIN_SIN_Z_MAG`].
pub fn mag_measurement_default<T: Real>(
    z_local: &Vector3<T>,
    m_unit: &Vector3<T>,
    variance: T,
) -> Option<MagMeasurement<T>> {
    mag_measurement(
        z_local,
        m_unit,
        variance,
        constant(crate::config::MIN_SIN_Z_MAG),
    )
}
