//! Attitude error encodings and frame rotation helpers.
//!
//! Two encodings of a small rotation as a 3-vector are used and they are not interchangeable:
//!
//! - the EKF correction vector is half the rotation angle times the axis (the vector part of
//!   the error quaternion), converted with [`ekf_delta_quaternion`];
//! - the UKF tangent space uses generalized Rodrigues parameters (GRP), converted with
//!   [`error_to_quaternion`] and [`quaternion_to_error`].
//!
//! The GRP map with parameters `a` and `f` is
//!
//! $$
//! p = \frac{f}{a + q_w} q_v, \qquad
//! q_w = \frac{-a |p|^2 + f \sqrt{f^2 + (1 - a^2) |p|^2}}{f^2 + |p|^2}, \qquad
//! q_v = \frac{a + q_w}{f} p
//! $$
//!
//! With `f = 2(a + 1)` the parameters approximate the rotation vector to first order.
//! Quaternions `q` and `-q` describe the same rotation; the inverse map picks the
//! representative with non-negative scalar part so that `|p| <= f / a`.
use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::Real;
use crate::config::{GRP_A, GRP_F, constant};

/// Unit error quaternion from the half-angle error vector `v`.
///
/// Returns `{sqrt(1 - |v|²), v}` when `|v|² <= 1` and `{1, v} / sqrt(1 + |v|²)` otherwise.
pub fn ekf_delta_quaternion<T: Real>(v: &Vector3<T>) -> UnitQuaternion<T> {
    let n2 = v.norm_squared();
    let q = if n2 <= T::one() {
        Quaternion::from_parts((T::one() - n2).sqrt(), *v)
    } else {
        Quaternion::from_parts(T::one(), *v) / (T::one() + n2).sqrt()
    };
    UnitQuaternion::new_unchecked(q)
}

/// GRP vector to unit quaternion with explicit parameters.
pub fn grp_to_quaternion<T: Real>(p: &Vector3<T>, a: T, f: T) -> UnitQuaternion<T> {
    let n2 = p.norm_squared();
    let f2 = f * f;
    let w = (f * (f2 + (T::one() - a * a) * n2).sqrt() - a * n2) / (f2 + n2);
    let c = (a + w) / f;
    let q = UnitQuaternion::new_unchecked(Quaternion::from_parts(w, p * c));
    debug_assert_unit(&q);
    q
}

/// Unit quaternion to GRP vector with explicit parameters.
pub fn quaternion_to_grp<T: Real>(q: &UnitQuaternion<T>, a: T, f: T) -> Vector3<T> {
    debug_assert_unit(q);
    let (w, v) = if q.w < T::zero() {
        (-q.w, -q.imag())
    } else {
        (q.w, q.imag())
    };
    v * (f / (a + w))
}

/// GRP vector to unit quaternion with the default parameters [`GRP_A`], [`GRP_F`].
pub fn error_to_quaternion<T: Real>(p: &Vector3<T>) -> UnitQuaternion<T> {
    grp_to_quaternion(p, constant(GRP_A), constant(GRP_F))
}

/// Unit quaternion to GRP vector with the default parameters [`GRP_A`], [`GRP_F`].
pub fn quaternion_to_error<T: Real>(q: &UnitQuaternion<T>) -> Vector3<T> {
    quaternion_to_grp(q, constant(GRP_A), constant(GRP_F))
}

/// Attitude obtained by applying the body-frame error `p` to `center`.
pub fn error_to_quaternion_about<T: Real>(
    p: &Vector3<T>,
    center: &UnitQuaternion<T>,
) -> UnitQuaternion<T> {
    center * error_to_quaternion(p)
}

/// Body-frame error of `q` relative to the center whose inverse is `center_inverse`.
///
/// The inverse is taken by the caller because one center is shared by a whole sigma point
/// ensemble.
pub fn quaternion_to_error_about<T: Real>(
    q: &UnitQuaternion<T>,
    center_inverse: &UnitQuaternion<T>,
) -> Vector3<T> {
    quaternion_to_error(&(center_inverse * q))
}

/// Express a reference frame vector in the body frame of attitude `q`.
#[inline]
pub fn global_to_local<T: Real>(q: &UnitQuaternion<T>, v: &Vector3<T>) -> Vector3<T> {
    q.inverse_transform_vector(v)
}

/// Express a body frame vector in the reference frame.
#[inline]
pub fn local_to_global<T: Real>(q: &UnitQuaternion<T>, v: &Vector3<T>) -> Vector3<T> {
    q.transform_vector(v)
}

/// Rotation angle between two attitudes, accurate for nearly equal arguments.
pub fn angle_between<T: Real>(a: &UnitQuaternion<T>, b: &UnitQuaternion<T>) -> T {
    let d = a.inverse() * b;
    d.imag().norm().atan2(d.w.abs()) * constant(2.0)
}

#[inline]
fn debug_assert_unit<T: Real>(q: &UnitQuaternion<T>) {
    debug_assert!(
        (q.as_ref().norm_squared() - T::one()).abs() < constant(1e-4),
        "quaternion is not unit"
    );
}
