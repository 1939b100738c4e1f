//! Quaternion kinematics integrators
//!
//! The attitude quaternion obeys
//!
//! $$
//! \dot{q} = \frac{1}{2} q \otimes \begin{bmatrix} 0 \\\\ \omega \end{bmatrix}
//! $$
//!
//! with the angular rate $\omega$ measured in the body frame. Both integrators return the
//! propagated quaternion *without* renormalizing it; callers normalize after use.
use nalgebra::{Quaternion, Vector3};

use crate::Real;
use crate::config::{W_THRESHOLD, constant};

/// Rotation increment for a constant rate `w` over `dt`.
///
/// Exact exponential map for `|w| >= W_THRESHOLD`, first-order Taylor expansion below it.
fn delta_quaternion<T: Real>(w: &Vector3<T>, dt: T) -> Quaternion<T> {
    let half_dt = dt * constant::<T>(0.5);
    let wn = w.norm();
    if wn < constant(W_THRESHOLD) {
        return Quaternion::from_parts(T::one(), w * half_dt);
    }
    let angle = wn * half_dt;
    Quaternion::from_parts(angle.cos(), w * (angle.sin() / wn))
}

/// Advance `q` by `dt` assuming the constant body rate `w`.
pub fn zeroth_order_quaternion_integrator<T: Real>(
    q: &Quaternion<T>,
    w: &Vector3<T>,
    dt: T,
) -> Quaternion<T> {
    q * delta_quaternion(w, dt)
}

/// Advance `q` by `dt` with a rate varying linearly from `w0` to `w1`.
///
/// Uses the mean rate plus the second-order commutation term
/// $\frac{\Delta t^2}{24} (\omega_0 \times \omega_1)$. Reduces to the zeroth-order
/// integrator when `w0 == w1`.
pub fn first_order_quaternion_integrator<T: Real>(
    q: &Quaternion<T>,
    w0: &Vector3<T>,
    w1: &Vector3<T>,
    dt: T,
) -> Quaternion<T> {
    let w = (w0 + w1) * constant::<T>(0.5);
    let dq0 = delta_quaternion(&w, dt);
    let dq1 = Quaternion::from_parts(T::zero(), w0.cross(w1) * (dt * dt / constant::<T>(24.0)));
    q * (dq0 + dq1)
}
