//! Error taxonomy for the attitude filters.
//!
//! Two kinds of failure leave a filter untouched and are reported through this type:
//! protocol violations by the caller and matrices that cannot be inverted. Sensor
//! geometry that is unsuitable for a correction (gravity or magnetic magnitude out of
//! band, magnetic field nearly parallel to gravity) is not an error; the `update_*`
//! methods report it by returning `Ok(false)`.
use thiserror::Error;

use crate::Real;

/// Errors raised by the attitude filters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// The caller broke an operation's contract (for example a non-positive time step
    /// or a negative variance). The filter state is unchanged.
    #[error("precondition violated: {0}")]
    Precondition(&'static str),
    /// A covariance matrix that must be inverted is singular. Callers are expected to
    /// keep measurement variances above a floor to avoid this.
    #[error("singular matrix: {0}")]
    SingularMatrix(&'static str),
}

/// Result alias used throughout the crate
pub type FilterResult<R> = Result<R, FilterError>;

/// Fails with [`FilterError::Precondition`] unless `condition` holds.
#[inline]
pub(crate) fn require(condition: bool, message: &'static str) -> FilterResult<()> {
    if condition {
        Ok(())
    } else {
        Err(FilterError::Precondition(message))
    }
}

/// Time steps must be positive and finite.
pub(crate) fn require_time_step<T: Real>(dt: T) -> FilterResult<()> {
    require(dt.is_finite() && dt > T::zero(), "time step must be positive and finite")
}

/// Variances must be non-negative and finite.
pub(crate) fn require_variance<T: Real>(variance: T) -> FilterResult<()> {
    require(
        variance.is_finite() && variance >= T::zero(),
        "variance must be non-negative and finite",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_step_and_variance_checks() {
        assert!(require_time_step(0.01_f64).is_ok());
        assert!(require_time_step(0.0_f64).is_err());
        assert!(require_time_step(f32::INFINITY).is_err());
        assert!(require_variance(0.0_f64).is_ok());
        assert!(require_variance(-1e-9_f64).is_err());
        assert!(require_variance(f64::NAN).is_err());
    }

    #[test]
    fn require_reports_message() {
        assert_eq!(require(true, "unused"), Ok(()));
        let err = require(false, "dt must be positive").unwrap_err();
        assert_eq!(err, FilterError::Precondition("dt must be positive"));
        assert_eq!(err.to_string(), "precondition violated: dt must be positive");
    }
}
