//! Tuning constants and runtime configuration for the attitude filters.
//!
//! Numeric constants that shape the analytic formulas (small-angle cutoff, generalized
//! Rodrigues parameters) are compile-time `f64` values converted to the filter scalar on
//! use. Sensor acceptance limits, initialization length, initial covariance and the
//! unscented transform parameters live in [`AttitudeConfig`], which can be persisted as
//! JSON or TOML.
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Real;
use crate::error::{FilterResult, require, require_variance};

/// Angular rate magnitude (rad/s) below which the integrators and the analytic
/// transition and noise matrices switch to their power-series forms.
pub const W_THRESHOLD: f64 = 1e-5;

/// Number of accelerometer (and magnetometer) samples averaged before the first
/// attitude is produced.
pub const INIT_COUNT: usize = 10;

/// Smallest accepted sine of the angle between the magnetic field and the local
/// vertical. Below it heading cannot be observed reliably.
pub const MIN_SIN_Z_MAG: f64 = 0.1;

/// Largest accepted absolute cosine of the angle between averaged gravity and
/// averaged magnetic field during initialization.
pub const MAG_INCLINATION_MAX_COS: f64 = 0.995;

/// Lower bound of the accepted specific force magnitude (m/s²)
pub const MIN_ACCELERATION: f64 = 9.0;
/// Upper bound of the accepted specific force magnitude (m/s²)
pub const MAX_ACCELERATION: f64 = 10.6;
/// Lower bound of the accepted magnetic field magnitude (µT)
pub const MIN_MAGNETIC_FIELD: f64 = 10.0;
/// Upper bound of the accepted magnetic field magnitude (µT)
pub const MAX_MAGNETIC_FIELD: f64 = 100.0;

/// Generalized Rodrigues parameter `a`
pub const GRP_A: f64 = 0.1;
/// Generalized Rodrigues parameter `f = 2(a + 1)`
pub const GRP_F: f64 = 2.0 * (GRP_A + 1.0);

/// Convert an `f64` constant into the filter scalar type.
#[inline]
pub fn constant<T: Real>(value: f64) -> T {
    nalgebra::convert(value)
}

/// Scaling parameters of the scaled unscented transform.
///
/// `alpha` controls the spread of the sigma points, `beta` incorporates prior knowledge of
/// the distribution (2 is optimal for a Gaussian) and `kappa` is the secondary scaling
/// parameter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SigmaPointParameters {
    pub alpha: f64,
    pub beta: f64,
    pub kappa: f64,
}

impl Default for SigmaPointParameters {
    fn default() -> Self {
        SigmaPointParameters {
            alpha: 1.0,
            beta: 0.0,
            kappa: 1.0,
        }
    }
}

fn default_init_count() -> usize {
    INIT_COUNT
}

/// Runtime configuration shared by the initializers, filters and wrappers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttitudeConfig {
    /// Samples per sensor averaged before the first attitude is produced
    #[serde(default = "default_init_count")]
    pub init_count: usize,
    /// Accepted specific force magnitude band (m/s²)
    pub acceleration_min: f64,
    pub acceleration_max: f64,
    /// Accepted magnetic field magnitude band (µT)
    pub magnetic_field_min: f64,
    pub magnetic_field_max: f64,
    /// Update-time rejection threshold on the sine between field and vertical
    pub min_sin_z_mag: f64,
    /// Initialization-time rejection threshold on the cosine between field and gravity
    pub mag_inclination_max_cos: f64,
    /// Initial attitude error variance (rad²) on each axis
    pub initial_variance_r: f64,
    /// Initial gyroscope bias error variance ((rad/s)²) on each axis
    pub initial_variance_w: f64,
    /// Unscented transform parameters used by the sigma-point filters
    #[serde(default)]
    pub ukf: SigmaPointParameters,
}

impl Default for AttitudeConfig {
    fn default() -> Self {
        AttitudeConfig {
            init_count: INIT_COUNT,
            acceleration_min: MIN_ACCELERATION,
            acceleration_max: MAX_ACCELERATION,
            magnetic_field_min: MIN_MAGNETIC_FIELD,
            magnetic_field_max: MAX_MAGNETIC_FIELD,
            min_sin_z_mag: MIN_SIN_Z_MAG,
            mag_inclination_max_cos: MAG_INCLINATION_MAX_COS,
            initial_variance_r: 1e-2,
            initial_variance_w: 1e-6,
            ukf: SigmaPointParameters::default(),
        }
    }
}

impl AttitudeConfig {
    /// Check the settings shared by every filter. Sigma point parameters are checked by the
    /// unscented filters, which know their state dimension.
    pub fn validate(&self) -> FilterResult<()> {
        require(self.init_count > 0, "init_count must be positive")?;
        require(
            self.acceleration_min <= self.acceleration_max,
            "acceleration band is empty",
        )?;
        require(
            self.magnetic_field_min <= self.magnetic_field_max,
            "magnetic field band is empty",
        )?;
        require_variance(self.initial_variance_r)?;
        require_variance(self.initial_variance_w)
    }

    /// True if the specific force magnitude is close enough to gravity for the
    /// accelerometer to be used as a vertical reference.
    pub fn acc_suitable<T: Real>(&self, norm: T) -> bool {
        norm >= constant(self.acceleration_min) && norm <= constant(self.acceleration_max)
    }

    /// True if the magnetic field magnitude is plausible for the Earth's field.
    pub fn mag_suitable<T: Real>(&self, norm: T) -> bool {
        norm >= constant(self.magnetic_field_min) && norm <= constant(self.magnetic_field_max)
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }

    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }

    /// Generic write: choose format by file extension (.json/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }

    /// Generic read: choose format by file extension (.json/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}
