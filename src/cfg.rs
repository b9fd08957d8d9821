use crate::error::Error;
use crate::prelude::{Vector3, SV};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Positioning mode
#[derive(Default, Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
pub enum PositioningMode {
    /// Rover is moving: position states are re-estimated every epoch.
    #[default]
    Kinematic,
    /// Rover is static: position states behave as random constants.
    Static,
    /// Both receivers move, the baseline is estimated and the base
    /// position re-evaluated every epoch from its own code solution.
    MovingBase,
    /// Rover position is known: only the ambiguities are estimated,
    /// typically for residual analysis.
    Fixed,
}

/// Integer ambiguity resolution strategy
#[derive(Default, Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
pub enum ArMode {
    /// Float solution only
    Off,
    /// Ambiguities are estimated continuously and the fix is attempted
    /// every epoch without feedback into the float filter.
    #[default]
    Continuous,
    /// Ambiguities are re-initialized then fixed every single epoch.
    Instantaneous,
    /// Successful fixes are fed back as tight pseudo measurements,
    /// so subsequent epochs inherit the fix.
    FixAndHold,
}

/// Rover dynamics model
#[derive(Default, Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
pub enum Dynamics {
    /// Position only
    #[default]
    None,
    /// Position + velocity states
    Velocity,
    /// Position + velocity + acceleration states
    VelocityAcceleration,
}

impl Dynamics {
    pub(crate) fn states(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Velocity => 3,
            Self::VelocityAcceleration => 6,
        }
    }
}

/// Tropospheric delay handling
#[derive(Default, Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
pub enum TropoEstimation {
    /// Modeled only (cancels across short baselines)
    #[default]
    Model,
    /// Relative zenith delay estimated
    Ztd,
    /// Relative zenith delay + east/north gradients estimated
    ZtdGradients,
}

impl TropoEstimation {
    pub(crate) fn states(&self) -> usize {
        match self {
            Self::Model => 0,
            Self::Ztd => 1,
            Self::ZtdGradients => 3,
        }
    }
}

/// Navigation kernel
#[derive(Default, Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
pub enum FilterKind {
    /// Extended Kalman filter (Joseph form measurement update)
    #[default]
    Extended,
    /// Unscented Kalman filter: sigma points propagated through the
    /// nonlinear measurement model, Van der Merwe weighting.
    Unscented {
        alpha: f64,
        beta: f64,
        kappa: f64,
    },
    /// Particle filter, restricted to the position sub space.
    /// Ambiguities remain with the extended filter.
    Particle {
        particles: usize,
        seed: u64,
    },
}

/// Process noise standard deviations
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
pub struct ProcessNoise {
    /// Carrier phase bias [cycle/sqrt(s)]
    pub bias: f64,
    /// Vertical ionospheric delay [m/sqrt(s)]
    pub iono: f64,
    /// Zenith tropospheric delay [m/sqrt(s)]
    pub tropo: f64,
    /// Horizontal acceleration [m/s^2/sqrt(s)]
    pub accel_h: f64,
    /// Vertical acceleration [m/s^2/sqrt(s)]
    pub accel_v: f64,
    /// Position, applied only without a dynamics model [m/sqrt(s)]
    pub pos: f64,
}

impl Default for ProcessNoise {
    fn default() -> Self {
        Self {
            bias: 1.0E-4,
            iono: 1.0E-3,
            tropo: 1.0E-4,
            accel_h: 1.0E-1,
            accel_v: 1.0E-2,
            pos: 1.0E-1,
        }
    }
}

/// Initial state standard deviations
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
pub struct InitialSigmas {
    /// Carrier phase bias [cycle]
    pub bias: f64,
    /// Vertical ionospheric delay [m]
    pub iono: f64,
    /// Zenith tropospheric delay [m]
    pub tropo: f64,
}

impl Default for InitialSigmas {
    fn default() -> Self {
        Self {
            bias: 30.0,
            iono: 0.03,
            tropo: 0.3,
        }
    }
}

/// Elevation dependent measurement error model:
/// sigma^2 = a^2 + b^2 / sin(el)^2 + (c * baseline)^2
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
pub struct MeasurementError {
    /// Code / carrier-phase error ratio
    pub eratio: f64,
    /// Carrier phase error, constant term [m]
    pub a: f64,
    /// Carrier phase error, elevation term [m]
    pub b: f64,
    /// Carrier phase error, baseline term [m / 10 km]
    pub c: f64,
    /// Doppler error [Hz]
    pub doppler: f64,
}

impl Default for MeasurementError {
    fn default() -> Self {
        Self {
            eratio: 100.0,
            a: 0.003,
            b: 0.003,
            c: 0.0,
            doppler: 1.0,
        }
    }
}

fn default_max_age_s() -> f64 {
    30.0
}

fn default_maxout() -> u32 {
    5
}

fn default_minlock() -> u32 {
    0
}

fn default_minfix() -> u32 {
    10
}

fn default_niter() -> usize {
    1
}

fn default_thresar() -> f64 {
    3.0
}

fn default_thresslip() -> f64 {
    0.05
}

fn default_maxinno() -> f64 {
    30.0
}

fn default_maxgdop() -> f64 {
    30.0
}

fn default_channels() -> usize {
    32
}

/// Engine configuration, frozen for the whole run and validated
/// by [Solver::new].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
pub struct Config {
    /// Positioning mode
    #[cfg_attr(feature = "serde", serde(default))]
    pub mode: PositioningMode,
    /// Ambiguity resolution strategy
    #[cfg_attr(feature = "serde", serde(default))]
    pub ar_mode: ArMode,
    /// Dynamics model
    #[cfg_attr(feature = "serde", serde(default))]
    pub dynamics: Dynamics,
    /// Tropospheric states
    #[cfg_attr(feature = "serde", serde(default))]
    pub tropo: TropoEstimation,
    /// Estimate per satellite slant ionospheric delays.
    /// Short baselines usually leave this off and let the
    /// double differences cancel the delay.
    #[cfg_attr(feature = "serde", serde(default))]
    pub iono_estimation: bool,
    /// Navigation kernel
    #[cfg_attr(feature = "serde", serde(default))]
    pub filter: FilterKind,
    /// Minimal elevation angle [deg]. SV below that angle are dropped.
    #[cfg_attr(feature = "serde", serde(default))]
    pub min_sv_elev: Option<f64>,
    /// Minimal SNR [dB-Hz] for an SV to be considered.
    #[cfg_attr(feature = "serde", serde(default))]
    pub min_snr: Option<f64>,
    /// Excluded satellites
    #[cfg_attr(feature = "serde", serde(default))]
    pub excluded: Vec<SV>,
    /// Process noise standard deviations
    #[cfg_attr(feature = "serde", serde(default))]
    pub prn: ProcessNoise,
    /// Initial state standard deviations
    #[cfg_attr(feature = "serde", serde(default))]
    pub std: InitialSigmas,
    /// Measurement error model
    #[cfg_attr(feature = "serde", serde(default))]
    pub err: MeasurementError,
    /// Innovation rejection threshold [m]
    #[cfg_attr(feature = "serde", serde(default = "default_maxinno"))]
    pub max_innovation: f64,
    /// GDOP rejection threshold
    #[cfg_attr(feature = "serde", serde(default = "default_maxgdop"))]
    pub max_gdop: f64,
    /// Ratio test threshold for ambiguity validation
    #[cfg_attr(feature = "serde", serde(default = "default_thresar"))]
    pub ar_ratio_threshold: f64,
    /// Elevation mask for ambiguity resolution candidates [deg]
    #[cfg_attr(feature = "serde", serde(default))]
    pub ar_elevation_mask: f64,
    /// Fix Glonass ambiguities as well. Requires calibrated
    /// inter-channel biases, off by default.
    #[cfg_attr(feature = "serde", serde(default))]
    pub glonass_ar: bool,
    /// Geometry-free phase jump declared a slip above this value [m]
    #[cfg_attr(feature = "serde", serde(default = "default_thresslip"))]
    pub slip_threshold: f64,
    /// Observation outage count before an ambiguity is reset
    #[cfg_attr(feature = "serde", serde(default = "default_maxout"))]
    pub max_outage: u32,
    /// Minimal lock count before an ambiguity may be fixed
    #[cfg_attr(feature = "serde", serde(default = "default_minlock"))]
    pub min_lock: u32,
    /// Consecutive fixes before the ambiguity is held
    #[cfg_attr(feature = "serde", serde(default = "default_minfix"))]
    pub min_fix: u32,
    /// Measurement update iterations (re-linearized) per epoch
    #[cfg_attr(feature = "serde", serde(default = "default_niter"))]
    pub niter: usize,
    /// Interpolate base observations to the rover epoch when both
    /// sites were not sampled synchronously (post mission).
    #[cfg_attr(feature = "serde", serde(default))]
    pub base_interpolation: bool,
    /// Differential age limit [s]
    #[cfg_attr(feature = "serde", serde(default = "default_max_age_s"))]
    pub max_age_s: f64,
    /// Adaptive innovation scaling of the measurement noise
    #[cfg_attr(feature = "serde", serde(default))]
    pub adaptive_innovation: bool,
    /// Baseline length constraint {length, sigma} [m], moving base only
    #[cfg_attr(feature = "serde", serde(default))]
    pub baseline_constraint: Option<(f64, f64)>,
    /// Base position (ECEF) [m]. Mandatory, except in moving-base mode.
    #[cfg_attr(feature = "serde", serde(default))]
    pub base_position_ecef: Option<Vector3<f64>>,
    /// Rover position (ECEF) [m], for [PositioningMode::Fixed]
    #[cfg_attr(feature = "serde", serde(default))]
    pub rover_position_ecef: Option<Vector3<f64>>,
    /// Rover, then base antenna delta: (east, north, up) offset
    /// from the monument to the antenna reference point [m]
    #[cfg_attr(feature = "serde", serde(default))]
    pub antenna_delta_enu: [(f64, f64, f64); 2],
    /// Apply the modeled tropospheric delay to one-way ranges
    #[cfg_attr(feature = "serde", serde(default = "default_tropo_model"))]
    pub tropo_model: bool,
    /// Maximum simultaneously tracked satellites (state vector channels)
    #[cfg_attr(feature = "serde", serde(default = "default_channels"))]
    pub max_channels: usize,
}

fn default_tropo_model() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self::kinematic_preset()
    }
}

impl Config {
    /// Kinematic rover, continuous AR: the typical RTK setup.
    pub fn kinematic_preset() -> Self {
        Self {
            mode: PositioningMode::Kinematic,
            ar_mode: ArMode::Continuous,
            dynamics: Dynamics::None,
            tropo: TropoEstimation::Model,
            iono_estimation: false,
            filter: FilterKind::Extended,
            min_sv_elev: Some(15.0),
            min_snr: None,
            excluded: Vec::new(),
            prn: ProcessNoise::default(),
            std: InitialSigmas::default(),
            err: MeasurementError::default(),
            max_innovation: default_maxinno(),
            max_gdop: default_maxgdop(),
            ar_ratio_threshold: default_thresar(),
            ar_elevation_mask: 0.0,
            glonass_ar: false,
            slip_threshold: default_thresslip(),
            max_outage: default_maxout(),
            min_lock: default_minlock(),
            min_fix: default_minfix(),
            niter: default_niter(),
            base_interpolation: false,
            max_age_s: default_max_age_s(),
            adaptive_innovation: false,
            baseline_constraint: None,
            base_position_ecef: None,
            rover_position_ecef: None,
            antenna_delta_enu: [(0.0, 0.0, 0.0); 2],
            tropo_model: default_tropo_model(),
            max_channels: default_channels(),
        }
    }

    /// Static short-baseline survey, fix-and-hold.
    pub fn static_preset() -> Self {
        let mut cfg = Self::kinematic_preset();
        cfg.mode = PositioningMode::Static;
        cfg.ar_mode = ArMode::FixAndHold;
        cfg
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.ar_ratio_threshold < 1.0 {
            return Err(Error::InvalidConfiguration(
                "ratio threshold below 1 accepts any fix",
            ));
        }
        if self.err.eratio <= 0.0 || self.err.a < 0.0 || self.err.b < 0.0 || self.err.doppler < 0.0
        {
            return Err(Error::InvalidConfiguration("negative measurement error"));
        }
        if self.max_channels < 4 {
            return Err(Error::InvalidConfiguration("needs at least 4 channels"));
        }
        if self.niter == 0 {
            return Err(Error::InvalidConfiguration(
                "at least one filter iteration required",
            ));
        }
        if self.max_age_s <= 0.0 {
            return Err(Error::InvalidConfiguration("differential age limit"));
        }
        match self.filter {
            FilterKind::Unscented { alpha, .. } => {
                if alpha <= 0.0 || alpha > 1.0 {
                    return Err(Error::InvalidConfiguration("ukf alpha outside ]0, 1]"));
                }
            },
            FilterKind::Particle { particles, .. } => {
                if particles < 8 {
                    return Err(Error::InvalidConfiguration("particle swarm too small"));
                }
            },
            FilterKind::Extended => {},
        }
        if self.mode == PositioningMode::Fixed && self.rover_position_ecef.is_none() {
            return Err(Error::InvalidConfiguration(
                "fixed mode requires the rover position",
            ));
        }
        if self.mode != PositioningMode::MovingBase && self.base_position_ecef.is_none() {
            return Err(Error::UnknownBasePosition);
        }
        if let Some((len, sigma)) = self.baseline_constraint {
            if len <= 0.0 || sigma <= 0.0 {
                return Err(Error::InvalidConfiguration("baseline constraint"));
            }
        }
        Ok(())
    }

    /// Number of non-ambiguity states
    pub(crate) fn base_states(&self) -> usize {
        3 + self.dynamics.states() + self.tropo.states()
    }

    /// Offset of the ionospheric slots, when estimated
    pub(crate) fn iono_index(&self, slot: usize) -> Option<usize> {
        if self.iono_estimation {
            Some(self.base_states() + slot)
        } else {
            None
        }
    }

    /// Offset of the ambiguity slot
    pub(crate) fn bias_index(&self, slot: usize) -> usize {
        let iono = if self.iono_estimation {
            self.max_channels
        } else {
            0
        };
        self.base_states() + iono + slot
    }

    /// Full state dimension
    pub(crate) fn nx(&self) -> usize {
        self.bias_index(self.max_channels)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_indexing() {
        let mut cfg = Config::kinematic_preset();
        cfg.base_position_ecef = Some(Vector3::new(0.0, 0.0, 0.0));
        assert_eq!(cfg.base_states(), 3);
        assert_eq!(cfg.bias_index(0), 3);
        assert_eq!(cfg.nx(), 3 + cfg.max_channels);

        cfg.dynamics = Dynamics::VelocityAcceleration;
        cfg.tropo = TropoEstimation::Ztd;
        cfg.iono_estimation = true;
        assert_eq!(cfg.base_states(), 10);
        assert_eq!(cfg.iono_index(2), Some(12));
        assert_eq!(cfg.bias_index(0), 10 + cfg.max_channels);
        assert_eq!(cfg.nx(), 10 + 2 * cfg.max_channels);
    }

    #[test]
    fn presets_validate() {
        let mut cfg = Config::kinematic_preset();
        assert!(cfg.validate().is_err()); // base position unknown
        cfg.base_position_ecef = Some(Vector3::new(4696989.0, 723994.0, 4239678.0));
        assert!(cfg.validate().is_ok());

        cfg.ar_ratio_threshold = 0.5;
        assert!(cfg.validate().is_err());
    }
}
