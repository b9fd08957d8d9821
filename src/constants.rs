//! Physical constants and engine tolerances.

use crate::prelude::Constellation;

pub(crate) struct Constants;

impl Constants {
    /// Speed of light [m/s]
    pub const SPEED_OF_LIGHT_M_S: f64 = 299_792_458.0;

    /// Earth angular velocity (WGS84) [rad/s]
    pub const EARTH_ANGULAR_VEL_RAD_S: f64 = 7.2921151467E-5;

    /// Tolerance when pairing rover and base epochs [s]
    pub const EPOCH_PAIRING_TOL_S: f64 = 0.005;

    /// Innovation variance inflation is armed above this
    /// normalized innovation squared value.
    pub const ADAPTIVE_NIS_THRESHOLD: f64 = 2.0;

    /// Variance of a position state initialized from a code solution [m^2]
    pub const VAR_INITIAL_POS: f64 = 60.0 * 60.0;

    /// Variance of a velocity state initialized from scratch [m^2/s^2]
    pub const VAR_INITIAL_VEL: f64 = 10.0 * 10.0;

    /// Variance of an acceleration state initialized from scratch [m^2/s^4]
    pub const VAR_INITIAL_ACC: f64 = 10.0 * 10.0;

    /// Variance of the pseudo measurements injected when holding
    /// fixed ambiguities [cycle^2]
    pub const VAR_HOLD_AMBIGUITY: f64 = 0.001;

    /// MW slip detection: multiple of the running standard deviation
    pub const MW_SLIP_FACTOR: f64 = 4.0;

    /// Reported ratio factor is clamped to this value
    pub const MAX_RATIO: f64 = 999.9;

    /// Consecutive numerical failures before the whole filter restarts
    pub const MAX_NUMERIC_FAILURES: u32 = 3;

    /// Iterated measurement update exits below this position increment [m]
    pub const ITERATION_EXIT_M: f64 = 1.0E-4;

    /// Constellation error factor, applied to the elevation
    /// dependent measurement error model.
    pub fn error_factor(c: Constellation) -> f64 {
        if c.is_sbas() {
            3.0
        } else {
            match c {
                Constellation::Glonass => 1.5,
                Constellation::IRNSS => 1.5,
                _ => 1.0,
            }
        }
    }
}
