use crate::position::{enu_rotation, Position};
use crate::prelude::{Duration, Epoch, Vector3, SV};
use nalgebra::Matrix3;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Solution status, from worst to best.
#[derive(Default, Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum SolutionStatus {
    /// No solution could be published for this epoch
    #[default]
    None,
    /// Dead reckoning (never produced by this engine, part of the
    /// output contract for downstream consumers)
    DeadReckoning,
    /// Single point (code only) solution
    Single,
    /// SBAS augmented solution (downstream contract)
    Sbas,
    /// Code differential solution
    Dgps,
    /// RTK solution, float ambiguities
    Float,
    /// PPP solution (downstream contract)
    Ppp,
    /// RTK solution, fixed ambiguities
    Fix,
}

impl std::fmt::Display for SolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match self {
            Self::None => write!(f, "NONE"),
            Self::DeadReckoning => write!(f, "DR"),
            Self::Single => write!(f, "SINGLE"),
            Self::Sbas => write!(f, "SBAS"),
            Self::Dgps => write!(f, "DGPS"),
            Self::Float => write!(f, "FLOAT"),
            Self::Ppp => write!(f, "PPP"),
            Self::Fix => write!(f, "FIX"),
        }
    }
}

/// One solution record per consumed epoch.
#[derive(Default, Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Solution {
    /// Epoch (GPST)
    pub t: Epoch,
    /// Rover ECEF position [m]
    pub position: Vector3<f64>,
    /// Rover ECEF velocity [m/s], when the dynamics model estimates it
    pub velocity: Option<Vector3<f64>>,
    /// Position covariance {xx, yy, zz, xy, yz, zx} [m^2]
    pub qr: [f64; 6],
    /// Status achieved for this epoch
    pub status: SolutionStatus,
    /// Contributing satellites
    pub n_satellites: usize,
    /// Age of differential
    pub age: Duration,
    /// AR validation ratio achieved (0 when AR never ran)
    pub ratio: f64,
    /// AR validation threshold
    pub ratio_threshold: f64,
}

impl Solution {
    /// Explicit marker published when an epoch yields nothing.
    pub(crate) fn none(t: Epoch) -> Self {
        Self {
            t,
            status: SolutionStatus::None,
            ..Default::default()
        }
    }

    pub(crate) fn set_covariance(&mut self, q: &Matrix3<f64>) {
        self.qr = [
            q[(0, 0)],
            q[(1, 1)],
            q[(2, 2)],
            q[(0, 1)],
            q[(1, 2)],
            q[(2, 0)],
        ];
    }

    pub(crate) fn covariance(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.qr[0], self.qr[3], self.qr[5], self.qr[3], self.qr[1], self.qr[4], self.qr[5],
            self.qr[4], self.qr[2],
        )
    }

    /// Geodetic coordinates (lat [rad], lon [rad], alt [m])
    pub fn geodetic(&self) -> Vector3<f64> {
        Position::from_ecef(self.position).geodetic()
    }

    /// Baseline to the base position, in the local (east, north, up)
    /// frame centered on the base.
    pub fn enu_baseline(&self, base_ecef: Vector3<f64>) -> Vector3<f64> {
        let base = Position::from_ecef(base_ecef);
        enu_rotation(base.latitude_rad(), base.longitude_rad()) * (self.position - base_ecef)
    }
}

/// Per satellite status record, one stream entry per epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct SatelliteRecord {
    pub t: Epoch,
    pub sv: SV,
    /// Azimuth [rad]
    pub azimuth: f64,
    /// Elevation [rad]
    pub elevation: f64,
    /// Pseudo range residual [m]
    pub code_residual: f64,
    /// Carrier phase residual [m]
    pub phase_residual: f64,
    /// Contributed to the solution this epoch
    pub valid: bool,
    /// Slip declared this epoch
    pub slip: bool,
    /// Ambiguity currently fixed or held
    pub fixed: bool,
    /// Signal strength [dB-Hz]
    pub snr_dbhz: f64,
    pub lock: u32,
    pub outage: u32,
    pub slip_count: u32,
    pub reject_count: u32,
}
