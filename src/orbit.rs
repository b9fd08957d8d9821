use crate::prelude::{Duration, Epoch, Vector3, SV};

/// Satellite state evaluated by an external orbit/clock source
/// (broadcast ephemeris, SP3 + CLK products...) at transmit time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SatelliteState {
    /// ECEF position at transmit time [m]
    pub position: Vector3<f64>,
    /// ECEF velocity [m/s]
    pub velocity: Option<Vector3<f64>>,
    /// Clock bias, relativistic correction included
    pub clock_bias: Duration,
    /// Total group delay, when known
    pub group_delay: Option<Duration>,
    /// Ephemeris variance [m^2]
    pub variance: f64,
    /// Unhealthy satellites never contribute
    pub healthy: bool,
}

impl SatelliteState {
    /// Builds a healthy state from an ECEF position [m] and a clock bias.
    pub fn new(position: Vector3<f64>, clock_bias: Duration) -> Self {
        Self {
            position,
            clock_bias,
            velocity: None,
            group_delay: None,
            variance: 0.0,
            healthy: true,
        }
    }

    pub fn with_velocity(mut self, velocity: Vector3<f64>) -> Self {
        self.velocity = Some(velocity);
        self
    }

    pub fn with_group_delay(mut self, tgd: Duration) -> Self {
        self.group_delay = Some(tgd);
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }
}

/// Orbital state provider: external, considered a pure function of
/// (epoch, satellite). Return None when the state cannot be evaluated,
/// the satellite is then dropped for this epoch.
pub trait OrbitalStateProvider {
    /// Evaluate the satellite state at transmit epoch `t`.
    fn state_at(&self, t: Epoch, sv: SV) -> Option<SatelliteState>;
}

impl<T: OrbitalStateProvider> OrbitalStateProvider for &T {
    fn state_at(&self, t: Epoch, sv: SV) -> Option<SatelliteState> {
        (*self).state_at(t, sv)
    }
}
