//! Raw observations and the rover/base pairing logic.

use log::{debug, warn};

use crate::carrier::Carrier;
use crate::cfg::Config;
use crate::constants::Constants;
use crate::prelude::{Constellation, Duration, Epoch, SV};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Loss of lock reported by the receiver for this signal
pub const LLI_LOCK_LOSS: u8 = 0x01;

/// Half-cycle ambiguity possible on this signal
pub const LLI_HALF_CYCLE: u8 = 0x02;

/// One signal sampled by one receiver, at one epoch.
/// Single frequency navigation: the engine consumes the constellation
/// navigation band; a possible secondary band only feeds the
/// cycle slip detectors.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Observation {
    /// Satellite identity
    pub sv: SV,
    /// Sampling epoch (receiver time of reception)
    pub t: Epoch,
    /// Signal
    pub carrier: Carrier,
    /// Code pseudo range [m]
    pub pseudorange_m: Option<f64>,
    /// Carrier phase [cycle]
    pub phase_cycles: Option<f64>,
    /// Doppler shift [Hz]
    pub doppler_hz: Option<f64>,
    /// Signal strength [dB-Hz]
    pub snr_dbhz: Option<f64>,
    /// Loss of lock indicator (LLI_xxx bit flags)
    pub lli: u8,
}

impl Observation {
    /// Builds a code + phase observation on the navigation band of `sv`.
    pub fn new(sv: SV, t: Epoch, pseudorange_m: f64, phase_cycles: f64) -> Self {
        Self {
            sv,
            t,
            carrier: Carrier::navigation_band(sv.constellation),
            pseudorange_m: Some(pseudorange_m),
            phase_cycles: Some(phase_cycles),
            doppler_hz: None,
            snr_dbhz: None,
            lli: 0,
        }
    }

    pub fn with_snr(mut self, snr_dbhz: f64) -> Self {
        self.snr_dbhz = Some(snr_dbhz);
        self
    }

    pub fn with_doppler(mut self, doppler_hz: f64) -> Self {
        self.doppler_hz = Some(doppler_hz);
        self
    }

    pub fn with_lli(mut self, lli: u8) -> Self {
        self.lli = lli;
        self
    }

    pub(crate) fn lock_loss(&self) -> bool {
        self.lli & LLI_LOCK_LOSS != 0
    }

    pub(crate) fn half_cycle_ambiguous(&self) -> bool {
        self.lli & LLI_HALF_CYCLE != 0
    }

    pub(crate) fn is_navigation_band(&self) -> bool {
        self.carrier == Carrier::navigation_band(self.sv.constellation)
    }

    /// Both code and phase are required to contribute
    pub(crate) fn complete(&self) -> bool {
        self.pseudorange_m.is_some() && self.phase_cycles.is_some()
    }
}

/// One satellite observed by both sites at the rover epoch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SdPair {
    pub sv: SV,
    pub rover: Observation,
    pub base: Observation,
    /// Secondary band observed by the rover, for the slip detectors
    pub rover_secondary: Option<Observation>,
}

/// Deterministic processing order: (constellation, PRN).
pub(crate) fn sv_order(sv: SV) -> (u8, u8) {
    let sys = if sv.constellation.is_sbas() {
        6
    } else {
        match sv.constellation {
            Constellation::GPS => 0,
            Constellation::Glonass => 1,
            Constellation::Galileo => 2,
            Constellation::BeiDou => 3,
            Constellation::QZSS => 4,
            Constellation::IRNSS => 5,
            _ => 7,
        }
    };
    (sys, sv.prn)
}

/// Pairs rover and base observations for one nominal epoch.
/// The base records may lag behind the rover sampling instant: within
/// [Constants::EPOCH_PAIRING_TOL_S] they pair directly, otherwise the
/// previous base epoch brackets an interpolation (when enabled) or the
/// differential ages up to `cfg.max_age_s`.
///
/// Returns the ordered pair list and the age of differential.
pub(crate) fn pair_epochs(
    cfg: &Config,
    t: Epoch,
    rover: &[Observation],
    base: &[Observation],
    prev_base: Option<&(Epoch, Vec<Observation>)>,
) -> (Vec<SdPair>, Duration) {
    let mut pairs = Vec::<SdPair>::with_capacity(rover.len());

    let base_t = match base.first() {
        Some(ob) => ob.t,
        None => {
            return (pairs, Duration::ZERO);
        },
    };

    let age = t - base_t;
    let age_s = age.to_seconds();

    if age_s.abs() > cfg.max_age_s {
        warn!("{} - differential age {} exceeds limit", t, age);
        return (pairs, age);
    }

    let interpolate = age_s.abs() > Constants::EPOCH_PAIRING_TOL_S && cfg.base_interpolation;

    for rov in rover.iter() {
        if !rov.is_navigation_band() || !rov.complete() {
            continue;
        }
        if cfg.excluded.contains(&rov.sv) {
            debug!("{} ({}) excluded by configuration", t, rov.sv);
            continue;
        }
        let Some(bas) = base
            .iter()
            .find(|ob| ob.sv == rov.sv && ob.carrier == rov.carrier)
        else {
            continue;
        };
        if !bas.complete() {
            continue;
        }

        let base_ob = if interpolate {
            match interpolated(t, bas, prev_base) {
                Some(ob) => ob,
                None => {
                    debug!("{} ({}) no bracketing base epoch", t, rov.sv);
                    continue;
                },
            }
        } else {
            *bas
        };

        let rover_secondary = Carrier::secondary_band(rov.sv.constellation).and_then(|band| {
            rover
                .iter()
                .find(|ob| ob.sv == rov.sv && ob.carrier == band)
                .copied()
        });

        pairs.push(SdPair {
            sv: rov.sv,
            rover: *rov,
            base: base_ob,
            rover_secondary,
        });
    }

    pairs.sort_by_key(|p| sv_order(p.sv));
    (pairs, age)
}

/// Linear interpolation of the base observation between its two
/// bracketing epochs.
fn interpolated(
    t: Epoch,
    current: &Observation,
    prev_base: Option<&(Epoch, Vec<Observation>)>,
) -> Option<Observation> {
    let (t0, prev_obs) = prev_base?;
    let prev = prev_obs
        .iter()
        .find(|ob| ob.sv == current.sv && ob.carrier == current.carrier)?;

    let dt = (current.t - *t0).to_seconds();
    if dt.abs() < 1.0E-9 {
        return Some(*current);
    }
    let tau = (t - *t0).to_seconds() / dt;

    let mut ob = *current;
    ob.t = t;
    ob.lli |= prev.lli;
    ob.pseudorange_m = match (prev.pseudorange_m, current.pseudorange_m) {
        (Some(p0), Some(p1)) => Some(p0 + (p1 - p0) * tau),
        _ => None,
    };
    ob.phase_cycles = match (prev.phase_cycles, current.phase_cycles) {
        (Some(l0), Some(l1)) => Some(l0 + (l1 - l0) * tau),
        _ => None,
    };
    if ob.complete() {
        Some(ob)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::prelude::{Constellation, Vector3};

    fn basic_cfg() -> Config {
        let mut cfg = Config::kinematic_preset();
        cfg.base_position_ecef = Some(Vector3::new(0.0, 0.0, 0.0));
        cfg
    }

    fn gps(prn: u8) -> SV {
        SV::new(Constellation::GPS, prn)
    }

    #[test]
    fn pairing_is_ordered_and_complete_only() {
        let cfg = basic_cfg();
        let t = Epoch::from_gpst_seconds(100.0);

        let rover = vec![
            Observation::new(gps(12), t, 2.0E7, 1.0E8),
            Observation::new(gps(3), t, 2.0E7, 1.0E8),
            Observation {
                pseudorange_m: None,
                ..Observation::new(gps(7), t, 0.0, 1.0E8)
            },
        ];
        let base = vec![
            Observation::new(gps(3), t, 2.0E7, 1.0E8),
            Observation::new(gps(7), t, 2.0E7, 1.0E8),
            Observation::new(gps(12), t, 2.0E7, 1.0E8),
        ];

        let (pairs, age) = pair_epochs(&cfg, t, &rover, &base, None);
        assert_eq!(age.to_seconds(), 0.0);
        // G07 incomplete on rover side
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].sv, gps(3));
        assert_eq!(pairs[1].sv, gps(12));
    }

    #[test]
    fn misaligned_base_is_dropped_without_interpolation() {
        let cfg = basic_cfg();
        let t = Epoch::from_gpst_seconds(100.0);
        let tb = Epoch::from_gpst_seconds(99.0);

        let rover = vec![Observation::new(gps(1), t, 2.0E7, 1.0E8)];
        let base = vec![Observation::new(gps(1), tb, 2.0E7, 1.0E8)];

        // within the differential age limit: kept, aged
        let (pairs, age) = pair_epochs(&cfg, t, &rover, &base, None);
        assert_eq!(pairs.len(), 1);
        assert!((age.to_seconds() - 1.0).abs() < 1.0E-9);
    }

    #[test]
    fn base_interpolation_brackets_the_rover_epoch() {
        let mut cfg = basic_cfg();
        cfg.base_interpolation = true;

        let t = Epoch::from_gpst_seconds(100.0);
        let t0 = Epoch::from_gpst_seconds(99.0);
        let t1 = Epoch::from_gpst_seconds(101.0);

        let rover = vec![Observation::new(gps(1), t, 1000.0, 500.0)];
        let prev = (t0, vec![Observation::new(gps(1), t0, 900.0, 450.0)]);
        let base = vec![Observation::new(gps(1), t1, 1100.0, 550.0)];

        let (pairs, _) = pair_epochs(&cfg, t, &rover, &base, Some(&prev));
        assert_eq!(pairs.len(), 1);
        let ob = pairs[0].base;
        assert!((ob.pseudorange_m.unwrap() - 1000.0).abs() < 1.0E-9);
        assert!((ob.phase_cycles.unwrap() - 500.0).abs() < 1.0E-9);
        assert_eq!(ob.t, t);
    }

    #[test]
    fn excluded_satellite_never_pairs() {
        let mut cfg = basic_cfg();
        cfg.excluded = vec![gps(5)];
        let t = Epoch::from_gpst_seconds(0.0);

        let rover = vec![Observation::new(gps(5), t, 2.0E7, 1.0E8)];
        let base = vec![Observation::new(gps(5), t, 2.0E7, 1.0E8)];

        let (pairs, _) = pair_epochs(&cfg, t, &rover, &base, None);
        assert!(pairs.is_empty());
    }
}
