//! Cycle slip detection and per satellite quality bookkeeping.
//!
//! Runs ahead of the measurement update. A declared slip zeroes the
//! lock counter and flags the ambiguity for re-initialization during
//! the time update.

use log::{debug, warn};

use crate::cfg::Config;
use crate::constants::Constants;
use crate::obs::SdPair;
use crate::state::RtkState;

/// Inspects every paired satellite and updates its slip/lock state.
pub(crate) fn detect_slips(cfg: &Config, state: &mut RtkState, pairs: &[SdPair]) {
    for pair in pairs {
        let sv = pair.sv;

        // receiver reported loss of lock, on either site
        let lli_slip = pair.rover.lock_loss() || pair.base.lock_loss();

        let reacquired = {
            let status = state.status(sv);
            status.slip = false;
            status.half_cycle_ambiguous =
                pair.rover.half_cycle_ambiguous() || pair.base.half_cycle_ambiguous();
            status.outage >= cfg.max_outage && status.prev_phase.is_some()
        };

        if lli_slip {
            debug!("{} ({}) LLI slip", pair.rover.t, sv);
        }
        if reacquired {
            debug!("{} ({}) re-acquired after outage", pair.rover.t, sv);
        }

        let gf_slip = geometry_free_slip(cfg, state, pair);
        let mw_slip = melbourne_wubbena_slip(state, pair);

        if lli_slip || reacquired || gf_slip || mw_slip {
            let status = state.status(sv);
            status.slip = true;
            status.slip_count += 1;
            status.lock = 0;
            warn!("{} ({}) cycle slip declared", pair.rover.t, sv);
            state.control(sv).reset();
        }
    }
}

/// Geometry-free phase jump detector. Works when the rover tracks a
/// secondary band; otherwise keeps no decision.
fn geometry_free_slip(cfg: &Config, state: &mut RtkState, pair: &SdPair) -> bool {
    let Some(secondary) = pair.rover_secondary else {
        return false;
    };
    let (Some(l1), Some(l2)) = (pair.rover.phase_cycles, secondary.phase_cycles) else {
        return false;
    };

    let gf = pair.rover.carrier.wavelength() * l1 - secondary.carrier.wavelength() * l2;
    let status = state.status(pair.sv);
    let slip = match status.gf_m {
        Some(prev) => (gf - prev).abs() > cfg.slip_threshold,
        None => false, // armed for next epoch
    };
    status.gf_m = Some(gf);
    if slip {
        debug!("{} ({}) geometry-free jump", pair.rover.t, pair.sv);
    }
    slip
}

/// Melbourne-Wubbena residual against its running statistics.
fn melbourne_wubbena_slip(state: &mut RtkState, pair: &SdPair) -> bool {
    let Some(secondary) = pair.rover_secondary else {
        return false;
    };
    let (Some(l1), Some(l2), Some(p1), Some(p2)) = (
        pair.rover.phase_cycles,
        secondary.phase_cycles,
        pair.rover.pseudorange_m,
        secondary.pseudorange_m,
    ) else {
        return false;
    };

    let (f1, f2) = (
        pair.rover.carrier.frequency(),
        secondary.carrier.frequency(),
    );
    let wl_wavelength = Constants::SPEED_OF_LIGHT_M_S / (f1 - f2);
    let mw = wl_wavelength * (l1 - l2) - (f1 * p1 + f2 * p2) / (f1 + f2);

    match state.control(pair.sv).feed_mw(mw) {
        Some(deviation) if deviation > Constants::MW_SLIP_FACTOR => {
            debug!("{} ({}) MW deviation {:.1} sigma", pair.rover.t, pair.sv, deviation);
            true
        },
        _ => false,
    }
}

/// End of epoch bookkeeping: phase caches for the observed satellites,
/// lock counters for the contributing ones, aging for everyone else.
pub(crate) fn update_counters(state: &mut RtkState, observed: &[SdPair]) {
    for pair in observed {
        let status = state.status(pair.sv);
        if let Some(phase) = pair.rover.phase_cycles {
            status.prev_phase = Some((pair.rover.t, phase));
        }
        if let Some(snr) = pair.rover.snr_dbhz {
            status.snr_dbhz = snr;
        }
    }
    for status in state.ssat.values_mut() {
        if status.vsat {
            status.lock = status.lock.saturating_add(1);
            status.outage = 0;
        } else {
            status.outage = status.outage.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::carrier::Carrier;
    use crate::prelude::{Constellation, Epoch, Observation, Vector3, SV};

    fn cfg() -> Config {
        let mut cfg = Config::kinematic_preset();
        cfg.base_position_ecef = Some(Vector3::new(4696989.0, 723994.0, 4239678.0));
        cfg
    }

    fn g05() -> SV {
        SV::new(Constellation::GPS, 5)
    }

    fn pair(t: Epoch, lli: u8) -> SdPair {
        SdPair {
            sv: g05(),
            rover: Observation::new(g05(), t, 2.0E7, 1.0E8).with_lli(lli),
            base: Observation::new(g05(), t, 2.0E7, 1.0E8),
            rover_secondary: None,
        }
    }

    #[test]
    fn lli_slip_updates_lifecycle() {
        let cfg = cfg();
        let mut state = RtkState::new(&cfg);
        let t = Epoch::from_gpst_seconds(0.0);

        state.status(g05()).lock = 12;
        detect_slips(&cfg, &mut state, &[pair(t, crate::obs::LLI_LOCK_LOSS)]);

        let status = state.status(g05());
        assert!(status.slip);
        assert_eq!(status.slip_count, 1);
        assert_eq!(status.lock, 0);
    }

    #[test]
    fn clean_epoch_keeps_lock() {
        let cfg = cfg();
        let mut state = RtkState::new(&cfg);
        let t = Epoch::from_gpst_seconds(0.0);

        state.status(g05()).lock = 12;
        detect_slips(&cfg, &mut state, &[pair(t, 0)]);
        assert!(!state.status(g05()).slip);

        state.status(g05()).vsat = true;
        update_counters(&mut state, &[pair(t, 0)]);
        assert_eq!(state.status(g05()).lock, 13);
        assert_eq!(state.status(g05()).outage, 0);
        assert!(state.status(g05()).prev_phase.is_some());
    }

    #[test]
    fn geometry_free_jump_needs_two_epochs() {
        let mut cfg = cfg();
        cfg.slip_threshold = 0.05;
        let mut state = RtkState::new(&cfg);
        let t = Epoch::from_gpst_seconds(0.0);

        let mut p = pair(t, 0);
        p.rover_secondary = Some(Observation {
            carrier: Carrier::L2,
            ..Observation::new(g05(), t, 2.0E7, 0.8E8)
        });

        // first sighting arms the detector
        detect_slips(&cfg, &mut state, &[p]);
        assert!(!state.status(g05()).slip);

        // one L1 cycle jump trips it
        let mut p2 = p;
        p2.rover.phase_cycles = Some(1.0E8 + 1.0);
        detect_slips(&cfg, &mut state, &[p2]);
        assert!(state.status(g05()).slip);
    }

    #[test]
    fn unseen_satellite_ages() {
        let cfg = cfg();
        let mut state = RtkState::new(&cfg);
        state.status(g05()).lock = 3;

        update_counters(&mut state, &[]);
        assert_eq!(state.status(g05()).outage, 1);
    }
}
