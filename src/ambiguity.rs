//! Integer ambiguity resolution: double difference projection of the
//! float ambiguities, LAMBDA search, ratio validation, solution
//! back-substitution and the optional fix-and-hold feedback.

use itertools::Itertools;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

use crate::cfg::{ArMode, Config};
use crate::constants::Constants;
use crate::filter::{Kernel, Measurement};
use crate::lambda::{lambda_search, ratio};
use crate::obs::sv_order;
use crate::prelude::{Constellation, SV};
use crate::state::{AmbiguityState, RtkState};

/// Ambiguity resolution outcome for one epoch.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ArOutcome {
    /// Solution was fixed and back-substituted into `xa`/`Pa`
    pub fixed: bool,
    /// Ratio achieved (0 when the search never ran)
    pub ratio: f64,
    /// Double difference ambiguities involved
    pub nb: usize,
}

/// One DD ambiguity: satellite and reference channel slots.
#[derive(Debug, Clone, Copy)]
struct DdAmbiguity {
    sv: SV,
    refsv: SV,
    slot: usize,
    refslot: usize,
}

fn ar_capable(cfg: &Config, constellation: Constellation) -> bool {
    if constellation == Constellation::Glonass {
        // FDMA wavelengths differ across channels, integer fixing
        // requires calibrated inter channel biases
        cfg.glonass_ar
    } else {
        true
    }
}

/// Candidate subset: locked, unslipped, high enough satellites,
/// grouped per constellation under the highest elevation reference.
fn dd_candidates(cfg: &Config, state: &RtkState) -> Vec<DdAmbiguity> {
    let eligible: Vec<(SV, usize)> = state
        .channels
        .assigned()
        .filter(|(sv, slot)| {
            let Some(status) = state.ssat.get(sv) else {
                return false;
            };
            ar_capable(cfg, sv.constellation)
                && status.vsat
                && !status.slip
                && !status.half_cycle_ambiguous
                && status.fix != AmbiguityState::None
                && status.lock >= cfg.min_lock
                && status.elevation.to_degrees() >= cfg.ar_elevation_mask
                && state.p[(cfg.bias_index(*slot), cfg.bias_index(*slot))] > 0.0
        })
        .sorted_by_key(|(sv, _)| sv_order(*sv))
        .collect();

    let mut dd = Vec::<DdAmbiguity>::new();
    let mut references: Vec<(SV, usize)> = Vec::new();

    for (sv, _) in eligible.iter() {
        if references.iter().any(|(r, _)| r.constellation == sv.constellation) {
            continue;
        }
        let best = eligible
            .iter()
            .filter(|(s, _)| s.constellation == sv.constellation)
            .max_by(|(a, _), (b, _)| {
                let (ea, eb) = (
                    state.ssat.get(a).map(|s| s.elevation).unwrap_or(0.0),
                    state.ssat.get(b).map(|s| s.elevation).unwrap_or(0.0),
                );
                ea.partial_cmp(&eb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // ties: keep the smallest PRN
                    .then_with(|| sv_order(*b).cmp(&sv_order(*a)))
            });
        if let Some(best) = best {
            references.push(*best);
        }
    }

    for (sv, slot) in eligible.iter() {
        let Some((refsv, refslot)) = references
            .iter()
            .find(|(r, _)| r.constellation == sv.constellation)
        else {
            continue;
        };
        if refsv == sv {
            continue;
        }
        dd.push(DdAmbiguity {
            sv: *sv,
            refsv: *refsv,
            slot: *slot,
            refslot: *refslot,
        });
    }
    dd
}

/// Attempts integer resolution. On validated success the fixed
/// solution lands in `state.xa`/`state.pa` and true is reported.
pub(crate) fn resolve(cfg: &Config, state: &mut RtkState, kernel: &mut Kernel) -> ArOutcome {
    if cfg.ar_mode == ArMode::Off {
        return ArOutcome::default();
    }

    let dd = dd_candidates(cfg, state);
    let nb = dd.len();
    if nb == 0 {
        state.nfix = 0;
        return ArOutcome::default();
    }

    let nx = state.x.len();
    let na = cfg.base_states();

    // DD projector
    let mut d = DMatrix::<f64>::zeros(nb, nx);
    for (k, amb) in dd.iter().enumerate() {
        d[(k, cfg.bias_index(amb.slot))] = 1.0;
        d[(k, cfg.bias_index(amb.refslot))] = -1.0;
    }

    let a_float = &d * &state.x;
    let c = &state.p * d.transpose(); // nx x nb
    let q_aa = &d * &c;

    let (candidates, s) = match lambda_search(&a_float, &q_aa, 2) {
        Ok(out) => out,
        Err(e) => {
            warn!("ambiguity search failure: {}", e);
            state.nfix = 0;
            return ArOutcome::default();
        },
    };

    let reached = ratio(&s);
    let validated = s[0] <= 0.0 || reached >= cfg.ar_ratio_threshold;

    if !validated {
        debug!(
            "ratio {:.2} below threshold {:.2}, float retained",
            reached, cfg.ar_ratio_threshold
        );
        state.nfix = 0;
        for amb in dd.iter() {
            state.control(amb.sv).fix_count = 0;
        }
        return ArOutcome {
            fixed: false,
            ratio: reached,
            nb,
        };
    }

    let fixed = &candidates[0];

    // back substitution restricted to the kept states:
    // xa = x - C Qaa^-1 (a - N), Pa likewise
    let Some(q_aa_inv) = q_aa.clone().try_inverse() else {
        warn!("ambiguity covariance inversion failure");
        state.nfix = 0;
        return ArOutcome::default();
    };

    let gain = &c * q_aa_inv; // nx x nb
    let x_fixed = &state.x - &gain * (&a_float - fixed);
    let p_fixed = &state.p - &gain * c.transpose();

    state.xa = DVector::from_iterator(na, (0..na).map(|i| x_fixed[i]));
    state.pa = DMatrix::from_fn(na, na, |i, j| p_fixed[(i, j)]);

    state.nfix += 1;
    info!(
        "ambiguities fixed: nb={} ratio={:.2} nfix={}",
        nb, reached, state.nfix
    );

    for amb in dd.iter() {
        for sv in [amb.sv, amb.refsv] {
            let status = state.status(sv);
            if status.fix != AmbiguityState::Hold {
                status.fix = AmbiguityState::Fixed;
            }
            state.control(sv).fix_count += 1;
        }
    }

    if cfg.ar_mode == ArMode::FixAndHold && state.nfix >= cfg.min_fix {
        hold(cfg, state, kernel, &dd, fixed);
    }

    ArOutcome {
        fixed: true,
        ratio: reached,
        nb,
    }
}

/// Feeds the fixed DD ambiguities back as tight pseudo measurements,
/// so the float filter inherits the fix. Only satellites whose own
/// fix streak reached `min_fix` take part: a freshly risen SV keeps
/// floating until it has proven itself.
fn hold(
    cfg: &Config,
    state: &mut RtkState,
    kernel: &mut Kernel,
    dd: &[DdAmbiguity],
    fixed: &DVector<f64>,
) {
    let held: Vec<(usize, &DdAmbiguity)> = dd
        .iter()
        .enumerate()
        .filter(|(_, amb)| {
            state
                .ambc
                .get(&amb.sv)
                .map_or(0, |control| control.fix_count)
                >= cfg.min_fix
        })
        .collect();
    if held.is_empty() {
        return;
    }

    let nx = state.x.len();
    let nb = held.len();

    let mut h = DMatrix::<f64>::zeros(nb, nx);
    let mut v = DVector::<f64>::zeros(nb);
    for (row, (k, amb)) in held.iter().enumerate() {
        h[(row, cfg.bias_index(amb.slot))] = 1.0;
        h[(row, cfg.bias_index(amb.refslot))] = -1.0;
        v[row] = fixed[*k]
            - (state.x[cfg.bias_index(amb.slot)] - state.x[cfg.bias_index(amb.refslot)]);
    }
    let r = DMatrix::<f64>::identity(nb, nb) * Constants::VAR_HOLD_AMBIGUITY;

    let meas = Measurement {
        h: &h,
        v: &v,
        r: &r,
        repredict: None,
    };
    match kernel.measurement_update(state, &meas) {
        Ok(()) => {
            for (_, amb) in held.iter() {
                state.status(amb.sv).fix = AmbiguityState::Hold;
                state.status(amb.refsv).fix = AmbiguityState::Hold;
            }
            debug!("{} ambiguities held", nb);
        },
        Err(e) => warn!("hold feedback rejected: {}", e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::prelude::Vector3;

    fn cfg() -> Config {
        let mut cfg = Config::kinematic_preset();
        cfg.base_position_ecef = Some(Vector3::new(4696989.0, 723994.0, 4239678.0));
        cfg.ar_mode = ArMode::Continuous;
        cfg
    }

    fn gps(prn: u8) -> SV {
        SV::new(Constellation::GPS, prn)
    }

    /// Seeds a state whose SD ambiguities sit close to integers with a
    /// tight covariance: resolution must validate and snap them.
    fn seeded_state(cfg: &Config, offsets: &[f64]) -> RtkState {
        let mut state = RtkState::new(cfg);
        state.init_position(cfg, Vector3::new(1.0, 2.0, 3.0), 1.0);

        for (i, offset) in offsets.iter().enumerate() {
            let sv = gps(i as u8 + 1);
            let seeds = [crate::state::BiasSeed {
                sv,
                sd_bias_cycles: 10.0 * (i as f64 + 1.0) + offset,
                reset: false,
            }];
            state.propagate_ambiguities(cfg, 1.0, &seeds);
            let slot = state.channels.slot_of(sv).unwrap();
            let idx = cfg.bias_index(slot);
            // tight float estimate
            state.p[(idx, idx)] = 1.0E-4;
            let status = state.status(sv);
            status.vsat = true;
            status.elevation = (30.0 + 10.0 * i as f64).to_radians();
            status.lock = 10;
        }
        state
    }

    #[test]
    fn near_integer_floats_fix() {
        let cfg = cfg();
        let mut state = seeded_state(&cfg, &[0.001, -0.002, 0.001, 0.003]);
        let mut kernel = Kernel::new(&cfg);

        let outcome = resolve(&cfg, &mut state, &mut kernel);
        assert!(outcome.fixed, "ratio = {}", outcome.ratio);
        assert_eq!(outcome.nb, 3);
        assert_eq!(state.nfix, 1);

        // fixed states exist for position + kept states
        assert_eq!(state.xa.len(), cfg.base_states());
    }

    #[test]
    fn ambiguous_floats_stay_float() {
        let cfg = cfg();
        // one DD lands exactly between two integers: the two best
        // candidates tie and the ratio cannot validate
        let mut state = seeded_state(&cfg, &[0.0, 0.5, 0.0, 0.0]);
        let mut kernel = Kernel::new(&cfg);
        let outcome = resolve(&cfg, &mut state, &mut kernel);
        assert!(!outcome.fixed, "ratio = {}", outcome.ratio);
        assert!(outcome.ratio < cfg.ar_ratio_threshold);
        assert_eq!(state.nfix, 0);
    }

    #[test]
    fn slipped_satellite_is_not_a_candidate() {
        let cfg = cfg();
        let mut state = seeded_state(&cfg, &[0.001, -0.002, 0.001, 0.003]);
        state.status(gps(2)).slip = true;

        let dd = dd_candidates(&cfg, &state);
        assert_eq!(dd.len(), 2);
        assert!(dd.iter().all(|amb| amb.sv != gps(2)));
    }

    #[test]
    fn reference_is_highest_eligible_elevation() {
        let cfg = cfg();
        let state = seeded_state(&cfg, &[0.0, 0.0, 0.0, 0.0]);
        let dd = dd_candidates(&cfg, &state);
        // G04 was seeded with the highest elevation
        assert!(dd.iter().all(|amb| amb.refsv == gps(4)));
    }

    #[test]
    fn hold_mode_tightens_the_ambiguities() {
        let mut cfg = cfg();
        cfg.ar_mode = ArMode::FixAndHold;
        cfg.min_fix = 1;

        let mut state = seeded_state(&cfg, &[0.001, -0.002, 0.001, 0.003]);
        let mut kernel = Kernel::new(&cfg);

        let outcome = resolve(&cfg, &mut state, &mut kernel);
        assert!(outcome.fixed);

        let slot = state.channels.slot_of(gps(1)).unwrap();
        let idx = cfg.bias_index(slot);
        assert!(state.p[(idx, idx)] < 1.0E-4);
        assert_eq!(state.status(gps(1)).fix, AmbiguityState::Hold);
    }
}
