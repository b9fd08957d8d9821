//! RTK epoch orchestrator.

use log::{debug, error, info, warn};
use nalgebra::{DMatrix, DVector};

use crate::ambiguity;
use crate::bancroft::Bancroft;
use crate::carrier::Carrier;
use crate::cfg::{ArMode, Config, PositioningMode};
use crate::constants::Constants;
use crate::error::Error;
use crate::filter::{Kernel, Measurement};
use crate::obs::{pair_epochs, Observation, SdPair};
use crate::orbit::{OrbitalStateProvider, SatelliteState};
use crate::position::{azimuth_elevation, Position};
use crate::prelude::{Duration, Epoch, Vector3};
use crate::quality;
use crate::residual::{dops, DdContext, DdModel, SatGeom};
use crate::solution::{SatelliteRecord, Solution, SolutionStatus};
use crate::state::{AmbiguityState, BiasSeed, RtkState};

/// Single frequency RTK [Solver].
///
/// Owns the estimation state for the whole run: create it once,
/// feed it one epoch at a time through [Solver::process].
pub struct Solver<O: OrbitalStateProvider> {
    /// Solver parametrization
    pub cfg: Config,
    /// External orbital state source
    orbit: O,
    /// Navigation kernel
    kernel: Kernel,
    /// Estimation state
    pub(crate) state: RtkState,
    /// Previous base epoch, kept for interpolation
    prev_base: Option<(Epoch, Vec<Observation>)>,
    /// Per satellite status stream for the last epoch
    records: Vec<SatelliteRecord>,
}

impl<O: OrbitalStateProvider> Solver<O> {
    /// Builds a new [Solver] with frozen options. The configuration is
    /// validated here; the state store is allocated once, sized by the
    /// worst case dimension.
    pub fn new(cfg: &Config, orbit: O) -> Result<Self, Error> {
        cfg.validate()?;

        let mut state = RtkState::new(cfg);
        if cfg.mode == PositioningMode::Fixed {
            if let Some(rr) = cfg.rover_position_ecef {
                state.init_position(cfg, rr, 1.0E-8);
            }
        }

        info!(
            "solver deployed: mode={:?} ar={:?} nx={}",
            cfg.mode,
            cfg.ar_mode,
            cfg.nx()
        );

        Ok(Self {
            cfg: cfg.clone(),
            orbit,
            kernel: Kernel::new(cfg),
            state,
            prev_base: None,
            records: Vec::new(),
        })
    }

    /// Last published solution (explicit `none` marker after a failed
    /// epoch: the stream never gaps silently).
    pub fn last_solution(&self) -> &Solution {
        &self.state.sol
    }

    /// Per satellite status stream for the last consumed epoch.
    pub fn satellite_records(&self) -> &[SatelliteRecord] {
        &self.records
    }

    /// Currently estimated base position.
    pub fn base_position(&self) -> Option<Vector3<f64>> {
        self.state.rb
    }

    /// Moving-base runs may re-seed the base position externally.
    pub fn set_base_position(&mut self, rb: Vector3<f64>) {
        self.state.rb = Some(rb);
    }

    /// Consumes one epoch: rover and base observations sampled around
    /// the same nominal instant. Publishes exactly one [Solution] or
    /// one explicit failure; either way the epoch is consumed and the
    /// next one may be proposed.
    pub fn process(
        &mut self,
        rover: &[Observation],
        base: &[Observation],
    ) -> Result<Solution, Error> {
        let t = rover.first().ok_or(Error::EmptyEpoch)?.t;
        let tt = self
            .state
            .prev_epoch
            .map(|prev| (t - prev).to_seconds())
            .unwrap_or(0.0);

        let result = self.run_epoch(t, tt, rover, base);

        // epoch is consumed whatever the outcome
        self.state.prev_epoch = Some(t);
        self.state.tt = tt;
        debug!("{} consumed (tt={:.3}s)", t, self.state.tt);
        if let Some(ob) = base.first() {
            self.prev_base = Some((ob.t, base.to_vec()));
        }

        match result {
            Ok(solution) => {
                self.state.numeric_failures = 0;
                self.state.sol = solution.clone();
                Ok(solution)
            },
            Err(e) => {
                error!("{} epoch failure: {}", t, e);
                self.recover(&e);
                self.state.sol = Solution::none(t);
                self.state.sol.ratio_threshold = self.cfg.ar_ratio_threshold;
                Err(e)
            },
        }
    }

    /// Failure policy: numerical breakdowns rebuild the covariance and
    /// eventually restart the filter; everything else preserves state.
    fn recover(&mut self, e: &Error) {
        match e {
            Error::CovarianceNotPositiveDefinite | Error::MatrixInversion => {
                self.state.numeric_failures += 1;
                if self.state.numeric_failures >= Constants::MAX_NUMERIC_FAILURES {
                    warn!("numerical failures persist: full filter restart");
                    self.state.restart(&self.cfg);
                    self.kernel = Kernel::new(&self.cfg);
                } else {
                    warn!("covariance reset, estimates preserved");
                    self.state.reset_covariance(&self.cfg);
                }
            },
            _ => {},
        }
    }

    fn run_epoch(
        &mut self,
        t: Epoch,
        tt: f64,
        rover: &[Observation],
        base: &[Observation],
    ) -> Result<Solution, Error> {
        // nobody contributed yet
        for status in self.state.ssat.values_mut() {
            status.vsat = false;
        }

        if self.cfg.mode == PositioningMode::MovingBase {
            if let Err(e) = self.estimate_base_position(t, base) {
                quality::update_counters(&mut self.state, &[]);
                return Err(e);
            }
        }
        let rb = self.state.rb.ok_or(Error::UnknownBasePosition)?;

        let (pairs, age) = pair_epochs(&self.cfg, t, rover, base, self.prev_base.as_ref());
        if age.to_seconds().abs() > self.cfg.max_age_s {
            quality::update_counters(&mut self.state, &[]);
            return Err(Error::EpochMisalignment);
        }

        // orbital states
        let resolved: Vec<(SdPair, SatelliteState)> = pairs
            .iter()
            .filter_map(|pair| {
                let state = self.satellite_state(t, pair)?;
                if !state.healthy {
                    debug!("{} ({}) unhealthy", t, pair.sv);
                    return None;
                }
                Some((*pair, state))
            })
            .collect();

        // bootstrap when no prior rover position is known
        let just_initialized = !self.state.initialized;
        if just_initialized {
            if let Err(e) = self.bootstrap(&resolved) {
                quality::update_counters(&mut self.state, &pairs);
                return Err(e);
            }
        }

        // attitude + masks
        let rx = Position::from_ecef(self.state.rover_position());
        let masked: Vec<(SdPair, SatelliteState, f64, f64)> = resolved
            .iter()
            .filter_map(|(pair, sat_state)| {
                let (az, el) = azimuth_elevation(&rx, sat_state.position);
                if let Some(mask_deg) = self.cfg.min_sv_elev {
                    // a satellite sitting exactly on the mask stays out
                    if el.to_degrees() <= mask_deg {
                        debug!("{} ({}) below elevation mask", t, pair.sv);
                        return None;
                    }
                }
                if let Some(min_snr) = self.cfg.min_snr {
                    if pair.rover.snr_dbhz.unwrap_or(0.0) < min_snr {
                        debug!("{} ({}) below SNR mask", t, pair.sv);
                        return None;
                    }
                }
                Some((*pair, *sat_state, az, el))
            })
            .collect();

        let observed: Vec<SdPair> = masked.iter().map(|(p, ..)| *p).collect();

        if masked.len() < 4 {
            quality::update_counters(&mut self.state, &observed);
            if just_initialized {
                // the code bootstrap succeeded: publish it rather
                // than dropping the epoch entirely
                let mut solution = Solution {
                    t,
                    position: self.state.rover_position(),
                    status: SolutionStatus::Single,
                    n_satellites: resolved.len(),
                    age,
                    ratio_threshold: self.cfg.ar_ratio_threshold,
                    ..Default::default()
                };
                solution.set_covariance(&self.state.position_covariance());
                return Ok(solution);
            }
            return Err(Error::NotEnoughSatellites(masked.len()));
        }

        // geometry strength, ahead of any state mutation. A geometry
        // too degenerate to even invert counts as infinite dilution.
        let azel: Vec<(f64, f64)> = masked.iter().map(|(.., az, el)| (*az, *el)).collect();
        let gdop = match dops(&azel) {
            Some((gdop, pdop, ..)) => {
                debug!("{} gdop={:.1} pdop={:.1}", t, gdop, pdop);
                gdop
            },
            None => f64::INFINITY,
        };
        if gdop > self.cfg.max_gdop {
            quality::update_counters(&mut self.state, &observed);
            return Err(Error::GdopExceeded(gdop));
        }

        // cycle slips, then the filter time update with its
        // ambiguity seeds
        quality::detect_slips(&self.cfg, &mut self.state, &observed);

        let seeds = self.bias_seeds(&observed);
        self.kernel
            .time_update(&mut self.state, &self.cfg, tt, &seeds);

        // per satellite attitude bookkeeping
        for (pair, _, az, el) in masked.iter() {
            let status = self.state.status(pair.sv);
            status.azimuth = *az;
            status.elevation = *el;
        }

        // geometry with assigned channels
        let sats: Vec<SatGeom> = masked
            .iter()
            .filter_map(|(pair, sat_state, _, el)| {
                let slot = self.state.channels.slot_of(pair.sv)?;
                Some(SatGeom {
                    sv: pair.sv,
                    state: *sat_state,
                    rover: pair.rover,
                    base: pair.base,
                    elevation: *el,
                    wavelength: Carrier::navigation_band(pair.sv.constellation).wavelength(),
                    slot,
                })
            })
            .collect();

        if sats.len() < 4 {
            quality::update_counters(&mut self.state, &observed);
            return Err(Error::NotEnoughSatellites(sats.len()));
        }

        let snapshot = (self.state.x.clone(), self.state.p.clone());
        let ctx = DdContext::new(&self.cfg, &sats, rb, self.state.rover_position());

        let outcome = self.measurement_loop(&ctx);
        let model_rows = match outcome {
            Ok(rows) => rows,
            Err(e) => {
                self.state.x = snapshot.0;
                self.state.p = snapshot.1;
                quality::update_counters(&mut self.state, &observed);
                return Err(e);
            },
        };

        self.state.symmetrize();

        // post fit validation
        let post_fit = ctx.innovations(&self.state.x, &model_rows.rows);
        if !self.validate_post_fit(&sats, &model_rows, &post_fit) {
            self.state.x = snapshot.0;
            self.state.p = snapshot.1;
            quality::update_counters(&mut self.state, &observed);
            return Err(Error::PostFitValidation);
        }

        // contribution flags + residual stream
        for &i in model_rows.used.iter() {
            self.state.status(sats[i].sv).vsat = true;
        }
        for (k, row) in model_rows.rows.iter().enumerate() {
            let status = self.state.status(sats[row.sat].sv);
            if row.phase {
                status.phase_residual = post_fit[k];
            } else {
                status.code_residual = post_fit[k];
            }
        }
        for (i, _) in model_rows.rejected.iter() {
            let status = self.state.status(sats[*i].sv);
            status.reject_count = status.reject_count.saturating_add(1);
        }

        // integer ambiguity resolution
        let ar = ambiguity::resolve(&self.cfg, &mut self.state, &mut self.kernel);

        let mut solution = Solution {
            t,
            position: self.state.rover_position(),
            velocity: self.state.rover_velocity(&self.cfg),
            qr: [0.0; 6],
            status: SolutionStatus::Float,
            n_satellites: model_rows.used.len(),
            age,
            ratio: ar.ratio,
            ratio_threshold: self.cfg.ar_ratio_threshold,
        };
        solution.set_covariance(&self.state.position_covariance());

        if ar.fixed {
            solution.status = SolutionStatus::Fix;
            solution.position = Vector3::new(self.state.xa[0], self.state.xa[1], self.state.xa[2]);
            let qa = self.state.pa.fixed_view::<3, 3>(0, 0).into_owned();
            solution.set_covariance(&qa);
        } else if self.state.nfix > 0 {
            // a fix existed and was just lost
            self.state.nfix = 0;
        }

        quality::update_counters(&mut self.state, &observed);
        self.build_records(t, &sats);

        Ok(solution)
    }

    /// Iterated measurement update: relinearize and update until the
    /// position increment is negligible or the iteration budget runs
    /// out. Returns the accepted DD model description.
    fn measurement_loop(&mut self, ctx: &DdContext) -> Result<DdModel, Error> {
        let mut model = ctx.build(&self.state.x);
        if model.rows.is_empty() {
            return Err(Error::AllInnovationsRejected);
        }
        if model.phase_rows() == 0 {
            debug!("no phase rows survived, code only epoch");
        }

        for iteration in 0..self.cfg.niter {
            let before = self.state.rover_position();

            let repredict = |x: &DVector<f64>| ctx.innovations(x, &model.rows);
            let meas = Measurement {
                h: &model.h,
                v: &model.v,
                r: &model.r,
                repredict: Some(&repredict),
            };
            self.kernel.measurement_update(&mut self.state, &meas)?;

            let increment = (self.state.rover_position() - before).norm();
            if increment < Constants::ITERATION_EXIT_M {
                break;
            }
            if iteration + 1 < self.cfg.niter {
                // relinearize at the updated state
                let rebuilt = ctx.build(&self.state.x);
                if rebuilt.rows == model.rows {
                    model = rebuilt;
                } else {
                    model.v = ctx.innovations(&self.state.x, &model.rows);
                }
            }
        }

        // optional baseline length constraint, separate tight row
        if let Some((v, h_row, var)) = ctx.baseline_constraint(&self.state.x) {
            let h = DMatrix::from_rows(&[h_row.transpose()]);
            let v = DVector::from_vec(vec![v]);
            let r = DMatrix::from_diagonal(&DVector::from_vec(vec![var]));
            let meas = Measurement {
                h: &h,
                v: &v,
                r: &r,
                repredict: None,
            };
            self.kernel.measurement_update(&mut self.state, &meas)?;
        }

        Ok(model)
    }

    /// Post fit residuals against their expected magnitude. The
    /// particle kernel publishes a sampled position whose spread sits
    /// above the carrier noise floor: only its code rows are gated.
    fn validate_post_fit(
        &self,
        sats: &[SatGeom],
        model: &DdModel,
        post_fit: &DVector<f64>,
    ) -> bool {
        let phase_gate = !matches!(self.cfg.filter, crate::cfg::FilterKind::Particle { .. });
        for (k, row) in model.rows.iter().enumerate() {
            if row.phase && !phase_gate {
                continue;
            }
            let threshold = 4.0 * model.r[(k, k)].sqrt();
            if post_fit[k].abs() > threshold {
                warn!(
                    "({}) {} post-fit residual {:.3} exceeds {:.3}",
                    sats[row.sat].sv,
                    if row.phase { "phase" } else { "code" },
                    post_fit[k],
                    threshold
                );
                return false;
            }
        }
        true
    }

    /// Transmit-time satellite state, through the external provider.
    fn satellite_state(&self, t: Epoch, pair: &SdPair) -> Option<SatelliteState> {
        let pr = pair.rover.pseudorange_m?;
        let flight = Duration::from_seconds(pr / Constants::SPEED_OF_LIGHT_M_S);
        let coarse = self.orbit.state_at(t - flight, pair.sv)?;
        // refine with the satellite clock offset
        self.orbit.state_at(t - flight - coarse.clock_bias, pair.sv)
    }

    /// Initializes the rover from a closed form code solution.
    fn bootstrap(&mut self, resolved: &[(SdPair, SatelliteState)]) -> Result<(), Error> {
        let sats: Vec<(Observation, SatelliteState)> = resolved
            .iter()
            .map(|(pair, state)| (pair.rover, *state))
            .collect();

        let solver = Bancroft::new(&sats)?;
        let solution = solver.resolve()?;
        let position = Vector3::new(solution[0], solution[1], solution[2]);

        let geo = Position::from_ecef(position);
        info!(
            "rover initialized: lat={:.5} lon={:.5}",
            geo.latitude_rad().to_degrees(),
            geo.longitude_rad().to_degrees()
        );
        self.state
            .init_position(&self.cfg, position, Constants::VAR_INITIAL_POS);
        Ok(())
    }

    /// Moving-base: the base position is re-evaluated every epoch from
    /// its own code observations.
    fn estimate_base_position(&mut self, t: Epoch, base: &[Observation]) -> Result<(), Error> {
        let sats: Vec<(Observation, SatelliteState)> = base
            .iter()
            .filter_map(|ob| {
                let pr = ob.pseudorange_m?;
                let flight = Duration::from_seconds(pr / Constants::SPEED_OF_LIGHT_M_S);
                let state = self.orbit.state_at(ob.t - flight, ob.sv)?;
                Some((*ob, state))
            })
            .collect();

        let solver = Bancroft::new(&sats)?;
        let solution = solver.resolve()?;
        self.state.rb = Some(Vector3::new(solution[0], solution[1], solution[2]));
        debug!("{} base position re-estimated", t);
        Ok(())
    }

    /// Single difference ambiguity seeds for the time update.
    fn bias_seeds(&mut self, pairs: &[SdPair]) -> Vec<BiasSeed> {
        pairs
            .iter()
            .filter_map(|pair| {
                let lambda = Carrier::navigation_band(pair.sv.constellation).wavelength();
                let phase_sd = pair.rover.phase_cycles? - pair.base.phase_cycles?;
                let code_sd = pair.rover.pseudorange_m? - pair.base.pseudorange_m?;
                let slip = self
                    .state
                    .ssat
                    .get(&pair.sv)
                    .map(|s| s.slip)
                    .unwrap_or(false);
                Some(BiasSeed {
                    sv: pair.sv,
                    sd_bias_cycles: phase_sd - code_sd / lambda,
                    reset: slip || self.cfg.ar_mode == ArMode::Instantaneous,
                })
            })
            .collect()
    }

    fn build_records(&mut self, t: Epoch, sats: &[SatGeom]) {
        self.records.clear();
        for sat in sats.iter() {
            let Some(status) = self.state.ssat.get(&sat.sv) else {
                continue;
            };
            self.records.push(SatelliteRecord {
                t,
                sv: sat.sv,
                azimuth: status.azimuth,
                elevation: status.elevation,
                code_residual: status.code_residual,
                phase_residual: status.phase_residual,
                valid: status.vsat,
                slip: status.slip,
                fixed: matches!(status.fix, AmbiguityState::Fixed | AmbiguityState::Hold),
                snr_dbhz: status.snr_dbhz,
                lock: status.lock,
                outage: status.outage,
                slip_count: status.slip_count,
                reject_count: status.reject_count,
            });
        }
    }
}
