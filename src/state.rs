//! Float/fixed state vector and covariance store.
//!
//! The float state gathers the rover position (optionally velocity and
//! acceleration), the optional tropospheric and ionospheric states and
//! one single-difference L1 ambiguity per tracked satellite. Satellites
//! are mapped onto a fixed pool of channels so the vector dimension is
//! decided once, at initialization.

use std::collections::HashMap;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Matrix3};

use crate::cfg::{ArMode, Config, Dynamics, PositioningMode, TropoEstimation};
use crate::position::{enu_rotation, Position};
use crate::prelude::{Epoch, Solution, Vector3, SV};

/// Ambiguity lifecycle, per satellite.
#[derive(Default, Debug, Clone, Copy, PartialEq)]
pub enum AmbiguityState {
    /// Never sighted, or reset
    #[default]
    None,
    /// Estimated as a float state
    Float,
    /// Resolved to an integer this epoch
    Fixed,
    /// Resolved and held
    Hold,
}

/// Per satellite status, carried across epochs.
#[derive(Default, Debug, Clone)]
pub(crate) struct SatelliteStatus {
    /// Azimuth [rad], at last sighting
    pub azimuth: f64,
    /// Elevation [rad], at last sighting
    pub elevation: f64,
    /// Code residual [m], post fit
    pub code_residual: f64,
    /// Phase residual [m], post fit
    pub phase_residual: f64,
    /// Contributed to the current solution
    pub vsat: bool,
    /// Signal strength [dB-Hz]
    pub snr_dbhz: f64,
    /// Ambiguity lifecycle
    pub fix: AmbiguityState,
    /// Slip declared this epoch
    pub slip: bool,
    /// Receiver reports a possible half-cycle ambiguity: the integer
    /// property does not hold and resolution must leave this SV out
    pub half_cycle_ambiguous: bool,
    /// Epochs of continuous phase lock
    pub lock: u32,
    /// Epochs without a usable observation
    pub outage: u32,
    /// Total declared slips
    pub slip_count: u32,
    /// Total innovation rejections
    pub reject_count: u32,
    /// Geometry-free phase cache [m]
    pub gf_m: Option<f64>,
    /// Previous epoch phase [cycle] and sampling time
    pub prev_phase: Option<(Epoch, f64)>,
}

/// Running linear-combination statistics: MW mean/variance feeding the
/// slip detector, fix counters feeding the hold decision.
#[derive(Default, Debug, Clone)]
pub(crate) struct AmbiguityControl {
    pub mw_mean: f64,
    pub mw_var: f64,
    pub mw_count: u32,
    /// Consecutive epochs this satellite took part in a validated fix
    pub fix_count: u32,
}

impl AmbiguityControl {
    /// Feeds one MW combination value [m]; returns the deviation from
    /// the running mean normalized by the running sigma, when armed.
    pub fn feed_mw(&mut self, mw: f64) -> Option<f64> {
        if self.mw_count == 0 {
            self.mw_mean = mw;
            self.mw_var = 0.25;
            self.mw_count = 1;
            return None;
        }
        let sigma = self.mw_var.sqrt();
        let deviation = (mw - self.mw_mean).abs() / sigma.max(1.0E-3);

        let n = self.mw_count as f64;
        self.mw_mean += (mw - self.mw_mean) / (n + 1.0);
        self.mw_var += ((mw - self.mw_mean).powi(2) - self.mw_var) / (n + 1.0);
        self.mw_count += 1;
        Some(deviation)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Satellite to channel mapping. O(1) lookup, deterministic
/// first-free allocation.
#[derive(Debug, Clone)]
pub(crate) struct ChannelMap {
    slots: HashMap<SV, usize>,
    channels: Vec<Option<SV>>,
}

impl ChannelMap {
    fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::with_capacity(capacity),
            channels: vec![None; capacity],
        }
    }

    pub fn slot_of(&self, sv: SV) -> Option<usize> {
        self.slots.get(&sv).copied()
    }

    pub fn allocate(&mut self, sv: SV) -> Option<usize> {
        if let Some(slot) = self.slots.get(&sv) {
            return Some(*slot);
        }
        let free = self.channels.iter().position(|c| c.is_none())?;
        self.channels[free] = Some(sv);
        self.slots.insert(sv, free);
        Some(free)
    }

    pub fn release(&mut self, sv: SV) {
        if let Some(slot) = self.slots.remove(&sv) {
            self.channels[slot] = None;
        }
    }

    pub fn assigned(&self) -> impl Iterator<Item = (SV, usize)> + '_ {
        self.channels
            .iter()
            .enumerate()
            .filter_map(|(slot, sv)| sv.map(|sv| (sv, slot)))
    }
}

/// Ambiguity seed, one per paired satellite, produced by the
/// orchestrator ahead of the time update.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BiasSeed {
    pub sv: SV,
    /// Single difference (rover - base) bias estimate [cycle]
    pub sd_bias_cycles: f64,
    /// Slip declared, or instantaneous AR: re-initialize
    pub reset: bool,
}

/// RTK estimation state, owned by the [Solver] for the whole run.
#[derive(Debug, Clone)]
pub(crate) struct RtkState {
    /// Float state
    pub x: DVector<f64>,
    /// Float covariance
    pub p: DMatrix<f64>,
    /// Fixed state (position + dynamics + atmospheric states)
    pub xa: DVector<f64>,
    /// Fixed covariance
    pub pa: DMatrix<f64>,
    /// Satellite channels
    pub channels: ChannelMap,
    /// Per satellite status
    pub ssat: HashMap<SV, SatelliteStatus>,
    /// Per satellite ambiguity control
    pub ambc: HashMap<SV, AmbiguityControl>,
    /// Consecutive epochs holding a validated fix
    pub nfix: u32,
    /// Time delta to the previous epoch [s]
    pub tt: f64,
    /// Previously consumed epoch
    pub prev_epoch: Option<Epoch>,
    /// Base position (ECEF) [m]
    pub rb: Option<Vector3<f64>>,
    /// Last published solution
    pub sol: Solution,
    /// Adaptive innovation scale factor
    pub lam: f64,
    /// Consecutive numerical failures
    pub numeric_failures: u32,
    /// Rover position is initialized
    pub initialized: bool,
}

impl RtkState {
    pub fn new(cfg: &Config) -> Self {
        let nx = cfg.nx();
        let na = cfg.base_states();
        Self {
            x: DVector::zeros(nx),
            p: DMatrix::zeros(nx, nx),
            xa: DVector::zeros(na),
            pa: DMatrix::zeros(na, na),
            channels: ChannelMap::new(cfg.max_channels),
            ssat: HashMap::new(),
            ambc: HashMap::new(),
            nfix: 0,
            tt: 0.0,
            prev_epoch: None,
            rb: cfg.base_position_ecef,
            sol: Solution::default(),
            lam: 1.0,
            numeric_failures: 0,
            initialized: false,
        }
    }

    /// (Re)initializes one state: value on the diagonal, decorrelated
    /// from everything else.
    pub fn initx(&mut self, value: f64, var: f64, idx: usize) {
        self.x[idx] = value;
        for k in 0..self.x.len() {
            self.p[(idx, k)] = 0.0;
            self.p[(k, idx)] = 0.0;
        }
        self.p[(idx, idx)] = var;
    }

    /// Enforces P = (P + P')/2
    pub fn symmetrize(&mut self) {
        let n = self.p.nrows();
        for i in 0..n {
            for j in (i + 1)..n {
                let m = 0.5 * (self.p[(i, j)] + self.p[(j, i)]);
                self.p[(i, j)] = m;
                self.p[(j, i)] = m;
            }
        }
    }

    pub fn rover_position(&self) -> Vector3<f64> {
        Vector3::new(self.x[0], self.x[1], self.x[2])
    }

    pub fn rover_velocity(&self, cfg: &Config) -> Option<Vector3<f64>> {
        if cfg.dynamics == Dynamics::None {
            None
        } else {
            Some(Vector3::new(self.x[3], self.x[4], self.x[5]))
        }
    }

    pub fn position_covariance(&self) -> Matrix3<f64> {
        self.p.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn status(&mut self, sv: SV) -> &mut SatelliteStatus {
        self.ssat.entry(sv).or_default()
    }

    pub fn control(&mut self, sv: SV) -> &mut AmbiguityControl {
        self.ambc.entry(sv).or_default()
    }

    /// Rover position (re)initialization from a code solution.
    pub fn init_position(&mut self, cfg: &Config, position: Vector3<f64>, var: f64) {
        for i in 0..3 {
            self.initx(position[i], var, i);
        }
        for i in 3..(3 + cfg.dynamics.states()) {
            let v = if i < 6 {
                crate::constants::Constants::VAR_INITIAL_VEL
            } else {
                crate::constants::Constants::VAR_INITIAL_ACC
            };
            self.initx(1.0E-6, v, i);
        }
        self.initialized = true;
    }

    /// Dynamics time update: x <- PHI x, P <- PHI P PHI' + Q(tt).
    pub fn propagate_dynamics(&mut self, cfg: &Config, tt: f64) {
        if !self.initialized || tt == 0.0 {
            return;
        }
        match cfg.mode {
            PositioningMode::Static | PositioningMode::Fixed => {
                // random constants
                return;
            },
            _ => {},
        }

        let nd = cfg.dynamics.states();
        if nd == 0 {
            // position random walk in kinematic mode
            let q = cfg.prn.pos.powi(2) * tt.abs();
            for i in 0..3 {
                self.p[(i, i)] += q;
            }
            return;
        }

        let nx = self.x.len();
        let mut phi = DMatrix::<f64>::identity(nx, nx);
        for i in 0..3 {
            phi[(i, i + 3)] = tt;
        }
        if nd == 6 {
            for i in 0..3 {
                phi[(i, i + 6)] = 0.5 * tt * tt;
                phi[(i + 3, i + 6)] = tt;
            }
        }

        self.x = &phi * &self.x;
        self.p = &phi * &self.p * phi.transpose();

        // acceleration (or velocity) noise, ENU to ECEF
        let rx = Position::from_ecef(self.rover_position());
        let e = enu_rotation(rx.latitude_rad(), rx.longitude_rad());
        let q_enu = Matrix3::from_diagonal(&Vector3::new(
            cfg.prn.accel_h.powi(2),
            cfg.prn.accel_h.powi(2),
            cfg.prn.accel_v.powi(2),
        )) * tt.abs();
        let q_ecef = e.transpose() * q_enu * e;

        let noisy = if nd == 6 { 6 } else { 3 };
        for i in 0..3 {
            for j in 0..3 {
                self.p[(noisy + i, noisy + j)] += q_ecef[(i, j)];
            }
        }
    }

    /// Tropospheric states: first-sight initialization + random walk.
    pub fn propagate_tropo(&mut self, cfg: &Config, tt: f64) {
        if cfg.tropo == TropoEstimation::Model {
            return;
        }
        let it = 3 + cfg.dynamics.states();
        for k in 0..cfg.tropo.states() {
            let sigma = if k == 0 { cfg.std.tropo } else { 0.01 };
            let noise = if k == 0 { cfg.prn.tropo } else { cfg.prn.tropo * 0.1 };
            if self.p[(it + k, it + k)] <= 0.0 {
                self.initx(1.0E-6, sigma.powi(2), it + k);
            } else {
                self.p[(it + k, it + k)] += noise.powi(2) * tt.abs();
            }
        }
    }

    /// Ionospheric states: random walk on active channels, reset
    /// alongside the ambiguity lifecycle.
    pub fn propagate_iono(&mut self, cfg: &Config, tt: f64) {
        if !cfg.iono_estimation {
            return;
        }
        let assigned: Vec<(SV, usize)> = self.channels.assigned().collect();
        for (_, slot) in assigned {
            let idx = match cfg.iono_index(slot) {
                Some(idx) => idx,
                None => return,
            };
            if self.p[(idx, idx)] > 0.0 {
                self.p[(idx, idx)] += cfg.prn.iono.powi(2) * tt.abs();
            }
        }
    }

    /// Ambiguity time update:
    /// - channels in outage beyond `cfg.max_outage` are released,
    /// - surviving ambiguities random walk with the bias process noise,
    /// - slipped, re-acquired or instantaneous-mode ambiguities are
    ///   re-initialized from their single difference seed.
    pub fn propagate_ambiguities(&mut self, cfg: &Config, tt: f64, seeds: &[BiasSeed]) {
        // outage expiry
        let expired: Vec<SV> = self
            .channels
            .assigned()
            .filter(|(sv, _)| {
                self.ssat
                    .get(sv)
                    .map_or(false, |s| s.outage >= cfg.max_outage)
            })
            .map(|(sv, _)| sv)
            .collect();

        for sv in expired {
            let slot = self.channels.slot_of(sv).unwrap_or(0);
            warn!("{} outage expired, ambiguity reset", sv);
            self.initx(0.0, 0.0, cfg.bias_index(slot));
            if let Some(idx) = cfg.iono_index(slot) {
                self.initx(0.0, 0.0, idx);
            }
            self.channels.release(sv);
            if let Some(status) = self.ssat.get_mut(&sv) {
                status.fix = AmbiguityState::None;
                status.lock = 0;
                status.gf_m = None;
                status.prev_phase = None;
            }
            self.control(sv).reset();
        }

        // process noise on continuous ambiguities
        let continuing: Vec<usize> = self
            .channels
            .assigned()
            .map(|(_, slot)| cfg.bias_index(slot))
            .collect();
        for idx in continuing {
            if self.p[(idx, idx)] > 0.0 {
                self.p[(idx, idx)] += cfg.prn.bias.powi(2) * tt.abs();
            }
        }

        // seeds: new sights and resets
        for seed in seeds {
            let Some(slot) = self.channels.allocate(seed.sv) else {
                warn!("{} dropped: all channels in use", seed.sv);
                continue;
            };
            let idx = cfg.bias_index(slot);
            let fresh = self.p[(idx, idx)] <= 0.0;
            if fresh || seed.reset {
                if !fresh {
                    debug!("{} ambiguity re-initialized", seed.sv);
                }
                self.initx(seed.sd_bias_cycles, cfg.std.bias.powi(2), idx);
                if let Some(iidx) = cfg.iono_index(slot) {
                    self.initx(1.0E-6, cfg.std.iono.powi(2), iidx);
                }
                let status = self.status(seed.sv);
                status.fix = AmbiguityState::Float;
                status.lock = 0;
                if cfg.ar_mode != ArMode::Instantaneous {
                    self.control(seed.sv).reset();
                }
            }
        }
    }

    /// Numerical failure recovery: keep x, rebuild P as a diagonal
    /// from the initial sigmas.
    pub fn reset_covariance(&mut self, cfg: &Config) {
        let nx = self.x.len();
        self.p = DMatrix::zeros(nx, nx);
        for i in 0..3 {
            self.p[(i, i)] = crate::constants::Constants::VAR_INITIAL_POS;
        }
        for i in 3..(3 + cfg.dynamics.states()) {
            self.p[(i, i)] = crate::constants::Constants::VAR_INITIAL_VEL;
        }
        let it = 3 + cfg.dynamics.states();
        for k in 0..cfg.tropo.states() {
            self.p[(it + k, it + k)] = cfg.std.tropo.powi(2);
        }
        let assigned: Vec<usize> = self.channels.assigned().map(|(_, s)| s).collect();
        for slot in assigned {
            self.p[(cfg.bias_index(slot), cfg.bias_index(slot))] = cfg.std.bias.powi(2);
            if let Some(idx) = cfg.iono_index(slot) {
                self.p[(idx, idx)] = cfg.std.iono.powi(2);
            }
        }
    }

    /// Full restart: everything is dropped except the configuration
    /// and the base position.
    pub fn restart(&mut self, cfg: &Config) {
        let keep_rb = self.rb;
        *self = Self::new(cfg);
        self.rb = keep_rb;
    }
}
