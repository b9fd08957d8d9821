//! Navigation kernels.
//!
//! Three interchangeable kernels share one contract: a time update
//! driven by the state store propagation and a measurement update
//! consuming the DD model. The unscented and particle kernels reach
//! the nonlinear measurement model through a re-prediction closure
//! instead of the Jacobian.

use nalgebra::{DMatrix, DVector};

use crate::cfg::{Config, FilterKind};
use crate::error::Error;
use crate::state::{BiasSeed, RtkState};

mod ekf;
mod particle;
mod ukf;

pub(crate) use ekf::Ekf;
pub(crate) use particle::ParticleFilter;
pub(crate) use ukf::Ukf;

/// One measurement update input.
pub(crate) struct Measurement<'a> {
    /// Jacobian (nv x nx)
    pub h: &'a DMatrix<f64>,
    /// Innovations at the current state
    pub v: &'a DVector<f64>,
    /// Measurement covariance
    pub r: &'a DMatrix<f64>,
    /// Innovation re-evaluation at an arbitrary state, when the
    /// nonlinear model is reachable. Linearized fallback otherwise.
    pub repredict: Option<&'a dyn Fn(&DVector<f64>) -> DVector<f64>>,
}

/// Selected kernel, instantiated once per run.
#[derive(Debug, Clone)]
pub(crate) enum Kernel {
    Extended(Ekf),
    Unscented(Ukf),
    Particle(ParticleFilter),
}

impl Kernel {
    pub fn new(cfg: &Config) -> Self {
        match cfg.filter {
            FilterKind::Extended => Self::Extended(Ekf::new(cfg)),
            FilterKind::Unscented { alpha, beta, kappa } => {
                Self::Unscented(Ukf::new(alpha, beta, kappa))
            },
            FilterKind::Particle { particles, seed } => {
                Self::Particle(ParticleFilter::new(cfg, particles, seed))
            },
        }
    }

    /// Time update: dynamics, atmospheric and ambiguity propagation
    /// through the state store, particle propagation when applicable.
    pub fn time_update(&mut self, state: &mut RtkState, cfg: &Config, tt: f64, seeds: &[BiasSeed]) {
        state.propagate_dynamics(cfg, tt);
        state.propagate_tropo(cfg, tt);
        state.propagate_iono(cfg, tt);
        state.propagate_ambiguities(cfg, tt, seeds);

        if let Self::Particle(pf) = self {
            pf.propagate(state, cfg, tt);
        }
    }

    /// Measurement update. A zero-row update is the identity.
    pub fn measurement_update(
        &mut self,
        state: &mut RtkState,
        meas: &Measurement,
    ) -> Result<(), Error> {
        if meas.v.is_empty() {
            return Ok(());
        }
        match self {
            Self::Extended(ekf) => ekf.measurement_update(state, meas),
            Self::Unscented(ukf) => ukf.measurement_update(state, meas),
            Self::Particle(pf) => pf.measurement_update(state, meas),
        }
    }
}
