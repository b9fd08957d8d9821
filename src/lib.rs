#![doc = include_str!("../README.md")]
#![cfg_attr(docrs, feature(doc_cfg))]

extern crate gnss_rs as gnss;

// private modules
mod ambiguity;
mod bancroft;
mod bias;
mod carrier;
mod cfg;
mod error;
mod filter;
mod lambda;
mod obs;
mod orbit;
mod position;
mod postproc;
mod quality;
mod residual;
mod solution;
mod solver;
mod state;

pub(crate) mod constants;


// prelude
pub mod prelude {
    pub use crate::carrier::Carrier;
    pub use crate::cfg::{ArMode, Config, Dynamics, FilterKind, PositioningMode, TropoEstimation};
    pub use crate::error::Error;
    pub use crate::obs::{Observation, LLI_HALF_CYCLE, LLI_LOCK_LOSS};
    pub use crate::orbit::{OrbitalStateProvider, SatelliteState};
    pub use crate::position::Position;
    pub use crate::postproc::{Direction, EpochData, PostProcessor};
    pub use crate::solution::{SatelliteRecord, Solution, SolutionStatus};
    pub use crate::solver::Solver;
    // re-export
    pub use gnss::prelude::{Constellation, SV};
    pub use hifitime::{Duration, Epoch, TimeScale};
    pub use nalgebra::Vector3;
}
