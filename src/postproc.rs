//! Post processed (batch) runs: forward, backward, or combined
//! forward + backward smoothing.

use log::{debug, warn};
use nalgebra::Matrix3;

use crate::cfg::Config;
use crate::constants::Constants;
use crate::error::Error;
use crate::obs::Observation;
use crate::orbit::OrbitalStateProvider;
use crate::prelude::{Duration, Epoch};
use crate::solution::{Solution, SolutionStatus};
use crate::solver::Solver;

/// One replayable epoch: rover + base observations.
#[derive(Debug, Clone, Default)]
pub struct EpochData {
    pub rover: Vec<Observation>,
    pub base: Vec<Observation>,
}

impl EpochData {
    pub fn new(rover: Vec<Observation>, base: Vec<Observation>) -> Self {
        Self { rover, base }
    }

    fn t(&self) -> Option<Epoch> {
        self.rover.first().map(|ob| ob.t)
    }
}

/// Processing direction.
#[derive(Default, Debug, Clone, Copy, PartialEq)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
    /// Forward then backward over the same window, fused epoch-wise.
    Combined,
}

/// Batch driver around the epoch [Solver].
pub struct PostProcessor {
    cfg: Config,
    direction: Direction,
}

impl PostProcessor {
    pub fn new(cfg: &Config, direction: Direction) -> Self {
        Self {
            cfg: cfg.clone(),
            direction,
        }
    }

    /// Iterates the window `[ts, te]` with decimation interval `ti`
    /// over the proposed epochs, emitting one record per retained
    /// epoch through `sink` (failed epochs emit their explicit `none`
    /// marker). Returns the number of resolved solutions.
    pub fn run<O: OrbitalStateProvider, F: FnMut(&Solution)>(
        &self,
        orbit: O,
        epochs: &[EpochData],
        ts: Option<Epoch>,
        te: Option<Epoch>,
        ti: Option<Duration>,
        mut sink: F,
    ) -> Result<usize, Error> {
        let window: Vec<&EpochData> = epochs
            .iter()
            .filter(|data| {
                let Some(t) = data.t() else {
                    return false;
                };
                if let Some(ts) = ts {
                    if t < ts {
                        return false;
                    }
                }
                if let Some(te) = te {
                    if t > te {
                        return false;
                    }
                }
                if let (Some(ti), Some(t0)) = (ti, ts.or(epochs.first().and_then(|e| e.t()))) {
                    let dt = (t - t0).to_seconds();
                    let ti = ti.to_seconds();
                    if ti > 0.0 {
                        let off = dt - (dt / ti).round() * ti;
                        if off.abs() > Constants::EPOCH_PAIRING_TOL_S {
                            return false;
                        }
                    }
                }
                true
            })
            .collect();

        match self.direction {
            Direction::Forward => {
                let solutions = self.pass(&orbit, window.iter().copied())?;
                Ok(Self::emit(solutions, &mut sink))
            },
            Direction::Backward => {
                let solutions = self.pass(&orbit, window.iter().rev().copied())?;
                Ok(Self::emit(solutions, &mut sink))
            },
            Direction::Combined => {
                let forward = self.pass(&orbit, window.iter().copied())?;
                let mut backward = self.pass(&orbit, window.iter().rev().copied())?;
                backward.reverse();

                let fused: Vec<Solution> = forward
                    .iter()
                    .zip(backward.iter())
                    .map(|(f, b)| combine(f, b))
                    .collect();
                Ok(Self::emit(fused, &mut sink))
            },
        }
    }

    fn pass<'a, O: OrbitalStateProvider>(
        &self,
        orbit: &O,
        epochs: impl Iterator<Item = &'a EpochData>,
    ) -> Result<Vec<Solution>, Error> {
        let mut solver = Solver::new(&self.cfg, orbit)?;
        let mut solutions = Vec::<Solution>::new();
        for data in epochs {
            match solver.process(&data.rover, &data.base) {
                Ok(solution) => solutions.push(solution),
                Err(e) => {
                    debug!("epoch dropped: {}", e);
                    solutions.push(solver.last_solution().clone());
                },
            }
        }
        Ok(solutions)
    }

    fn emit<F: FnMut(&Solution)>(solutions: Vec<Solution>, sink: &mut F) -> usize {
        let mut resolved = 0;
        for solution in solutions.iter() {
            if solution.status != SolutionStatus::None {
                resolved += 1;
            }
            sink(solution);
        }
        resolved
    }
}

/// Epoch-wise fusion of a forward and a backward solution:
/// x = Pb (Pf + Pb)^-1 xf + Pf (Pf + Pb)^-1 xb.
/// Whichever pass fixed wins alone; a double fix disagreeing beyond
/// 4 sigma of the fused covariance keeps the forward pass, degraded
/// to float.
pub(crate) fn combine(forward: &Solution, backward: &Solution) -> Solution {
    match (forward.status, backward.status) {
        (SolutionStatus::None, _) => return backward.clone(),
        (_, SolutionStatus::None) => return forward.clone(),
        (SolutionStatus::Fix, s) if s != SolutionStatus::Fix => return forward.clone(),
        (s, SolutionStatus::Fix) if s != SolutionStatus::Fix => return backward.clone(),
        _ => {},
    }

    let p_f = forward.covariance();
    let p_b = backward.covariance();

    let Some(sum_inv) = (p_f + p_b).try_inverse() else {
        warn!("{} degenerate smoother covariance", forward.t);
        return forward.clone();
    };

    let position = p_b * sum_inv * forward.position + p_f * sum_inv * backward.position;
    let covariance: Matrix3<f64> = p_f * sum_inv * p_b;

    let mut fused = forward.clone();
    fused.position = position;
    fused.set_covariance(&covariance);
    fused.ratio = forward.ratio.max(backward.ratio);
    fused.n_satellites = forward.n_satellites.max(backward.n_satellites);

    if forward.status == SolutionStatus::Fix && backward.status == SolutionStatus::Fix {
        let disagreement = (forward.position - backward.position).norm();
        let sigma = covariance.trace().sqrt();
        if disagreement > 4.0 * sigma.max(1.0E-4) {
            warn!("{} fixed passes disagree, degraded to float", forward.t);
            fused = forward.clone();
            fused.status = SolutionStatus::Float;
        }
    }
    fused
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::prelude::Vector3;

    fn solution(status: SolutionStatus, x: f64, var: f64) -> Solution {
        let mut sol = Solution {
            t: Epoch::from_gpst_seconds(10.0),
            position: Vector3::new(x, 0.0, 0.0),
            status,
            ratio: 3.5,
            ratio_threshold: 3.0,
            n_satellites: 8,
            ..Default::default()
        };
        sol.set_covariance(&(Matrix3::identity() * var));
        sol
    }

    #[test]
    fn combination_weights_by_covariance() {
        let f = solution(SolutionStatus::Float, 0.0, 1.0);
        let b = solution(SolutionStatus::Float, 1.0, 3.0);
        let s = combine(&f, &b);
        // tighter forward pass dominates: x = 3/4 * 0 + 1/4 * 1
        assert!((s.position[0] - 0.25).abs() < 1.0E-12);
        // fused covariance below both inputs
        assert!(s.qr[0] < 1.0 && s.qr[0] < 3.0);
    }

    #[test]
    fn fix_beats_float() {
        let f = solution(SolutionStatus::Float, 0.0, 1.0);
        let b = solution(SolutionStatus::Fix, 1.0, 1.0);
        let s = combine(&f, &b);
        assert_eq!(s.status, SolutionStatus::Fix);
        assert_eq!(s.position[0], 1.0);
    }

    #[test]
    fn combination_is_idempotent_on_the_estimate() {
        let s = solution(SolutionStatus::Float, 2.5, 0.8);
        let again = combine(&s, &s.clone());
        assert!((again.position - s.position).norm() < 1.0E-12);
    }

    #[test]
    fn disagreeing_fixes_degrade() {
        let f = solution(SolutionStatus::Fix, 0.0, 1.0E-4);
        let b = solution(SolutionStatus::Fix, 5.0, 1.0E-4);
        let s = combine(&f, &b);
        assert_eq!(s.status, SolutionStatus::Float);
        assert_eq!(s.position, f.position);
    }

    #[test]
    fn none_marker_defers_to_the_other_pass() {
        let f = solution(SolutionStatus::None, 0.0, 0.0);
        let b = solution(SolutionStatus::Float, 1.0, 1.0);
        assert_eq!(combine(&f, &b).status, SolutionStatus::Float);
    }
}
