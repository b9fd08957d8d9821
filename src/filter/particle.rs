//! Particle filter kernel, position sub space only.
//!
//! The swarm refines the rover position after a regular extended
//! update has absorbed the measurement into the full state, so the
//! ambiguities and atmospheric states stay with the extended pipeline.
//! Systematic resampling keeps the swarm alive once the effective
//! sample size drops below half the population.

use log::debug;
use nalgebra::Matrix3;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::{Ekf, Measurement};
use crate::cfg::Config;
use crate::error::Error;
use crate::prelude::Vector3;
use crate::state::RtkState;

#[derive(Debug, Clone)]
pub(crate) struct ParticleFilter {
    ekf: Ekf,
    particles: Vec<Vector3<f64>>,
    weights: Vec<f64>,
    rng: SmallRng,
    population: usize,
}

impl ParticleFilter {
    pub fn new(cfg: &Config, population: usize, seed: u64) -> Self {
        Self {
            ekf: Ekf::new(cfg),
            particles: Vec::with_capacity(population),
            weights: Vec::with_capacity(population),
            rng: SmallRng::seed_from_u64(seed),
            population,
        }
    }

    /// Spawns the swarm around the current position estimate.
    fn spawn(&mut self, state: &RtkState) {
        let center = state.rover_position();
        let sigma: Vec<f64> = (0..3).map(|i| state.p[(i, i)].sqrt().max(1.0E-3)).collect();
        self.particles.clear();
        self.weights.clear();
        for _ in 0..self.population {
            let mut p = center;
            for c in 0..3 {
                if let Ok(normal) = Normal::new(0.0, sigma[c]) {
                    p[c] += normal.sample(&mut self.rng);
                }
            }
            self.particles.push(p);
            self.weights.push(1.0 / self.population as f64);
        }
    }

    /// Time update: diffuse the swarm with the position process noise.
    pub fn propagate(&mut self, state: &mut RtkState, cfg: &Config, tt: f64) {
        if !state.initialized {
            return;
        }
        if self.particles.is_empty() {
            self.spawn(state);
            return;
        }
        let sigma = (cfg.prn.pos * tt.abs().sqrt()).max(1.0E-4);
        let normal = match Normal::new(0.0, sigma) {
            Ok(n) => n,
            Err(_) => return,
        };
        for p in self.particles.iter_mut() {
            for c in 0..3 {
                p[c] += normal.sample(&mut self.rng);
            }
        }
    }

    pub fn measurement_update(
        &mut self,
        state: &mut RtkState,
        meas: &Measurement,
    ) -> Result<(), Error> {
        // full state first: ambiguities remain with the EKF
        self.ekf.measurement_update(state, meas)?;

        let Some(repredict) = meas.repredict else {
            return Ok(());
        };
        if self.particles.is_empty() {
            self.spawn(state);
        }

        // weight by measurement likelihood at each particle position
        let mut log_weights = Vec::<f64>::with_capacity(self.particles.len());
        let mut chi = state.x.clone();
        for (k, particle) in self.particles.iter().enumerate() {
            for c in 0..3 {
                chi[c] = particle[c];
            }
            let v = repredict(&chi);
            let mut log_lik = 0.0;
            for i in 0..v.len() {
                log_lik -= 0.5 * v[i].powi(2) / meas.r[(i, i)].max(1.0E-12);
            }
            log_weights.push(self.weights[k].ln() + log_lik);
        }

        let max_lw = log_weights.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !max_lw.is_finite() {
            return Err(Error::CovarianceNotPositiveDefinite);
        }
        let mut total = 0.0;
        for (w, lw) in self.weights.iter_mut().zip(log_weights.iter()) {
            *w = (lw - max_lw).exp();
            total += *w;
        }
        for w in self.weights.iter_mut() {
            *w /= total;
        }

        let ess = 1.0 / self.weights.iter().map(|w| w * w).sum::<f64>();
        if ess < self.population as f64 / 2.0 {
            debug!("particle resampling, ess = {:.1}", ess);
            self.systematic_resample();
        }

        // weighted mean and covariance replace the position estimate
        let mut mean = Vector3::<f64>::zeros();
        for (p, w) in self.particles.iter().zip(self.weights.iter()) {
            mean += p * *w;
        }
        let mut cov = Matrix3::<f64>::zeros();
        for (p, w) in self.particles.iter().zip(self.weights.iter()) {
            let d = p - mean;
            cov += *w * d * d.transpose();
        }

        for c in 0..3 {
            state.x[c] = mean[c];
            for d in 0..3 {
                // blend: never report less than the swarm spread
                if c == d {
                    state.p[(c, d)] = state.p[(c, d)].min(cov[(c, d)].max(1.0E-8));
                }
            }
        }
        Ok(())
    }

    fn systematic_resample(&mut self) {
        let n = self.particles.len();
        let step = 1.0 / n as f64;
        let start: f64 = self.rng.gen::<f64>() * step;

        let mut resampled = Vec::<Vector3<f64>>::with_capacity(n);
        let mut cumulative = self.weights[0];
        let mut j = 0;
        for k in 0..n {
            let target = start + k as f64 * step;
            while cumulative < target && j + 1 < n {
                j += 1;
                cumulative += self.weights[j];
            }
            resampled.push(self.particles[j]);
        }
        self.particles = resampled;
        for w in self.weights.iter_mut() {
            *w = step;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::filter::Measurement;
    use nalgebra::{DMatrix, DVector};

    fn cfg() -> Config {
        let mut cfg = Config::kinematic_preset();
        cfg.base_position_ecef = Some(Vector3::new(4696989.0, 723994.0, 4239678.0));
        cfg.filter = crate::cfg::FilterKind::Particle {
            particles: 200,
            seed: 17,
        };
        cfg
    }

    #[test]
    fn swarm_concentrates_on_the_likelihood_peak() {
        let cfg = cfg();
        let mut state = RtkState::new(&cfg);
        state.init_position(&cfg, Vector3::new(0.0, 0.0, 0.0), 4.0);

        let mut pf = ParticleFilter::new(&cfg, 200, 17);
        pf.propagate(&mut state, &cfg, 1.0);

        // pseudo measurement pulling x towards 1.5 m
        let nx = cfg.nx();
        let mut h = DMatrix::<f64>::zeros(1, nx);
        h[(0, 0)] = 1.0;
        let r = DMatrix::<f64>::identity(1, 1) * 0.01;

        let truth = 1.5;
        let repredict = move |x: &DVector<f64>| DVector::from_vec(vec![truth - x[0]]);

        for _ in 0..5 {
            let v = DVector::from_vec(vec![truth - state.x[0]]);
            pf.measurement_update(
                &mut state,
                &Measurement {
                    h: &h,
                    v: &v,
                    r: &r,
                    repredict: Some(&repredict),
                },
            )
            .unwrap();
            pf.propagate(&mut state, &cfg, 1.0);
        }

        assert!((state.x[0] - truth).abs() < 0.2, "x = {}", state.x[0]);
        assert!(state.p[(0, 0)] <= 4.0);
    }

    #[test]
    fn resampling_preserves_population() {
        let cfg = cfg();
        let mut pf = ParticleFilter::new(&cfg, 64, 3);
        let mut state = RtkState::new(&cfg);
        state.init_position(&cfg, Vector3::zeros(), 1.0);
        pf.propagate(&mut state, &cfg, 1.0);

        // degenerate weights
        for (k, w) in pf.weights.iter_mut().enumerate() {
            *w = if k == 0 { 1.0 } else { 0.0 };
        }
        pf.systematic_resample();
        assert_eq!(pf.particles.len(), 64);
        assert!(pf.weights.iter().all(|w| (*w - 1.0 / 64.0).abs() < 1.0E-12));
    }
}
