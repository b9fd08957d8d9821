//! Extended Kalman filter kernel.

use log::debug;
use nalgebra::{Cholesky, DMatrix};

use super::Measurement;
use crate::cfg::Config;
use crate::constants::Constants;
use crate::error::Error;
use crate::state::RtkState;

/// EKF measurement update, Joseph stabilized. The optional adaptive
/// innovation scaling inflates the measurement covariance when the
/// observed innovation exceeds its predicted magnitude, reducing the
/// gain during outlier bursts.
#[derive(Debug, Clone)]
pub(crate) struct Ekf {
    adaptive: bool,
}

impl Ekf {
    pub fn new(cfg: &Config) -> Self {
        Self {
            adaptive: cfg.adaptive_innovation,
        }
    }

    pub fn measurement_update(
        &mut self,
        state: &mut RtkState,
        meas: &Measurement,
    ) -> Result<(), Error> {
        let nx = state.x.len();

        let mut r = meas.r.clone();
        let mut s = meas.h * &state.p * meas.h.transpose() + &r;

        if self.adaptive {
            let lam = self.innovation_scale(state, meas, &s);
            if lam > 1.0 {
                debug!("innovation scaling lambda = {:.2}", lam);
                r *= lam;
                s = meas.h * &state.p * meas.h.transpose() + &r;
            }
        }
        let s_chol = Cholesky::new(s).ok_or(Error::CovarianceNotPositiveDefinite)?;
        let s_inv = s_chol.inverse();

        let k = &state.p * meas.h.transpose() * s_inv;

        state.x += &k * meas.v;

        // Joseph form keeps the covariance symmetric positive
        let ikh = DMatrix::<f64>::identity(nx, nx) - &k * meas.h;
        state.p = &ikh * &state.p * ikh.transpose() + &k * &r * k.transpose();

        for i in 0..nx {
            if !state.x[i].is_finite() || state.p[(i, i)] < 0.0 {
                return Err(Error::CovarianceNotPositiveDefinite);
            }
        }
        Ok(())
    }

    /// Adaptive scale: armed when the normalized innovation squared
    /// exceeds its expectation, decays by halving on clean epochs.
    /// The reached value lives on the RTK context.
    fn innovation_scale(&self, state: &mut RtkState, meas: &Measurement, s: &DMatrix<f64>) -> f64 {
        let nv = meas.v.len() as f64;
        let Some(s_inv) = s.clone().try_inverse() else {
            return state.lam;
        };
        let nis = (meas.v.transpose() * s_inv * meas.v)[(0, 0)] / nv;
        if nis > Constants::ADAPTIVE_NIS_THRESHOLD {
            state.lam = (meas.v.dot(meas.v) / s.trace()).max(1.0);
        } else {
            state.lam = (state.lam * 0.5).max(1.0);
        }
        state.lam
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::filter::Measurement;
    use crate::prelude::Vector3;
    use nalgebra::DVector;

    fn cfg() -> Config {
        let mut cfg = Config::kinematic_preset();
        cfg.base_position_ecef = Some(Vector3::new(4696989.0, 723994.0, 4239678.0));
        cfg
    }

    #[test]
    fn update_stays_symmetric_and_shrinks() {
        let cfg = cfg();
        let mut state = RtkState::new(&cfg);
        state.init_position(&cfg, Vector3::new(1.0E6, 2.0E6, 3.0E6), 100.0);

        let nx = cfg.nx();
        let mut h = DMatrix::<f64>::zeros(2, nx);
        h[(0, 0)] = 1.0;
        h[(1, 1)] = 1.0;
        let v = DVector::from_vec(vec![0.5, -0.2]);
        let r = DMatrix::<f64>::identity(2, 2) * 0.01;

        let mut ekf = Ekf::new(&cfg);
        ekf.measurement_update(
            &mut state,
            &Measurement {
                h: &h,
                v: &v,
                r: &r,
                repredict: None,
            },
        )
        .unwrap();

        assert!(state.p[(0, 0)] < 100.0);
        assert!(state.p[(0, 0)] > 0.0);
        for i in 0..nx {
            for j in 0..nx {
                assert!((state.p[(i, j)] - state.p[(j, i)]).abs() < 1.0E-9);
            }
        }
        // near perfect measurement dominates the weak prior
        assert!((state.x[0] - 1.0E6 - 0.5).abs() < 1.0E-3);
    }

    #[test]
    fn adaptive_scaling_reduces_the_gain() {
        let mut cfg = cfg();
        cfg.adaptive_innovation = true;
        let nx = cfg.nx();

        let mut h = DMatrix::<f64>::zeros(1, nx);
        h[(0, 0)] = 1.0;
        let r = DMatrix::<f64>::identity(1, 1) * 0.01;

        let run = |innovation: f64, cfg: &Config| -> (f64, f64) {
            let mut state = RtkState::new(cfg);
            state.init_position(cfg, Vector3::zeros(), 1.0);
            let v = DVector::from_vec(vec![innovation]);
            let mut ekf = Ekf::new(cfg);
            ekf.measurement_update(
                &mut state,
                &Measurement {
                    h: &h,
                    v: &v,
                    r: &r,
                    repredict: None,
                },
            )
            .unwrap();
            (state.x[0], state.lam)
        };

        let (clean, lam_clean) = run(0.05, &cfg);
        let (outlier, lam_outlier) = run(50.0, &cfg);

        assert!((lam_clean - 1.0).abs() < 1.0E-9);
        assert!(lam_outlier > 1.0);
        // inflated R pulls the correction below the raw gain share
        assert!(outlier / 50.0 < clean / 0.05);
    }
}
