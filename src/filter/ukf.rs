//! Unscented Kalman filter kernel.
//!
//! 2n+1 sigma points with Van der Merwe weighting, propagated through
//! the nonlinear measurement model when it is reachable, through the
//! linearized rows otherwise. The covariance is reconstructed from
//! weighted outer products, which keeps it symmetric by construction.
//!
//! Sigma points are drawn in the active sub space (states with a
//! strictly positive variance): unassigned satellite channels carry a
//! zero diagonal and would defeat the square root factorization.

use nalgebra::{Cholesky, DMatrix, DVector};

use super::Measurement;
use crate::error::Error;
use crate::state::RtkState;

#[derive(Debug, Clone)]
pub(crate) struct Ukf {
    alpha: f64,
    beta: f64,
    kappa: f64,
}

impl Ukf {
    pub fn new(alpha: f64, beta: f64, kappa: f64) -> Self {
        Self { alpha, beta, kappa }
    }

    pub fn measurement_update(
        &mut self,
        state: &mut RtkState,
        meas: &Measurement,
    ) -> Result<(), Error> {
        let nv = meas.v.len();

        let active: Vec<usize> = (0..state.x.len())
            .filter(|&i| state.p[(i, i)] > 0.0)
            .collect();
        let n = active.len();
        if n == 0 {
            return Ok(());
        }
        let nf = n as f64;

        let lambda = self.alpha.powi(2) * (nf + self.kappa) - nf;
        let scale = nf + lambda;

        let wm0 = lambda / scale;
        let wc0 = wm0 + 1.0 - self.alpha.powi(2) + self.beta;
        let wi = 0.5 / scale;

        let mut p_sub = DMatrix::<f64>::zeros(n, n);
        for (a, &i) in active.iter().enumerate() {
            for (b, &j) in active.iter().enumerate() {
                p_sub[(a, b)] = state.p[(i, j)];
            }
        }

        // sigma point spread: columns of sqrt((n + lambda) P)
        let spread = Cholesky::new(&p_sub * scale)
            .ok_or(Error::CovarianceNotPositiveDefinite)?
            .l();

        let mut deviations = Vec::<DVector<f64>>::with_capacity(2 * n + 1);
        deviations.push(DVector::zeros(n));
        for i in 0..n {
            let col = spread.column(i).into_owned();
            deviations.push(col.clone());
            deviations.push(-col);
        }

        // innovation at each sigma state
        let innovations: Vec<DVector<f64>> = deviations
            .iter()
            .map(|dx| match meas.repredict {
                Some(f) => {
                    let mut chi = state.x.clone();
                    for (a, &i) in active.iter().enumerate() {
                        chi[i] += dx[a];
                    }
                    f(&chi)
                },
                None => {
                    let mut projected = DVector::<f64>::zeros(nv);
                    for k in 0..nv {
                        let mut acc = 0.0;
                        for (a, &i) in active.iter().enumerate() {
                            acc += meas.h[(k, i)] * dx[a];
                        }
                        projected[k] = acc;
                    }
                    meas.v - projected
                },
            })
            .collect();

        let weight = |i: usize, mean: bool| -> f64 {
            if i == 0 {
                if mean {
                    wm0
                } else {
                    wc0
                }
            } else {
                wi
            }
        };

        let mut d_mean = DVector::<f64>::zeros(nv);
        for (i, d) in innovations.iter().enumerate() {
            d_mean += weight(i, true) * d;
        }

        let mut s = meas.r.clone();
        let mut p_xd = DMatrix::<f64>::zeros(n, nv);
        for (i, d) in innovations.iter().enumerate() {
            let dd = d - &d_mean;
            let wc = weight(i, false);
            s += wc * &dd * dd.transpose();
            p_xd += wc * &deviations[i] * dd.transpose();
        }

        let s_inv = Cholesky::new(s.clone())
            .ok_or(Error::CovarianceNotPositiveDefinite)?
            .inverse();

        // d = y - h(chi): the cross covariance against h flips sign
        let gain = -p_xd * s_inv;

        let dx = &gain * &d_mean;
        let dp = &gain * s * gain.transpose();

        for (a, &i) in active.iter().enumerate() {
            state.x[i] += dx[a];
            for (b, &j) in active.iter().enumerate() {
                state.p[(i, j)] -= dp[(a, b)];
            }
        }

        for i in 0..state.x.len() {
            if !state.x[i].is_finite() || state.p[(i, i)] < 0.0 {
                return Err(Error::CovarianceNotPositiveDefinite);
            }
        }
        Ok(())
    }
}
