//! Bancroft solver: closed form code solution used to bootstrap the
//! rover when no position prior is available.

use crate::constants::Constants;
use crate::error::Error;
use crate::obs::Observation;
use crate::orbit::SatelliteState;

use nalgebra::{Matrix4, Vector4};

const EARTH_EQUATORIAL_RADIUS_M: f64 = 6_378_137.0;

pub(crate) struct Bancroft {
    a: Vector4<f64>,
    b: Matrix4<f64>,
    m: Matrix4<f64>,
    ones: Vector4<f64>,
}

fn lorentz_4_4(a: Vector4<f64>, b: Vector4<f64>, m: &Matrix4<f64>) -> f64 {
    let scalar = a.transpose() * m * b;
    scalar[(0, 0)]
}

impl Bancroft {
    fn m_matrix() -> Matrix4<f64> {
        let mut m = Matrix4::<f64>::identity();
        m[(3, 3)] = -1.0;
        m
    }

    /// Builds the solver from the first four satellites holding both a
    /// resolved state and a pseudo range.
    pub fn new(sats: &[(Observation, SatelliteState)]) -> Result<Self, Error> {
        let m = Self::m_matrix();
        let mut a = Vector4::<f64>::default();
        let mut b = Matrix4::<f64>::default();

        let mut j = 0;
        for (obs, state) in sats.iter() {
            let Some(pr) = obs.pseudorange_m else {
                continue;
            };
            let dt = state.clock_bias.to_seconds();
            let tgd = state.group_delay.map(|d| d.to_seconds()).unwrap_or(0.0);
            let pr = pr + (dt - tgd) * Constants::SPEED_OF_LIGHT_M_S;

            b[(j, 0)] = state.position[0];
            b[(j, 1)] = state.position[1];
            b[(j, 2)] = state.position[2];
            b[(j, 3)] = pr;
            a[j] = 0.5
                * (state.position[0].powi(2) + state.position[1].powi(2)
                    + state.position[2].powi(2)
                    - pr.powi(2));

            j += 1;
            if j == 4 {
                break;
            }
        }

        if j != 4 {
            Err(Error::InitializationFailure)
        } else {
            Ok(Self {
                a,
                b,
                m,
                ones: Vector4::<f64>::new(1.0, 1.0, 1.0, 1.0),
            })
        }
    }

    /// Resolution: (x, y, z, c dt) of the receiver. The physical root
    /// is the one closest to the Earth surface.
    pub fn resolve(&self) -> Result<Vector4<f64>, Error> {
        let b_inv = self.b.try_inverse().ok_or(Error::MatrixInversion)?;

        let b_1 = b_inv * self.ones;
        let b_a = b_inv * self.a;

        let a = lorentz_4_4(b_1, b_1, &self.m);
        let b = 2.0 * (lorentz_4_4(b_1, b_a, &self.m) - 1.0);
        let c = lorentz_4_4(b_a, b_a, &self.m);

        let delta = b.powi(2) - 4.0 * a * c;

        if delta > 0.0 {
            let delta_sqrt = delta.sqrt();
            let x = ((-b + delta_sqrt) / 2.0 / a, (-b - delta_sqrt) / 2.0 / a);
            let solutions = (
                self.m * b_inv * (x.0 * self.ones + self.a),
                self.m * b_inv * (x.1 * self.ones + self.a),
            );
            let rho = (
                (solutions.0[0].powi(2) + solutions.0[1].powi(2) + solutions.0[2].powi(2)).sqrt(),
                (solutions.1[0].powi(2) + solutions.1[1].powi(2) + solutions.1[2].powi(2)).sqrt(),
            );

            let err = (
                (rho.0 - EARTH_EQUATORIAL_RADIUS_M).abs(),
                (rho.1 - EARTH_EQUATORIAL_RADIUS_M).abs(),
            );

            if err.0 < err.1 {
                Ok(solutions.0)
            } else {
                Ok(solutions.1)
            }
        } else if delta < 0.0 {
            Err(Error::InitializationFailure)
        } else {
            let x = -b / a / 2.0;
            Ok(self.m * b_inv * (x * self.ones + self.a))
        }
    }
}

#[cfg(test)]
mod test {
    use super::{lorentz_4_4, Bancroft};
    use crate::orbit::SatelliteState;
    use crate::prelude::{Constellation, Duration, Epoch, Observation, Vector3, SV};
    use nalgebra::Vector4;

    #[test]
    fn lorentz_product() {
        let a = Vector4::<f64>::new(1.0, 2.0, 3.0, 4.0);
        let b = Vector4::<f64>::new(5.0, 6.0, 7.0, 8.0);
        let m = Bancroft::m_matrix();
        assert_eq!(lorentz_4_4(a, b, &m), 6.0);
        assert_eq!(
            lorentz_4_4(a, a, &m),
            a[0].powi(2) + a[1].powi(2) + a[2].powi(2) - a[3].powi(2)
        );
    }

    #[test]
    fn recovers_a_known_receiver() {
        let rx = Vector3::new(3582105.3, 532589.7, 5232754.8);
        let t = Epoch::from_gpst_seconds(0.0);

        let sky = [
            Vector3::new(15600.0E3, 7540.0E3, 20140.0E3),
            Vector3::new(18760.0E3, 2750.0E3, 18610.0E3),
            Vector3::new(17610.0E3, 14630.0E3, 13480.0E3),
            Vector3::new(19170.0E3, 610.0E3, 18390.0E3),
        ];

        let sats: Vec<(Observation, SatelliteState)> = sky
            .iter()
            .enumerate()
            .map(|(i, pos)| {
                let sv = SV::new(Constellation::GPS, i as u8 + 1);
                let pr = (pos - rx).norm();
                (
                    Observation::new(sv, t, pr, 0.0),
                    SatelliteState::new(*pos, Duration::ZERO),
                )
            })
            .collect();

        let solver = Bancroft::new(&sats).unwrap();
        let solution = solver.resolve().unwrap();
        let estimate = Vector3::new(solution[0], solution[1], solution[2]);
        assert!(
            (estimate - rx).norm() < 1.0E-3,
            "error: {}",
            (estimate - rx).norm()
        );
        assert!(solution[3].abs() < 1.0E-3);
    }
}
