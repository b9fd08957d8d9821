use crate::prelude::Vector3;
use map_3d::{ecef2geodetic, geodetic2ecef, Ellipsoid};
use nalgebra::Matrix3;

/// Receiver position, expressed in both ECEF and geodetic frames.
#[derive(Default, Debug, Clone, Copy, PartialEq)]
pub struct Position {
    /// ECEF coordinates [m]
    pub(crate) ecef: Vector3<f64>,
    /// Geodetic coordinates: latitude [rad], longitude [rad], altitude [m]
    pub(crate) geodetic: Vector3<f64>,
}

impl Position {
    /// Builds Self from ECEF coordinates [m]
    pub fn from_ecef(ecef: Vector3<f64>) -> Self {
        let (x, y, z) = (ecef[0], ecef[1], ecef[2]);
        let (lat, lon, h) = ecef2geodetic(x, y, z, Ellipsoid::WGS84);
        Self {
            ecef,
            geodetic: Vector3::new(lat, lon, h),
        }
    }

    /// Builds Self from geodetic coordinates:
    /// latitude [ddeg], longitude [ddeg] and altitude above sea [m].
    pub fn from_geo_ddeg(geodetic: Vector3<f64>) -> Self {
        let (lat, lon, alt) = (
            geodetic[0].to_radians(),
            geodetic[1].to_radians(),
            geodetic[2],
        );
        let (x, y, z) = geodetic2ecef(lat, lon, alt, Ellipsoid::WGS84);
        Self {
            geodetic: Vector3::new(lat, lon, alt),
            ecef: Vector3::new(x, y, z),
        }
    }

    /// Returns ECEF coordinates [m]
    pub fn ecef(&self) -> Vector3<f64> {
        self.ecef
    }

    /// Returns geodetic coordinates (lat [rad], lon [rad], alt [m])
    pub fn geodetic(&self) -> Vector3<f64> {
        self.geodetic
    }

    pub(crate) fn latitude_rad(&self) -> f64 {
        self.geodetic[0]
    }

    pub(crate) fn longitude_rad(&self) -> f64 {
        self.geodetic[1]
    }

    pub(crate) fn altitude_m(&self) -> f64 {
        self.geodetic[2]
    }
}

/// Rotation from ECEF into the local (east, north, up) frame
/// at given latitude and longitude.
pub(crate) fn enu_rotation(lat_rad: f64, lon_rad: f64) -> Matrix3<f64> {
    let (sin_lat, cos_lat) = (lat_rad.sin(), lat_rad.cos());
    let (sin_lon, cos_lon) = (lon_rad.sin(), lon_rad.cos());
    Matrix3::new(
        -sin_lon,
        cos_lon,
        0.0_f64,
        -sin_lat * cos_lon,
        -sin_lat * sin_lon,
        cos_lat,
        cos_lat * cos_lon,
        cos_lat * sin_lon,
        sin_lat,
    )
}

/// (azimuth, elevation) [rad] of a target seen from a receiver position.
pub(crate) fn azimuth_elevation(rx: &Position, target_ecef: Vector3<f64>) -> (f64, f64) {
    let los = target_ecef - rx.ecef;
    let enu = enu_rotation(rx.latitude_rad(), rx.longitude_rad()) * los;
    let range = enu.norm();
    if range < 1.0 {
        return (0.0, std::f64::consts::FRAC_PI_2);
    }
    let azimuth = enu[0].atan2(enu[1]).rem_euclid(2.0 * std::f64::consts::PI);
    let elevation = (enu[2] / range).asin();
    (azimuth, elevation)
}

#[cfg(test)]
mod test {
    use super::{azimuth_elevation, enu_rotation, Position};
    use crate::prelude::Vector3;

    #[test]
    fn ecef_geodetic_roundtrip() {
        let p = Position::from_ecef(Vector3::new(3582105.291, 532589.7313, 5232754.8054));
        let q = Position::from_geo_ddeg(Vector3::new(
            p.latitude_rad().to_degrees(),
            p.longitude_rad().to_degrees(),
            p.altitude_m(),
        ));
        assert!((p.ecef() - q.ecef()).norm() < 1.0E-3);
    }

    #[test]
    fn enu_rotation_is_orthonormal() {
        let r = enu_rotation(0.97, 0.15);
        let should_be_identity = r * r.transpose();
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((should_be_identity[(i, j)] - expected).abs() < 1.0E-12);
            }
        }
    }

    #[test]
    fn zenith_target_elevation() {
        let rx = Position::from_geo_ddeg(Vector3::new(45.0, 7.0, 0.0));
        let up = rx.ecef() * (1.0 + 20.0E6 / rx.ecef().norm());
        let (_, el) = azimuth_elevation(&rx, up);
        assert!(el.to_degrees() > 85.0);
    }
}
