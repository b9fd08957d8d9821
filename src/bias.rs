//! Atmospheric delay models applied to one-way ranges.
//!
//! Short baselines mostly cancel these delays across the double
//! differences; the models remove the residual elevation dependent part
//! and seed the optional tropospheric states.

use crate::position::Position;

/// Zenith angles close to the horizon are floored to keep the
/// mapping functions bounded.
const MIN_ELEVATION_RAD: f64 = 0.0875; // ~5 deg

/// Saastamoinen tropospheric delay [m] for a standard atmosphere
/// (relative humidity 0.7), mapped to the given elevation.
pub(crate) fn tropo_delay(rx: &Position, elevation_rad: f64) -> f64 {
    let el = elevation_rad.max(MIN_ELEVATION_RAD);
    let hgt = rx.altitude_m().clamp(0.0, 10_000.0);
    let lat = rx.latitude_rad();

    let pres = 1013.25 * (1.0 - 2.2557E-5 * hgt).powf(5.2568);
    let temp = 15.0 - 6.5E-3 * hgt + 273.16;
    let e = 6.108 * 0.7 * ((17.15 * temp - 4684.0) / (temp - 38.45)).exp();

    let z = std::f64::consts::FRAC_PI_2 - el;
    let trph =
        0.0022768 * pres / (1.0 - 0.00266 * (2.0 * lat).cos() - 0.00028 * hgt / 1.0E3) / z.cos();
    let trpw = 0.002277 * (1255.0 / temp + 0.05) * e / z.cos();
    trph + trpw
}

/// Elevation mapping of a zenith tropospheric state.
pub(crate) fn tropo_mapping(elevation_rad: f64) -> f64 {
    1.0 / elevation_rad.max(MIN_ELEVATION_RAD).sin()
}

/// Gradient mapping (east, north) of the tropospheric gradient states.
pub(crate) fn tropo_gradient_mapping(elevation_rad: f64, azimuth_rad: f64) -> (f64, f64) {
    let el = elevation_rad.max(MIN_ELEVATION_RAD);
    let m = tropo_mapping(el) / el.tan();
    (m * azimuth_rad.sin(), m * azimuth_rad.cos())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::prelude::Vector3;

    #[test]
    fn zenith_delay_magnitude() {
        let rx = Position::from_geo_ddeg(Vector3::new(45.0, 7.0, 200.0));
        let zenith = tropo_delay(&rx, std::f64::consts::FRAC_PI_2);
        // typical zenith total delay: 2.3m at sea level
        assert!(zenith > 2.0 && zenith < 2.8, "ztd = {}", zenith);

        let low = tropo_delay(&rx, 15.0_f64.to_radians());
        assert!(low > 2.0 * zenith);
    }

    #[test]
    fn mapping_grows_towards_horizon() {
        assert!(tropo_mapping(0.2) > tropo_mapping(1.0));
        assert!((tropo_mapping(std::f64::consts::FRAC_PI_2) - 1.0).abs() < 1.0E-9);
    }
}
