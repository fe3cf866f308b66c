use glam::DVec3;

use crate::geometry::rotate_axis_angle;

// Reference atmosphere
const TEMPERATURE_REF: f64 = 283.15; // sea level temperature [K]
const PRESSURE_REF: f64 = 101.0; // sea level pressure [kPa]
const LAPSE_RATE: f64 = 0.0065; // temperature lapse rate [K m-1]
const GRAVIT_ACC: f64 = 9.81; // acceleration due to gravity [m s-2]
const GAS_CONST_DRY: f64 = 287.0; // gas constant for dry air [J K-1 kg-1]

/// Atmospheric refraction correction after Saemundsson (1986); see also
/// Meeus (1998), Astronomical Algorithms, 2nd ed., p. 106.
///
/// # Arguments
/// * `elev_ang_true` - true solar elevation angle [degree]
/// * `temperature` - air temperature [degree Celsius]
/// * `pressure` - atmospheric pressure [kPa]
///
/// # Returns
/// Refraction correction [degree]; zero for the sun at the zenith.
pub fn atmos_refrac(elev_ang_true: f64, temperature: f64, pressure: f64) -> f64 {
    let elev_ang_true = elev_ang_true.clamp(-1.0, 90.0);
    let mut refrac_cor = 1.02 / (elev_ang_true + 10.3 / (elev_ang_true + 5.11)).to_radians().tan();
    refrac_cor += 0.0019279; // set R = 0.0 for h = 90.0 degree
    refrac_cor *= (pressure / 101.0) * (283.0 / (273.0 + temperature));
    refrac_cor * (1.0 / 60.0)
}

/// Bend the unit sun vector `sun_dir` by the refraction correction for a
/// surface `elevation` metres above the reference surface, assuming a
/// standard atmosphere. `norm_hori` is the horizontal surface normal and
/// `dot_prod_hs` its dot product with `sun_dir`. Returns the apparent sun
/// vector and the recomputed dot product; the normal is never changed.
pub fn refract_sun_dir(
    sun_dir: DVec3,
    norm_hori: DVec3,
    dot_prod_hs: f64,
    elevation: f64,
) -> (DVec3, f64) {
    let exp_baro = GRAVIT_ACC / (GAS_CONST_DRY * LAPSE_RATE);
    let temperature = TEMPERATURE_REF - LAPSE_RATE * elevation;
    let pressure = PRESSURE_REF * (temperature / TEMPERATURE_REF).powf(exp_baro);

    let elev_ang_true = 90.0 - dot_prod_hs.acos().to_degrees();
    let refrac_cor = atmos_refrac(elev_ang_true, temperature - 273.15, pressure);

    // rotate towards the zenith, about the axis normal to the sun/normal plane
    let axis = sun_dir.cross(norm_hori).normalize();
    let sun_dir_app = rotate_axis_angle(axis, refrac_cor.to_radians(), sun_dir);
    (sun_dir_app, norm_hori.dot(sun_dir_app))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refrac_zero_at_zenith() {
        let r = atmos_refrac(90.0, 10.0, 101.0);
        assert!(r.abs() < 1e-6, "refraction at zenith = {r}");
    }

    #[test]
    fn test_refrac_near_horizon() {
        // roughly half a degree of lift at the horizon, standard conditions
        let r = atmos_refrac(0.0, 10.0, 101.0);
        assert!(r > 0.4 && r < 0.6, "horizon refraction = {r}");
    }

    #[test]
    fn test_refrac_monotone_in_pressure() {
        let r_low = atmos_refrac(5.0, 10.0, 70.0);
        let r_high = atmos_refrac(5.0, 10.0, 101.0);
        assert!(r_high > r_low);
    }

    #[test]
    fn test_refrac_clamps_below_horizon() {
        assert_eq!(
            atmos_refrac(-5.0, 10.0, 101.0),
            atmos_refrac(-1.0, 10.0, 101.0)
        );
    }

    #[test]
    fn test_refract_sun_dir_raises_low_sun() {
        let norm_hori = DVec3::new(0.0, 0.0, 1.0);
        // sun 2 degrees above the horizon, due east
        let elev: f64 = 2.0_f64.to_radians();
        let sun_dir = DVec3::new(elev.cos(), 0.0, elev.sin());
        let dot_prod_hs = norm_hori.dot(sun_dir);
        let (sun_app, dot_app) = refract_sun_dir(sun_dir, norm_hori, dot_prod_hs, 0.0);
        assert!(dot_app > dot_prod_hs, "apparent sun not raised");
        assert!((sun_app.length() - 1.0).abs() < 1e-12);
        // azimuth is unchanged
        assert!(sun_app.y.abs() < 1e-12);
    }

    #[test]
    fn test_refract_sun_dir_weaker_aloft() {
        let norm_hori = DVec3::new(0.0, 0.0, 1.0);
        let elev: f64 = 2.0_f64.to_radians();
        let sun_dir = DVec3::new(elev.cos(), 0.0, elev.sin());
        let dot_prod_hs = norm_hori.dot(sun_dir);
        let (_, dot_sea) = refract_sun_dir(sun_dir, norm_hori, dot_prod_hs, 0.0);
        let (_, dot_alp) = refract_sun_dir(sun_dir, norm_hori, dot_prod_hs, 3000.0);
        // thinner air refracts less
        assert!(dot_alp < dot_sea);
        assert!(dot_alp > dot_prod_hs);
    }
}
