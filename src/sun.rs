//! Sunset times from the standard low-precision solar position model
//! (NOAA/Meeus approximations), accurate to a minute or two at mid latitudes.

use std::f64::consts::PI;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

const RAD: f64 = PI / 180.0;
const DAY_MS: f64 = 86_400_000.0;
const J1970: f64 = 2_440_588.0;
const J2000: f64 = 2_451_545.0;
const J0: f64 = 0.0009;
/// Obliquity of the ecliptic.
const OBLIQUITY: f64 = RAD * 23.4397;
/// Sun's upper limb touching the horizon, refraction included.
const SUNSET_ALTITUDE: f64 = RAD * -0.833;

fn to_days(instant: DateTime<Utc>) -> f64 {
    instant.timestamp_millis() as f64 / DAY_MS - 0.5 + J1970 - J2000
}

fn from_julian(j: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(((j + 0.5 - J1970) * DAY_MS).round() as i64)
}

fn solar_mean_anomaly(d: f64) -> f64 {
    RAD * (357.5291 + 0.985_600_28 * d)
}

fn ecliptic_longitude(m: f64) -> f64 {
    let center = RAD * (1.9148 * m.sin() + 0.02 * (2.0 * m).sin() + 0.0003 * (3.0 * m).sin());
    let perihelion = RAD * 102.9372;
    m + center + perihelion + PI
}

fn declination(l: f64) -> f64 {
    (OBLIQUITY.sin() * l.sin()).asin()
}

fn approx_transit(hour_angle: f64, lw: f64, n: f64) -> f64 {
    J0 + (hour_angle + lw) / (2.0 * PI) + n
}

fn solar_transit_j(ds: f64, m: f64, l: f64) -> f64 {
    J2000 + ds + 0.0053 * m.sin() - 0.0069 * (2.0 * l).sin()
}

/// `None` when the sun never reaches `altitude` (polar day or night).
fn hour_angle(altitude: f64, phi: f64, dec: f64) -> Option<f64> {
    let cos_h = (altitude.sin() - phi.sin() * dec.sin()) / (phi.cos() * dec.cos());
    (-1.0..=1.0).contains(&cos_h).then(|| cos_h.acos())
}

/// Sunset on the solar day nearest noon UTC of `date` at the given position,
/// or `None` if the sun does not set that day.
pub fn sunset(date: NaiveDate, latitude: f64, longitude: f64) -> Option<DateTime<Utc>> {
    let noon = date.and_time(NaiveTime::from_hms_opt(12, 0, 0)?).and_utc();
    let lw = RAD * -longitude;
    let phi = RAD * latitude;

    let d = to_days(noon);
    let n = (d - J0 - lw / (2.0 * PI)).round();
    let ds = approx_transit(0.0, lw, n);

    let m = solar_mean_anomaly(ds);
    let l = ecliptic_longitude(m);
    let dec = declination(l);

    let w = hour_angle(SUNSET_ALTITUDE, phi, dec)?;
    let a = approx_transit(w, lw, n);
    from_julian(solar_transit_j(a, m, l))
}
