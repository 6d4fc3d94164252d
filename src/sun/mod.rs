//! Solar event times and day-phase classification.
//!
//! Implements the NOAA solar position equations directly: equation of time,
//! declination, and hour angle for a given zenith. Event times are cached
//! per calendar date. Under polar conditions, where civil twilight is
//! undefined, civil dawn falls back to sunrise and civil dusk to sunset so
//! downstream day/night filters keep working degenerately instead of
//! failing.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Timelike, Utc};

use crate::types::SolarPhase;

/// Zenith angle for geometric sunrise/sunset, including refraction (deg).
const ZENITH_OFFICIAL: f64 = 90.833;

/// Zenith angle bounding civil twilight (deg).
const ZENITH_CIVIL: f64 = 96.0;

/// Solar elevation bounds for twilight phases (deg).
const ELEVATION_SUNRISE: f64 = -0.833;
const ELEVATION_CIVIL: f64 = -6.0;
const ELEVATION_NAUTICAL: f64 = -12.0;
const ELEVATION_ASTRONOMICAL: f64 = -18.0;

/// Civil dawn, sunrise, sunset, and civil dusk in local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SunEventTimes {
    pub civil_dawn: DateTime<Local>,
    pub sunrise: DateTime<Local>,
    pub sunset: DateTime<Local>,
    pub civil_dusk: DateTime<Local>,
}

/// Per-location solar calculator with a per-date cache.
pub struct SunCalc {
    latitude: f64,
    longitude: f64,
    cache: RwLock<HashMap<NaiveDate, SunEventTimes>>,
}

impl SunCalc {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Event times for `date`, computed once and cached.
    pub fn get_sun_event_times(&self, date: NaiveDate) -> SunEventTimes {
        if let Ok(cache) = self.cache.read() {
            if let Some(times) = cache.get(&date) {
                return *times;
            }
        }

        let times = self.compute_event_times(date);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(date, times);
        }
        times
    }

    /// Phase of the solar day at `at`, from the solar elevation angle.
    pub fn solar_phase(&self, at: DateTime<Local>) -> SolarPhase {
        let elevation = self.solar_elevation(at.with_timezone(&Utc));
        if elevation >= ELEVATION_SUNRISE {
            SolarPhase::Day
        } else if elevation >= ELEVATION_CIVIL {
            SolarPhase::CivilTwilight
        } else if elevation >= ELEVATION_NAUTICAL {
            SolarPhase::NauticalTwilight
        } else if elevation >= ELEVATION_ASTRONOMICAL {
            SolarPhase::AstronomicalTwilight
        } else {
            SolarPhase::Night
        }
    }

    fn compute_event_times(&self, date: NaiveDate) -> SunEventTimes {
        let gamma = fractional_year(date, 12.0);
        let eqtime = equation_of_time(gamma);
        let decl = solar_declination(gamma);

        // Sunrise/sunset always resolve: the hour angle is clamped, which
        // degenerates to solar midnight under midnight sun / polar night.
        let ha_official = hour_angle(self.latitude, decl, ZENITH_OFFICIAL);
        let sunrise_min = event_minutes_utc(self.longitude, ha_official, eqtime, true);
        let sunset_min = event_minutes_utc(self.longitude, ha_official, eqtime, false);

        let sunrise = to_local(date, sunrise_min);
        let sunset = to_local(date, sunset_min);

        // Civil twilight may genuinely not exist; fall back to the solar
        // events rather than erroring.
        let (civil_dawn, civil_dusk) =
            match hour_angle_checked(self.latitude, decl, ZENITH_CIVIL) {
                Some(ha_civil) => (
                    to_local(
                        date,
                        event_minutes_utc(self.longitude, ha_civil, eqtime, true),
                    ),
                    to_local(
                        date,
                        event_minutes_utc(self.longitude, ha_civil, eqtime, false),
                    ),
                ),
                None => (sunrise, sunset),
            };

        SunEventTimes {
            civil_dawn,
            sunrise,
            sunset,
            civil_dusk,
        }
    }

    /// Solar elevation (deg) at a UTC instant.
    fn solar_elevation(&self, at: DateTime<Utc>) -> f64 {
        let date = at.date_naive();
        let hour = f64::from(at.hour())
            + f64::from(at.minute()) / 60.0
            + f64::from(at.second()) / 3600.0;
        let gamma = fractional_year(date, hour);
        let eqtime = equation_of_time(gamma);
        let decl = solar_declination(gamma);

        let time_offset = eqtime + 4.0 * self.longitude;
        let true_solar_minutes = hour * 60.0 + time_offset;
        let ha_deg = true_solar_minutes / 4.0 - 180.0;

        let lat = self.latitude.to_radians();
        let ha = ha_deg.to_radians();
        let cos_zenith = lat.sin() * decl.sin() + lat.cos() * decl.cos() * ha.cos();
        90.0 - cos_zenith.clamp(-1.0, 1.0).acos().to_degrees()
    }
}

/// Fractional year in radians for a date and fractional hour.
fn fractional_year(date: NaiveDate, hour: f64) -> f64 {
    let day_of_year = f64::from(date.ordinal());
    2.0 * std::f64::consts::PI / 365.0 * (day_of_year - 1.0 + (hour - 12.0) / 24.0)
}

/// NOAA equation of time (minutes).
fn equation_of_time(gamma: f64) -> f64 {
    229.18
        * (0.000075 + 0.001868 * gamma.cos()
            - 0.032077 * gamma.sin()
            - 0.014615 * (2.0 * gamma).cos()
            - 0.040849 * (2.0 * gamma).sin())
}

/// NOAA solar declination (radians).
fn solar_declination(gamma: f64) -> f64 {
    0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin()
        - 0.006758 * (2.0 * gamma).cos()
        + 0.000907 * (2.0 * gamma).sin()
        - 0.002697 * (3.0 * gamma).cos()
        + 0.00148 * (3.0 * gamma).sin()
}

/// Hour angle (deg) for a zenith, clamped when the sun never crosses it.
fn hour_angle(latitude: f64, decl: f64, zenith: f64) -> f64 {
    let lat = latitude.to_radians();
    let cos_ha =
        zenith.to_radians().cos() / (lat.cos() * decl.cos()) - lat.tan() * decl.tan();
    cos_ha.clamp(-1.0, 1.0).acos().to_degrees()
}

/// Hour angle (deg), or `None` when the sun never crosses the zenith.
fn hour_angle_checked(latitude: f64, decl: f64, zenith: f64) -> Option<f64> {
    let lat = latitude.to_radians();
    let cos_ha =
        zenith.to_radians().cos() / (lat.cos() * decl.cos()) - lat.tan() * decl.tan();
    if !(-1.0..=1.0).contains(&cos_ha) {
        return None;
    }
    Some(cos_ha.acos().to_degrees())
}

/// UTC minutes-of-day for a rising (`morning`) or setting event.
fn event_minutes_utc(longitude: f64, ha_deg: f64, eqtime: f64, morning: bool) -> f64 {
    let signed = if morning { ha_deg } else { -ha_deg };
    720.0 - 4.0 * (longitude + signed) - eqtime
}

/// A date plus UTC minutes-of-day as a local timestamp.
fn to_local(date: NaiveDate, minutes_utc: f64) -> DateTime<Local> {
    let minutes = minutes_utc.rem_euclid(24.0 * 60.0);
    let secs = (minutes * 60.0).round() as u32;
    let (hour, rem) = (secs / 3600, secs % 3600);
    let time = date
        .and_hms_opt(hour.min(23), (rem / 60).min(59), (rem % 60).min(59))
        .unwrap_or_else(|| date.and_hms_opt(0, 0, 0).expect("midnight is valid"));
    Utc.from_utc_datetime(&time).with_timezone(&Local)
}
