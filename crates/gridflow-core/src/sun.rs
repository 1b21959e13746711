// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of GridFlow.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

/// Solar altitude at which rise/set is reported: refraction plus half the
/// solar disc.
const SUN_ALTITUDE_DEG: f64 = -0.833;
/// Obliquity of the ecliptic
const EARTH_TILT_DEG: f64 = 23.4397;

/// Sunrise/sunset provider for a fixed location, localized to one timezone.
///
/// Uses the closed-form NOAA sunrise equation; accurate to a couple of
/// minutes, which is far below the configured sunrise/sunset offsets.
#[derive(Debug, Clone)]
pub struct SunClock {
    latitude: f64,
    longitude: f64,
    tz: Tz,
}

fn sin_d(deg: f64) -> f64 {
    deg.to_radians().sin()
}

fn cos_d(deg: f64) -> f64 {
    deg.to_radians().cos()
}

impl SunClock {
    pub fn new(latitude: f64, longitude: f64, timezone: &str) -> anyhow::Result<Self> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("Unknown timezone: '{}'", timezone))?;
        Ok(Self {
            latitude,
            longitude,
            tz,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Current wall-clock time at the configured location
    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    /// (sunrise, sunset) for the given civil date.
    ///
    /// Polar day/night degenerates to transit ± 12 h / ± 0 h; the decision
    /// procedure only ever compares against offset windows, so the
    /// degenerate values keep it on the conservative night path.
    pub fn sun_times(&self, date: NaiveDate) -> (DateTime<Tz>, DateTime<Tz>) {
        let noon_utc = Utc.from_utc_datetime(&date.and_hms_opt(12, 0, 0).expect("valid time"));
        let jd = noon_utc.timestamp() as f64 / 86400.0 + 2440587.5;

        // days since the J2000 epoch, corrected for mean solar time at the
        // observer's longitude (east positive)
        let n = (jd - 2451545.0 + 0.0008).round();
        let j_star = n - self.longitude / 360.0;

        let mean_anomaly = (357.5291 + 0.98560028 * j_star).rem_euclid(360.0);
        let center = 1.9148 * sin_d(mean_anomaly)
            + 0.0200 * sin_d(2.0 * mean_anomaly)
            + 0.0003 * sin_d(3.0 * mean_anomaly);
        let ecliptic_lon = (mean_anomaly + center + 180.0 + 102.9372).rem_euclid(360.0);

        let j_transit = 2451545.0 + j_star + 0.0053 * sin_d(mean_anomaly)
            - 0.0069 * sin_d(2.0 * ecliptic_lon);

        let sin_decl = sin_d(ecliptic_lon) * sin_d(EARTH_TILT_DEG);
        let cos_decl = (1.0 - sin_decl * sin_decl).sqrt();

        let cos_hour_angle = (sin_d(SUN_ALTITUDE_DEG) - sin_d(self.latitude) * sin_decl)
            / (cos_d(self.latitude) * cos_decl);
        let hour_angle_deg = cos_hour_angle.clamp(-1.0, 1.0).acos().to_degrees();

        let j_rise = j_transit - hour_angle_deg / 360.0;
        let j_set = j_transit + hour_angle_deg / 360.0;

        (self.julian_to_local(j_rise), self.julian_to_local(j_set))
    }

    /// Daylight duration for the date, in hours
    pub fn daylight_hours(&self, date: NaiveDate) -> f64 {
        let (sunrise, sunset) = self.sun_times(date);
        (sunset - sunrise).num_seconds() as f64 / 3600.0
    }

    fn julian_to_local(&self, jd: f64) -> DateTime<Tz> {
        let secs = ((jd - 2440587.5) * 86400.0).round() as i64;
        DateTime::<Utc>::from_timestamp(secs, 0)
            .unwrap_or_else(Utc::now)
            .with_timezone(&self.tz)
    }
}
