use chrono::{DateTime, Days, Utc};
use log::debug;

use crate::error::{TimelapseError, TimelapseResult};
use crate::sun;

pub const DEFAULT_SPEED: f64 = 30.0;
pub const DEFAULT_SUNSET_SPEED: f64 = 40.0;
/// Length of the window used when no bounds are given.
pub const DEFAULT_LOOKBACK: chrono::Duration = chrono::Duration::minutes(30);
pub const DEFAULT_BEFORE_SUNSET: chrono::Duration = chrono::Duration::minutes(20);
pub const DEFAULT_AFTER_SUNSET: chrono::Duration = chrono::Duration::minutes(10);

/// A validated `[start, end)` window with `end > start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> TimelapseResult<Self> {
        if end <= start {
            return Err(TimelapseError::invalid_input(format!(
                "end {} must be after start {}",
                end.to_rfc3339(),
                start.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    /// Resolves explicit ISO-8601 bounds. Both or neither must be given;
    /// neither means the `DEFAULT_LOOKBACK` ending at `now`.
    pub fn from_iso(
        start: Option<&str>,
        end: Option<&str>,
        now: DateTime<Utc>,
    ) -> TimelapseResult<Self> {
        match (start, end) {
            (Some(start), Some(end)) => {
                Self::new(parse_instant("start", start)?, parse_instant("end", end)?)
            }
            (None, None) => {
                debug!(
                    "No window given, using the {} minutes before now",
                    DEFAULT_LOOKBACK.num_minutes()
                );
                Self::new(now - DEFAULT_LOOKBACK, now)
            }
            (Some(_), None) => Err(TimelapseError::invalid_input("start given without end")),
            (None, Some(_)) => Err(TimelapseError::invalid_input("end given without start")),
        }
    }

    /// `[sunset - before, sunset + after]`.
    pub fn around(
        sunset: DateTime<Utc>,
        before: chrono::Duration,
        after: chrono::Duration,
    ) -> TimelapseResult<Self> {
        Self::new(sunset - before, sunset + after)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

fn parse_instant(which: &str, raw: &str) -> TimelapseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TimelapseError::invalid_input(format!("{which} {raw:?} is not ISO-8601: {e}")))
}

/// Parses a playback speed factor, falling back to `default` when absent.
pub fn parse_speed(raw: Option<&str>, default: f64) -> TimelapseResult<f64> {
    let speed = match raw {
        None => default,
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|_| TimelapseError::invalid_input(format!("speed {raw:?} is not a number")))?,
    };

    if !speed.is_finite() || speed <= 0.0 {
        return Err(TimelapseError::invalid_input("speed must be a positive number"));
    }
    Ok(speed)
}

pub fn validate_coordinates(latitude: f64, longitude: f64) -> TimelapseResult<()> {
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(TimelapseError::invalid_input(format!("latitude {latitude} out of range")));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(TimelapseError::invalid_input(format!("longitude {longitude} out of range")));
    }
    Ok(())
}

/// The most recent sunset window that has fully elapsed by `now`: today's
/// when it is already over, otherwise yesterday's.
pub fn last_sunset_window(
    now: DateTime<Utc>,
    latitude: f64,
    longitude: f64,
    before: chrono::Duration,
    after: chrono::Duration,
) -> TimelapseResult<TimeWindow> {
    validate_coordinates(latitude, longitude)?;

    let today = now.date_naive();
    for days_back in 0..=2 {
        let Some(date) = today.checked_sub_days(Days::new(days_back)) else {
            break;
        };
        let Some(sunset) = sun::sunset(date, latitude, longitude) else {
            continue;
        };
        let window = TimeWindow::around(sunset, before, after)?;
        if window.end <= now {
            debug!("Using sunset {} of {}", sunset.to_rfc3339(), date);
            return Ok(window);
        }
    }

    Err(TimelapseError::invalid_input(format!(
        "no completed sunset near {} at ({latitude}, {longitude})",
        now.to_rfc3339()
    )))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::archive_key;

    fn utc(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, d, h, m, 0).unwrap()
    }

    #[test]
    fn explicit_bounds_are_parsed() {
        let w = TimeWindow::from_iso(
            Some("2024-06-01T20:00:00Z"),
            Some("2024-06-01T20:30:00Z"),
            utc(2, 0, 0),
        )
        .unwrap();
        assert_eq!(w.start, utc(1, 20, 0));
        assert_eq!(w.duration(), chrono::Duration::minutes(30));
    }

    #[test]
    fn offsets_are_normalized_to_utc() {
        let w = TimeWindow::from_iso(
            Some("2024-06-01T22:00:00+02:00"),
            Some("2024-06-01T20:30:00Z"),
            utc(2, 0, 0),
        )
        .unwrap();
        assert_eq!(w.start, utc(1, 20, 0));
    }

    #[test]
    fn one_sided_window_is_rejected() {
        let now = utc(2, 0, 0);
        assert!(matches!(
            TimeWindow::from_iso(Some("2024-06-01T20:00:00Z"), None, now),
            Err(TimelapseError::InvalidInput(_))
        ));
        assert!(matches!(
            TimeWindow::from_iso(None, Some("2024-06-01T20:00:00Z"), now),
            Err(TimelapseError::InvalidInput(_))
        ));
    }

    #[test]
    fn end_must_be_after_start() {
        let now = utc(2, 0, 0);
        let t = "2024-06-01T20:00:00Z";
        assert!(TimeWindow::from_iso(Some(t), Some(t), now).is_err());
        assert!(TimeWindow::from_iso(Some("2024-06-01T21:00:00Z"), Some(t), now).is_err());
    }

    #[test]
    fn garbage_is_invalid_input() {
        let end = Some("2024-06-01T20:00:00Z");
        let err = TimeWindow::from_iso(Some("yesterday"), end, utc(2, 0, 0)).unwrap_err();
        assert!(matches!(err, TimelapseError::InvalidInput(_)));
    }

    #[test]
    fn missing_bounds_default_to_last_half_hour() {
        let now = utc(1, 12, 0);
        let w = TimeWindow::from_iso(None, None, now).unwrap();
        assert_eq!(w.end, now);
        assert_eq!(w.start, utc(1, 11, 30));
    }

    #[test]
    fn speed_parsing() {
        assert_eq!(parse_speed(None, DEFAULT_SPEED).unwrap(), 30.0);
        assert_eq!(parse_speed(Some(" 12.5 "), DEFAULT_SPEED).unwrap(), 12.5);
        for bad in ["0", "-3", "NaN", "inf", "fast"] {
            assert!(parse_speed(Some(bad), DEFAULT_SPEED).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn sunset_window_and_key() {
        let w = TimeWindow::around(utc(1, 19, 5), DEFAULT_BEFORE_SUNSET, DEFAULT_AFTER_SUNSET)
            .unwrap();
        assert_eq!(w.start, utc(1, 18, 45));
        assert_eq!(w.end, utc(1, 19, 15));
        assert_eq!(archive_key::sunset_key(w.start), "20240601_sunset.mp4");
    }

    fn london_sunset(now: DateTime<Utc>) -> TimeWindow {
        last_sunset_window(now, 51.5074, -0.1278, DEFAULT_BEFORE_SUNSET, DEFAULT_AFTER_SUNSET)
            .unwrap()
    }

    #[test]
    fn uses_today_once_the_window_is_over() {
        let w = london_sunset(utc(1, 23, 0));
        assert_eq!(w.start.date_naive(), utc(1, 0, 0).date_naive());
        assert!(w.end <= utc(1, 23, 0));
    }

    #[test]
    fn falls_back_to_yesterday_before_sunset() {
        let w = london_sunset(utc(2, 12, 0));
        assert_eq!(w.start.date_naive(), utc(1, 0, 0).date_naive());
    }

    #[test]
    fn coordinates_are_range_checked() {
        assert!(validate_coordinates(91.0, 0.0).is_err());
        assert!(validate_coordinates(0.0, -181.0).is_err());
        assert!(validate_coordinates(-33.9, 151.2).is_ok());
    }
}
