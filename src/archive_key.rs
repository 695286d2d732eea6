use chrono::{DateTime, Utc};

/// Windows at least this long are archived as `daily`.
pub const DAILY_THRESHOLD: chrono::Duration = chrono::Duration::hours(20);

/// Destination key for an explicit-window run.
///
/// An override is returned verbatim. Otherwise the key is
/// `{year}/{MonthName}/ring-{kind}-{YYYYMMDD}-{speed}x.mp4`, dated by the UTC
/// start of the window, where `kind` is `clip_type` when given and
/// `daily`/`custom` by window length otherwise.
pub fn derive_key(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    clip_type: Option<&str>,
    speed: f64,
    key_override: Option<&str>,
) -> String {
    if let Some(key) = key_override {
        return key.to_string();
    }

    let kind = clip_type.unwrap_or_else(|| classify(start, end));
    format!(
        "{}/ring-{kind}-{}-{speed}x.mp4",
        start.format("%Y/%B"),
        start.format("%Y%m%d")
    )
}

/// Destination key for the sunset variant: `{YYYYMMDD}_sunset.mp4`.
pub fn sunset_key(start: DateTime<Utc>) -> String {
    format!("{}_sunset.mp4", start.format("%Y%m%d"))
}

pub fn classify(start: DateTime<Utc>, end: DateTime<Utc>) -> &'static str {
    if end - start >= DAILY_THRESHOLD {
        "daily"
    } else {
        "custom"
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, s).unwrap()
    }

    #[test]
    fn thirty_minute_window_is_custom() {
        let key = derive_key(at(20, 0, 0), at(20, 30, 0), None, 30.0, None);
        assert_eq!(key, "2024/June/ring-custom-20240601-30x.mp4");
    }

    #[test]
    fn twenty_hours_is_the_daily_boundary() {
        let start = at(0, 0, 0);
        assert_eq!(classify(start, at(20, 0, 0)), "daily");
        assert_eq!(classify(start, at(19, 59, 59)), "custom");
    }

    #[test]
    fn clip_type_replaces_classification() {
        let key = derive_key(at(0, 0, 0), at(23, 0, 0), Some("weekly"), 60.0, None);
        assert_eq!(key, "2024/June/ring-weekly-20240601-60x.mp4");
    }

    #[test]
    fn fractional_speed_is_kept_in_the_tag() {
        let key = derive_key(at(20, 0, 0), at(20, 30, 0), None, 1.5, None);
        assert_eq!(key, "2024/June/ring-custom-20240601-1.5x.mp4");
    }

    #[test]
    fn same_inputs_same_key_and_inputs_matter() {
        let a = derive_key(at(20, 0, 0), at(20, 30, 0), None, 30.0, None);
        assert_eq!(a, derive_key(at(20, 0, 0), at(20, 30, 0), None, 30.0, None));
        assert_ne!(a, derive_key(at(20, 0, 0), at(20, 30, 0), None, 40.0, None));
        assert_ne!(
            a,
            derive_key(
                Utc.with_ymd_and_hms(2024, 6, 2, 20, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 6, 2, 20, 30, 0).unwrap(),
                None,
                30.0,
                None
            )
        );
    }

    #[test]
    fn override_wins_verbatim() {
        let key = derive_key(
            at(20, 0, 0),
            at(20, 30, 0),
            Some("daily"),
            30.0,
            Some("manual/x.mp4"),
        );
        assert_eq!(key, "manual/x.mp4");
    }

    #[test]
    fn sunset_key_uses_start_date() {
        assert_eq!(sunset_key(at(18, 45, 0)), "20240601_sunset.mp4");
    }
}
