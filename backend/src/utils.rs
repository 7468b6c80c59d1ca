use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};

/// Builds the UTC instant for a millisecond epoch.
///
/// The whole seconds and the millisecond remainder are handled separately so
/// the result is exact. Negative input yields `None`.
pub fn datetime_from_epoch_ms(ms: i64) -> Option<DateTime<Utc>> {
    if ms < 0 {
        return None;
    }
    let secs = ms / 1000;
    let rem = ms % 1000;

    let base = Utc.timestamp_opt(secs, 0).single()?;
    base.checked_add_signed(Duration::milliseconds(rem))
}

pub fn epoch_ms(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// `2025-10-20T16:30:12.123Z`
pub fn iso_z(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Rounds half away from zero to three decimals, as the decimal literal reads.
///
/// `1.0005 * 1000.0` is `1000.4999..` in binary, so the scaled value is first
/// cut to 15 significant digits before rounding.
pub fn round3(v: f64) -> f64 {
    if !v.is_finite() {
        return v;
    }
    let scaled = v * 1000.0;
    let scaled = format!("{scaled:.14e}").parse::<f64>().unwrap_or(scaled);
    scaled.round() / 1000.0
}
