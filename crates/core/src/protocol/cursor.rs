//! Timestamp and cursor handling.
//!
//! Storage keeps `server_modified` as unix microseconds. The wire speaks
//! RFC-3339: `next_cursor` and every `server_modified` field are formatted
//! here, and cursor input is parsed permissively (RFC-3339, bare datetimes,
//! epoch seconds or milliseconds) so older clients keep working.

use std::time::{SystemTime, UNIX_EPOCH};

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

/// Epoch-millisecond values at or above this are treated as milliseconds;
/// below it, as seconds.
const EPOCH_MS_THRESHOLD: i64 = 1_000_000_000_000;

/// Current wall-clock time in unix microseconds.
pub fn now_micros() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_micros()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

/// Canonical RFC-3339 UTC rendering of a unix-microsecond timestamp.
/// Subseconds are always six digits so the strings sort chronologically,
/// which keeps cursor strings comparable as plain text.
pub fn format_micros(micros: i64) -> String {
    let format = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    let nanos = i128::from(micros) * 1_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .and_then(|dt| dt.format(format).ok())
        .unwrap_or_else(|| "1970-01-01T00:00:00.000000Z".to_owned())
}

/// Parse a timestamp in any accepted input form into unix microseconds.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    if let Some(micros) = parse_epoch_numeric(value) {
        return Some(micros);
    }
    if let Ok(dt) = OffsetDateTime::parse(value, &Rfc3339) {
        return offset_to_micros(dt);
    }

    let datetime_format =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let datetime_subsec_format =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");
    if let Ok(dt) = PrimitiveDateTime::parse(value, datetime_subsec_format) {
        return offset_to_micros(dt.assume_utc());
    }
    if let Ok(dt) = PrimitiveDateTime::parse(value, datetime_format) {
        return offset_to_micros(dt.assume_utc());
    }

    let date_format = format_description!("[year]-[month]-[day]");
    if let Ok(date) = Date::parse(value, date_format) {
        return offset_to_micros(date.midnight().assume_utc());
    }

    None
}

/// Cursors are timestamps in disguise; a cursor that does not parse as one
/// is malformed.
pub fn parse_cursor(raw: &str) -> Option<i64> {
    parse_timestamp(raw)
}

fn parse_epoch_numeric(value: &str) -> Option<i64> {
    let numeric: i64 = value.parse().ok()?;
    if numeric < 0 {
        return None;
    }
    let micros = if numeric >= EPOCH_MS_THRESHOLD {
        numeric.checked_mul(1_000)?
    } else {
        numeric.checked_mul(1_000_000)?
    };
    Some(micros)
}

fn offset_to_micros(dt: OffsetDateTime) -> Option<i64> {
    i64::try_from(dt.unix_timestamp_nanos() / 1_000).ok()
}
