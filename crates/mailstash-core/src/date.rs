//! Millisecond-timestamp date helpers for sync window math.
//!
//! The sync engine reasons about IMAP-style date ranges: `since` bounds are
//! inclusive, `before` bounds are exclusive, and both are quantized to a
//! server-local midnight. All timestamps are milliseconds since the Unix
//! epoch in UTC; a `None` bound means "open ended" (the dawn of time for a
//! start, "now and beyond" for an end).

use chrono::{TimeZone, Utc};

/// Milliseconds since the Unix epoch (UTC).
pub type TimestampMs = i64;

/// One hour in milliseconds.
pub const HOUR_MS: i64 = 60 * 60 * 1000;

/// One day in milliseconds.
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Current wall-clock time in milliseconds.
#[must_use]
pub fn now_ms() -> TimestampMs {
    Utc::now().timestamp_millis()
}

/// True if `a` is chronologically before `b` (exclusive).
///
/// A `None` for `b` means "the end of time", so everything is before it.
#[must_use]
pub fn before(a: TimestampMs, b: Option<TimestampMs>) -> bool {
    b.is_none_or(|b| a < b)
}

/// True if `a` is at or after `b` (inclusive, the IMAP SINCE sense).
///
/// A `None` for `b` means "the dawn of time", so everything is since it.
#[must_use]
pub fn since(a: TimestampMs, b: Option<TimestampMs>) -> bool {
    b.is_none_or(|b| a >= b)
}

/// True if `ts` falls in the IMAP-style range `[start, end)` where either
/// bound may be open.
#[must_use]
pub fn in_date_range(ts: TimestampMs, start: Option<TimestampMs>, end: Option<TimestampMs>) -> bool {
    since(ts, start) && before(ts, end)
}

/// Quantize a timestamp down to the preceding UTC midnight.
#[must_use]
pub fn quantize_date(ts: TimestampMs) -> TimestampMs {
    ts - ts.rem_euclid(DAY_MS)
}

/// Quantize a timestamp up to the following UTC midnight.
///
/// A timestamp already on a midnight is left unchanged.
#[must_use]
pub fn quantize_date_up(ts: TimestampMs) -> TimestampMs {
    let rem = ts.rem_euclid(DAY_MS);
    if rem == 0 { ts } else { ts - rem + DAY_MS }
}

/// Quantize to the midnight of the remote server's timezone.
///
/// IMAP SEARCH date ranges are interpreted in the server's local day, so we
/// shift into server-local time, floor to midnight, and shift back.
#[must_use]
pub fn quantize_to_server_midnight(ts: TimestampMs, tz_offset_ms: i64) -> TimestampMs {
    quantize_date(ts + tz_offset_ms) - tz_offset_ms
}

/// Step a timestamp `days` whole days into the past (negative steps move
/// into the future), staying on a UTC midnight.
#[must_use]
pub fn make_days_before(ts: TimestampMs, days: i64) -> TimestampMs {
    quantize_date(ts) - days * DAY_MS
}

/// Fractional number of days `ts` lies in the past relative to `now`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn days_in_past(ts: TimestampMs, now: TimestampMs) -> f64 {
    (quantize_date(now) - ts) as f64 / DAY_MS as f64
}

/// Whole-day span of `[start, end)`, rounded to the nearest day.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn day_span(start: TimestampMs, end: TimestampMs) -> i64 {
    ((end - start) as f64 / DAY_MS as f64).round() as i64
}

/// Millisecond timestamp for a UTC calendar date. Used for fixed horizon
/// constants; panics only on out-of-range dates, which the constants are not.
#[must_use]
#[allow(clippy::missing_panics_doc, clippy::unwrap_used)]
pub fn utc_date_ms(year: i32, month: u32, day: u32) -> TimestampMs {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .unwrap()
        .timestamp_millis()
}
