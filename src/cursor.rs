//! Read cursors for container log streams.
//!
//! A cursor is the RFC3339 timestamp (nanosecond precision, `Z` offset) of
//! the last log line accepted from a container. The engine emits timestamps
//! in exactly this shape, so cursors are kept as strings and only parsed at
//! the boundaries where arithmetic is needed.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use snafu::{ResultExt, Snafu};

/// Where a container starts when no state has been persisted for it.
pub const EPOCH: &str = "1970-01-01T00:00:00.000000000Z";

const RFC3339_NANO: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";

#[derive(Debug, Snafu)]
pub enum TimestampError {
    #[snafu(display("unparseable timestamp {value:?}: {source}"))]
    Unparseable {
        value: String,
        source: chrono::ParseError,
    },
}

/// Parse an engine timestamp. Accepts `Z` or an explicit offset, since the
/// engine has historically emitted both; everything is normalized to UTC.
pub fn parse(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .context(UnparseableSnafu { value })
}

/// Render a timestamp in the canonical stored form, always nine fractional
/// digits and a literal `Z`. Fixed width means lexicographic order is
/// chronological order.
pub fn format(ts: DateTime<Utc>) -> String {
    ts.format(RFC3339_NANO).to_string()
}

pub fn from_unix_nanos(nanos: i64) -> String {
    format(DateTime::from_timestamp_nanos(nanos))
}

/// One nanosecond past the given timestamp, used as the `since` bound when
/// resuming a stream so the last accepted line is not re-delivered.
pub fn successor(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    Ok(parse(value)? + chrono::Duration::nanoseconds(1))
}

/// The engine's `since` query parameter: seconds and nanoseconds as decimal
/// integers. Never goes through binary floating point, which cannot
/// represent nanosecond precision.
pub fn unix_fraction(ts: DateTime<Utc>) -> String {
    format!("{}.{:09}", ts.timestamp(), ts.timestamp_subsec_nanos())
}

pub fn unix_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_nanos()) / 1e9
}

/// The shared `last_log_timestamp` of one container.
///
/// The owning worker advances it on every accepted line; the router reads it
/// under the same lock when checkpointing. It never moves backwards.
#[derive(Clone, Debug)]
pub struct Cursor(Arc<Mutex<String>>);

impl Cursor {
    pub fn new(initial: impl Into<String>) -> Self {
        Self(Arc::new(Mutex::new(initial.into())))
    }

    pub fn get(&self) -> String {
        self.0.lock().unwrap().clone()
    }

    /// Advance to `value` if it is ahead of the current position. Returns
    /// whether the cursor moved. Comparison is on the fixed-width canonical
    /// string form, so no parsing is required here.
    pub fn advance(&self, value: &str) -> bool {
        let mut guard = self.0.lock().unwrap();
        if value > guard.as_str() {
            *guard = value.to_owned();
            true
        } else {
            false
        }
    }
}
