//! Wall-clock timestamp helpers.
//!
//! All persisted timestamps are ISO-8601 strings, which keeps registry
//! documents portable and makes lexicographic ordering equal to
//! chronological ordering.

use chrono::{SecondsFormat, Utc};

/// Current time as an ISO-8601 UTC string with microsecond precision.
pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
