// Timestamp helpers. The teacher computes ISO8601 timestamps by hand via libc's strftime to avoid
// pulling in chrono for a single call site; this crate already depends on chrono for SQLite row
// timestamps and SSE payloads, so it is the one true way to format a time here too.

use chrono::{DateTime, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339()
}
