//! Shared scalar aliases.

/// Serial id of a stored access-log row (`BIGSERIAL`).
pub type DbId = i64;

/// Log event time. Always UTC, truncated to microseconds so it survives a
/// `TIMESTAMPTZ` round trip unchanged.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
