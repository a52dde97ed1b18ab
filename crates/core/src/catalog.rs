//! The fixed catalog of security queries and their result shape.
//!
//! Stores evaluate the queries (in SQL, or in process for the memory store);
//! this module owns what each query means: its filter, its ordering, its
//! column set and the rows it projects.

use std::str::FromStr;

use chrono::TimeDelta;
use serde::Serialize;

use crate::error::CoreError;
use crate::record::Record;
use crate::types::Timestamp;
use crate::variant::FormatVariant;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Status codes counted as failed logins.
pub const FAILED_LOGIN_STATUSES: [u16; 2] = [401, 403];

/// Characters whose presence in a query string marks it as suspicious.
pub const SUSPICIOUS_QUERY_CHARS: [char; 3] = ['<', '>', '\''];

/// Path prefixes of administrative pages.
pub const ADMIN_PATH_PREFIXES: [&str; 2] = ["/admin", "/dashboard"];

/// Path prefixes of credential-entry pages.
pub const CREDENTIAL_PATH_PREFIXES: [&str; 2] = ["/login", "/signup"];

/// A client must exceed this many requests in the window to be reported.
pub const VOLUMETRIC_REQUEST_THRESHOLD: i64 = 1000;

/// Length of the default volumetric window, in seconds.
pub const VOLUMETRIC_WINDOW_SECS: i64 = 3600;

// ---------------------------------------------------------------------------
// Catalog entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogQuery {
    FailedLogins,
    SuspiciousRequests,
    AdminAccess,
    PhishingPaths,
    VolumetricAnomaly,
}

impl CatalogQuery {
    pub const ALL: [CatalogQuery; 5] = [
        Self::FailedLogins,
        Self::SuspiciousRequests,
        Self::AdminAccess,
        Self::PhishingPaths,
        Self::VolumetricAnomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailedLogins => "failed-logins",
            Self::SuspiciousRequests => "suspicious-requests",
            Self::AdminAccess => "admin-access",
            Self::PhishingPaths => "phishing-paths",
            Self::VolumetricAnomaly => "volumetric-anomaly",
        }
    }

    /// Name of the exported report for this query.
    pub fn export_name(&self) -> &'static str {
        match self {
            Self::FailedLogins => "analyze_failed_logins",
            Self::SuspiciousRequests => "analyze_suspicious_requests",
            Self::AdminAccess => "analyze_admin_access",
            Self::PhishingPaths => "analyze_phishing_attempts",
            Self::VolumetricAnomaly => "analyze_ddos",
        }
    }

    /// Whether the query aggregates per client instead of listing events.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::VolumetricAnomaly)
    }

    /// Column names of the result, in order.
    pub fn columns(&self, variant: FormatVariant) -> &'static [&'static str] {
        match self {
            Self::FailedLogins => &["timestamp", "client_ip", "username", "uri_path", "status_code"],
            Self::SuspiciousRequests => &["timestamp", "client_ip", "uri_path", "uri_query"],
            Self::AdminAccess | Self::PhishingPaths => {
                &["timestamp", "client_ip", "username", "uri_path"]
            }
            Self::VolumetricAnomaly => match variant {
                FormatVariant::ByteMetrics => &["client_ip", "request_count", "total_bytes"],
                FormatVariant::TimingMetrics => {
                    &["client_ip", "request_count", "total_time_taken_ms"]
                }
            },
        }
    }

    /// Filter predicate of the event-listing queries.
    ///
    /// Always `false` for the volumetric query, which is a grouping and not a
    /// per-record filter.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::FailedLogins => FAILED_LOGIN_STATUSES.contains(&record.status_code),
            Self::SuspiciousRequests => record.uri_query.contains(SUSPICIOUS_QUERY_CHARS),
            Self::AdminAccess => has_prefix(&record.uri_path, &ADMIN_PATH_PREFIXES),
            Self::PhishingPaths => has_prefix(&record.uri_path, &CREDENTIAL_PATH_PREFIXES),
            Self::VolumetricAnomaly => false,
        }
    }

    /// The window a query actually runs over.
    ///
    /// The volumetric query falls back to the hour ending at `now`; the
    /// others run unbounded when no window is given.
    pub fn effective_window(
        &self,
        window: Option<TimeWindow>,
        now: Timestamp,
    ) -> Option<TimeWindow> {
        match (self, window) {
            (_, Some(window)) => Some(window),
            (Self::VolumetricAnomaly, None) => Some(TimeWindow::last_hour(now)),
            (_, None) => None,
        }
    }
}

fn has_prefix(path: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| path.starts_with(prefix))
}

impl std::fmt::Display for CatalogQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogQuery {
    type Err = CoreError;

    /// Accepts either the short name (`failed-logins`) or the export name
    /// (`analyze_failed_logins`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == s || q.export_name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|q| q.as_str()).collect();
                CoreError::Validation(format!(
                    "Unknown query '{s}'. Must be one of: {}",
                    names.join(", ")
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Time window
// ---------------------------------------------------------------------------

/// Inclusive range over record timestamps. A window without `to` is open
/// above and also admits timestamps later than query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub from: Timestamp,
    pub to: Option<Timestamp>,
}

impl TimeWindow {
    pub fn new(from: Timestamp, to: Timestamp) -> Result<Self, CoreError> {
        if from > to {
            return Err(CoreError::Validation(format!(
                "Time window start {from} is after its end {to}"
            )));
        }
        Ok(Self { from, to: Some(to) })
    }

    /// Everything at or after `from`.
    pub fn since(from: Timestamp) -> Self {
        Self { from, to: None }
    }

    /// The volumetric window: from one hour before `now`, open above so
    /// that clock skew on the log source does not hide recent requests.
    pub fn last_hour(now: Timestamp) -> Self {
        Self::since(now - TimeDelta::seconds(VOLUMETRIC_WINDOW_SECS))
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.from <= ts && self.to.map_or(true, |to| ts <= to)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One cell of a result table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Integer(i64),
    Text(String),
    Timestamp(Timestamp),
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

/// An event row as returned by a store for the listing queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    pub timestamp: Timestamp,
    pub client_ip: String,
    pub username: Option<String>,
    pub uri_path: String,
    pub uri_query: String,
    pub status_code: i32,
}

impl From<&Record> for EventRow {
    fn from(record: &Record) -> Self {
        Self {
            timestamp: record.timestamp,
            client_ip: record.client_ip.clone(),
            username: record.username.clone(),
            uri_path: record.uri_path.clone(),
            uri_query: record.uri_query.clone(),
            status_code: i32::from(record.status_code),
        }
    }
}

/// A per-client aggregate as returned by a store for the volumetric query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRow {
    pub client_ip: String,
    pub request_count: i64,
    pub metric_total: i64,
}

/// Ordered rows with a fixed column set, produced by one catalog query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    pub query: CatalogQuery,
    pub variant: FormatVariant,
    pub columns: &'static [&'static str],
    pub rows: Vec<Vec<Cell>>,
}

impl QueryResult {
    pub fn empty(query: CatalogQuery, variant: FormatVariant) -> Self {
        Self {
            query,
            variant,
            columns: query.columns(variant),
            rows: Vec::new(),
        }
    }

    /// Project event rows onto the query's columns, keeping their order.
    pub fn from_events(query: CatalogQuery, variant: FormatVariant, events: Vec<EventRow>) -> Self {
        let rows = events
            .into_iter()
            .map(|e| {
                let ts = Cell::Timestamp(e.timestamp);
                let ip = Cell::Text(e.client_ip);
                let user = e.username.map_or(Cell::Null, Cell::Text);
                let path = Cell::Text(e.uri_path);
                match query {
                    CatalogQuery::FailedLogins => {
                        vec![ts, ip, user, path, Cell::Integer(i64::from(e.status_code))]
                    }
                    CatalogQuery::SuspiciousRequests => {
                        vec![ts, ip, path, Cell::Text(e.uri_query)]
                    }
                    _ => vec![ts, ip, user, path],
                }
            })
            .collect();
        Self {
            rows,
            ..Self::empty(query, variant)
        }
    }

    /// Build the volumetric result, keeping the rows' order.
    pub fn from_volumes(variant: FormatVariant, volumes: Vec<VolumeRow>) -> Self {
        let rows = volumes
            .into_iter()
            .map(|v| {
                vec![
                    Cell::Text(v.client_ip),
                    Cell::Integer(v.request_count),
                    Cell::Integer(v.metric_total),
                ]
            })
            .collect();
        Self {
            rows,
            ..Self::empty(CatalogQuery::VolumetricAnomaly, variant)
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{LineParser, ParseOutcome};
    use chrono::{TimeZone, Utc};

    fn record(path: &str, query: &str, status: u16) -> Record {
        let line = format!("2024-01-15T10:30:00Z 10.0.0.1 alice GET {path} {query} {status} 10 10 UA");
        match LineParser::new(FormatVariant::ByteMetrics).parse(&line) {
            Some(ParseOutcome::Parsed(r)) => r,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn failed_logins_match_401_and_403_only() {
        let q = CatalogQuery::FailedLogins;
        assert!(q.matches(&record("/", "-", 401)));
        assert!(q.matches(&record("/", "-", 403)));
        assert!(!q.matches(&record("/", "-", 200)));
        assert!(!q.matches(&record("/", "-", 404)));
    }

    #[test]
    fn suspicious_requests_match_injection_characters() {
        let q = CatalogQuery::SuspiciousRequests;
        assert!(q.matches(&record("/", "id=1<script>", 200)));
        assert!(q.matches(&record("/", "name=o'brien", 200)));
        assert!(q.matches(&record("/", "a>b", 200)));
        assert!(!q.matches(&record("/", "id=123", 200)));
        assert!(!q.matches(&record("/", "-", 200)));
    }

    #[test]
    fn path_queries_match_by_prefix() {
        assert!(CatalogQuery::AdminAccess.matches(&record("/admin/users", "-", 200)));
        assert!(CatalogQuery::AdminAccess.matches(&record("/dashboard", "-", 200)));
        assert!(!CatalogQuery::AdminAccess.matches(&record("/api/admin", "-", 200)));
        assert!(CatalogQuery::PhishingPaths.matches(&record("/login.aspx", "-", 200)));
        assert!(CatalogQuery::PhishingPaths.matches(&record("/signup", "-", 200)));
        assert!(!CatalogQuery::PhishingPaths.matches(&record("/Login", "-", 200)));
    }

    #[test]
    fn volumetric_column_depends_on_variant() {
        let q = CatalogQuery::VolumetricAnomaly;
        assert_eq!(q.columns(FormatVariant::ByteMetrics)[2], "total_bytes");
        assert_eq!(q.columns(FormatVariant::TimingMetrics)[2], "total_time_taken_ms");
    }

    #[test]
    fn volumetric_defaults_to_last_hour() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let window = CatalogQuery::VolumetricAnomaly.effective_window(None, now).unwrap();
        assert_eq!(window.from, Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap());
        assert_eq!(window.to, None);
        assert!(window.contains(now + TimeDelta::seconds(120)));
        assert!(!window.contains(now - TimeDelta::seconds(VOLUMETRIC_WINDOW_SECS + 1)));
        assert_eq!(CatalogQuery::FailedLogins.effective_window(None, now), None);
    }

    #[test]
    fn explicit_window_wins() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let window = TimeWindow::new(from, to).unwrap();
        assert_eq!(
            CatalogQuery::VolumetricAnomaly.effective_window(Some(window), to),
            Some(window)
        );
        assert!(TimeWindow::new(to, from).is_err());
        assert!(window.contains(from) && window.contains(to));
    }

    #[test]
    fn query_names_round_trip_through_from_str() {
        for q in CatalogQuery::ALL {
            assert_eq!(q.as_str().parse::<CatalogQuery>(), Ok(q));
            assert_eq!(q.export_name().parse::<CatalogQuery>(), Ok(q));
        }
        assert!("everything".parse::<CatalogQuery>().is_err());
    }

    #[test]
    fn failed_login_rows_follow_column_order() {
        let events = vec![EventRow::from(&record("/login", "-", 401))];
        let result = QueryResult::from_events(CatalogQuery::FailedLogins, FormatVariant::ByteMetrics, events);
        assert_eq!(result.columns.len(), result.rows[0].len());
        assert_eq!(result.rows[0][1], Cell::Text("10.0.0.1".into()));
        assert_eq!(result.rows[0][2], Cell::Text("alice".into()));
        assert_eq!(result.rows[0][4], Cell::Integer(401));
    }

    #[test]
    fn every_projection_matches_its_columns() {
        let events = || vec![EventRow::from(&record("/admin", "x<y", 403))];
        for q in CatalogQuery::ALL.into_iter().filter(|q| !q.is_aggregate()) {
            let result = QueryResult::from_events(q, FormatVariant::ByteMetrics, events());
            assert_eq!(result.rows[0].len(), result.columns.len(), "{q}");
        }
        let volumes = QueryResult::from_volumes(
            FormatVariant::TimingMetrics,
            vec![VolumeRow { client_ip: "10.0.0.1".into(), request_count: 1001, metric_total: 5 }],
        );
        assert_eq!(volumes.rows[0].len(), volumes.columns.len());
    }

    #[test]
    fn null_cell_renders_empty() {
        assert_eq!(Cell::Null.to_string(), "");
        assert_eq!(Cell::Integer(7).to_string(), "7");
    }
}
