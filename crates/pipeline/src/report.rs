//! Report sinks: where named query results are exported.
//!
//! A sink never sees the store. Its failures are reported to the caller and
//! leave ingested data untouched.

use std::path::{Path, PathBuf};

use logwarden_core::catalog::QueryResult;

use crate::catalog::CatalogRun;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Invalid report name '{0}'")]
    InvalidName(String),

    #[error("Report I/O failed for '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV write failed for '{}': {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Receives one named result at a time.
pub trait ReportSink {
    /// Export `result` under `name`, returning where it went.
    fn write(&self, name: &str, result: &QueryResult) -> Result<PathBuf, ReportError>;
}

/// Writes each result to `<dir>/<name>.csv` with a header row.
#[derive(Debug, Clone)]
pub struct CsvReportSink {
    dir: PathBuf,
}

impl CsvReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, ReportError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(ReportError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.csv")))
    }
}

impl ReportSink for CsvReportSink {
    fn write(&self, name: &str, result: &QueryResult) -> Result<PathBuf, ReportError> {
        let path = self.path_for(name)?;
        std::fs::create_dir_all(&self.dir).map_err(|source| ReportError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let csv_err = |source| ReportError::Csv {
            path: path.clone(),
            source,
        };
        let mut writer = csv::Writer::from_path(&path).map_err(csv_err)?;
        writer.write_record(result.columns).map_err(csv_err)?;
        for row in &result.rows {
            writer
                .write_record(row.iter().map(ToString::to_string))
                .map_err(csv_err)?;
        }
        writer.flush().map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;

        tracing::info!(report = name, path = %path.display(), rows = result.len(), "Report written");
        Ok(path)
    }
}

/// Export every successful run. Failed runs are skipped so that an empty
/// file never stands in for a query error.
///
/// Returns the number of exports that failed.
pub fn export_runs(sink: &dyn ReportSink, runs: &[CatalogRun]) -> usize {
    let mut failures = 0;
    for run in runs.iter().filter(|r| r.is_ok()) {
        if let Err(e) = sink.write(run.name(), &run.result) {
            tracing::error!(report = run.name(), error = %e, "Report export failed");
            failures += 1;
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use logwarden_core::catalog::{CatalogQuery, EventRow, VolumeRow};
    use logwarden_core::error::QueryError;
    use logwarden_core::variant::FormatVariant;

    fn failed_logins() -> QueryResult {
        let event = EventRow {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap(),
            client_ip: "10.0.0.1".into(),
            username: None,
            uri_path: "/login".into(),
            uri_query: String::new(),
            status_code: 401,
        };
        QueryResult::from_events(CatalogQuery::FailedLogins, FormatVariant::ByteMetrics, vec![event])
    }

    #[test]
    fn csv_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvReportSink::new(dir.path().join("reports"));

        let path = sink.write("analyze_failed_logins", &failed_logins()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "timestamp,client_ip,username,uri_path,status_code");
        assert_eq!(lines[1], "2024-01-15T10:30:00+00:00,10.0.0.1,,/login,401");
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn empty_result_still_gets_a_header() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvReportSink::new(dir.path());
        let result = QueryResult::from_volumes(FormatVariant::TimingMetrics, Vec::<VolumeRow>::new());

        let path = sink.write("analyze_ddos", &result).unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.trim_end(), "client_ip,request_count,total_time_taken_ms");
    }

    #[test]
    fn path_like_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvReportSink::new(dir.path());
        assert_matches!(
            sink.write("../escape", &failed_logins()),
            Err(ReportError::InvalidName(_))
        );
    }

    #[test]
    fn export_skips_failed_runs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvReportSink::new(dir.path());
        let runs = vec![
            CatalogRun {
                query: CatalogQuery::FailedLogins,
                result: failed_logins(),
                error: None,
            },
            CatalogRun {
                query: CatalogQuery::AdminAccess,
                result: QueryResult::empty(CatalogQuery::AdminAccess, FormatVariant::ByteMetrics),
                error: Some(QueryError::Timeout { query: CatalogQuery::AdminAccess }),
            },
        ];

        assert_eq!(export_runs(&sink, &runs), 0);
        assert!(dir.path().join("analyze_failed_logins.csv").exists());
        assert!(!dir.path().join("analyze_admin_access.csv").exists());
    }

    #[test]
    fn unwritable_destination_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let sink = CsvReportSink::new(&blocker);

        assert_matches!(
            sink.write("analyze_ddos", &failed_logins()),
            Err(ReportError::Io { .. })
        );
        assert_eq!(
            export_runs(
                &sink,
                &[CatalogRun {
                    query: CatalogQuery::FailedLogins,
                    result: failed_logins(),
                    error: None,
                }]
            ),
            1
        );
    }
}
