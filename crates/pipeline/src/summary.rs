//! The run report of one ingestion run.

use logwarden_core::error::ParseError;
use logwarden_core::parser::RejectedLine;
use logwarden_core::variant::FormatVariant;
use serde::Serialize;
use uuid::Uuid;

/// A rejected line with its position in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedDetail {
    /// 1-based line number.
    pub line: u64,
    pub raw_line: String,
    pub reason: ParseError,
}

/// Records that could not be persisted after all retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreFailure {
    pub first_line: u64,
    pub last_line: u64,
    pub records: usize,
    pub error: String,
}

/// Outcome counts and failure details of one ingestion run.
///
/// Every line read is counted in `lines_total` and lands in exactly one of
/// `skipped`, `inserted`, `duplicates`, `rejected` or `store_failures`,
/// unless the run was interrupted with records still unflushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    /// `None` when auto-detection never found a data line it could classify.
    pub variant: Option<FormatVariant>,
    pub lines_total: u64,
    /// Blank and comment lines.
    pub skipped: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub rejected_details: Vec<RejectedDetail>,
    /// Parsed records lost to store failures.
    pub store_failures: u64,
    pub store_failure_details: Vec<StoreFailure>,
    /// Reading stopped before the end of the source.
    pub interrupted: bool,
}

impl RunSummary {
    pub fn new(run_id: Uuid, source: impl Into<String>, variant: Option<FormatVariant>) -> Self {
        Self {
            run_id,
            source: source.into(),
            variant,
            lines_total: 0,
            skipped: 0,
            inserted: 0,
            duplicates: 0,
            rejected: 0,
            rejected_details: Vec::new(),
            store_failures: 0,
            store_failure_details: Vec::new(),
            interrupted: false,
        }
    }

    /// Count a rejected line, keeping its details while under `max_details`.
    pub fn record_rejected(&mut self, line: u64, rejected: RejectedLine, max_details: usize) {
        self.rejected += 1;
        if self.rejected_details.len() < max_details {
            self.rejected_details.push(RejectedDetail {
                line,
                raw_line: rejected.raw_line,
                reason: rejected.reason,
            });
        }
    }

    pub fn record_store_failure(&mut self, failure: StoreFailure) {
        self.store_failures += failure.records as u64;
        self.store_failure_details.push(failure);
    }

    /// True when records were lost to the store or reading stopped early.
    pub fn is_degraded(&self) -> bool {
        self.store_failures > 0 || !self.store_failure_details.is_empty() || self.interrupted
    }
}
