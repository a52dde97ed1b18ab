//! Shared fixtures for the pipeline unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use logwarden_core::catalog::{CatalogQuery, QueryResult, TimeWindow};
use logwarden_core::error::{QueryError, StoreError};
use logwarden_core::parser::{LineParser, ParseOutcome};
use logwarden_core::record::{NaturalKey, Record};
use logwarden_core::store::{InsertOutcome, LogStore};
use logwarden_core::types::Timestamp;
use logwarden_core::variant::FormatVariant;

use crate::memory::MemoryLogStore;

/// A byte-metrics line with 512 bytes sent.
pub fn byte_line(ts: &str, ip: &str, path: &str, query: &str, status: u16) -> String {
    format!("{ts} {ip} alice GET {path} {query} {status} 512 128 Mozilla/5.0")
}

pub fn parse_byte(line: &str) -> Record {
    match LineParser::new(FormatVariant::ByteMetrics).parse(line) {
        Some(ParseOutcome::Parsed(record)) => record,
        other => panic!("unexpected outcome for {line:?}: {other:?}"),
    }
}

/// A timing-metrics line stamped at `at`, served by 10.0.0.9.
pub fn timing_line(at: Timestamp, ip: &str, path: &str, status: u16, time_taken_ms: u64) -> String {
    format!(
        "{} 10.0.0.9 GET {path} - 443 - {ip} Mozilla/5.0 {status} 0 0 {time_taken_ms}",
        at.format("%Y-%m-%d %H:%M:%S")
    )
}

pub fn parse_timing(line: &str) -> Record {
    match LineParser::new(FormatVariant::TimingMetrics).parse(line) {
        Some(ParseOutcome::Parsed(record)) => record,
        other => panic!("unexpected outcome for {line:?}: {other:?}"),
    }
}

/// Memory store whose batch inserts fail or stall on demand.
pub struct FlakyStore {
    inner: MemoryLogStore,
    failures_left: AtomicU32,
    insert_calls: AtomicU32,
    delay: Option<Duration>,
}

impl FlakyStore {
    /// Fail the first `failures` batch inserts with a backend error.
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryLogStore::new(),
            failures_left: AtomicU32::new(failures),
            insert_calls: AtomicU32::new(0),
            delay: None,
        }
    }

    /// Stall every batch insert for `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(0)
        }
    }

    pub fn insert_calls(&self) -> u32 {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogStore for FlakyStore {
    async fn ensure_schema(&self, variant: FormatVariant) -> Result<(), StoreError> {
        self.inner.ensure_schema(variant).await
    }

    async fn has_table(&self, name: &str) -> Result<bool, StoreError> {
        self.inner.has_table(name).await
    }

    async fn exists(&self, variant: FormatVariant, key: &NaturalKey) -> Result<bool, StoreError> {
        self.inner.exists(variant, key).await
    }

    async fn existing_keys(
        &self,
        variant: FormatVariant,
        keys: &[NaturalKey],
    ) -> Result<HashSet<NaturalKey>, StoreError> {
        self.inner.existing_keys(variant, keys).await
    }

    async fn insert(&self, record: &Record) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }

    async fn insert_batch(&self, records: &[Record]) -> Result<Vec<InsertOutcome>, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Backend("connection reset by peer".into()));
        }
        self.inner.insert_batch(records).await
    }

    async fn count(&self, variant: FormatVariant) -> Result<i64, StoreError> {
        self.inner.count(variant).await
    }

    async fn run_query(
        &self,
        variant: FormatVariant,
        query: CatalogQuery,
        window: Option<TimeWindow>,
    ) -> Result<QueryResult, QueryError> {
        self.inner.run_query(variant, query, window).await
    }
}
