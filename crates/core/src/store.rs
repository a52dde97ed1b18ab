//! The contract the ingestion and query layers require from a record store.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;

use crate::catalog::{CatalogQuery, QueryResult, TimeWindow};
use crate::error::{QueryError, StoreError};
use crate::record::{NaturalKey, Record};
use crate::variant::FormatVariant;

/// What happened to a record offered to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    SkippedDuplicate,
}

/// A persistent record store.
///
/// Implementations must enforce uniqueness of the natural key themselves;
/// [`exists`](LogStore::exists) is only an optimisation for callers.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Create (or verify) the table for `variant`.
    async fn ensure_schema(&self, variant: FormatVariant) -> Result<(), StoreError>;

    async fn has_table(&self, name: &str) -> Result<bool, StoreError>;

    /// Whether a committed record with this natural key exists.
    async fn exists(&self, variant: FormatVariant, key: &NaturalKey) -> Result<bool, StoreError>;

    /// The subset of `keys` already committed.
    async fn existing_keys(
        &self,
        variant: FormatVariant,
        keys: &[NaturalKey],
    ) -> Result<HashSet<NaturalKey>, StoreError> {
        let mut found = HashSet::new();
        for key in keys {
            if self.exists(variant, key).await? {
                found.insert(key.clone());
            }
        }
        Ok(found)
    }

    /// Insert one record. A natural-key collision is
    /// [`StoreError::DuplicateKey`].
    async fn insert(&self, record: &Record) -> Result<(), StoreError>;

    /// Insert a batch of same-variant records, reporting one outcome per
    /// record in input order. Later records sharing a key with an earlier
    /// one in the same batch are duplicates.
    async fn insert_batch(&self, records: &[Record]) -> Result<Vec<InsertOutcome>, StoreError> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            match self.insert(record).await {
                Ok(()) => outcomes.push(InsertOutcome::Inserted),
                Err(StoreError::DuplicateKey) => outcomes.push(InsertOutcome::SkippedDuplicate),
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    /// Number of records stored for `variant`.
    async fn count(&self, variant: FormatVariant) -> Result<i64, StoreError>;

    /// Evaluate one catalog query. Filtering and aggregation happen inside
    /// the store.
    async fn run_query(
        &self,
        variant: FormatVariant,
        query: CatalogQuery,
        window: Option<TimeWindow>,
    ) -> Result<QueryResult, QueryError>;
}
