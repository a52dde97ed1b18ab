//! The deduplication gate between parsed records and the store.
//!
//! The store's natural-key uniqueness guard decides every outcome. The gate's
//! existence check only saves write attempts for records that were already
//! committed before the call, and a constraint violation on insert is read as
//! a skipped duplicate.

use std::future::Future;
use std::time::Duration;

use logwarden_core::error::StoreError;
use logwarden_core::record::{NaturalKey, Record};
use logwarden_core::store::{InsertOutcome, LogStore};
use logwarden_core::variant::FormatVariant;

/// Per-call gate over a store. Every store call is bounded by `store_timeout`.
pub struct DedupGate<'a, S: LogStore + ?Sized> {
    store: &'a S,
    store_timeout: Duration,
    check_existing: bool,
}

impl<'a, S: LogStore + ?Sized> DedupGate<'a, S> {
    pub fn new(store: &'a S, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
            check_existing: true,
        }
    }

    /// Skip the existence pre-check and let the store constraint decide.
    pub fn without_existence_check(mut self) -> Self {
        self.check_existing = false;
        self
    }

    pub async fn ensure_schema(&self, variant: FormatVariant) -> Result<(), StoreError> {
        self.bounded(self.store.ensure_schema(variant)).await
    }

    /// Whether a record with this key has been committed.
    pub async fn exists(&self, record: &Record) -> Result<bool, StoreError> {
        let key = record.natural_key();
        self.bounded(self.store.exists(record.variant(), &key)).await
    }

    /// Offer one record to the store.
    pub async fn admit(&self, record: &Record) -> Result<InsertOutcome, StoreError> {
        if self.check_existing && self.exists(record).await? {
            return Ok(InsertOutcome::SkippedDuplicate);
        }
        match self.bounded(self.store.insert(record)).await {
            Ok(()) => Ok(InsertOutcome::Inserted),
            Err(StoreError::DuplicateKey) => Ok(InsertOutcome::SkippedDuplicate),
            Err(e) => Err(e),
        }
    }

    /// Offer a batch of same-variant records, one outcome per record in
    /// input order.
    ///
    /// Records found by the pre-check are skipped without a write; the rest
    /// go to the store in one call. Within the batch, only the first record
    /// per key can be inserted.
    pub async fn admit_batch(&self, records: &[Record]) -> Result<Vec<InsertOutcome>, StoreError> {
        let Some(first) = records.first() else {
            return Ok(Vec::new());
        };

        let mut outcomes = vec![InsertOutcome::SkippedDuplicate; records.len()];
        let mut pending: Vec<usize> = (0..records.len()).collect();

        if self.check_existing {
            let keys: Vec<NaturalKey> = records.iter().map(Record::natural_key).collect();
            let found = self
                .bounded(self.store.existing_keys(first.variant(), &keys))
                .await?;
            if !found.is_empty() {
                pending.retain(|&i| !found.contains(&keys[i]));
            }
        }
        if pending.is_empty() {
            return Ok(outcomes);
        }

        let to_insert: Vec<Record> = pending.iter().map(|&i| records[i].clone()).collect();
        let inserted = self.bounded(self.store.insert_batch(&to_insert)).await?;
        for (&i, outcome) in pending.iter().zip(inserted) {
            outcomes[i] = outcome;
        }
        Ok(outcomes)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}
