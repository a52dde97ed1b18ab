//! In-process record store.
//!
//! Implements the whole [`LogStore`] contract, natural-key uniqueness and
//! catalog evaluation included, with the same result ordering as the
//! PostgreSQL store. Used for dry runs and tests.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use logwarden_core::catalog::{
    CatalogQuery, EventRow, QueryResult, TimeWindow, VolumeRow, VOLUMETRIC_REQUEST_THRESHOLD,
};
use logwarden_core::error::{QueryError, StoreError};
use logwarden_core::record::{NaturalKey, Record};
use logwarden_core::store::{InsertOutcome, LogStore};
use logwarden_core::variant::FormatVariant;

#[derive(Debug, Default)]
struct Table {
    keys: HashSet<NaturalKey>,
    /// Insertion order stands in for the serial id.
    rows: Vec<Record>,
}

impl Table {
    fn insert(&mut self, record: &Record) -> InsertOutcome {
        if self.keys.insert(record.natural_key()) {
            self.rows.push(record.clone());
            InsertOutcome::Inserted
        } else {
            InsertOutcome::SkippedDuplicate
        }
    }

    fn in_window<'a>(&'a self, window: Option<TimeWindow>) -> impl Iterator<Item = &'a Record> + 'a {
        self.rows
            .iter()
            .filter(move |r| window.map_or(true, |w| w.contains(r.timestamp)))
    }

    fn events(&self, query: CatalogQuery, window: Option<TimeWindow>) -> Vec<EventRow> {
        let mut matched: Vec<(usize, &Record)> = self
            .in_window(window)
            .enumerate()
            .filter(|(_, r)| query.matches(r))
            .collect();
        matched.sort_by_key(|&(seq, r)| Reverse((r.timestamp, seq)));
        matched.into_iter().map(|(_, r)| EventRow::from(r)).collect()
    }

    fn volumes(&self, window: TimeWindow) -> Vec<VolumeRow> {
        let mut groups: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
        for record in self.in_window(Some(window)) {
            let metric = i64::try_from(record.volume_metric()).unwrap_or(i64::MAX);
            let entry = groups.entry(record.client_ip.as_str()).or_default();
            entry.0 += 1;
            entry.1 = entry.1.saturating_add(metric);
        }

        let mut rows: Vec<VolumeRow> = groups
            .into_iter()
            .filter(|&(_, (count, _))| count > VOLUMETRIC_REQUEST_THRESHOLD)
            .map(|(ip, (request_count, metric_total))| VolumeRow {
                client_ip: ip.to_string(),
                request_count,
                metric_total,
            })
            .collect();
        // Stable sort over BTreeMap order: ties stay ordered by client_ip.
        rows.sort_by_key(|row| Reverse(row.request_count));
        rows
    }
}

/// A [`LogStore`] held entirely in memory.
///
/// Tables exist only after [`LogStore::ensure_schema`], like their
/// PostgreSQL counterparts.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    tables: Mutex<HashMap<FormatVariant, Table>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FormatVariant, Table>> {
        // Every mutation is a single insert, so a poisoned map is still whole.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn missing(variant: FormatVariant) -> StoreError {
    StoreError::SchemaMissing(variant.table_name().to_string())
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn ensure_schema(&self, variant: FormatVariant) -> Result<(), StoreError> {
        self.lock().entry(variant).or_default();
        Ok(())
    }

    async fn has_table(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.lock().keys().any(|v| v.table_name() == name))
    }

    async fn exists(&self, variant: FormatVariant, key: &NaturalKey) -> Result<bool, StoreError> {
        let tables = self.lock();
        let table = tables.get(&variant).ok_or_else(|| missing(variant))?;
        Ok(table.keys.contains(key))
    }

    async fn existing_keys(
        &self,
        variant: FormatVariant,
        keys: &[NaturalKey],
    ) -> Result<HashSet<NaturalKey>, StoreError> {
        let tables = self.lock();
        let table = tables.get(&variant).ok_or_else(|| missing(variant))?;
        Ok(keys.iter().filter(|k| table.keys.contains(*k)).cloned().collect())
    }

    async fn insert(&self, record: &Record) -> Result<(), StoreError> {
        let variant = record.variant();
        let mut tables = self.lock();
        let table = tables.get_mut(&variant).ok_or_else(|| missing(variant))?;
        match table.insert(record) {
            InsertOutcome::Inserted => Ok(()),
            InsertOutcome::SkippedDuplicate => Err(StoreError::DuplicateKey),
        }
    }

    async fn insert_batch(&self, records: &[Record]) -> Result<Vec<InsertOutcome>, StoreError> {
        let Some(first) = records.first() else {
            return Ok(Vec::new());
        };
        let variant = first.variant();
        if records.iter().any(|r| r.variant() != variant) {
            return Err(StoreError::Backend(
                "Batch mixes records of different format variants".to_string(),
            ));
        }

        let mut tables = self.lock();
        let table = tables.get_mut(&variant).ok_or_else(|| missing(variant))?;
        Ok(records.iter().map(|r| table.insert(r)).collect())
    }

    async fn count(&self, variant: FormatVariant) -> Result<i64, StoreError> {
        let tables = self.lock();
        let table = tables.get(&variant).ok_or_else(|| missing(variant))?;
        Ok(table.rows.len() as i64)
    }

    async fn run_query(
        &self,
        variant: FormatVariant,
        query: CatalogQuery,
        window: Option<TimeWindow>,
    ) -> Result<QueryResult, QueryError> {
        let window = query.effective_window(window, Utc::now());
        let tables = self.lock();
        let table = tables
            .get(&variant)
            .ok_or_else(|| QueryError::execution(query, missing(variant).to_string()))?;

        match (query, window) {
            (CatalogQuery::VolumetricAnomaly, Some(window)) => {
                Ok(QueryResult::from_volumes(variant, table.volumes(window)))
            }
            (CatalogQuery::VolumetricAnomaly, None) => {
                Err(QueryError::execution(query, "volumetric query requires a window"))
            }
            _ => Ok(QueryResult::from_events(query, variant, table.events(query, window))),
        }
    }
}
