//! PostgreSQL implementation of [`LogStore`].

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use logwarden_core::catalog::{CatalogQuery, QueryResult, TimeWindow};
use logwarden_core::error::{QueryError, StoreError};
use logwarden_core::record::{NaturalKey, Record};
use logwarden_core::store::{InsertOutcome, LogStore};
use logwarden_core::variant::FormatVariant;

use crate::repositories::AccessLogRepo;
use crate::DbPool;

/// PostgreSQL SQLSTATE for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

/// Record store backed by a connection pool.
///
/// The natural-key unique indexes created by the migrations are the only
/// authority on duplicates; the existence checks are advisory.
#[derive(Debug, Clone)]
pub struct PgLogStore {
    pool: DbPool,
}

impl PgLogStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Classify a sqlx error into the store taxonomy.
///
/// - Unique violations (SQLSTATE 23505) map to [`StoreError::DuplicateKey`].
/// - Pool acquisition timeouts map to [`StoreError::Timeout`].
/// - Everything else is a backend failure.
pub fn classify_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            StoreError::DuplicateKey
        }
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        other => StoreError::Backend(other.to_string()),
    }
}

/// Map per-record outcomes from the set of keys the database accepted.
///
/// The first record carrying an accepted key is the inserted one; anything
/// else is a duplicate (of a stored row or of an earlier batch member).
fn outcomes_from_inserted(records: &[Record], inserted: HashSet<NaturalKey>) -> Vec<InsertOutcome> {
    let mut inserted = inserted;
    records
        .iter()
        .map(|record| {
            if inserted.remove(&record.natural_key()) {
                InsertOutcome::Inserted
            } else {
                InsertOutcome::SkippedDuplicate
            }
        })
        .collect()
}

#[async_trait]
impl LogStore for PgLogStore {
    async fn ensure_schema(&self, variant: FormatVariant) -> Result<(), StoreError> {
        crate::run_migrations(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if self.has_table(variant.table_name()).await? {
            tracing::debug!(%variant, table = variant.table_name(), "Schema verified");
            Ok(())
        } else {
            Err(StoreError::SchemaMissing(variant.table_name().to_string()))
        }
    }

    async fn has_table(&self, name: &str) -> Result<bool, StoreError> {
        AccessLogRepo::has_table(&self.pool, name)
            .await
            .map_err(classify_sqlx_error)
    }

    async fn exists(&self, variant: FormatVariant, key: &NaturalKey) -> Result<bool, StoreError> {
        AccessLogRepo::exists(&self.pool, variant, key)
            .await
            .map_err(classify_sqlx_error)
    }

    async fn existing_keys(
        &self,
        variant: FormatVariant,
        keys: &[NaturalKey],
    ) -> Result<HashSet<NaturalKey>, StoreError> {
        let rows = AccessLogRepo::existing_keys(&self.pool, variant, keys)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(rows.into_iter().map(NaturalKey::from).collect())
    }

    async fn insert(&self, record: &Record) -> Result<(), StoreError> {
        match AccessLogRepo::insert(&self.pool, record).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(StoreError::DuplicateKey),
            Err(e) => Err(classify_sqlx_error(e)),
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

        // Only the first record per key is sent; the rest are duplicates
        // within the batch and would be rejected anyway.
        let mut seen: HashSet<NaturalKey> = HashSet::with_capacity(records.len());
        let unique: Vec<&Record> = records
            .iter()
            .filter(|r| seen.insert(r.natural_key()))
            .collect();

        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;
        let rows = AccessLogRepo::insert_batch(&mut *tx, variant, &unique)
            .await
            .map_err(classify_sqlx_error)?;
        tx.commit().await.map_err(classify_sqlx_error)?;

        let inserted: HashSet<NaturalKey> = rows.into_iter().map(NaturalKey::from).collect();
        tracing::debug!(
            %variant,
            offered = records.len(),
            inserted = inserted.len(),
            "Batch committed"
        );
        Ok(outcomes_from_inserted(records, inserted))
    }

    async fn count(&self, variant: FormatVariant) -> Result<i64, StoreError> {
        AccessLogRepo::count(&self.pool, variant)
            .await
            .map_err(classify_sqlx_error)
    }

    async fn run_query(
        &self,
        variant: FormatVariant,
        query: CatalogQuery,
        window: Option<TimeWindow>,
    ) -> Result<QueryResult, QueryError> {
        let window = query.effective_window(window, Utc::now());
        let to_query_error = |e: sqlx::Error| QueryError::execution(query, e.to_string());

        match (query, window) {
            (CatalogQuery::VolumetricAnomaly, Some(window)) => {
                let volumes = AccessLogRepo::volume_by_client(&self.pool, variant, window)
                    .await
                    .map_err(to_query_error)?;
                Ok(QueryResult::from_volumes(variant, volumes))
            }
            (CatalogQuery::VolumetricAnomaly, None) => {
                Err(QueryError::execution(query, "volumetric query requires a window"))
            }
            _ => {
                let events = AccessLogRepo::list_events(&self.pool, variant, query, window)
                    .await
                    .map_err(to_query_error)?;
                Ok(QueryResult::from_events(query, variant, events))
            }
        }
    }
}
