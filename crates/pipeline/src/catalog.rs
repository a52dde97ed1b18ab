//! Catalog execution: run queries against a store with a time bound each.
//!
//! A failed or timed-out query yields an empty result together with its
//! error. Other queries are unaffected.

use std::time::Duration;

use futures::future::join_all;
use logwarden_core::catalog::{CatalogQuery, QueryResult, TimeWindow};
use logwarden_core::error::QueryError;
use logwarden_core::store::LogStore;
use logwarden_core::variant::FormatVariant;

/// Outcome of one catalog query.
#[derive(Debug, Clone)]
pub struct CatalogRun {
    pub query: CatalogQuery,
    pub result: QueryResult,
    /// Set when the query failed; `result` is then empty.
    pub error: Option<QueryError>,
}

impl CatalogRun {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Export name of the result.
    pub fn name(&self) -> &'static str {
        self.query.export_name()
    }
}

/// Run one catalog query, bounded by `timeout`.
pub async fn execute<S: LogStore + ?Sized>(
    store: &S,
    variant: FormatVariant,
    query: CatalogQuery,
    window: Option<TimeWindow>,
    timeout: Duration,
) -> CatalogRun {
    let outcome = tokio::time::timeout(timeout, store.run_query(variant, query, window))
        .await
        .unwrap_or(Err(QueryError::Timeout { query }));

    match outcome {
        Ok(result) => {
            tracing::info!(%query, %variant, rows = result.len(), "Catalog query complete");
            CatalogRun {
                query,
                result,
                error: None,
            }
        }
        Err(e) => {
            tracing::error!(%query, %variant, error = %e, "Catalog query failed");
            CatalogRun {
                query,
                result: QueryResult::empty(query, variant),
                error: Some(e),
            }
        }
    }
}

/// Run several catalog queries concurrently. Results keep the order of
/// `queries`.
pub async fn execute_all<S: LogStore + ?Sized>(
    store: &S,
    variant: FormatVariant,
    queries: &[CatalogQuery],
    window: Option<TimeWindow>,
    timeout: Duration,
) -> Vec<CatalogRun> {
    join_all(
        queries
            .iter()
            .map(|&query| execute(store, variant, query, window, timeout)),
    )
    .await
}
