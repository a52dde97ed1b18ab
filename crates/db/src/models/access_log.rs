//! Access log row models.

use logwarden_core::catalog::{EventRow, VolumeRow};
use logwarden_core::record::NaturalKey;
use logwarden_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// The natural-key columns of a stored record.
///
/// `server_ip` is `NULL` for byte-metrics rows.
#[derive(Debug, Clone, FromRow)]
pub struct KeyRow {
    pub log_time: Timestamp,
    pub server_ip: Option<String>,
    pub uri_path: String,
    pub client_ip: String,
}

impl From<KeyRow> for NaturalKey {
    fn from(row: KeyRow) -> Self {
        Self {
            timestamp: row.log_time,
            server_ip: row.server_ip,
            uri_path: row.uri_path,
            client_ip: row.client_ip,
        }
    }
}

/// Columns shared by every event-listing catalog query.
#[derive(Debug, Clone, FromRow)]
pub struct CatalogEventRow {
    pub log_time: Timestamp,
    pub client_ip: String,
    pub username: Option<String>,
    pub uri_path: String,
    pub uri_query: String,
    pub status_code: i32,
}

impl From<CatalogEventRow> for EventRow {
    fn from(row: CatalogEventRow) -> Self {
        Self {
            timestamp: row.log_time,
            client_ip: row.client_ip,
            username: row.username,
            uri_path: row.uri_path,
            uri_query: row.uri_query,
            status_code: row.status_code,
        }
    }
}

/// One group of the volumetric aggregate.
#[derive(Debug, Clone, FromRow)]
pub struct VolumeAggregateRow {
    pub client_ip: String,
    pub request_count: i64,
    pub metric_total: i64,
}

impl From<VolumeAggregateRow> for VolumeRow {
    fn from(row: VolumeAggregateRow) -> Self {
        Self {
            client_ip: row.client_ip,
            request_count: row.request_count,
            metric_total: row.metric_total,
        }
    }
}

/// A full stored row, common columns only. Used for inspection and tests.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StoredAccessLog {
    pub id: DbId,
    pub log_time: Timestamp,
    pub client_ip: String,
    pub username: Option<String>,
    pub http_method: String,
    pub uri_path: String,
    pub uri_query: String,
    pub status_code: i32,
    pub user_agent: String,
    pub created_at: Timestamp,
}
