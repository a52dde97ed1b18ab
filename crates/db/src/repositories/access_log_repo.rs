//! Repository for the `iis_logs` and `iis_timing_logs` tables.
//!
//! Table and column names come from [`FormatVariant`] and compile-time
//! constants only. Every value taken from a log line is a bound parameter.

use futures::TryStreamExt;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::{PgConnection, PgPool, Postgres};

use logwarden_core::catalog::{
    CatalogQuery, EventRow, TimeWindow, VolumeRow, ADMIN_PATH_PREFIXES, CREDENTIAL_PATH_PREFIXES,
    FAILED_LOGIN_STATUSES, SUSPICIOUS_QUERY_CHARS, VOLUMETRIC_REQUEST_THRESHOLD,
};
use logwarden_core::record::{NaturalKey, Record, VariantFields};
use logwarden_core::types::{DbId, Timestamp};
use logwarden_core::variant::FormatVariant;

use crate::models::access_log::{CatalogEventRow, KeyRow, StoredAccessLog, VolumeAggregateRow};

// ---------------------------------------------------------------------------
// Column lists
// ---------------------------------------------------------------------------

/// Column list for byte-metrics INSERT, in bind order.
const BYTE_INSERT_COLUMNS: &str = "\
    log_time, client_ip, username, http_method, uri_path, uri_query, \
    status_code, bytes_sent, bytes_received, user_agent";

/// Column list for timing-metrics INSERT, in bind order.
const TIMING_INSERT_COLUMNS: &str = "\
    log_time, server_ip, http_method, uri_path, uri_query, server_port, \
    username, client_ip, user_agent, status_code, sub_status, win32_status, \
    time_taken_ms";

/// Column list for [`StoredAccessLog`] SELECT queries.
const STORED_COLUMNS: &str = "\
    id, log_time, client_ip, username, http_method, uri_path, uri_query, \
    status_code, user_agent, created_at";

/// Column list for [`CatalogEventRow`] SELECT queries.
const EVENT_COLUMNS: &str = "log_time, client_ip, username, uri_path, uri_query, status_code";

/// Upper bound on rows in one multi-row INSERT, well under the 65535
/// bind-parameter limit for either variant.
pub const MAX_ROWS_PER_STATEMENT: usize = 1000;

fn insert_columns(variant: FormatVariant) -> (&'static str, usize) {
    match variant {
        FormatVariant::ByteMetrics => (BYTE_INSERT_COLUMNS, 10),
        FormatVariant::TimingMetrics => (TIMING_INSERT_COLUMNS, 13),
    }
}

/// Columns of the natural-key unique index.
fn conflict_target(variant: FormatVariant) -> &'static str {
    match variant {
        FormatVariant::ByteMetrics => "(log_time, uri_path, client_ip)",
        FormatVariant::TimingMetrics => "(log_time, server_ip, uri_path, client_ip)",
    }
}

/// Natural-key columns shaped as a [`KeyRow`].
fn key_columns(variant: FormatVariant) -> &'static str {
    match variant {
        FormatVariant::ByteMetrics => "log_time, NULL::TEXT AS server_ip, uri_path, client_ip",
        FormatVariant::TimingMetrics => "log_time, server_ip, uri_path, client_ip",
    }
}

/// Column summed by the volumetric query.
fn volume_metric_column(variant: FormatVariant) -> &'static str {
    match variant {
        FormatVariant::ByteMetrics => "bytes_sent",
        FormatVariant::TimingMetrics => "time_taken_ms",
    }
}

// ---------------------------------------------------------------------------
// AccessLogRepo
// ---------------------------------------------------------------------------

/// Provides insert, lookup and catalog queries for access log records.
pub struct AccessLogRepo;

impl AccessLogRepo {
    /// Whether a table with this name exists in the current schema.
    pub async fn has_table(pool: &PgPool, name: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (\
                SELECT 1 FROM information_schema.tables \
                WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(name)
        .fetch_one(pool)
        .await
    }

    /// Count stored records of one variant.
    pub async fn count(pool: &PgPool, variant: FormatVariant) -> Result<i64, sqlx::Error> {
        let query = format!("SELECT COUNT(*)::BIGINT FROM {}", variant.table_name());
        sqlx::query_scalar::<_, i64>(&query).fetch_one(pool).await
    }

    /// Whether a record with this natural key has been committed.
    pub async fn exists(
        pool: &PgPool,
        variant: FormatVariant,
        key: &NaturalKey,
    ) -> Result<bool, sqlx::Error> {
        let table = variant.table_name();
        match variant {
            FormatVariant::ByteMetrics => {
                let query = format!(
                    "SELECT EXISTS (SELECT 1 FROM {table} \
                     WHERE log_time = $1 AND uri_path = $2 AND client_ip = $3)"
                );
                sqlx::query_scalar::<_, bool>(&query)
                    .bind(key.timestamp)
                    .bind(&key.uri_path)
                    .bind(&key.client_ip)
                    .fetch_one(pool)
                    .await
            }
            FormatVariant::TimingMetrics => {
                let query = format!(
                    "SELECT EXISTS (SELECT 1 FROM {table} \
                     WHERE log_time = $1 AND server_ip = $2 AND uri_path = $3 AND client_ip = $4)"
                );
                sqlx::query_scalar::<_, bool>(&query)
                    .bind(key.timestamp)
                    .bind(key.server_ip.as_deref())
                    .bind(&key.uri_path)
                    .bind(&key.client_ip)
                    .fetch_one(pool)
                    .await
            }
        }
    }

    /// Return the natural keys among `keys` that are already stored.
    ///
    /// One round trip: the candidate keys travel as parallel arrays and are
    /// joined with `UNNEST`.
    pub async fn existing_keys(
        pool: &PgPool,
        variant: FormatVariant,
        keys: &[NaturalKey],
    ) -> Result<Vec<KeyRow>, sqlx::Error> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let times: Vec<Timestamp> = keys.iter().map(|k| k.timestamp).collect();
        let paths: Vec<String> = keys.iter().map(|k| k.uri_path.clone()).collect();
        let clients: Vec<String> = keys.iter().map(|k| k.client_ip.clone()).collect();
        let table = variant.table_name();
        let columns = key_columns(variant);

        match variant {
            FormatVariant::ByteMetrics => {
                let query = format!(
                    "SELECT {columns} FROM {table} \
                     WHERE (log_time, uri_path, client_ip) IN (\
                        SELECT * FROM UNNEST($1::timestamptz[], $2::text[], $3::text[]))"
                );
                sqlx::query_as::<_, KeyRow>(&query)
                    .bind(times)
                    .bind(paths)
                    .bind(clients)
                    .fetch_all(pool)
                    .await
            }
            FormatVariant::TimingMetrics => {
                let servers: Vec<String> = keys
                    .iter()
                    .map(|k| k.server_ip.clone().unwrap_or_default())
                    .collect();
                let query = format!(
                    "SELECT {columns} FROM {table} \
                     WHERE (log_time, server_ip, uri_path, client_ip) IN (\
                        SELECT * FROM UNNEST($1::timestamptz[], $2::text[], $3::text[], $4::text[]))"
                );
                sqlx::query_as::<_, KeyRow>(&query)
                    .bind(times)
                    .bind(servers)
                    .bind(paths)
                    .bind(clients)
                    .fetch_all(pool)
                    .await
            }
        }
    }

    /// Insert one record unless its natural key is taken.
    ///
    /// Returns the new row id, or `None` when the unique index rejected it.
    pub async fn insert(pool: &PgPool, record: &Record) -> Result<Option<DbId>, sqlx::Error> {
        let variant = record.variant();
        let (columns, count) = insert_columns(variant);
        let placeholders = placeholder_group(1, count);
        let query = format!(
            "INSERT INTO {} ({columns}) VALUES {placeholders} \
             ON CONFLICT {} DO NOTHING RETURNING id",
            variant.table_name(),
            conflict_target(variant),
        );

        let q = bind_record(sqlx::query_as::<_, (DbId,)>(&query), record);
        Ok(q.fetch_optional(pool).await?.map(|(id,)| id))
    }

    /// Batch insert records of one variant.
    ///
    /// Uses multi-row INSERTs of at most [`MAX_ROWS_PER_STATEMENT`] rows with
    /// `ON CONFLICT DO NOTHING`, and returns the natural keys of the rows
    /// actually written. Callers run this inside a transaction.
    pub async fn insert_batch(
        conn: &mut PgConnection,
        variant: FormatVariant,
        records: &[&Record],
    ) -> Result<Vec<KeyRow>, sqlx::Error> {
        let mut inserted = Vec::with_capacity(records.len());
        let (columns, count) = insert_columns(variant);

        for chunk in records.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query = format!("INSERT INTO {} ({columns}) VALUES ", variant.table_name());
            let mut param_idx = 1usize;
            for (i, _) in chunk.iter().enumerate() {
                if i > 0 {
                    query.push_str(", ");
                }
                query.push_str(&placeholder_group(param_idx, count));
                param_idx += count;
            }
            query.push_str(&format!(
                " ON CONFLICT {} DO NOTHING RETURNING {}",
                conflict_target(variant),
                key_columns(variant),
            ));

            let mut q = sqlx::query_as::<_, KeyRow>(&query);
            for record in chunk {
                q = bind_record(q, record);
            }
            inserted.extend(q.fetch_all(&mut *conn).await?);
        }

        Ok(inserted)
    }

    /// Find a stored record by natural key.
    pub async fn find_by_key(
        pool: &PgPool,
        variant: FormatVariant,
        key: &NaturalKey,
    ) -> Result<Option<StoredAccessLog>, sqlx::Error> {
        let table = variant.table_name();
        let query = format!(
            "SELECT {STORED_COLUMNS} FROM {table} \
             WHERE log_time = $1 AND uri_path = $2 AND client_ip = $3 \
               AND ($4::text IS NULL OR {server_ip_column} = $4)",
            server_ip_column = match variant {
                FormatVariant::ByteMetrics => "NULL",
                FormatVariant::TimingMetrics => "server_ip",
            },
        );
        sqlx::query_as::<_, StoredAccessLog>(&query)
            .bind(key.timestamp)
            .bind(&key.uri_path)
            .bind(&key.client_ip)
            .bind(key.server_ip.as_deref())
            .fetch_optional(pool)
            .await
    }

    // -----------------------------------------------------------------------
    // Catalog queries
    // -----------------------------------------------------------------------

    /// Evaluate an event-listing catalog query, newest first.
    ///
    /// The volumetric query is not an event listing; asking for it here
    /// returns no rows.
    pub async fn list_events(
        pool: &PgPool,
        variant: FormatVariant,
        query: CatalogQuery,
        window: Option<TimeWindow>,
    ) -> Result<Vec<EventRow>, sqlx::Error> {
        let table = variant.table_name();
        let window_clause = "($1::timestamptz IS NULL OR log_time >= $1) \
                             AND ($2::timestamptz IS NULL OR log_time <= $2)";
        let from = window.map(|w| w.from);
        let to = window.and_then(|w| w.to);

        match query {
            CatalogQuery::FailedLogins => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM {table} \
                     WHERE {window_clause} AND status_code = ANY($3) \
                     ORDER BY log_time DESC, id DESC"
                );
                let statuses: Vec<i32> = FAILED_LOGIN_STATUSES.iter().map(|s| i32::from(*s)).collect();
                fetch_events(sqlx::query_as(&sql).bind(from).bind(to).bind(statuses), pool).await
            }
            CatalogQuery::SuspiciousRequests => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM {table} \
                     WHERE {window_clause} AND uri_query LIKE ANY($3) \
                     ORDER BY log_time DESC, id DESC"
                );
                let patterns: Vec<String> = SUSPICIOUS_QUERY_CHARS
                    .iter()
                    .map(|c| format!("%{}%", like_escape(&c.to_string())))
                    .collect();
                fetch_events(sqlx::query_as(&sql).bind(from).bind(to).bind(patterns), pool).await
            }
            CatalogQuery::AdminAccess | CatalogQuery::PhishingPaths => {
                let prefixes: &[&str] = if query == CatalogQuery::AdminAccess {
                    &ADMIN_PATH_PREFIXES
                } else {
                    &CREDENTIAL_PATH_PREFIXES
                };
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM {table} \
                     WHERE {window_clause} AND uri_path LIKE ANY($3) \
                     ORDER BY log_time DESC, id DESC"
                );
                let patterns: Vec<String> =
                    prefixes.iter().map(|p| format!("{}%", like_escape(p))).collect();
                fetch_events(sqlx::query_as(&sql).bind(from).bind(to).bind(patterns), pool).await
            }
            CatalogQuery::VolumetricAnomaly => Ok(Vec::new()),
        }
    }

    /// Per-client request counts inside `window`, for clients above the
    /// volumetric threshold, busiest first.
    pub async fn volume_by_client(
        pool: &PgPool,
        variant: FormatVariant,
        window: TimeWindow,
    ) -> Result<Vec<VolumeRow>, sqlx::Error> {
        let query = format!(
            "SELECT client_ip, COUNT(*)::BIGINT AS request_count, \
                    COALESCE(SUM({metric}), 0)::BIGINT AS metric_total \
             FROM {table} \
             WHERE log_time >= $1 AND ($2::timestamptz IS NULL OR log_time <= $2) \
             GROUP BY client_ip \
             HAVING COUNT(*) > $3 \
             ORDER BY request_count DESC, client_ip ASC",
            metric = volume_metric_column(variant),
            table = variant.table_name(),
        );
        sqlx::query_as::<_, VolumeAggregateRow>(&query)
            .bind(window.from)
            .bind(window.to)
            .bind(VOLUMETRIC_REQUEST_THRESHOLD)
            .fetch(pool)
            .map_ok(VolumeRow::from)
            .try_collect()
            .await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn fetch_events(
    q: QueryAs<'_, Postgres, CatalogEventRow, PgArguments>,
    pool: &PgPool,
) -> Result<Vec<EventRow>, sqlx::Error> {
    q.fetch(pool).map_ok(EventRow::from).try_collect().await
}

/// `($start, $start+1, ...)` with `count` placeholders.
fn placeholder_group(start: usize, count: usize) -> String {
    let params: Vec<String> = (start..start + count).map(|i| format!("${i}")).collect();
    format!("({})", params.join(", "))
}

/// Escape `LIKE` metacharacters so a literal matches itself.
fn like_escape(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Counters are validated to fit `BIGINT` when parsed.
fn to_bigint(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Bind a record's values in the variant's INSERT column order.
fn bind_record<'q, O>(
    q: QueryAs<'q, Postgres, O, PgArguments>,
    record: &'q Record,
) -> QueryAs<'q, Postgres, O, PgArguments> {
    match &record.metrics {
        VariantFields::ByteMetrics {
            bytes_sent,
            bytes_received,
        } => q
            .bind(record.timestamp)
            .bind(&record.client_ip)
            .bind(record.username.as_deref())
            .bind(&record.http_method)
            .bind(&record.uri_path)
            .bind(&record.uri_query)
            .bind(i32::from(record.status_code))
            .bind(to_bigint(*bytes_sent))
            .bind(to_bigint(*bytes_received))
            .bind(&record.user_agent),
        VariantFields::TimingMetrics {
            server_ip,
            server_port,
            sub_status,
            win32_status,
            time_taken_ms,
        } => q
            .bind(record.timestamp)
            .bind(server_ip)
            .bind(&record.http_method)
            .bind(&record.uri_path)
            .bind(&record.uri_query)
            .bind(i32::from(*server_port))
            .bind(record.username.as_deref())
            .bind(&record.client_ip)
            .bind(&record.user_agent)
            .bind(i32::from(record.status_code))
            .bind(i64::from(*sub_status))
            .bind(i64::from(*win32_status))
            .bind(to_bigint(*time_taken_ms)),
    }
}
