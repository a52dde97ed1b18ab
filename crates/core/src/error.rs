use serde::Serialize;

use crate::catalog::CatalogQuery;
use crate::variant::FormatVariant;

/// General validation failures for user-supplied settings (variant names,
/// query names, time windows).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Line-level parse failures
// ---------------------------------------------------------------------------

/// Why a single log line could not be turned into a record.
///
/// Both variants are recovered locally by the ingestion pipeline: the line is
/// recorded in the run report and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseError {
    #[error("Expected {expected} fields for {variant} but found {found}")]
    FieldCountMismatch {
        variant: FormatVariant,
        expected: usize,
        found: usize,
    },

    #[error("Field '{field}' has invalid value '{token}': {reason}")]
    FieldTypeError {
        field: &'static str,
        token: String,
        reason: String,
    },

    /// Variant auto-detection could not classify the line.
    #[error("Cannot detect the format variant from a line of {found} fields")]
    UndetectedVariant { found: usize },
}

impl ParseError {
    pub(crate) fn field(field: &'static str, token: &str, reason: impl Into<String>) -> Self {
        Self::FieldTypeError {
            field,
            token: token.to_string(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store failures
// ---------------------------------------------------------------------------

/// Failures reported by a [`LogStore`](crate::store::LogStore) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A record with the same natural key is already stored. Callers map
    /// this to a skipped duplicate, never to a failure.
    #[error("Record with the same natural key already exists")]
    DuplicateKey,

    /// The store did not answer within the caller's bound.
    #[error("Store operation timed out")]
    Timeout,

    /// The table backing a format variant does not exist.
    #[error("Table '{0}' is missing")]
    SchemaMissing(String),

    /// Any other backend failure (connection loss, I/O, ...).
    #[error("Store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Backend(_))
    }
}

// ---------------------------------------------------------------------------
// Query failures
// ---------------------------------------------------------------------------

/// A catalog query could not be answered. Affects only that query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("Query '{query}' failed: {message}")]
    Execution {
        query: CatalogQuery,
        message: String,
    },

    #[error("Query '{query}' timed out")]
    Timeout { query: CatalogQuery },
}

impl QueryError {
    pub fn execution(query: CatalogQuery, message: impl Into<String>) -> Self {
        Self::Execution {
            query,
            message: message.into(),
        }
    }
}
