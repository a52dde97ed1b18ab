//! The normalized log record and its natural key.

use serde::Serialize;

use crate::error::ParseError;
use crate::schema::{self, DecodedFields};
use crate::types::Timestamp;
use crate::variant::FormatVariant;

/// One normalized log event.
///
/// Records are built once by the line parser and never mutated afterwards;
/// the deduplication gate alone decides whether one is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub timestamp: Timestamp,
    pub client_ip: String,
    /// `None` for anonymous requests.
    pub username: Option<String>,
    pub http_method: String,
    pub uri_path: String,
    /// Empty when the request had no query string.
    pub uri_query: String,
    pub status_code: u16,
    pub user_agent: String,
    pub metrics: VariantFields,
}

/// Fields that exist in only one format variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "variant", rename_all = "kebab-case")]
pub enum VariantFields {
    ByteMetrics {
        bytes_sent: u64,
        bytes_received: u64,
    },
    TimingMetrics {
        server_ip: String,
        server_port: u16,
        sub_status: u32,
        win32_status: u32,
        time_taken_ms: u64,
    },
}

/// Identity of a log event for deduplication.
///
/// `server_ip` is only part of the key for timing-metrics records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NaturalKey {
    pub timestamp: Timestamp,
    pub server_ip: Option<String>,
    pub uri_path: String,
    pub client_ip: String,
}

impl Record {
    /// Build a record from the tokens of one line, already split and counted.
    pub(crate) fn from_tokens(variant: FormatVariant, tokens: &[&str]) -> Result<Self, ParseError> {
        let mut f = DecodedFields::decode(schema::fields(variant), tokens)?;
        match variant {
            FormatVariant::ByteMetrics => Ok(Self {
                timestamp: f.timestamp()?,
                client_ip: f.text()?,
                username: f.optional_text()?,
                http_method: f.text()?,
                uri_path: f.text()?,
                uri_query: f.text()?,
                status_code: f.status()?,
                metrics: VariantFields::ByteMetrics {
                    bytes_sent: f.counter()?,
                    bytes_received: f.counter()?,
                },
                user_agent: f.text()?,
            }),
            FormatVariant::TimingMetrics => {
                let timestamp = schema::combine_date_time(f.date()?, f.time()?);
                let server_ip = f.text()?;
                let http_method = f.text()?;
                let uri_path = f.text()?;
                let uri_query = f.text()?;
                let server_port = f.port()?;
                let username = f.optional_text()?;
                let client_ip = f.text()?;
                let user_agent = f.text()?;
                let status_code = f.status()?;
                Ok(Self {
                    timestamp,
                    client_ip,
                    username,
                    http_method,
                    uri_path,
                    uri_query,
                    status_code,
                    user_agent,
                    metrics: VariantFields::TimingMetrics {
                        server_ip,
                        server_port,
                        sub_status: f.code()?,
                        win32_status: f.code()?,
                        time_taken_ms: f.counter()?,
                    },
                })
            }
        }
    }

    pub fn variant(&self) -> FormatVariant {
        match self.metrics {
            VariantFields::ByteMetrics { .. } => FormatVariant::ByteMetrics,
            VariantFields::TimingMetrics { .. } => FormatVariant::TimingMetrics,
        }
    }

    pub fn server_ip(&self) -> Option<&str> {
        match &self.metrics {
            VariantFields::ByteMetrics { .. } => None,
            VariantFields::TimingMetrics { server_ip, .. } => Some(server_ip),
        }
    }

    /// The value summed by the volumetric query: bytes sent for
    /// byte-metrics, time taken for timing-metrics.
    pub fn volume_metric(&self) -> u64 {
        match self.metrics {
            VariantFields::ByteMetrics { bytes_sent, .. } => bytes_sent,
            VariantFields::TimingMetrics { time_taken_ms, .. } => time_taken_ms,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            timestamp: self.timestamp,
            server_ip: self.server_ip().map(str::to_string),
            uri_path: self.uri_path.clone(),
            client_ip: self.client_ip.clone(),
        }
    }
}
