//! Format variants: the two positional layouts an access-log file may use.
//!
//! The active variant is always chosen by the caller. [`FormatVariant::detect`]
//! exists only as a documented fallback for `--variant auto`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::schema;

/// Byte-metrics table name.
pub const BYTE_METRICS_TABLE: &str = "iis_logs";

/// Timing-metrics table name.
pub const TIMING_METRICS_TABLE: &str = "iis_timing_logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatVariant {
    /// `timestamp client_ip username method uri_path uri_query status_code
    /// bytes_sent bytes_received user_agent`
    ByteMetrics,
    /// `date time server_ip method uri_path uri_query server_port username
    /// client_ip user_agent status_code sub_status win32_status time_taken_ms`
    TimingMetrics,
}

impl FormatVariant {
    pub const ALL: [FormatVariant; 2] = [Self::ByteMetrics, Self::TimingMetrics];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ByteMetrics => "byte-metrics",
            Self::TimingMetrics => "timing-metrics",
        }
    }

    /// Table holding records of this variant.
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::ByteMetrics => BYTE_METRICS_TABLE,
            Self::TimingMetrics => TIMING_METRICS_TABLE,
        }
    }

    /// Number of whitespace-separated tokens a line of this variant has.
    pub fn token_count(&self) -> usize {
        schema::fields(*self).len()
    }

    /// Guess the variant of a data line from its token count.
    ///
    /// Rule: exactly 10 tokens is byte-metrics, exactly 14 is timing-metrics,
    /// anything else is undecidable. Comment and blank lines are undecidable.
    pub fn detect(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(crate::parser::COMMENT_MARKER) {
            return None;
        }
        let count = line.split_whitespace().count();
        Self::ALL.into_iter().find(|v| v.token_count() == count)
    }
}

impl std::fmt::Display for FormatVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatVariant {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" | "bytes" | "byte-metrics" => Ok(Self::ByteMetrics),
            "b" | "timing" | "timing-metrics" => Ok(Self::TimingMetrics),
            other => Err(CoreError::Validation(format!(
                "Invalid format variant '{other}'. Must be one of: byte-metrics, timing-metrics"
            ))),
        }
    }
}
