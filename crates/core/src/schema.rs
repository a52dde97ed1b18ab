//! Positional field layouts and per-field decoders (the record schema).
//!
//! Each format variant exposes an ordered list of [`FieldSpec`]s. A spec
//! decodes one raw token into a typed [`FieldValue`], applying that field's
//! validation rules. Decoders never panic; every failure is a
//! [`ParseError::FieldTypeError`] naming the field and the offending token.

use std::net::IpAddr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SubsecRound, Utc};

use crate::error::ParseError;
use crate::types::Timestamp;
use crate::variant::FormatVariant;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Placeholder IIS writes for an empty field.
pub const EMPTY_PLACEHOLDER: &str = "-";

/// Lowest valid HTTP status code.
pub const MIN_STATUS_CODE: u16 = 100;

/// Highest valid HTTP status code.
pub const MAX_STATUS_CODE: u16 = 599;

/// Longest accepted HTTP method token.
pub const MAX_METHOD_LEN: usize = 16;

/// Stored timestamps keep microsecond precision (the PostgreSQL limit).
const TIMESTAMP_PRECISION_DIGITS: u16 = 6;

const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";

// ---------------------------------------------------------------------------
// Field kinds and specs
// ---------------------------------------------------------------------------

/// The declared type of a positional field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Combined date and time in one token.
    Timestamp,
    Date,
    Time,
    /// IPv4 or IPv6 textual address.
    IpAddr,
    /// User name, `-` for anonymous.
    Username,
    Method,
    Text,
    /// Query string, `-` for none.
    Query,
    /// HTTP status code, 100-599.
    Status,
    /// TCP port, 0-65535.
    Port,
    /// IIS sub-status or Win32 status code.
    Code,
    /// Non-negative counter that must fit a signed 64-bit column.
    Counter,
}

/// One positional field of a format variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// A decoded, validated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Timestamp(Timestamp),
    Date(NaiveDate),
    Time(NaiveTime),
    Text(String),
    OptionalText(Option<String>),
    Status(u16),
    Port(u16),
    Code(u32),
    Counter(u64),
}

const fn spec(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind }
}

/// Layout of the byte-metrics variant.
pub const BYTE_METRICS_FIELDS: &[FieldSpec] = &[
    spec("timestamp", FieldKind::Timestamp),
    spec("client_ip", FieldKind::IpAddr),
    spec("username", FieldKind::Username),
    spec("http_method", FieldKind::Method),
    spec("uri_path", FieldKind::Text),
    spec("uri_query", FieldKind::Query),
    spec("status_code", FieldKind::Status),
    spec("bytes_sent", FieldKind::Counter),
    spec("bytes_received", FieldKind::Counter),
    spec("user_agent", FieldKind::Text),
];

/// Layout of the timing-metrics variant.
pub const TIMING_METRICS_FIELDS: &[FieldSpec] = &[
    spec("date", FieldKind::Date),
    spec("time", FieldKind::Time),
    spec("server_ip", FieldKind::IpAddr),
    spec("http_method", FieldKind::Method),
    spec("uri_path", FieldKind::Text),
    spec("uri_query", FieldKind::Query),
    spec("server_port", FieldKind::Port),
    spec("username", FieldKind::Username),
    spec("client_ip", FieldKind::IpAddr),
    spec("user_agent", FieldKind::Text),
    spec("status_code", FieldKind::Status),
    spec("sub_status", FieldKind::Code),
    spec("win32_status", FieldKind::Code),
    spec("time_taken_ms", FieldKind::Counter),
];

/// Ordered positional fields for `variant`.
pub fn fields(variant: FormatVariant) -> &'static [FieldSpec] {
    match variant {
        FormatVariant::ByteMetrics => BYTE_METRICS_FIELDS,
        FormatVariant::TimingMetrics => TIMING_METRICS_FIELDS,
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

impl FieldSpec {
    /// Decode and validate one raw token.
    pub fn decode(&self, token: &str) -> Result<FieldValue, ParseError> {
        let name = self.name;
        match self.kind {
            FieldKind::Timestamp => decode_timestamp(name, token).map(FieldValue::Timestamp),
            FieldKind::Date => NaiveDate::parse_from_str(token, DATE_FORMAT)
                .map(FieldValue::Date)
                .map_err(|e| ParseError::field(name, token, format!("expected YYYY-MM-DD ({e})"))),
            FieldKind::Time => NaiveTime::parse_from_str(token, TIME_FORMAT)
                .map(FieldValue::Time)
                .map_err(|e| ParseError::field(name, token, format!("expected HH:MM:SS ({e})"))),
            FieldKind::IpAddr => token
                .parse::<IpAddr>()
                .map(|_| FieldValue::Text(token.to_string()))
                .map_err(|_| ParseError::field(name, token, "not an IPv4 or IPv6 address")),
            FieldKind::Username => Ok(FieldValue::OptionalText(
                (token != EMPTY_PLACEHOLDER).then(|| token.to_string()),
            )),
            FieldKind::Method => {
                if token.len() <= MAX_METHOD_LEN && token.bytes().all(|b| b.is_ascii_alphabetic()) {
                    Ok(FieldValue::Text(token.to_string()))
                } else {
                    Err(ParseError::field(
                        name,
                        token,
                        format!("expected 1-{MAX_METHOD_LEN} ASCII letters"),
                    ))
                }
            }
            FieldKind::Text => Ok(FieldValue::Text(token.to_string())),
            FieldKind::Query => Ok(FieldValue::Text(if token == EMPTY_PLACEHOLDER {
                String::new()
            } else {
                token.to_string()
            })),
            FieldKind::Status => {
                let code: u16 = token
                    .parse()
                    .map_err(|_| ParseError::field(name, token, "not a number"))?;
                if (MIN_STATUS_CODE..=MAX_STATUS_CODE).contains(&code) {
                    Ok(FieldValue::Status(code))
                } else {
                    Err(ParseError::field(
                        name,
                        token,
                        format!("must be between {MIN_STATUS_CODE} and {MAX_STATUS_CODE}"),
                    ))
                }
            }
            FieldKind::Port => token
                .parse::<u16>()
                .map(FieldValue::Port)
                .map_err(|_| ParseError::field(name, token, "not a port number (0-65535)")),
            FieldKind::Code => token
                .parse::<u32>()
                .map(FieldValue::Code)
                .map_err(|_| ParseError::field(name, token, "not an unsigned 32-bit number")),
            FieldKind::Counter => {
                let value: u64 = token
                    .parse()
                    .map_err(|_| ParseError::field(name, token, "not a non-negative integer"))?;
                if value > i64::MAX as u64 {
                    return Err(ParseError::field(name, token, "exceeds the storable range"));
                }
                Ok(FieldValue::Counter(value))
            }
        }
    }
}

fn decode_timestamp(name: &'static str, token: &str) -> Result<Timestamp, ParseError> {
    let parsed = DateTime::parse_from_rfc3339(token)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(token, NAIVE_TIMESTAMP_FORMAT).map(|n| n.and_utc()))
        .map_err(|_| ParseError::field(name, token, "expected an RFC 3339 or YYYY-MM-DDTHH:MM:SS timestamp"))?;
    Ok(truncate_timestamp(parsed))
}

/// Combine a date and a time token pair into a UTC timestamp.
pub fn combine_date_time(date: NaiveDate, time: NaiveTime) -> Timestamp {
    truncate_timestamp(date.and_time(time).and_utc())
}

fn truncate_timestamp(ts: Timestamp) -> Timestamp {
    ts.trunc_subsecs(TIMESTAMP_PRECISION_DIGITS)
}

// ---------------------------------------------------------------------------
// Decoded line cursor
// ---------------------------------------------------------------------------

/// Decoded values of one line, consumed in layout order.
///
/// The typed accessors report a layout error if the next value is not of the
/// requested kind, which can only happen if a layout and its assembly code
/// disagree.
pub struct DecodedFields {
    values: std::vec::IntoIter<(&'static str, FieldValue)>,
}

impl DecodedFields {
    /// Decode every token against its positional spec.
    pub fn decode(specs: &[FieldSpec], tokens: &[&str]) -> Result<Self, ParseError> {
        let values = specs
            .iter()
            .zip(tokens)
            .map(|(spec, token)| spec.decode(token).map(|value| (spec.name, value)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            values: values.into_iter(),
        })
    }

    fn next(&mut self) -> Result<(&'static str, FieldValue), ParseError> {
        self.values
            .next()
            .ok_or_else(|| ParseError::field("<layout>", "", "fewer decoded values than expected"))
    }

    pub fn timestamp(&mut self) -> Result<Timestamp, ParseError> {
        match self.next()? {
            (_, FieldValue::Timestamp(ts)) => Ok(ts),
            (name, other) => Err(layout_error(name, &other)),
        }
    }

    pub fn date(&mut self) -> Result<NaiveDate, ParseError> {
        match self.next()? {
            (_, FieldValue::Date(d)) => Ok(d),
            (name, other) => Err(layout_error(name, &other)),
        }
    }

    pub fn time(&mut self) -> Result<NaiveTime, ParseError> {
        match self.next()? {
            (_, FieldValue::Time(t)) => Ok(t),
            (name, other) => Err(layout_error(name, &other)),
        }
    }

    pub fn text(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            (_, FieldValue::Text(s)) => Ok(s),
            (name, other) => Err(layout_error(name, &other)),
        }
    }

    pub fn optional_text(&mut self) -> Result<Option<String>, ParseError> {
        match self.next()? {
            (_, FieldValue::OptionalText(s)) => Ok(s),
            (name, other) => Err(layout_error(name, &other)),
        }
    }

    pub fn status(&mut self) -> Result<u16, ParseError> {
        match self.next()? {
            (_, FieldValue::Status(code)) => Ok(code),
            (name, other) => Err(layout_error(name, &other)),
        }
    }

    pub fn port(&mut self) -> Result<u16, ParseError> {
        match self.next()? {
            (_, FieldValue::Port(port)) => Ok(port),
            (name, other) => Err(layout_error(name, &other)),
        }
    }

    pub fn code(&mut self) -> Result<u32, ParseError> {
        match self.next()? {
            (_, FieldValue::Code(code)) => Ok(code),
            (name, other) => Err(layout_error(name, &other)),
        }
    }

    pub fn counter(&mut self) -> Result<u64, ParseError> {
        match self.next()? {
            (_, FieldValue::Counter(n)) => Ok(n),
            (name, other) => Err(layout_error(name, &other)),
        }
    }
}

fn layout_error(name: &'static str, value: &FieldValue) -> ParseError {
    ParseError::field(name, "", format!("layout mismatch, decoded {value:?}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
