//! Line parser: one raw text line in, one [`ParseOutcome`] (or nothing) out.

use serde::Serialize;

use crate::error::ParseError;
use crate::record::Record;
use crate::schema;
use crate::variant::FormatVariant;

/// Lines starting with this character are comments (`#Fields:`, `#Date:`, ...).
pub const COMMENT_MARKER: char = '#';

/// Result of parsing one data line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Parsed(Record),
    Rejected(RejectedLine),
}

/// A line that could not be parsed, kept for the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedLine {
    pub raw_line: String,
    pub reason: ParseError,
}

/// Whether a line is a non-event: blank, or a comment.
pub fn is_non_event(line: &str) -> bool {
    let line = line.trim_start();
    line.is_empty() || line.starts_with(COMMENT_MARKER)
}

/// Parses lines of one format variant.
#[derive(Debug, Clone, Copy)]
pub struct LineParser {
    variant: FormatVariant,
}

impl LineParser {
    pub fn new(variant: FormatVariant) -> Self {
        Self { variant }
    }

    pub fn variant(&self) -> FormatVariant {
        self.variant
    }

    /// Build a parser for the variant a data line looks like.
    ///
    /// Fallback for callers without an explicit variant. On failure the
    /// line comes back as a rejection so it can be reported like any other.
    pub fn detect(line: &str) -> Result<Self, RejectedLine> {
        let line = line.trim();
        FormatVariant::detect(line).map(Self::new).ok_or_else(|| RejectedLine {
            raw_line: line.to_string(),
            reason: ParseError::UndetectedVariant {
                found: line.split_whitespace().count(),
            },
        })
    }

    /// Parse one line.
    ///
    /// Returns `None` for blank and comment lines. Every other line yields
    /// exactly one outcome; this never panics.
    pub fn parse(&self, line: &str) -> Option<ParseOutcome> {
        let line = line.trim();
        if is_non_event(line) {
            return None;
        }

        Some(match self.parse_record(line) {
            Ok(record) => ParseOutcome::Parsed(record),
            Err(reason) => ParseOutcome::Rejected(RejectedLine {
                raw_line: line.to_string(),
                reason,
            }),
        })
    }

    fn parse_record(&self, line: &str) -> Result<Record, ParseError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let expected = schema::fields(self.variant).len();
        if tokens.len() != expected {
            return Err(ParseError::FieldCountMismatch {
                variant: self.variant,
                expected,
                found: tokens.len(),
            });
        }
        Record::from_tokens(self.variant, &tokens)
    }
}
