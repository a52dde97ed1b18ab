//! The ingestion pipeline: one source, read sequentially in line order.
//!
//! Per line: skip non-events, reject malformed lines into the run report,
//! and batch parsed records through the [`DedupGate`]. Batches that keep
//! failing after retries are counted as store failures and the run moves
//! on. Only an unopenable source fails the run.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use logwarden_core::error::{CoreError, ParseError, StoreError};
use logwarden_core::parser::{self, LineParser, ParseOutcome, RejectedLine};
use logwarden_core::record::Record;
use logwarden_core::store::{InsertOutcome, LogStore};
use logwarden_core::variant::FormatVariant;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::Instrument;
use uuid::Uuid;

use crate::gate::DedupGate;
use crate::retry::{with_retry, RetryPolicy};
use crate::summary::{RunSummary, StoreFailure};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Tuning for one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Records per persistence batch (default: `500`).
    pub batch_size: usize,
    /// Bound on opening the source and on each read (default: 30s).
    pub read_timeout: Duration,
    /// Bound on each store call (default: 30s).
    pub store_timeout: Duration,
    pub retry: RetryPolicy,
    /// Cap on rejected lines kept with details (default: `1000`).
    pub max_rejected_details: usize,
    /// Ask the store which keys exist before writing (default: `true`).
    pub check_existing: bool,
    /// Longest line kept in memory, in bytes (default: 64 KiB). Longer
    /// lines are rejected without being buffered whole.
    pub max_line_bytes: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            read_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            max_rejected_details: 1000,
            check_existing: true,
            max_line_bytes: 64 * 1024,
        }
    }
}

/// Characters of an oversize line kept in its rejection detail.
const OVERSIZE_PREVIEW_CHARS: usize = 256;

/// How the pipeline picks the format variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantSelector {
    Explicit(FormatVariant),
    /// Classify the first data line by token count.
    Detect,
}

impl FromStr for VariantSelector {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(Self::Detect)
        } else {
            s.parse().map(Self::Explicit)
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that end a run before any line is read.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Source '{}' is unavailable: {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out opening source '{}'", path.display())]
    Timeout { path: PathBuf },
}

// ---------------------------------------------------------------------------
// Line reading
// ---------------------------------------------------------------------------

/// Read one line into `buf` without its terminator, keeping at most
/// `max_len` bytes. The remainder of a longer line is consumed and dropped.
///
/// Returns the bytes consumed from `reader` (0 at end of input) and whether
/// the line was cut.
async fn read_capped_line<R>(reader: &mut R, buf: &mut Vec<u8>, max_len: usize) -> std::io::Result<(usize, bool)>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    let mut oversize = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok((consumed, oversize));
        }
        let (used, content, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, &available[..i], true),
            None => (available.len(), available, false),
        };
        let room = max_len.saturating_sub(buf.len());
        if content.len() > room {
            oversize = true;
        }
        buf.extend_from_slice(&content[..content.len().min(room)]);
        reader.consume(used);
        consumed += used;
        if done {
            return Ok((consumed, oversize));
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Mutable state of a single run.
struct RunState {
    summary: RunSummary,
    parser: Option<LineParser>,
    schema_ready: bool,
    batch: Vec<Record>,
    batch_lines: Vec<u64>,
}

pub struct IngestionPipeline<'a, S: LogStore + ?Sized> {
    store: &'a S,
    options: IngestOptions,
}

impl<'a, S: LogStore + ?Sized> IngestionPipeline<'a, S> {
    pub fn new(store: &'a S, options: IngestOptions) -> Self {
        Self { store, options }
    }

    /// Ingest the file at `path`.
    pub async fn run(&self, path: &Path, selector: VariantSelector) -> Result<RunSummary, IngestError> {
        let file = match tokio::time::timeout(self.options.read_timeout, File::open(path)).await {
            Err(_) => {
                return Err(IngestError::Timeout {
                    path: path.to_path_buf(),
                })
            }
            Ok(Err(source)) => {
                return Err(IngestError::SourceUnavailable {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Ok(Ok(file)) => file,
        };

        let source = path.display().to_string();
        Ok(self.run_reader(&source, BufReader::new(file), selector).await)
    }

    /// Ingest from an already open reader. `source` labels the run.
    pub async fn run_reader<R>(&self, source: &str, reader: R, selector: VariantSelector) -> RunSummary
    where
        R: AsyncBufRead + Unpin,
    {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("ingest", %run_id, source);
        self.ingest(run_id, source, reader, selector)
            .instrument(span)
            .await
    }

    async fn ingest<R>(&self, run_id: Uuid, source: &str, mut reader: R, selector: VariantSelector) -> RunSummary
    where
        R: AsyncBufRead + Unpin,
    {
        let parser = match selector {
            VariantSelector::Explicit(variant) => Some(LineParser::new(variant)),
            VariantSelector::Detect => None,
        };
        let mut state = RunState {
            summary: RunSummary::new(run_id, source, parser.map(|p| p.variant())),
            parser,
            schema_ready: false,
            batch: Vec::with_capacity(self.options.batch_size.max(1)),
            batch_lines: Vec::with_capacity(self.options.batch_size.max(1)),
        };
        tracing::info!(variant = ?state.summary.variant, "Ingestion run started");

        let max_line_bytes = self.options.max_line_bytes.max(1);
        let mut buf = Vec::new();
        let mut line_no = 0u64;
        loop {
            buf.clear();
            let read = read_capped_line(&mut reader, &mut buf, max_line_bytes);
            let oversize = match tokio::time::timeout(self.options.read_timeout, read).await {
                Ok(Ok((0, _))) => break,
                Ok(Ok((_, oversize))) => oversize,
                Ok(Err(e)) => {
                    tracing::error!(line = line_no + 1, error = %e, "Read failed, stopping early");
                    state.summary.interrupted = true;
                    break;
                }
                Err(_) => {
                    tracing::error!(line = line_no + 1, "Read timed out, stopping early");
                    state.summary.interrupted = true;
                    break;
                }
            };

            line_no += 1;
            state.summary.lines_total += 1;
            let line = String::from_utf8_lossy(&buf);
            if oversize {
                let rejected = RejectedLine {
                    raw_line: line.chars().take(OVERSIZE_PREVIEW_CHARS).collect(),
                    reason: ParseError::FieldTypeError {
                        field: "line",
                        token: String::new(),
                        reason: format!("line exceeds {max_line_bytes} bytes"),
                    },
                };
                self.reject(&mut state, line_no, rejected);
                continue;
            }
            self.process_line(&mut state, line_no, &line).await;
        }
        self.flush(&mut state).await;

        let s = &state.summary;
        tracing::info!(
            lines_total = s.lines_total,
            skipped = s.skipped,
            inserted = s.inserted,
            duplicates = s.duplicates,
            rejected = s.rejected,
            store_failures = s.store_failures,
            interrupted = s.interrupted,
            "Ingestion run complete"
        );
        state.summary
    }

    async fn process_line(&self, state: &mut RunState, line_no: u64, line: &str) {
        if parser::is_non_event(line) {
            state.summary.skipped += 1;
            return;
        }

        let parser = match state.parser {
            Some(parser) => parser,
            None => match LineParser::detect(line) {
                Ok(parser) => {
                    tracing::warn!(
                        line = line_no,
                        variant = %parser.variant(),
                        "Format variant auto-detected from token count"
                    );
                    state.parser = Some(parser);
                    state.summary.variant = Some(parser.variant());
                    parser
                }
                Err(rejected) => {
                    self.reject(state, line_no, rejected);
                    return;
                }
            },
        };

        match parser.parse(line) {
            Some(ParseOutcome::Parsed(record)) => {
                state.batch.push(record);
                state.batch_lines.push(line_no);
                if state.batch.len() >= self.options.batch_size.max(1) {
                    self.flush(state).await;
                }
            }
            Some(ParseOutcome::Rejected(rejected)) => self.reject(state, line_no, rejected),
            None => state.summary.skipped += 1,
        }
    }

    fn reject(&self, state: &mut RunState, line_no: u64, rejected: RejectedLine) {
        tracing::debug!(line = line_no, reason = %rejected.reason, "Line rejected");
        state
            .summary
            .record_rejected(line_no, rejected, self.options.max_rejected_details);
    }

    /// Persist the pending batch and fold its outcomes into the summary.
    async fn flush(&self, state: &mut RunState) {
        if state.batch.is_empty() {
            return;
        }
        let records = std::mem::take(&mut state.batch);
        let lines = std::mem::take(&mut state.batch_lines);

        match self.persist(&mut state.schema_ready, &records).await {
            Ok(outcomes) => {
                for outcome in outcomes {
                    match outcome {
                        InsertOutcome::Inserted => state.summary.inserted += 1,
                        InsertOutcome::SkippedDuplicate => state.summary.duplicates += 1,
                    }
                }
            }
            Err(e) => {
                let first_line = lines.first().copied().unwrap_or_default();
                let last_line = lines.last().copied().unwrap_or_default();
                tracing::error!(
                    first_line,
                    last_line,
                    records = records.len(),
                    error = %e,
                    "Batch not persisted"
                );
                state.summary.record_store_failure(StoreFailure {
                    first_line,
                    last_line,
                    records: records.len(),
                    error: e.to_string(),
                });
            }
        }
    }

    async fn persist(&self, schema_ready: &mut bool, records: &[Record]) -> Result<Vec<InsertOutcome>, StoreError> {
        let mut gate = DedupGate::new(self.store, self.options.store_timeout);
        if !self.options.check_existing {
            gate = gate.without_existence_check();
        }
        let gate = &gate;
        let policy = &self.options.retry;

        if !*schema_ready {
            if let Some(first) = records.first() {
                let variant = first.variant();
                with_retry(policy, "Schema check", move || gate.ensure_schema(variant)).await?;
                *schema_ready = true;
            }
        }
        with_retry(policy, "Batch insert", move || gate.admit_batch(records)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLogStore;
    use crate::test_support::{byte_line, FlakyStore};
    use assert_matches::assert_matches;
    use logwarden_core::error::ParseError;

    const TIMING_LINE_1: &str =
        "2024-01-15 10:30:00 10.0.0.9 GET /index.html - 443 - 10.0.0.1 Mozilla/5.0 200 0 0 15";
    const TIMING_LINE_2: &str =
        "2024-01-15 10:30:01 10.0.0.9 POST /login - 443 bob 10.0.0.2 Mozilla/5.0 401 0 0 9";

    fn fast_options(batch_size: usize) -> IngestOptions {
        IngestOptions {
            batch_size,
            read_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    fn write_log(dir: &tempfile::TempDir, lines: &[String]) -> PathBuf {
        let path = dir.path().join("access.log");
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    fn sample_lines() -> Vec<String> {
        vec![
            "#Software: Microsoft Internet Information Services 10.0".to_string(),
            byte_line("2024-01-15T10:30:00Z", "10.0.0.1", "/index.html", "-", 200),
            byte_line("2024-01-15T10:30:01Z", "10.0.0.2", "/login", "-", 401),
            String::new(),
            byte_line("2024-01-15T10:30:02Z", "10.0.0.3", "/admin", "-", 403),
        ]
    }

    const BYTES: VariantSelector = VariantSelector::Explicit(FormatVariant::ByteMetrics);

    #[tokio::test]
    async fn counts_every_line_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, &sample_lines());
        let store = MemoryLogStore::new();

        let summary = IngestionPipeline::new(&store, fast_options(2))
            .run(&path, BYTES)
            .await
            .unwrap();

        assert_eq!(summary.lines_total, 5);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.duplicates, 0);
        assert_eq!(summary.rejected, 0);
        assert_eq!(summary.variant, Some(FormatVariant::ByteMetrics));
        assert!(!summary.is_degraded());
    }

    #[tokio::test]
    async fn reingesting_the_same_file_inserts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(&dir, &sample_lines());
        let store = MemoryLogStore::new();
        let pipeline = IngestionPipeline::new(&store, fast_options(500));

        let first = pipeline.run(&path, BYTES).await.unwrap();
        let count_after_first = store.count(FormatVariant::ByteMetrics).await.unwrap();
        let second = pipeline.run(&path, BYTES).await.unwrap();

        assert_eq!(first.inserted, 3);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(store.count(FormatVariant::ByteMetrics).await.unwrap(), count_after_first);
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn comment_and_blank_only_file_processes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let lines = vec![
            "#Version: 1.0".to_string(),
            "   ".to_string(),
            "#Fields: date time s-ip".to_string(),
        ];
        let path = write_log(&dir, &lines);
        let store = MemoryLogStore::new();

        let summary = IngestionPipeline::new(&store, fast_options(10))
            .run(&path, BYTES)
            .await
            .unwrap();

        assert_eq!(summary.lines_total, 3);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.rejected, 0);
        assert!(!store.has_table("iis_logs").await.unwrap());
    }

    #[tokio::test]
    async fn lines_differing_only_in_user_agent_store_once() {
        let a = byte_line("2024-01-15T10:30:00Z", "10.0.0.1", "/index.html", "-", 200);
        let b = a.replace("Mozilla/5.0", "curl/8.4.0");
        assert_ne!(a, b);

        for batch_size in [1, 10] {
            let dir = tempfile::tempdir().unwrap();
            let path = write_log(&dir, &[a.clone(), b.clone()]);
            let store = MemoryLogStore::new();

            let summary = IngestionPipeline::new(&store, fast_options(batch_size))
                .run(&path, BYTES)
                .await
                .unwrap();

            assert_eq!(summary.inserted, 1, "batch_size {batch_size}");
            assert_eq!(summary.duplicates, 1, "batch_size {batch_size}");
            assert_eq!(store.count(FormatVariant::ByteMetrics).await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn malformed_lines_are_reported_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let lines = vec![
            byte_line("2024-01-15T10:30:00Z", "10.0.0.1", "/a", "-", 200),
            "2024-01-15T10:30:01Z 10.0.0.1 - GET".to_string(),
            byte_line("2024-01-15T10:30:02Z", "10.0.0.1", "/b", "-", 200).replace(" 200 ", " OK "),
            byte_line("2024-01-15T10:30:03Z", "10.0.0.1", "/c", "-", 200),
        ];
        let path = write_log(&dir, &lines);
        let store = MemoryLogStore::new();
        let options = IngestOptions {
            max_rejected_details: 1,
            ..fast_options(10)
        };

        let summary = IngestionPipeline::new(&store, options).run(&path, BYTES).await.unwrap();

        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.rejected_details.len(), 1);
        assert_eq!(summary.rejected_details[0].line, 2);
        assert_matches!(
            summary.rejected_details[0].reason,
            ParseError::FieldCountMismatch { expected: 10, found: 4, .. }
        );
    }

    #[tokio::test]
    async fn missing_source_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryLogStore::new();
        let result = IngestionPipeline::new(&store, fast_options(10))
            .run(&dir.path().join("nope.log"), BYTES)
            .await;
        assert_matches!(result, Err(IngestError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let mut bytes = byte_line("2024-01-15T10:30:00Z", "10.0.0.1", "/a", "-", 200).into_bytes();
        bytes.extend_from_slice(b"\xff\xfe\n");
        std::fs::write(&path, bytes).unwrap();
        let store = MemoryLogStore::new();

        let summary = IngestionPipeline::new(&store, fast_options(10))
            .run(&path, BYTES)
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
    }

    #[tokio::test]
    async fn auto_detection_rejects_until_a_line_classifies() {
        let lines = vec![
            "#Fields: date time s-ip cs-method".to_string(),
            "garbage line".to_string(),
            TIMING_LINE_1.to_string(),
            TIMING_LINE_2.to_string(),
            byte_line("2024-01-15T10:30:00Z", "10.0.0.1", "/a", "-", 200),
        ];
        let store = MemoryLogStore::new();
        let input = lines.join("\n");

        let summary = IngestionPipeline::new(&store, fast_options(10))
            .run_reader("inline", input.as_bytes(), VariantSelector::Detect)
            .await;

        assert_eq!(summary.variant, Some(FormatVariant::TimingMetrics));
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.rejected, 2);
        assert_matches!(
            summary.rejected_details[0].reason,
            ParseError::UndetectedVariant { found: 2 }
        );
        assert_matches!(
            summary.rejected_details[1].reason,
            ParseError::FieldCountMismatch { variant: FormatVariant::TimingMetrics, .. }
        );
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried() {
        let store = FlakyStore::new(2);
        let input = sample_lines().join("\n");

        let summary = IngestionPipeline::new(&store, fast_options(10))
            .run_reader("inline", input.as_bytes(), BYTES)
            .await;

        assert_eq!(summary.inserted, 3);
        assert!(!summary.is_degraded());
        assert_eq!(store.insert_calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_degrade_the_run_but_continue() {
        // The first batch burns all three attempts; the second goes through.
        let store = FlakyStore::new(3);
        let lines = vec![
            byte_line("2024-01-15T10:30:00Z", "10.0.0.1", "/a", "-", 200),
            byte_line("2024-01-15T10:30:01Z", "10.0.0.1", "/b", "-", 200),
            byte_line("2024-01-15T10:30:02Z", "10.0.0.1", "/c", "-", 200),
            byte_line("2024-01-15T10:30:03Z", "10.0.0.1", "/d", "-", 200),
        ];
        let input = lines.join("\n");

        let summary = IngestionPipeline::new(&store, fast_options(2))
            .run_reader("inline", input.as_bytes(), BYTES)
            .await;

        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.store_failures, 2);
        assert_eq!(summary.store_failure_details.len(), 1);
        assert_eq!(summary.store_failure_details[0].first_line, 1);
        assert_eq!(summary.store_failure_details[0].last_line, 2);
        assert!(summary.is_degraded());
    }

    #[tokio::test]
    async fn slow_store_calls_time_out() {
        let store = FlakyStore::slow(Duration::from_millis(200));
        let options = IngestOptions {
            store_timeout: Duration::from_millis(10),
            retry: RetryPolicy::none(),
            ..fast_options(10)
        };
        let input = byte_line("2024-01-15T10:30:00Z", "10.0.0.1", "/a", "-", 200);

        let summary = IngestionPipeline::new(&store, options)
            .run_reader("inline", input.as_bytes(), BYTES)
            .await;

        assert_eq!(summary.store_failures, 1);
        assert_eq!(summary.store_failure_details[0].error, StoreError::Timeout.to_string());
    }

    #[tokio::test]
    async fn oversize_lines_are_rejected_without_buffering() {
        let store = MemoryLogStore::new();
        let options = IngestOptions {
            max_line_bytes: 200,
            ..fast_options(10)
        };
        let huge = "x".repeat(10_000);
        let input = [
            byte_line("2024-01-15T10:30:00Z", "10.0.0.1", "/a", "-", 200),
            huge.clone(),
            byte_line("2024-01-15T10:30:01Z", "10.0.0.1", "/b", "-", 200),
            huge,
        ]
        .join("\n");
        let reader = BufReader::with_capacity(16, input.as_bytes());

        let summary = IngestionPipeline::new(&store, options)
            .run_reader("inline", reader, BYTES)
            .await;

        assert_eq!(summary.lines_total, 4);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.rejected, 2);
        let detail = &summary.rejected_details[0];
        assert_eq!(detail.line, 2);
        assert_eq!(detail.raw_line.len(), OVERSIZE_PREVIEW_CHARS);
        assert_matches!(detail.reason, ParseError::FieldTypeError { field: "line", .. });
    }

    #[test]
    fn selector_parses_auto_and_variant_names() {
        assert_eq!("auto".parse::<VariantSelector>(), Ok(VariantSelector::Detect));
        assert_eq!("AUTO".parse::<VariantSelector>(), Ok(VariantSelector::Detect));
        assert_eq!(
            "timing-metrics".parse::<VariantSelector>(),
            Ok(VariantSelector::Explicit(FormatVariant::TimingMetrics))
        );
        assert!("xml".parse::<VariantSelector>().is_err());
    }
}
