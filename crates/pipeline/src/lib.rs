//! Async orchestration over the domain core: deduplicated ingestion runs,
//! bounded catalog execution and report export.

pub mod catalog;
pub mod gate;
pub mod ingest;
pub mod memory;
pub mod report;
pub mod retry;
pub mod summary;

#[cfg(test)]
mod test_support;

pub use catalog::{execute, execute_all, CatalogRun};
pub use gate::DedupGate;
pub use ingest::{IngestError, IngestOptions, IngestionPipeline, VariantSelector};
pub use memory::MemoryLogStore;
pub use report::{CsvReportSink, ReportError, ReportSink};
pub use retry::RetryPolicy;
pub use summary::RunSummary;
