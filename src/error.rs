//! Engine error taxonomy
//!
//! Per-line failures are counted and skipped; per-cycle failures abort one
//! source's collection cycle without advancing its watermark and are recorded
//! on the source row; aggregation failures leave the previous aggregate row
//! in place until the next scheduled rollup.

use thiserror::Error;

/// A single log line that could not be turned into a `ParsedLogEntry`.
///
/// Never fatal to a batch: the collector drops the line and increments a
/// counter.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line does not match the combined format")]
    Malformed,

    #[error("unparseable timestamp {0:?}")]
    Timestamp(String),

    #[error("invalid json log record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The log file could not be stat'ed, opened, or read. The cycle aborts
    /// and the watermark is preserved so the same bytes are retried next
    /// interval.
    #[error("log file unreadable: {0}")]
    WatermarkIo(#[source] std::io::Error),

    /// A fact batch failed to persist. The cycle aborts with the watermark
    /// untouched; re-processing the batch next cycle is safe because rollups
    /// recompute buckets.
    #[error("batch write failed: {0}")]
    BatchWrite(#[source] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("aggregation failed for bucket {bucket_ms}: {source}")]
    Aggregation {
        bucket_ms: i64,
        #[source]
        source: Box<EngineError>,
    },

    #[error("source {0} not found")]
    SourceNotFound(i64),

    #[error("source kind {0:?} cannot be collected by this build")]
    Uncollectable(String),
}
