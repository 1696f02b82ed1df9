//! Batch Processor - Pure Batching Abstraction
//!
//! Groups finished requests and decides when to flush based on size and time
//! thresholds. It holds no `Arc`, no atomics and no exporter: the exporter is
//! passed to [`BatchProcessor::flush`], and the concurrent plumbing lives in
//! [`RequestReporter`](crate::RequestReporter).

use crate::exporter::{ExportError, RequestBatch, RequestExporterBoxed};
use request_tracker::FinishedRequest;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for batch processing
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of requests per batch
    pub batch_size_limit: usize,
    /// Maximum time to wait before flushing a batch
    pub batch_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size_limit: 1_000,
            batch_timeout: Duration::from_secs(5),
        }
    }
}

/// Metrics for batch processing (plain u64 - no atomic overhead for sequential use)
#[derive(Debug, Default, Clone)]
pub struct BatchMetrics {
    /// Total requests exported
    pub requests_exported: u64,
    /// Total batches exported
    pub batches_exported: u64,
    /// Total export errors
    pub export_errors: u64,
}

impl BatchMetrics {
    /// Record a successful export
    pub fn record_success(&mut self, request_count: u64) {
        self.requests_exported += request_count;
        self.batches_exported += 1;
    }

    /// Record an export error
    pub fn record_error(&mut self) {
        self.export_errors += 1;
    }
}

/// Accumulates finished requests until a flush is due.
pub struct BatchProcessor {
    /// Pending requests in submission order
    pending: Vec<FinishedRequest>,
    config: BatchConfig,
    metrics: BatchMetrics,
    last_flush: Instant,
}

impl BatchProcessor {
    /// Creates a new batch processor
    pub fn new(config: BatchConfig) -> Self {
        Self {
            pending: Vec::new(),
            config,
            metrics: BatchMetrics::default(),
            last_flush: Instant::now(),
        }
    }

    /// Adds a request to the batch
    pub fn add(&mut self, request: FinishedRequest) {
        self.pending.push(request);
    }

    /// Returns the number of pending requests
    pub fn total_pending(&self) -> usize {
        self.pending.len()
    }

    /// Checks if the batch should be flushed
    pub fn should_flush(&self) -> bool {
        !self.pending.is_empty()
            && (self.pending.len() >= self.config.batch_size_limit
                || self.last_flush.elapsed() >= self.config.batch_timeout)
    }

    /// Flushes all pending requests through `exporter`, waiting for the export.
    ///
    /// On failure the batch is dropped and the error counted; requests are not
    /// retried.
    pub async fn flush(&mut self, exporter: &dyn RequestExporterBoxed) -> Result<usize, ExportError> {
        let Some(batch) = self.take_batch() else {
            return Ok(0);
        };
        let request_count = batch.len();

        match exporter.export_boxed(batch).await {
            Ok(()) => {
                self.metrics.record_success(request_count as u64);
                Ok(request_count)
            }
            Err(e) => {
                self.metrics.record_error();
                Err(e)
            }
        }
    }

    /// Takes all pending requests as a batch.
    ///
    /// Returns `None` if nothing is pending. The caller is responsible for
    /// exporting the batch and recording metrics.
    pub fn take_batch(&mut self) -> Option<RequestBatch> {
        if self.pending.is_empty() {
            return None;
        }

        let requests = std::mem::take(&mut self.pending);
        self.last_flush = Instant::now();
        Some(RequestBatch::with_requests(requests))
    }

    /// Returns current metrics
    pub fn metrics(&self) -> &BatchMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{finished_request, FailingExporter, LogExporter};

    #[tokio::test]
    async fn test_batch_processor_basic() {
        let exporter = LogExporter::new(false);
        let config = BatchConfig {
            batch_size_limit: 5,
            batch_timeout: Duration::from_secs(10),
        };
        let mut processor = BatchProcessor::new(config);

        for _ in 0..3 {
            processor.add(finished_request(1));
        }

        assert_eq!(processor.total_pending(), 3);
        assert!(!processor.should_flush()); // Below limit

        for _ in 3..5 {
            processor.add(finished_request(1));
        }

        assert!(processor.should_flush()); // At limit

        assert_eq!(processor.flush(&exporter).await.unwrap(), 5);
        assert_eq!(processor.total_pending(), 0);
        assert_eq!(processor.metrics().requests_exported, 5);
        assert_eq!(processor.metrics().batches_exported, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_after_timeout() {
        let config = BatchConfig {
            batch_size_limit: 100,
            batch_timeout: Duration::from_millis(50),
        };
        let mut processor = BatchProcessor::new(config);
        processor.add(finished_request(1));
        assert!(!processor.should_flush());

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(processor.should_flush());
    }

    #[tokio::test]
    async fn test_flush_error_counts() {
        let mut processor = BatchProcessor::new(BatchConfig::default());
        processor.add(finished_request(2));

        let result = processor.flush(&FailingExporter).await;
        assert!(result.is_err());
        assert_eq!(processor.metrics().export_errors, 1);
        assert_eq!(processor.total_pending(), 0);
    }

    #[tokio::test]
    async fn test_take_batch() {
        let mut processor = BatchProcessor::new(BatchConfig::default());

        // Empty processor returns None
        assert!(processor.take_batch().is_none());

        for _ in 0..5 {
            processor.add(finished_request(1));
        }

        let batch = processor.take_batch();
        assert!(batch.is_some());
        assert_eq!(batch.unwrap().requests.len(), 5);

        // Processor is now empty
        assert_eq!(processor.total_pending(), 0);
        assert!(processor.take_batch().is_none());
    }
}
