use crate::batch_processor::{BatchConfig, BatchProcessor};
use crate::error::ReporterError;
use crate::exporter::RequestExporterBoxed;
use request_tracker::{FinishedRequest, RequestSubmitter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Thread-safe reporter metrics (atomics, shared with every submitter clone)
#[derive(Debug, Default)]
pub struct ReporterMetrics {
    /// Requests received by the reporter task
    pub requests_received: AtomicU64,
    /// Requests successfully exported
    pub requests_exported: AtomicU64,
    /// Batches successfully exported
    pub batches_exported: AtomicU64,
    /// Failed export attempts
    pub export_errors: AtomicU64,
    /// Requests submitted after the reporter shut down
    pub requests_dropped: AtomicU64,
}

impl ReporterMetrics {
    pub fn requests_received(&self) -> u64 {
        self.requests_received.load(Ordering::Relaxed)
    }

    pub fn requests_exported(&self) -> u64 {
        self.requests_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    pub fn requests_dropped(&self) -> u64 {
        self.requests_dropped.load(Ordering::Relaxed)
    }

    fn record_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self, request_count: u64) {
        self.requests_exported.fetch_add(request_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.export_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Configuration for the request reporter
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Batch configuration
    pub batch_config: BatchConfig,
    /// How often the reporter checks whether a timed flush is due.
    ///
    /// Default: 100ms
    pub flush_interval: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            batch_config: BatchConfig::default(),
            flush_interval: Duration::from_millis(100),
        }
    }
}

impl ReporterConfig {
    /// Small batches, flushed quickly.
    pub fn low_latency() -> Self {
        Self {
            batch_config: BatchConfig {
                batch_size_limit: 16,
                batch_timeout: Duration::from_millis(50),
            },
            flush_interval: Duration::from_millis(10),
        }
    }

    /// Large batches, flushed rarely.
    pub fn high_throughput() -> Self {
        Self {
            batch_config: BatchConfig {
                batch_size_limit: 10_000,
                batch_timeout: Duration::from_secs(10),
            },
            flush_interval: Duration::from_millis(500),
        }
    }

    /// Sets the batch configuration.
    pub fn with_batch_config(mut self, batch_config: BatchConfig) -> Self {
        self.batch_config = batch_config;
        self
    }

    /// Sets the flush check interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

/// Flushes the processor through `exporter`, mirroring the outcome into the
/// shared metrics.
async fn flush(
    processor: &mut BatchProcessor,
    exporter: &dyn RequestExporterBoxed,
    metrics: &ReporterMetrics,
) {
    match processor.flush(exporter).await {
        Ok(0) => {}
        Ok(exported) => metrics.record_success(exported as u64),
        Err(e) => {
            metrics.record_error();
            error!(exporter = exporter.name(), error = %e, "request export failed");
        }
    }
}

/// Background task that batches finished requests and exports them.
///
/// Requests arrive through a [`ChannelSubmitter`], which never blocks the
/// thread finishing a request.
pub struct RequestReporter {
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    metrics: Arc<ReporterMetrics>,
}

impl RequestReporter {
    /// Spawns the reporter task on the current Tokio runtime and returns it
    /// together with the submitter that feeds it.
    pub fn spawn(
        config: ReporterConfig,
        exporter: Arc<dyn RequestExporterBoxed>,
    ) -> Result<(Self, ChannelSubmitter), ReporterError> {
        let handle = Handle::try_current()?;
        Ok(Self::spawn_on(&handle, config, exporter))
    }

    /// Spawns the reporter task on the given runtime.
    pub fn spawn_on(
        handle: &Handle,
        config: ReporterConfig,
        exporter: Arc<dyn RequestExporterBoxed>,
    ) -> (Self, ChannelSubmitter) {
        let (tx, mut rx) = mpsc::unbounded_channel::<FinishedRequest>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let metrics = Arc::new(ReporterMetrics::default());

        let task_metrics = Arc::clone(&metrics);
        let task = handle.spawn(async move {
            let mut interval = tokio::time::interval(config.flush_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut processor = BatchProcessor::new(config.batch_config);

            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(request) => {
                            task_metrics.record_received();
                            processor.add(request);
                            if processor.should_flush() {
                                flush(&mut processor, exporter.as_ref(), &task_metrics).await;
                            }
                        }
                        // Every submitter is gone
                        None => break,
                    },

                    _ = interval.tick() => {
                        if processor.should_flush() {
                            flush(&mut processor, exporter.as_ref(), &task_metrics).await;
                        }
                    }

                    // Explicit shutdown, or the reporter handle was dropped
                    _ = &mut shutdown_rx => {
                        rx.close();
                        while let Some(request) = rx.recv().await {
                            task_metrics.record_received();
                            processor.add(request);
                        }
                        break;
                    }
                }
            }

            // Final flush
            flush(&mut processor, exporter.as_ref(), &task_metrics).await;
            debug!(
                exported = task_metrics.requests_exported(),
                errors = task_metrics.export_errors(),
                "request reporter stopped"
            );
        });

        let submitter = ChannelSubmitter {
            tx,
            metrics: Arc::clone(&metrics),
        };
        let reporter = Self {
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            metrics,
        };
        (reporter, submitter)
    }

    /// Returns reporter metrics
    pub fn metrics(&self) -> &Arc<ReporterMetrics> {
        &self.metrics
    }

    /// Gracefully shuts down the reporter.
    ///
    /// Everything submitted before this call is exported; submissions after it
    /// are counted as dropped.
    pub async fn shutdown(mut self) -> Result<(), ReporterError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            task.await?;
        }

        Ok(())
    }
}

/// [`RequestSubmitter`] that forwards finished requests to a [`RequestReporter`].
///
/// Sending never blocks. Cloning is cheap; all clones feed the same reporter.
#[derive(Clone)]
pub struct ChannelSubmitter {
    tx: mpsc::UnboundedSender<FinishedRequest>,
    metrics: Arc<ReporterMetrics>,
}

impl ChannelSubmitter {
    /// Whether the reporter has stopped accepting requests.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl RequestSubmitter for ChannelSubmitter {
    fn submit(&self, request: FinishedRequest) {
        if let Err(mpsc::error::SendError(request)) = self.tx.send(request) {
            self.metrics.record_dropped();
            warn!(request_id = %request.id(), "request reporter is shut down, dropping finished request");
        }
    }
}
