use request_tracker::FinishedRequest;
use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info};

/// Error types for request export operations
#[derive(Debug, Error, Clone)]
pub enum ExportError {
    /// Transport-layer error (network, file, pipe)
    #[error("transport error: {0}")]
    Transport(String),
    /// Export operation timed out
    #[error("export operation timed out")]
    Timeout,
}

/// Batch of finished requests for export
#[derive(Debug)]
pub struct RequestBatch {
    /// All requests in this batch, in submission order
    pub requests: Vec<FinishedRequest>,
    /// Batch creation timestamp
    pub timestamp: SystemTime,
}

impl RequestBatch {
    /// Creates a new empty batch
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
            timestamp: SystemTime::now(),
        }
    }

    /// Creates a batch with the given requests
    pub fn with_requests(requests: Vec<FinishedRequest>) -> Self {
        Self {
            requests,
            timestamp: SystemTime::now(),
        }
    }

    pub fn add(&mut self, request: FinishedRequest) {
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Total number of spans across all requests in the batch
    pub fn span_count(&self) -> usize {
        self.requests.iter().map(|r| r.spans().len()).sum()
    }
}

impl Default for RequestBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for exporting batches of finished requests to a backend.
///
/// Uses native async fn in traits instead of `#[async_trait]`. For dynamic
/// dispatch, go through [`RequestExporterBoxed`].
pub trait RequestExporter: Send + Sync {
    /// Exports a batch of requests.
    fn export(&self, batch: RequestBatch) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of RequestExporter for dynamic dispatch.
pub trait RequestExporterBoxed: Send + Sync {
    /// Exports a batch (boxed future for object safety).
    fn export_boxed(
        &self,
        batch: RequestBatch,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>>;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Blanket implementation: any RequestExporter can be used as RequestExporterBoxed
impl<T: RequestExporter> RequestExporterBoxed for T {
    fn export_boxed(
        &self,
        batch: RequestBatch,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        RequestExporter::name(self)
    }
}

/// Exporter that writes each request's span waterfall to the log.
pub struct LogExporter {
    verbose: bool,
}

impl LogExporter {
    /// Creates a new log exporter. When `verbose`, every span is logged at
    /// `info`; otherwise only a per-batch summary is logged at `debug`.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl RequestExporter for LogExporter {
    async fn export(&self, batch: RequestBatch) -> Result<(), ExportError> {
        debug!(
            requests = batch.len(),
            spans = batch.span_count(),
            "exporting request batch"
        );
        if self.verbose {
            for request in &batch.requests {
                info!(
                    request_id = %request.id(),
                    duration_ms = request.duration().as_millis() as u64,
                    real = request.is_real(),
                    "request finished"
                );
                for line in request.dump() {
                    info!("{}", line);
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Null exporter that discards all requests (for benchmarking)
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestExporter for NullExporter {
    async fn export(&self, _batch: RequestBatch) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Test exporter that records all exported requests for verification
#[cfg(test)]
#[derive(Default)]
pub struct TestExporter {
    requests: std::sync::Mutex<Vec<FinishedRequest>>,
}

#[cfg(test)]
impl TestExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exported_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn all_requests(&self) -> Vec<FinishedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl RequestExporter for TestExporter {
    async fn export(&self, batch: RequestBatch) -> Result<(), ExportError> {
        self.requests.lock().unwrap().extend(batch.requests);
        Ok(())
    }

    fn name(&self) -> &str {
        "test"
    }
}

/// Exporter that always fails (for error-path testing)
#[cfg(test)]
pub struct FailingExporter;

#[cfg(test)]
impl RequestExporter for FailingExporter {
    async fn export(&self, _batch: RequestBatch) -> Result<(), ExportError> {
        Err(ExportError::Transport("backend unavailable".into()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Builds a finished request with `spans` sequential root-level spans
#[cfg(test)]
pub(crate) fn finished_request(spans: usize) -> FinishedRequest {
    use request_tracker::{Collaborators, TrackedRequest};
    use std::sync::{Arc, Mutex};

    let slot = Arc::new(Mutex::new(None));
    let target = Arc::clone(&slot);
    let submitter = move |request: FinishedRequest| *target.lock().unwrap() = Some(request);
    let mut request = TrackedRequest::new(Collaborators::new(
        Arc::new(submitter),
        Arc::new(request_tracker::NoopSampler),
    ));

    request.start_span("root");
    for i in 0..spans.saturating_sub(1) {
        request.start_span(format!("child-{}", i));
        request.stop_span();
    }
    request.stop_span();

    let finished = slot.lock().unwrap().take();
    finished.expect("request finishes when its root span closes")
}
