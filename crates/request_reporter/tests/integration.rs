use request_reporter::{
    ExportError, ReporterConfig, RequestBatch, RequestExporter, RequestReporter, Sampler,
    SamplerConfig, SamplerLauncher,
};
use request_tracker::{Collaborators, FinishedRequest, RegistryConfig, RequestRegistry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct TestExporter {
    requests: Mutex<Vec<FinishedRequest>>,
}

impl TestExporter {
    fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
        }
    }

    fn exported_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn all_requests(&self) -> Vec<FinishedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl RequestExporter for TestExporter {
    async fn export(&self, batch: RequestBatch) -> Result<(), ExportError> {
        self.requests.lock().unwrap().extend(batch.requests);
        Ok(())
    }

    fn name(&self) -> &str {
        "test"
    }
}

#[derive(Default)]
struct CountingSampler {
    samples: AtomicU64,
}

impl Sampler for CountingSampler {
    fn name(&self) -> &str {
        "counting"
    }

    fn sample(&self) {
        self.samples.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_waterfalls() {
    let exporter = Arc::new(TestExporter::new());
    let (reporter, submitter) =
        RequestReporter::spawn(ReporterConfig::low_latency(), exporter.clone()).unwrap();

    let sampler = Arc::new(CountingSampler::default());
    let launcher = Arc::new(
        SamplerLauncher::new(
            SamplerConfig::default().with_interval(Duration::from_millis(10)),
            vec![sampler.clone() as Arc<dyn Sampler>],
        )
        .unwrap(),
    );

    let registry = Arc::new(RequestRegistry::new(
        RegistryConfig::default(),
        Collaborators::new(Arc::new(submitter), launcher.clone()),
    ));

    // Span tracking is thread-bound, so each unit of work runs on a blocking thread
    let mut workers = Vec::new();
    for worker in 0..4 {
        let registry = Arc::clone(&registry);
        workers.push(tokio::task::spawn_blocking(move || {
            for unit in 0..50 {
                registry.mark_current_real();
                registry.tag_current("worker", worker);
                let root = registry.span("Controller/index");
                root.tag("unit", unit);
                let _sql = root.child("SQL/Query");
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    reporter.shutdown().await.unwrap();

    assert_eq!(exporter.exported_count(), 200);
    for request in exporter.all_requests() {
        let spans = request.spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].operation(), "SQL/Query");
        assert_eq!(spans[0].parent_id(), Some(spans[1].id()));
        assert!(request.is_real());
        assert!(request.tags().contains_key("worker"));
    }

    assert_eq!(launcher.launches(), 1);
    assert!(sampler.samples.load(Ordering::Relaxed) >= 1);
    launcher.stop();
}

#[tokio::test]
async fn test_synthetic_requests_do_not_start_sampler() {
    let exporter = Arc::new(TestExporter::new());
    let (reporter, submitter) =
        RequestReporter::spawn(ReporterConfig::default(), exporter.clone()).unwrap();
    let launcher = Arc::new(SamplerLauncher::new(SamplerConfig::default(), Vec::new()).unwrap());

    let registry = RequestRegistry::new(
        RegistryConfig::default(),
        Collaborators::new(Arc::new(submitter), launcher.clone()),
    );

    for _ in 0..5 {
        let _span = registry.span("Job/internal");
    }

    reporter.shutdown().await.unwrap();
    assert_eq!(exporter.exported_count(), 5);
    assert!(!launcher.is_running());
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn test_requests_after_shutdown_are_dropped() {
    let exporter = Arc::new(TestExporter::new());
    let (reporter, submitter) =
        RequestReporter::spawn(ReporterConfig::default(), exporter.clone()).unwrap();
    let metrics = Arc::clone(reporter.metrics());

    let registry = RequestRegistry::new(
        RegistryConfig::default(),
        Collaborators::new(Arc::new(submitter), Arc::new(request_tracker::NoopSampler)),
    );

    drop(registry.span("Before"));
    reporter.shutdown().await.unwrap();
    drop(registry.span("After"));

    assert_eq!(exporter.exported_count(), 1);
    assert_eq!(metrics.requests_dropped(), 1);
}
