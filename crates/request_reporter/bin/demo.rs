//! # Request Tracker Demo
//!
//! End-to-end run of the request tracker feeding a background reporter.
//!
//! ## What It Shows
//!
//! ### 1. Process-wide registry
//! - One `RequestRegistry` installed with `install`, reached from helpers via `global()`
//! - Finished requests forwarded through a `ChannelSubmitter` to a `RequestReporter`
//!
//! ### 2. Nested span waterfalls
//! - Worker threads open a root span per request and nest SQL/cache/render spans under it
//! - Request and span tags (`worker`, `rows`, `cache.hit`)
//! - Failing operations reported through `in_span_with` without leaking open spans
//!
//! ### 3. On-demand sampling
//! - Requests marked real start the `SamplerLauncher` on first finish; synthetic ones never do
//!
//! ### 4. Graceful Shutdown
//! - Every finished request is flushed before exit
//!
//! ## Running
//!
//! ```bash
//! # Quick mode (2 workers, 10 requests each)
//! cargo run -p request_reporter --bin demo -- --quick
//!
//! # Verbose mode (log every span of every request)
//! RUST_LOG=info cargo run -p request_reporter --bin demo -- --verbose
//! ```

use request_reporter::{
    LogExporter, ReporterConfig, RequestReporter, Sampler, SamplerConfig, SamplerLauncher,
};
use request_tracker::{Collaborators, RegistryConfig, RequestRegistry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Sampler that counts in-flight requests observed on each tick.
struct InFlightSampler {
    samples: AtomicU64,
}

impl Sampler for InFlightSampler {
    fn name(&self) -> &str {
        "in-flight"
    }

    fn sample(&self) {
        self.samples.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct QueryFailed(&'static str);

impl std::fmt::Display for QueryFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "query failed: {}", self.0)
    }
}

/// Code that knows nothing about the registry instance, only the global one.
fn load_rows(unit: u32) -> Result<u32, QueryFailed> {
    let Some(registry) = request_tracker::global() else {
        return Ok(0);
    };

    registry.in_span_with(
        "SQL/select",
        |e| tracing::warn!(error = %e, "select failed"),
        |span| {
            if unit % 7 == 6 {
                return Err(QueryFailed("lock timeout"));
            }
            let rows = unit * 3 + 1;
            span.tag("rows", rows);
            Ok(rows)
        },
    )
}

fn handle_request(registry: &RequestRegistry, worker: u32, unit: u32) {
    if unit % 4 != 0 {
        registry.mark_current_real();
    }
    registry.tag_current("worker", worker);

    let root = registry.span("Controller/orders#show");
    {
        let cache = root.child("Cache/get");
        cache.tag("cache.hit", unit % 2 == 0);
    }

    match load_rows(unit) {
        Ok(rows) => {
            let render = root.child("View/render");
            render.tag("rows", rows);
            std::thread::sleep(Duration::from_micros(200));
        }
        Err(_) => {
            root.tag("error", true);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let verbose = args.contains(&"--verbose".to_string());
    let quick = args.contains(&"--quick".to_string());
    let (workers, requests_per_worker) = if quick { (2u32, 10u32) } else { (4, 50) };

    println!("Demo Configuration:");
    println!("   Mode: {}", if quick { "quick" } else { "full" });
    println!("   Workers: {}", workers);
    println!("   Requests per worker: {}", requests_per_worker);
    println!();

    // Phase 1: reporter and sampler
    let (reporter, submitter) =
        RequestReporter::spawn(ReporterConfig::low_latency(), Arc::new(LogExporter::new(verbose)))?;
    let sampler = Arc::new(InFlightSampler {
        samples: AtomicU64::new(0),
    });
    let launcher = Arc::new(SamplerLauncher::new(
        SamplerConfig::default().with_interval(Duration::from_millis(20)),
        vec![sampler.clone() as Arc<dyn Sampler>],
    )?);

    // Phase 2: global registry
    let registry = request_tracker::install(RequestRegistry::new(
        RegistryConfig::default(),
        Collaborators::new(Arc::new(submitter), launcher.clone()),
    ))?;

    // Phase 3: workers
    let started = Instant::now();
    let mut handles = Vec::new();
    for worker in 0..workers {
        handles.push(tokio::task::spawn_blocking(move || {
            for unit in 0..requests_per_worker {
                handle_request(registry, worker, unit);
            }
        }));
    }
    for handle in handles {
        handle.await?;
    }
    let elapsed = started.elapsed();

    // Phase 4: shutdown
    let metrics = Arc::clone(reporter.metrics());
    reporter.shutdown().await?;
    launcher.stop();

    println!("Results:");
    println!("   Elapsed:            {:.2?}", elapsed);
    println!("   Requests received:  {}", metrics.requests_received());
    println!("   Requests exported:  {}", metrics.requests_exported());
    println!("   Batches exported:   {}", metrics.batches_exported());
    println!("   Export errors:      {}", metrics.export_errors());
    println!("   Sampler launches:   {}", launcher.launches());
    println!("   Sampler ticks:      {}", sampler.samples.load(Ordering::Relaxed));

    Ok(())
}
