//! Reporting Collaborators for request_tracker
//!
//! Tokio-backed implementations of the two seams a finished request crosses:
//!
//! - [`ChannelSubmitter`] implements `RequestSubmitter` by pushing onto an
//!   unbounded channel drained by a [`RequestReporter`] task, which batches
//!   finished requests and hands them to a [`RequestExporter`].
//! - [`SamplerLauncher`] implements `SamplerControl`: the first call spawns a
//!   periodic task running every registered [`Sampler`], later calls do
//!   nothing.
//!
//! # Example
//!
//! ```ignore
//! use request_reporter::{LogExporter, ReporterConfig, RequestReporter, SamplerConfig, SamplerLauncher};
//! use request_tracker::{Collaborators, RegistryConfig, RequestRegistry};
//! use std::sync::Arc;
//!
//! let (reporter, submitter) = RequestReporter::spawn(ReporterConfig::default(), Arc::new(LogExporter::new(true)))?;
//! let sampler = SamplerLauncher::new(SamplerConfig::default(), Vec::new())?;
//! let registry = RequestRegistry::new(
//!     RegistryConfig::default(),
//!     Collaborators::new(Arc::new(submitter), Arc::new(sampler)),
//! );
//! ```

pub mod async_bridge;
pub mod batch_processor;
pub mod error;
pub mod exporter;
pub mod sampler;

// Re-export main types
pub use async_bridge::{ChannelSubmitter, ReporterConfig, ReporterMetrics, RequestReporter};
pub use batch_processor::{BatchConfig, BatchMetrics, BatchProcessor};
pub use error::ReporterError;
pub use exporter::{ExportError, LogExporter, NullExporter, RequestBatch, RequestExporter, RequestExporterBoxed};
pub use sampler::{Sampler, SamplerConfig, SamplerLauncher};
