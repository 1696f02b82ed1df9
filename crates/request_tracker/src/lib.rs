//! Request and Span Lifecycle Tracking
//!
//! Tracks one logical unit of work (a *request*) as a tree of timed, named
//! operations (*spans*) so a reporting pipeline can rebuild its timing
//! waterfall later.
//!
//! - [`TrackedRequest`] owns a LIFO stack of open spans and the list of spans
//!   that have closed. Closing the last open span finalizes the request.
//! - [`Span`] is one timed interval with its tags.
//! - [`SpanGuard`] and [`ScopedSpan`] close their span on every exit path.
//! - [`RequestRegistry`] binds one request to each thread, created lazily and
//!   released once it finishes.
//!
//! Finished requests leave through two narrow seams, [`RequestSubmitter`] and
//! [`SamplerControl`]; the `request_reporter` crate provides tokio-backed
//! implementations of both.
//!
//! # Example
//!
//! ```ignore
//! use request_tracker::{Collaborators, RegistryConfig, RequestRegistry};
//!
//! let registry = RequestRegistry::new(RegistryConfig::default(), Collaborators::detached());
//!
//! registry.mark_current_real();
//! {
//!     let controller = registry.span("Controller/users#index");
//!     controller.tag("user_id", 42);
//!     {
//!         let _sql = controller.child("SQL/Query");
//!     }
//! } // request finished and submitted here
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod guard;
pub mod id;
mod invariants;
pub mod registry;
pub mod request;
pub mod span;
pub mod tags;

// Re-export main types
pub use collaborators::{Collaborators, NoopSampler, NullSubmitter, RequestSubmitter, SamplerControl};
pub use config::{AbandonPolicy, RegistryConfig};
pub use error::{ConfigError, InstallError};
pub use guard::SpanGuard;
pub use id::{RequestId, SpanId};
pub use registry::{global, install, RequestRegistry, ScopedSpan};
pub use request::{FinishedRequest, TrackedRequest};
pub use span::Span;
pub use tags::{TagValue, Tags};
