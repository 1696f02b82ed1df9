//! Handoff points to the outside world.
//!
//! A tracked request talks to exactly two collaborators, and only when it
//! finishes: a [`RequestSubmitter`] that takes ownership of the finished request
//! for export, and a [`SamplerControl`] that is asked to make sure the
//! background sampler is running whenever a real request completes.
//!
//! Both are invoked synchronously on the path that closes the last span of a
//! request, so implementations should hand work off (channel send, flag flip)
//! rather than do it inline. They may be shared by every execution context in
//! the process and must tolerate concurrent calls.

use crate::request::FinishedRequest;
use std::fmt;
use std::sync::Arc;

/// Accepts finished requests for asynchronous export.
pub trait RequestSubmitter: Send + Sync {
    /// Takes ownership of a finished request. Must not block significantly.
    fn submit(&self, request: FinishedRequest);
}

/// Starts the background sampler on demand.
pub trait SamplerControl: Send + Sync {
    /// Starts the sampler if it is not already running. Idempotent.
    fn ensure_running(&self);
}

/// Blanket implementation: any `Fn(FinishedRequest)` closure is a submitter
impl<F> RequestSubmitter for F
where
    F: Fn(FinishedRequest) + Send + Sync,
{
    fn submit(&self, request: FinishedRequest) {
        self(request);
    }
}

/// Submitter that discards every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSubmitter;

impl RequestSubmitter for NullSubmitter {
    fn submit(&self, request: FinishedRequest) {
        tracing::trace!(request_id = %request.id(), "discarding finished request");
    }
}

/// Sampler control that never starts anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSampler;

impl SamplerControl for NoopSampler {
    fn ensure_running(&self) {}
}

/// The pair of collaborators a request hands itself to on finish.
///
/// Cloning is cheap (two `Arc` bumps); every request created by a registry
/// holds its own clone.
#[derive(Clone)]
pub struct Collaborators {
    submitter: Arc<dyn RequestSubmitter>,
    sampler: Arc<dyn SamplerControl>,
}

impl Collaborators {
    pub fn new(submitter: Arc<dyn RequestSubmitter>, sampler: Arc<dyn SamplerControl>) -> Self {
        Self { submitter, sampler }
    }

    /// Collaborators that drop every request and never start a sampler.
    pub fn detached() -> Self {
        Self::new(Arc::new(NullSubmitter), Arc::new(NoopSampler))
    }

    pub(crate) fn submit(&self, request: FinishedRequest) {
        self.submitter.submit(request);
    }

    pub(crate) fn ensure_sampler_running(&self) {
        self.sampler.ensure_running();
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::detached()
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Submitter that records every request it receives (for verification)
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSubmitter {
    requests: std::sync::Mutex<Vec<FinishedRequest>>,
}

#[cfg(test)]
impl RecordingSubmitter {
    pub(crate) fn submitted(&self) -> Vec<FinishedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[cfg(test)]
impl RequestSubmitter for RecordingSubmitter {
    fn submit(&self, request: FinishedRequest) {
        self.requests.lock().unwrap().push(request);
    }
}

/// Sampler control that counts how often it was asked to start
#[cfg(test)]
#[derive(Default)]
pub(crate) struct CountingSampler {
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl CountingSampler {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl SamplerControl for CountingSampler {
    fn ensure_running(&self) {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Builds collaborators backed by fresh recording doubles
#[cfg(test)]
pub(crate) fn recording() -> (Collaborators, Arc<RecordingSubmitter>, Arc<CountingSampler>) {
    let submitter = Arc::new(RecordingSubmitter::default());
    let sampler = Arc::new(CountingSampler::default());
    let collaborators = Collaborators::new(submitter.clone(), sampler.clone());
    (collaborators, submitter, sampler)
}
