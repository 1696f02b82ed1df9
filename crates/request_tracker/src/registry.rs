//! Context-local request ownership.
//!
//! A [`RequestRegistry`] gives every thread its own [`TrackedRequest`], found
//! without threading the request through call signatures. The first access on
//! a thread creates the request; once that request finishes, its binding is
//! released and the next access starts a fresh one.
//!
//! # Ownership model
//!
//! Bindings live in a thread-local map keyed by a process-unique registry key,
//! so:
//!
//! - two threads never see the same request (no locking is involved)
//! - two registries on the same thread never share a request
//!
//! A registry is an ordinary value: tests build their own, and applications
//! that want process-wide access [`install`] one and reach it via [`global`].
//!
//! # Teardown
//!
//! When a thread exits, its bindings are dropped and any request still holding
//! open spans is handled according to the registry's [`AbandonPolicy`]
//! (finalized by default). [`RequestRegistry::teardown_current`] does the same
//! for the calling thread on demand, for executors that reuse threads across
//! logical units of work.
//!
//! # Re-entrancy
//!
//! The closure passed to [`RequestRegistry::with_current`] runs while the
//! thread's bindings are borrowed; it must not call back into a registry on the
//! same thread (that includes dropping a [`ScopedSpan`]).
//!
//! [`AbandonPolicy`]: crate::AbandonPolicy

use crate::collaborators::Collaborators;
use crate::config::RegistryConfig;
use crate::error::InstallError;
use crate::id::{RequestId, SpanId};
use crate::request::TrackedRequest;
use crate::span::Span;
use crate::tags::TagValue;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::{debug, warn};

static NEXT_REGISTRY_KEY: AtomicU64 = AtomicU64::new(1);
static GLOBAL_REGISTRY: OnceLock<RequestRegistry> = OnceLock::new();

thread_local! {
    static BINDINGS: RefCell<HashMap<u64, TrackedRequest>> = RefCell::new(HashMap::new());
}

/// Installs the process-wide registry. Only the first call succeeds.
pub fn install(registry: RequestRegistry) -> Result<&'static RequestRegistry, InstallError> {
    GLOBAL_REGISTRY
        .set(registry)
        .map_err(|_| InstallError::AlreadyInstalled)?;
    GLOBAL_REGISTRY.get().ok_or(InstallError::AlreadyInstalled)
}

/// The process-wide registry, if one has been installed.
pub fn global() -> Option<&'static RequestRegistry> {
    GLOBAL_REGISTRY.get()
}

/// Owns one [`TrackedRequest`] per thread.
#[derive(Debug)]
pub struct RequestRegistry {
    key: u64,
    config: RegistryConfig,
    collaborators: Collaborators,
}

impl RequestRegistry {
    pub fn new(config: RegistryConfig, collaborators: Collaborators) -> Self {
        Self {
            key: NEXT_REGISTRY_KEY.fetch_add(1, Ordering::Relaxed),
            config,
            collaborators,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Runs `f` on this thread's request, creating it on first access.
    ///
    /// If the request has finished by the time `f` returns, the binding is
    /// released so the next access creates a new request.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut TrackedRequest) -> R) -> R {
        BINDINGS.with(|bindings| {
            let mut bindings = bindings.borrow_mut();
            let request = bindings
                .entry(self.key)
                .or_insert_with(|| self.new_request());
            let out = f(request);
            if request.is_finished() {
                let request_id = request.id();
                bindings.remove(&self.key);
                debug!(request_id = %request_id, "released request binding");
            }
            out
        })
    }

    /// Runs `f` on this thread's request only if one is already bound.
    fn with_bound<R>(&self, f: impl FnOnce(&mut TrackedRequest) -> R) -> Option<R> {
        BINDINGS.with(|bindings| {
            let mut bindings = bindings.borrow_mut();
            let request = bindings.get_mut(&self.key)?;
            let out = f(request);
            if request.is_finished() {
                let request_id = request.id();
                bindings.remove(&self.key);
                debug!(request_id = %request_id, "released request binding");
            }
            Some(out)
        })
    }

    fn new_request(&self) -> TrackedRequest {
        TrackedRequest::new(self.collaborators.clone())
            .with_abandon_policy(self.config.abandon_policy)
    }

    /// Whether this thread currently has a request bound.
    pub fn has_current(&self) -> bool {
        BINDINGS.with(|bindings| bindings.borrow().contains_key(&self.key))
    }

    /// Id of this thread's request, without creating one.
    pub fn current_request_id(&self) -> Option<RequestId> {
        BINDINGS.with(|bindings| bindings.borrow().get(&self.key).map(TrackedRequest::id))
    }

    /// Id of the innermost open span on this thread, without creating a request.
    pub fn current_span_id(&self) -> Option<SpanId> {
        BINDINGS.with(|bindings| {
            bindings
                .borrow()
                .get(&self.key)
                .and_then(TrackedRequest::current_span)
                .map(Span::id)
        })
    }

    /// Tags this thread's request.
    pub fn tag_current(&self, key: impl Into<String>, value: impl Into<TagValue>) -> Option<TagValue> {
        self.with_current(|request| request.tag(key, value))
    }

    /// Marks this thread's request as real traffic.
    pub fn mark_current_real(&self) {
        self.with_current(TrackedRequest::mark_real);
    }

    /// Opens a span on this thread's request, closed when the guard drops.
    pub fn span(&self, operation: impl Into<String>) -> ScopedSpan<'_> {
        let span_id = self.with_current(|request| request.start_span(operation).id());
        ScopedSpan {
            registry: self,
            span_id,
            _not_send: PhantomData,
        }
    }

    /// Runs `body` inside a span on this thread's request.
    pub fn in_span<T, E, F>(&self, operation: impl Into<String>, body: F) -> Result<T, E>
    where
        F: FnOnce(&ScopedSpan<'_>) -> Result<T, E>,
    {
        let span = self.span(operation);
        body(&span)
    }

    /// Like [`in_span`](Self::in_span), reporting an `Err` to `on_error` before
    /// the span closes. The span closes even if `on_error` panics.
    ///
    /// A panic in `body` bypasses `on_error`; the span is still closed as the
    /// panic unwinds.
    pub fn in_span_with<T, E, F, H>(&self, operation: impl Into<String>, on_error: H, body: F) -> Result<T, E>
    where
        F: FnOnce(&ScopedSpan<'_>) -> Result<T, E>,
        H: FnOnce(&E),
    {
        let span = self.span(operation);
        let result = body(&span);
        if let Err(err) = &result {
            on_error(err);
        }
        drop(span);
        result
    }

    /// Releases this thread's binding, applying the abandon policy if spans
    /// are still open.
    pub fn teardown_current(&self) {
        let released = BINDINGS.with(|bindings| bindings.borrow_mut().remove(&self.key));
        if let Some(request) = released {
            debug!(request_id = %request.id(), "tearing down request binding");
            // Dropped outside the borrow: finalizing may call the collaborators.
            drop(request);
        }
    }

    /// Closes the scoped span `span_id` together with any spans opened above
    /// it. A span that is not open on the bound request (its request was
    /// finished or torn down) closes nothing.
    fn close_scoped(&self, span_id: SpanId) {
        let warn_out_of_order = self.config.warn_on_out_of_order_close;
        let closed = self.with_bound(|request| {
            let active = request.active_spans();
            let Some(position) = active.iter().position(|s| s.id() == span_id) else {
                debug!(
                    request_id = %request.id(),
                    span_id = %span_id,
                    "scoped span is not open on the bound request, nothing to close"
                );
                return;
            };

            let open_children = active.len() - position - 1;
            if warn_out_of_order && open_children > 0 {
                warn!(
                    request_id = %request.id(),
                    span_id = %span_id,
                    open_children,
                    "closing a scoped span that is not the innermost open span"
                );
            }
            for _ in 0..=open_children {
                request.stop_span();
            }
        });
        if closed.is_none() {
            debug!(span_id = %span_id, "scoped span closed after its request was released");
        }
    }
}

impl Drop for RequestRegistry {
    fn drop(&mut self) {
        // Bindings on other threads are released when those threads exit.
        let released = BINDINGS
            .try_with(|bindings| bindings.borrow_mut().remove(&self.key))
            .ok()
            .flatten();
        drop(released);
    }
}

/// A span on the current thread's request, closed when dropped.
///
/// Dropping it closes its own span and any spans still open above it. Once its
/// request has finished or been torn down, dropping it does nothing. Bound to
/// the thread that opened it (`!Send`).
#[must_use = "dropping the scoped span immediately closes it"]
pub struct ScopedSpan<'r> {
    registry: &'r RequestRegistry,
    span_id: SpanId,
    // ensure this type is !Send as it relies on thread locals
    _not_send: PhantomData<*const ()>,
}

impl ScopedSpan<'_> {
    pub fn id(&self) -> SpanId {
        self.span_id
    }

    /// Tags this span. Returns the replaced value, or `None` if there was none
    /// (or the span is no longer open).
    pub fn tag(&self, key: impl Into<String>, value: impl Into<TagValue>) -> Option<TagValue> {
        self.registry
            .with_bound(|request| {
                request
                    .active_span_mut(self.span_id)
                    .and_then(|span| span.tag(key, value))
            })
            .flatten()
    }

    /// Tags the request this span belongs to.
    pub fn tag_request(&self, key: impl Into<String>, value: impl Into<TagValue>) -> Option<TagValue> {
        self.registry.tag_current(key, value)
    }

    /// Opens a nested span.
    pub fn child(&self, operation: impl Into<String>) -> ScopedSpan<'_> {
        self.registry.span(operation)
    }
}

impl Drop for ScopedSpan<'_> {
    fn drop(&mut self) {
        self.registry.close_scoped(self.span_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::recording;
    use crate::config::AbandonPolicy;
    use std::thread;

    #[test]
    fn test_lazy_creation_and_release() {
        let (collaborators, submitter, _) = recording();
        let registry = RequestRegistry::new(RegistryConfig::default(), collaborators);

        assert!(!registry.has_current());
        let first = registry.with_current(|request| request.id());
        assert!(registry.has_current());
        assert_eq!(registry.current_request_id(), Some(first));

        registry.with_current(|request| {
            request.start_span("A");
            request.stop_span();
        });
        assert!(!registry.has_current());
        assert_eq!(submitter.count(), 1);
        assert_eq!(submitter.submitted()[0].id(), first);

        let second = registry.with_current(|request| request.id());
        assert_ne!(first, second);
    }

    #[test]
    fn test_scoped_spans_nest() {
        let (collaborators, submitter, _) = recording();
        let registry = RequestRegistry::new(RegistryConfig::default(), collaborators);
        let (outer_id, inner_id);
        {
            let outer = registry.span("Controller/index");
            outer_id = outer.id();
            {
                let inner = outer.child("SQL/Query");
                inner_id = inner.id();
                assert_eq!(registry.current_span_id(), Some(inner_id));
                inner.tag("rows", 10);
            }
            assert_eq!(registry.current_span_id(), Some(outer_id));
        }

        assert!(!registry.has_current());
        let submitted = submitter.submitted();
        let spans = submitted[0].spans();
        assert_eq!(spans[0].id(), inner_id);
        assert_eq!(spans[0].parent_id(), Some(outer_id));
        assert_eq!(spans[0].tags()["rows"], TagValue::from(10));
        assert_eq!(spans[1].id(), outer_id);
    }

    #[test]
    fn test_registries_do_not_share_requests() {
        let registry_a = RequestRegistry::new(RegistryConfig::default(), Collaborators::detached());
        let registry_b = RequestRegistry::new(RegistryConfig::default(), Collaborators::detached());

        let a = registry_a.with_current(|request| request.id());
        let b = registry_b.with_current(|request| request.id());
        assert_ne!(a, b);
    }

    #[test]
    fn test_threads_get_distinct_requests() {
        let registry = RequestRegistry::new(RegistryConfig::default(), Collaborators::detached());
        let here = registry.with_current(|request| request.id());

        thread::scope(|scope| {
            let there = scope
                .spawn(|| registry.with_current(|request| request.id()))
                .join()
                .unwrap();
            assert_ne!(here, there);
        });
        assert_eq!(registry.current_request_id(), Some(here));
    }

    #[test]
    fn test_in_span_with_reports_error() {
        let (collaborators, submitter, _) = recording();
        let registry = RequestRegistry::new(RegistryConfig::default(), collaborators);
        let mut seen = Vec::new();

        let result: Result<(), &str> =
            registry.in_span_with("HTTP/post", |err| seen.push(*err), |_| Err("timeout"));

        assert_eq!(result, Err("timeout"));
        assert_eq!(seen, vec!["timeout"]);
        assert!(submitter.submitted()[0].spans()[0].is_stopped());
    }

    #[test]
    fn test_teardown_finalizes_open_spans() {
        let (collaborators, submitter, _) = recording();
        let registry = RequestRegistry::new(RegistryConfig::default(), collaborators);

        registry.with_current(|request| {
            request.start_span("Job/run");
        });
        registry.teardown_current();

        assert!(!registry.has_current());
        assert_eq!(submitter.count(), 1);
    }

    #[test]
    fn test_teardown_discard_policy() {
        let (collaborators, submitter, _) = recording();
        let config = RegistryConfig::default().with_abandon_policy(AbandonPolicy::Discard);
        let registry = RequestRegistry::new(config, collaborators);

        registry.with_current(|request| {
            request.start_span("Job/run");
        });
        registry.teardown_current();
        assert_eq!(submitter.count(), 0);
    }

    #[test]
    fn test_mark_current_real_starts_sampler() {
        let (collaborators, _, sampler) = recording();
        let registry = RequestRegistry::new(RegistryConfig::default(), collaborators);

        registry.mark_current_real();
        drop(registry.span("Controller/index"));
        assert_eq!(sampler.calls(), 1);
    }

    #[test]
    fn test_stale_guard_after_teardown_leaves_new_request_alone() {
        let (collaborators, submitter, _) = recording();
        let registry = RequestRegistry::new(RegistryConfig::default(), collaborators);

        let stale = registry.span("Old/root");
        registry.teardown_current();
        assert_eq!(submitter.count(), 1);

        let fresh = registry.span("New/root");
        drop(stale);

        assert!(registry.has_current());
        assert_eq!(registry.current_span_id(), Some(fresh.id()));
        assert_eq!(submitter.count(), 1);

        drop(fresh);
        let submitted = submitter.submitted();
        assert_eq!(submitted.len(), 2);
        let ops: Vec<_> = submitted[1].spans().iter().map(Span::operation).collect();
        assert_eq!(ops, vec!["New/root"]);
    }

    #[test]
    fn test_stale_guard_after_explicit_finish_leaves_new_request_alone() {
        let (collaborators, submitter, _) = recording();
        let registry = RequestRegistry::new(RegistryConfig::default(), collaborators);

        let stale = registry.span("Old/root");
        registry.with_current(TrackedRequest::finish);
        assert!(!registry.has_current());

        let fresh = registry.span("New/root");
        let child = fresh.child("SQL/Query");
        drop(stale);

        assert_eq!(registry.current_span_id(), Some(child.id()));
        assert_eq!(submitter.count(), 1);

        drop(child);
        drop(fresh);
        let submitted = submitter.submitted();
        assert_eq!(submitted.len(), 2);
        let ops: Vec<_> = submitted[1].spans().iter().map(Span::operation).collect();
        assert_eq!(ops, vec!["SQL/Query", "New/root"]);
    }

    #[test]
    fn test_out_of_order_drop_closes_open_children_first() {
        let (collaborators, submitter, _) = recording();
        let registry = RequestRegistry::new(RegistryConfig::default(), collaborators);

        let outer = registry.span("A");
        let inner = registry.span("B");
        let (outer_id, inner_id) = (outer.id(), inner.id());

        drop(outer);
        assert_eq!(submitter.count(), 1);
        drop(inner);
        assert_eq!(submitter.count(), 1);

        let submitted = submitter.submitted();
        let ids: Vec<_> = submitted[0].spans().iter().map(Span::id).collect();
        assert_eq!(ids, vec![inner_id, outer_id]);
    }
}
