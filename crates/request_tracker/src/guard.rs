//! Scoped span guards.
//!
//! [`SpanGuard`] opens a span when it is created and closes it when it is
//! dropped, on every exit path: normal return, `?` propagation, and panics.
//! Because a guard holds the request mutably, a nested guard can only be
//! created through its parent and must be dropped first, so guards close
//! strictly innermost-first.
//!
//! ```rust,ignore
//! let mut request = TrackedRequest::new(collaborators);
//! {
//!     let mut controller = request.span("Controller/users#index");
//!     controller.tag("user", 42);
//!
//!     let rows = controller.in_child_with(
//!         "SQL/Query",
//!         |err: &DbError| warn!(%err, "query failed"),
//!         |sql| run_query(sql),
//!     )?;
//! } // Controller span closed here, request finished
//! ```

use crate::id::SpanId;
use crate::request::TrackedRequest;
use crate::span::Span;
use crate::tags::TagValue;

/// Keeps a span open for as long as it lives.
#[must_use = "dropping the guard immediately closes the span"]
pub struct SpanGuard<'a> {
    request: &'a mut TrackedRequest,
    span_id: SpanId,
    /// Position of the guarded span in the active stack
    depth: usize,
}

impl<'a> SpanGuard<'a> {
    fn open(request: &'a mut TrackedRequest, operation: String) -> Self {
        let depth = request.active_spans().len();
        let span_id = request.start_span(operation).id();
        Self {
            request,
            span_id,
            depth,
        }
    }

    pub fn id(&self) -> SpanId {
        self.span_id
    }

    /// The guarded span. It is always open while the guard is alive.
    pub fn span(&self) -> &Span {
        &self.request.active_spans()[self.depth]
    }

    pub fn span_mut(&mut self) -> &mut Span {
        &mut self.request.active_spans_mut()[self.depth]
    }

    /// Tags the guarded span.
    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Option<TagValue> {
        self.span_mut().tag(key, value)
    }

    /// Tags the owning request.
    pub fn tag_request(&mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Option<TagValue> {
        self.request.tag(key, value)
    }

    pub fn mark_real(&mut self) {
        self.request.mark_real();
    }

    /// Read access to the owning request.
    pub fn request(&self) -> &TrackedRequest {
        self.request
    }

    /// Opens a nested span, closed when the returned guard drops.
    pub fn child(&mut self, operation: impl Into<String>) -> SpanGuard<'_> {
        SpanGuard::open(self.request, operation.into())
    }

    /// Runs `body` inside a nested span.
    pub fn in_child<T, E, F>(&mut self, operation: impl Into<String>, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut SpanGuard<'_>) -> Result<T, E>,
    {
        self.request.in_span(operation, body)
    }

    /// Runs `body` inside a nested span, reporting an `Err` to `on_error` first.
    pub fn in_child_with<T, E, F, H>(
        &mut self,
        operation: impl Into<String>,
        on_error: H,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut SpanGuard<'_>) -> Result<T, E>,
        H: FnOnce(&E),
    {
        self.request.in_span_with(operation, on_error, body)
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        self.request.stop_span();
    }
}

impl TrackedRequest {
    /// Opens a span that stays open until the returned guard is dropped.
    pub fn span(&mut self, operation: impl Into<String>) -> SpanGuard<'_> {
        SpanGuard::open(self, operation.into())
    }

    /// Runs `body` inside a span that is closed however `body` exits.
    pub fn in_span<T, E, F>(&mut self, operation: impl Into<String>, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut SpanGuard<'_>) -> Result<T, E>,
    {
        let mut guard = self.span(operation);
        body(&mut guard)
    }

    /// Like [`in_span`](Self::in_span), but an `Err` from `body` is passed to
    /// `on_error` before the span closes. The error is returned unchanged, and
    /// the span still closes if `on_error` panics.
    ///
    /// `on_error` only observes returned errors. If `body` panics, `on_error`
    /// is not called; the span is closed while the panic unwinds.
    pub fn in_span_with<T, E, F, H>(
        &mut self,
        operation: impl Into<String>,
        on_error: H,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut SpanGuard<'_>) -> Result<T, E>,
        H: FnOnce(&E),
    {
        let mut guard = self.span(operation);
        let result = body(&mut guard);
        if let Err(err) = &result {
            on_error(err);
        }
        drop(guard);
        result
    }
}
