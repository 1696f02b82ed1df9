//! The tracked request: one logical unit of work and its span stack.
//!
//! A [`TrackedRequest`] owns an ordered stack of open spans and the list of
//! spans that have already closed. Opening a span pushes onto the stack and
//! parents the new span on whatever was on top; closing pops. The moment the
//! stack goes from non-empty to empty the request finalizes itself: it fixes
//! its end time, moves everything it recorded into a [`FinishedRequest`], hands
//! that to the submitter and, for real requests, pokes the sampler.
//!
//! # Unbalanced calls
//!
//! Instrumented code commonly closes more spans than it opened. An extra
//! [`stop_span`](TrackedRequest::stop_span) is a logged no-op, and an extra
//! [`finish`](TrackedRequest::finish) never touches the end time that was
//! already recorded.

use crate::collaborators::Collaborators;
use crate::config::AbandonPolicy;
use crate::id::{RequestId, SpanId};
#[cfg(debug_assertions)]
use crate::invariants::{
    debug_assert_children_closed, debug_assert_spans_unique, debug_assert_top_parented_on_below,
};
use crate::span::Span;
use crate::tags::{self, TagValue, Tags};
use chrono::{DateTime, Utc};
use std::mem;
use std::time::Duration;
use tracing::{debug, warn};

/// Span stack and tags for one unit of work in one execution context.
#[derive(Debug)]
pub struct TrackedRequest {
    id: RequestId,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    /// Open spans; the last element is the innermost
    active_spans: Vec<Span>,
    /// Closed spans in closure order
    complete_spans: Vec<Span>,
    tags: Tags,
    is_real: bool,
    finished: bool,
    abandon_policy: AbandonPolicy,
    collaborators: Collaborators,
}

impl TrackedRequest {
    /// Creates a request that hands itself to `collaborators` when it finishes.
    pub fn new(collaborators: Collaborators) -> Self {
        let request = Self {
            id: RequestId::new(),
            start_time: Utc::now(),
            end_time: None,
            active_spans: Vec::new(),
            complete_spans: Vec::new(),
            tags: Tags::new(),
            is_real: false,
            finished: false,
            abandon_policy: AbandonPolicy::default(),
            collaborators,
        };
        debug!(request_id = %request.id, "starting request");
        request
    }

    /// Sets what happens if this request is dropped with spans still open.
    pub fn with_abandon_policy(mut self, policy: AbandonPolicy) -> Self {
        self.abandon_policy = policy;
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// End time, set exactly once when the request finishes.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Open spans, outermost first.
    pub fn active_spans(&self) -> &[Span] {
        &self.active_spans
    }

    /// Spans closed so far, in closure order. Emptied when the request
    /// finishes and its data moves into the [`FinishedRequest`].
    pub fn complete_spans(&self) -> &[Span] {
        &self.complete_spans
    }

    pub(crate) fn active_spans_mut(&mut self) -> &mut [Span] {
        &mut self.active_spans
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// The innermost open span, if any.
    pub fn current_span(&self) -> Option<&Span> {
        self.active_spans.last()
    }

    pub fn current_span_mut(&mut self) -> Option<&mut Span> {
        self.active_spans.last_mut()
    }

    /// Looks up an open span by id.
    pub fn active_span_mut(&mut self, span_id: SpanId) -> Option<&mut Span> {
        self.active_spans.iter_mut().rev().find(|s| s.id() == span_id)
    }

    /// Marks this request as real traffic, so finishing it starts the sampler.
    pub fn mark_real(&mut self) {
        self.is_real = true;
    }

    pub fn is_real(&self) -> bool {
        self.is_real
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Sets a request-level tag, returning the value it replaced.
    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Option<TagValue> {
        let key = key.into();
        let previous = tags::upsert(&mut self.tags, key.clone(), value.into());
        if previous.is_some() {
            debug!(request_id = %self.id, key = %key, "overwriting previously set request tag");
        }
        previous
    }

    /// Opens a span nested under the current one and returns it.
    pub fn start_span(&mut self, operation: impl Into<String>) -> &mut Span {
        if self.finished {
            warn!(request_id = %self.id, "opening a span on a finished request; it will not be submitted");
        }

        let parent = self.current_span().map(Span::id);
        let span = Span::new(self.id, operation.into(), parent);

        let index = self.active_spans.len();
        self.active_spans.push(span);

        #[cfg(debug_assertions)]
        debug_assert_top_parented_on_below!(self.active_spans);

        &mut self.active_spans[index]
    }

    /// Closes the innermost open span.
    ///
    /// Returns the id of the closed span, or `None` if nothing was open (which
    /// is logged and otherwise ignored). Closing the last open span finishes
    /// the request.
    pub fn stop_span(&mut self) -> Option<SpanId> {
        let Some(mut span) = self.active_spans.pop() else {
            debug!(request_id = %self.id, "skipping attempt to pop span off empty stack");
            return None;
        };

        span.stop();

        #[cfg(debug_assertions)]
        debug_assert_children_closed!(self.active_spans, span);

        let span_id = span.id();
        self.complete_spans.push(span);

        if self.active_spans.is_empty() {
            self.finish();
        }
        Some(span_id)
    }

    /// Finalizes the request.
    ///
    /// Records the end time, submits the request and, if it is real, asks the
    /// sampler to run. Only the first call has any effect.
    pub fn finish(&mut self) {
        if self.finished {
            debug!(request_id = %self.id, "request already finished");
            return;
        }
        if !self.active_spans.is_empty() {
            warn!(
                request_id = %self.id,
                open_spans = self.active_spans.len(),
                "finishing request with spans still open"
            );
        }

        debug!(request_id = %self.id, "stopping request");
        let end_time = *self.end_time.get_or_insert_with(Utc::now);
        self.finished = true;

        #[cfg(debug_assertions)]
        debug_assert_spans_unique!(self.complete_spans);

        let finished = FinishedRequest {
            id: self.id,
            start_time: self.start_time,
            end_time,
            spans: mem::take(&mut self.complete_spans),
            tags: mem::take(&mut self.tags),
            is_real: self.is_real,
        };

        self.collaborators.submit(finished);
        if self.is_real {
            self.collaborators.ensure_sampler_running();
        }
    }
}

impl Drop for TrackedRequest {
    fn drop(&mut self) {
        if self.finished || self.active_spans.is_empty() {
            return;
        }

        warn!(
            request_id = %self.id,
            open_spans = self.active_spans.len(),
            policy = ?self.abandon_policy,
            "request abandoned with open spans"
        );

        if self.abandon_policy == AbandonPolicy::Finalize {
            while self.stop_span().is_some() {}
        }
    }
}

/// A request that has finished: the immutable record handed to the submitter.
#[derive(Debug, Clone)]
pub struct FinishedRequest {
    id: RequestId,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    spans: Vec<Span>,
    tags: Tags,
    is_real: bool,
}

impl FinishedRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    /// Completed spans, in the order they closed.
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn into_spans(self) -> Vec<Span> {
        self.spans
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn is_real(&self) -> bool {
        self.is_real
    }

    /// Wall-clock time from request start to finish.
    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time).to_std().unwrap_or_default()
    }

    /// One diagnostic line per span, in closure order.
    pub fn dump(&self) -> Vec<String> {
        self.spans.iter().map(Span::dump).collect()
    }
}
