use crate::id::{RequestId, SpanId};
#[cfg(debug_assertions)]
use crate::invariants::debug_assert_not_stopped;
use crate::tags::{self, TagValue, Tags};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::time::Duration;

/// A single named, timed interval within a tracked request.
///
/// Spans are created by [`TrackedRequest::start_span`](crate::TrackedRequest::start_span)
/// and stopped by the owning request when they are popped off its stack; there
/// is no way to stop a span from outside the crate.
#[derive(Debug, Clone)]
pub struct Span {
    /// Unique span identifier
    span_id: SpanId,
    /// Owning request (back-reference only)
    request_id: RequestId,
    /// Operation name
    operation: String,
    /// Span on top of the stack when this one was opened (None at the root)
    parent_span_id: Option<SpanId>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    tags: Tags,
}

impl Span {
    pub(crate) fn new(
        request_id: RequestId,
        operation: String,
        parent_span_id: Option<SpanId>,
    ) -> Self {
        Self {
            span_id: SpanId::new(),
            request_id,
            operation,
            parent_span_id,
            start_time: Utc::now(),
            end_time: None,
            tags: Tags::new(),
        }
    }

    /// Records the end time. Only the owning request calls this, once, on pop.
    pub(crate) fn stop(&mut self) {
        #[cfg(debug_assertions)]
        debug_assert_not_stopped!(self);

        self.end_time = Some(Utc::now());
    }

    pub fn id(&self) -> SpanId {
        self.span_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn parent_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// End time, or `None` while the span is still open.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn is_stopped(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Sets a tag, returning the value it replaced.
    pub fn tag(&mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Option<TagValue> {
        let key = key.into();
        let previous = tags::upsert(&mut self.tags, key.clone(), value.into());
        if previous.is_some() {
            tracing::debug!(span_id = %self.span_id, key = %key, "overwriting previously set span tag");
        }
        previous
    }

    /// Elapsed time of the span.
    ///
    /// For a stopped span this is `end_time - start_time` and never changes. For
    /// an open span it is measured against the current time, so repeated calls
    /// return increasing values.
    pub fn duration(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or_default()
    }

    /// [`duration`](Self::duration) in fractional seconds.
    pub fn duration_secs(&self) -> f64 {
        self.duration().as_secs_f64()
    }

    /// Human-readable diagnostic line for this span.
    pub fn dump(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request={} operation={} id={} parent=",
            self.request_id, self.operation, self.span_id
        )?;
        match self.parent_span_id {
            Some(parent) => write!(f, "{}", parent)?,
            None => f.write_str("none")?,
        }
        write!(
            f,
            " start_time={} end_time=",
            self.start_time.to_rfc3339_opts(SecondsFormat::Micros, true)
        )?;
        match self.end_time {
            Some(end) => f.write_str(&end.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => f.write_str("in-progress"),
        }
    }
}
