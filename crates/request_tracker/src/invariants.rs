//! Debug assertion macros for span stack invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so the hot path of
//! opening and closing spans carries no extra checks in release builds.

// =============================================================================
// Parent linkage
// =============================================================================

/// Assert that the span just pushed is parented on the span directly beneath
/// it in the active stack.
///
/// **Invariant**: `start_span → stack[n-1].parent == stack[n-2].id (or none if n == 1)`
///
/// Used in: `TrackedRequest::start_span()`
macro_rules! debug_assert_top_parented_on_below {
    ($active:expr) => {
        debug_assert!(
            match $active.as_slice() {
                [] => true,
                [.., below, top] => top.parent_id() == Some(below.id()),
                [top] => top.parent_id().is_none(),
            },
            "parent linkage violated: stack top is not parented on the span beneath it"
        )
    };
}

// =============================================================================
// Stop exactly once
// =============================================================================

/// Assert that a span is stopped at most once.
///
/// **Invariant**: `Span::stop() is only reached while end_time is unset`
///
/// Used in: `Span::stop()`
macro_rules! debug_assert_not_stopped {
    ($span:expr) => {
        debug_assert!(
            $span.end_time().is_none(),
            "span {} stopped twice",
            $span.id()
        )
    };
}

// =============================================================================
// Closure order
// =============================================================================

/// Assert that a popped span leaves no open child behind.
///
/// **Invariant**: `stop_span → no active span has the closing span as its parent`
///
/// Used in: `TrackedRequest::stop_span()`
macro_rules! debug_assert_children_closed {
    ($active:expr, $closing:expr) => {
        debug_assert!(
            $active
                .iter()
                .all(|s| s.parent_id() != Some($closing.id())),
            "LIFO violated: span {} closed while one of its children is open",
            $closing.id()
        )
    };
}

// =============================================================================
// Each span completes exactly once
// =============================================================================

/// Assert that no span appears twice among a request's completed spans.
///
/// **Invariant**: `finish() → complete_spans holds every opened span exactly once`
///
/// Used in: `TrackedRequest::finish()`
macro_rules! debug_assert_spans_unique {
    ($complete:expr) => {
        debug_assert!(
            {
                let mut seen = std::collections::HashSet::new();
                $complete.iter().all(|s| seen.insert(s.id()))
            },
            "a completed span was recorded more than once"
        )
    };
}

// =============================================================================
// Re-exports for crate-internal use
// =============================================================================

pub(crate) use debug_assert_children_closed;
pub(crate) use debug_assert_not_stopped;
pub(crate) use debug_assert_spans_unique;
pub(crate) use debug_assert_top_parented_on_below;
