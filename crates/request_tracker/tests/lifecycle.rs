use request_tracker::{
    Collaborators, FinishedRequest, RequestSubmitter, SamplerControl, Span, TagValue,
    TrackedRequest,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct TestSubmitter {
    requests: Mutex<Vec<FinishedRequest>>,
}

impl TestSubmitter {
    fn submitted(&self) -> Vec<FinishedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl RequestSubmitter for TestSubmitter {
    fn submit(&self, request: FinishedRequest) {
        self.requests.lock().unwrap().push(request);
    }
}

#[derive(Default)]
struct TestSampler {
    starts: AtomicUsize,
}

impl SamplerControl for TestSampler {
    fn ensure_running(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }
}

fn tracked() -> (TrackedRequest, Arc<TestSubmitter>, Arc<TestSampler>) {
    let submitter = Arc::new(TestSubmitter::default());
    let sampler = Arc::new(TestSampler::default());
    let request = TrackedRequest::new(Collaborators::new(submitter.clone(), sampler.clone()));
    (request, submitter, sampler)
}

#[test]
fn test_nested_spans_waterfall() {
    let (mut request, submitter, _) = tracked();

    let a = request.start_span("A").id();
    let b = request.start_span("B").id();
    request.stop_span();
    assert!(submitter.submitted().is_empty(), "finished before the root closed");
    request.stop_span();

    let submitted = submitter.submitted();
    assert_eq!(submitted.len(), 1);
    let spans = submitted[0].spans();
    assert_eq!(spans.iter().map(Span::id).collect::<Vec<_>>(), vec![b, a]);
    assert_eq!(spans[0].parent_id(), Some(a));
    assert_eq!(spans[1].parent_id(), None);
}

#[test]
fn test_siblings_close_in_call_order() {
    let (mut request, submitter, _) = tracked();

    let root = request.start_span("Controller").id();
    let first = request.start_span("SQL/1").id();
    request.stop_span();
    let second = request.start_span("SQL/2").id();
    request.stop_span();
    request.stop_span();

    let submitted = submitter.submitted();
    let spans = submitted[0].spans();
    assert_eq!(
        spans.iter().map(Span::id).collect::<Vec<_>>(),
        vec![first, second, root]
    );
    assert!(spans[..2].iter().all(|s| s.parent_id() == Some(root)));
}

#[test]
fn test_excess_stops_are_ignored() {
    let (mut request, submitter, _) = tracked();
    assert_eq!(request.stop_span(), None);
    assert_eq!(request.stop_span(), None);
    assert!(request.complete_spans().is_empty());
    assert!(submitter.submitted().is_empty());

    request.start_span("A");
    request.stop_span();
    assert_eq!(request.stop_span(), None);
    assert_eq!(submitter.submitted().len(), 1);
}

#[test]
fn test_real_request_signals_sampler_once() {
    let (mut request, submitter, sampler) = tracked();
    request.mark_real();
    request.start_span("Controller/index");
    request.stop_span();
    request.finish();

    assert_eq!(sampler.starts.load(Ordering::SeqCst), 1);
    let submitted = submitter.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(Some(submitted[0].end_time()), request.end_time());
}

#[test]
fn test_end_time_fixed_at_last_close() {
    let (mut request, submitter, _) = tracked();
    request.start_span("A");
    thread::sleep(Duration::from_millis(2));
    request.stop_span();

    let end = request.end_time().unwrap();
    thread::sleep(Duration::from_millis(2));
    request.finish();
    assert_eq!(request.end_time(), Some(end));

    let submitted = submitter.submitted();
    let root = &submitted[0].spans()[0];
    assert_eq!(root.end_time().map(|t| t <= end), Some(true));
    assert!(submitted[0].duration() >= root.duration());
}

#[test]
fn test_guard_error_path_records_span() {
    #[derive(Debug, PartialEq)]
    struct QueryError(&'static str);

    let (mut request, submitter, _) = tracked();
    let observed = Mutex::new(Vec::new());

    let result = {
        let mut root = request.span("Controller/index");
        root.tag_request("path", "/users");
        root.in_child_with(
            "SQL/Query",
            |err: &QueryError| observed.lock().unwrap().push(err.0),
            |sql| {
                sql.tag("table", "users");
                Err::<(), _>(QueryError("deadlock"))
            },
        )
    };

    assert_eq!(result, Err(QueryError("deadlock")));
    assert_eq!(*observed.lock().unwrap(), vec!["deadlock"]);

    let submitted = submitter.submitted();
    let spans = submitted[0].spans();
    assert_eq!(spans[0].operation(), "SQL/Query");
    assert!(spans[0].end_time().is_some());
    assert_eq!(spans[0].tags()["table"], TagValue::from("users"));
    assert_eq!(submitted[0].tags()["path"], TagValue::from("/users"));
}
