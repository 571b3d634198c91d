use std::cell::RefCell;
use std::rc::{Rc, Weak};

use dtrace_async::domain::{DecodeError, SessionError, SessionStatus, Value};
use dtrace_async::engine::replay::{Capture, ReplayEngine};
use dtrace_async::engine::WorkStatus;
use dtrace_async::session::{Callback, Session, SessionConfig, WorkerPool};
use dtrace_async_common::ActionKind;

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/syscalls.json");
const PROGRAM: &str = "syscall::read:entry { @calls[probefunc] = count(); }";

type Outcomes = Rc<RefCell<Vec<Result<(), SessionError>>>>;

fn recorder() -> (Outcomes, Callback) {
    let outcomes: Outcomes = Rc::default();
    let slot = Rc::clone(&outcomes);
    (outcomes, Box::new(move |result: Result<(), SessionError>| slot.borrow_mut().push(result)))
}

/// Start a control operation, wait for it, and return its single outcome
fn control(
    session: &Session<ReplayEngine>,
    start: impl FnOnce(&Session<ReplayEngine>, Callback) -> Result<(), SessionError>,
) -> Result<(), SessionError> {
    let (outcomes, callback) = recorder();
    start(session, callback)?;
    assert!(session.is_busy());
    assert!(session.wait());
    assert!(!session.is_busy());
    let mut outcomes = outcomes.borrow_mut();
    assert_eq!(outcomes.len(), 1, "completion callback must run exactly once");
    outcomes.remove(0)
}

fn open_with(pool: &WorkerPool, capture: Capture) -> (Session<ReplayEngine>, Result<(), SessionError>) {
    let (outcomes, callback) = recorder();
    let session = Session::open(
        pool,
        Box::new(move || ReplayEngine::open(capture)),
        &SessionConfig::default(),
        callback,
    );
    assert!(session.is_busy());
    assert_eq!(session.status(), SessionStatus::Opening);
    assert!(session.wait());
    let result = outcomes.borrow_mut().remove(0);
    (session, result)
}

fn fixture() -> Capture {
    Capture::load(FIXTURE).expect("Failed to load fixture")
}

fn running(pool: &WorkerPool, capture: Capture) -> Session<ReplayEngine> {
    let (session, opened) = open_with(pool, capture);
    opened.expect("open failed");
    control(&session, |s, cb| s.strcompile(PROGRAM, cb)).expect("strcompile failed");
    control(&session, |s, cb| s.go(cb)).expect("go failed");
    session
}

fn collect_consume(session: &Session<ReplayEngine>) -> (Vec<Vec<Value>>, WorkStatus) {
    let mut calls = Vec::new();
    let status = session.consume(|args| calls.push(args.to_vec())).expect("consume failed");
    (calls, status)
}

fn collect_aggwalk(session: &Session<ReplayEngine>) -> Vec<Vec<Value>> {
    let mut tuples = Vec::new();
    let dispatched = session.aggwalk(|args| tuples.push(args.to_vec())).expect("aggwalk failed");
    assert_eq!(dispatched, tuples.len());
    tuples
}

fn strs(values: &[&str]) -> Vec<Value> {
    values.iter().copied().map(Value::from).collect()
}

#[test]
fn test_open_from_file_reaches_ready() {
    let pool = WorkerPool::new(2).unwrap();
    let (outcomes, callback) = recorder();
    let session =
        Session::open(&pool, ReplayEngine::opener(FIXTURE), &SessionConfig::default(), callback);
    assert!(session.wait());

    assert_eq!(outcomes.borrow().len(), 1);
    assert_eq!(outcomes.borrow()[0], Ok(()));
    assert_eq!(session.status(), SessionStatus::Ready);
    assert!(session.flags().is_idle());
    assert!(!session.wait(), "nothing left in flight");
}

#[test]
fn test_default_options_applied_on_open() {
    let pool = WorkerPool::new(1).unwrap();
    let config = SessionConfig::default().with_option("quiet", None);
    let (outcomes, callback) = recorder();
    let session = Session::open(&pool, ReplayEngine::opener(FIXTURE), &config, callback);
    session.wait();
    assert_eq!(outcomes.borrow()[0], Ok(()));

    let applied = session.with_engine(|engine| {
        (engine.option("bufsize") == Some(Some("4m")))
            && (engine.option("aggsize") == Some(Some("4m")))
            && (engine.option("quiet") == Some(None))
    });
    assert_eq!(applied, Some(true));
}

#[test]
fn test_busy_rejection_leaves_state_unchanged() {
    let pool = WorkerPool::new(1).unwrap();
    let (session, opened) = open_with(&pool, fixture());
    opened.unwrap();
    control(&session, |s, cb| s.strcompile(PROGRAM, cb)).unwrap();

    let (outcomes, callback) = recorder();
    session.go(callback).unwrap();
    let before = session.flags();
    assert!(before.is_busy());

    let (rejected, rejected_cb) = recorder();
    assert_eq!(session.strcompile(PROGRAM, rejected_cb), Err(SessionError::Busy));
    assert_eq!(session.stop(|_| {}), Err(SessionError::Busy));
    assert_eq!(session.setopt("quiet", None), Err(SessionError::Busy));
    assert_eq!(session.consume(|_| {}), Err(SessionError::Busy));
    assert_eq!(session.aggwalk(|_| {}), Err(SessionError::Busy));
    assert_eq!(session.close(), Err(SessionError::Busy));
    assert_eq!(session.with_engine(|_| ()), None);
    assert_eq!(session.flags(), before);
    assert_eq!(session.status(), SessionStatus::Ready);

    assert!(session.wait());
    assert_eq!(*outcomes.borrow(), vec![Ok(())]);
    assert!(rejected.borrow().is_empty(), "rejected callbacks are never invoked");
    assert!(session.flags().is_idle());
}

#[test]
fn test_open_failure_reports_through_callback() {
    let pool = WorkerPool::new(1).unwrap();
    let mut capture = fixture();
    capture.faults.open = Some("permission denied".to_string());
    let (session, opened) = open_with(&pool, capture);

    assert_eq!(
        opened,
        Err(SessionError::Operation(
            "couldn't open tracing engine: permission denied".to_string()
        ))
    );
    assert_eq!(session.status(), SessionStatus::Failed);
    assert!(session.flags().is_idle());

    let err = session.go(|_| panic!("must not run")).unwrap_err();
    assert_eq!(err, SessionError::NoEngine(SessionStatus::Failed));
    assert_eq!(err.to_string(), "no tracing engine: consumer failed to initialize");
    assert_eq!(
        session.setopt("quiet", None),
        Err(SessionError::NoEngine(SessionStatus::Failed))
    );
}

#[test]
fn test_missing_capture_file() {
    let dir = tempfile::tempdir().unwrap();
    let pool = WorkerPool::new(1).unwrap();
    let (outcomes, callback) = recorder();
    let session = Session::open(
        &pool,
        ReplayEngine::opener(dir.path().join("absent.json")),
        &SessionConfig::default(),
        callback,
    );
    session.wait();

    let outcome = outcomes.borrow()[0].clone();
    match outcome {
        Err(SessionError::Operation(message)) => {
            assert!(message.starts_with("couldn't open tracing engine: "), "{message}");
            assert!(message.contains("absent.json"), "{message}");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_close_is_idempotent() {
    let pool = WorkerPool::new(1).unwrap();
    let (session, opened) = open_with(&pool, fixture());
    opened.unwrap();

    assert_eq!(session.close(), Ok(()));
    assert_eq!(session.status(), SessionStatus::Closed);
    assert_eq!(session.close(), Ok(()));
    assert_eq!(
        session.consume(|_| {}),
        Err(SessionError::NoEngine(SessionStatus::Closed))
    );
    assert_eq!(
        session.go(|_| {}),
        Err(SessionError::NoEngine(SessionStatus::Closed))
    );
}

#[test]
fn test_close_after_failed_open() {
    let pool = WorkerPool::new(1).unwrap();
    let mut capture = Capture::default();
    capture.faults.open = Some("no such device".to_string());
    let (session, opened) = open_with(&pool, capture);
    assert!(opened.is_err());

    assert_eq!(session.close(), Ok(()));
    assert_eq!(session.close(), Ok(()));
    assert_eq!(session.status(), SessionStatus::Closed);
}

#[test]
fn test_setopt_rejection_names_option() {
    let pool = WorkerPool::new(1).unwrap();
    let (session, opened) = open_with(&pool, fixture());
    opened.unwrap();

    assert_eq!(session.setopt("strsize", Some("512")), Ok(()));
    let err = session.setopt("bogus", Some("1")).unwrap_err();
    assert_eq!(
        err,
        SessionError::SetOption { option: "bogus".to_string(), reason: "Invalid option name".to_string() }
    );
    assert_eq!(err.to_string(), "couldn't set option 'bogus': Invalid option name");
    assert!(session.flags().is_idle());
}

#[test]
fn test_engine_failures_carry_operation_context() {
    let pool = WorkerPool::new(1).unwrap();
    let mut capture = fixture();
    capture.faults.compile = Some("syntax error near '}'".to_string());
    let (session, opened) = open_with(&pool, capture);
    opened.unwrap();

    let err = control(&session, |s, cb| s.strcompile("BEGIN {", cb)).unwrap_err();
    assert_eq!(
        err,
        SessionError::Operation("couldn't compile 'BEGIN {': syntax error near '}'".to_string())
    );
    assert_eq!(session.status(), SessionStatus::Ready);

    let err = control(&session, |s, cb| s.go(cb)).unwrap_err();
    assert_eq!(
        err,
        SessionError::Operation("couldn't enable tracing: no enablings installed".to_string())
    );
}

#[test]
fn test_callback_may_start_next_operation() {
    let pool = WorkerPool::new(1).unwrap();
    let (session, opened) = open_with(&pool, fixture());
    opened.unwrap();
    let session = Rc::new(session);

    let weak: Weak<Session<ReplayEngine>> = Rc::downgrade(&session);
    let (go_outcomes, go_callback) = recorder();
    let chained = Rc::new(RefCell::new(None));
    let chained_slot = Rc::clone(&chained);
    session
        .strcompile(PROGRAM, move |result| {
            assert_eq!(result, Ok(()));
            let session = weak.upgrade().unwrap();
            *chained_slot.borrow_mut() = Some(session.go(go_callback));
        })
        .unwrap();

    assert!(session.wait());
    assert_eq!(chained.borrow_mut().take(), Some(Ok(())));
    assert!(session.is_busy());
    assert!(session.wait());
    assert_eq!(*go_outcomes.borrow(), vec![Ok(())]);
    assert!(session.with_engine(ReplayEngine::is_enabled).unwrap());
}

#[test]
fn test_poll_delivers_without_blocking() {
    let pool = WorkerPool::new(1).unwrap();
    let (outcomes, callback) = recorder();
    let session =
        Session::open(&pool, ReplayEngine::opener(FIXTURE), &SessionConfig::default(), callback);

    while !session.poll() {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(outcomes.borrow().len(), 1);
    assert!(!session.poll());
    assert_eq!(session.status(), SessionStatus::Ready);
}

#[test]
fn test_consume_dispatches_records_in_order() {
    let pool = WorkerPool::new(1).unwrap();
    let session = running(&pool, fixture());

    let (calls, status) = collect_consume(&session);
    assert_eq!(status, WorkStatus::Okay);

    let read = strs(&["syscall", "", "read", "entry"]);
    let write = strs(&["syscall", "", "write", "entry"]);
    let with = |probe: &[Value], value: Value| {
        let mut args = probe.to_vec();
        args.push(value);
        args
    };
    assert_eq!(
        calls,
        vec![
            with(&read, Value::Int(7)),
            with(&read, Value::from("genunix")),
            with(&read, Value::from("libc.so.1")),
            with(&read, Value::from("read fd 7\n")),
            read.clone(),
            with(&write, Value::from("genunix`write")),
            with(&write, Value::from("libc.so.1`free")),
            with(&write, Value::from("ls")),
            write.clone(),
        ]
    );
    assert!(session.flags().is_idle());

    let (calls, status) = collect_consume(&session);
    assert_eq!(status, WorkStatus::Done);
    assert_eq!(calls[0][4], Value::UInt(512));
    assert_eq!(calls.len(), 2);
}

#[test]
fn test_reentrant_operations_are_busy() {
    let pool = WorkerPool::new(1).unwrap();
    let session = running(&pool, fixture());

    let mut nested = Vec::new();
    session
        .consume(|_| {
            assert!(session.flags().is_consuming());
            nested.push(session.consume(|_| {}).map(|_| ()));
            nested.push(session.aggwalk(|_| {}).map(|_| ()));
            nested.push(session.setopt("quiet", None));
            nested.push(session.go(|_| {}));
        })
        .unwrap();

    assert!(!nested.is_empty());
    assert!(nested.iter().all(|r| *r == Err(SessionError::Busy)));
    assert!(session.flags().is_idle());
    assert!(!session.wait(), "rejected control operations never start");
}

#[test]
fn test_aggwalk_removes_dispatched_tuples() {
    let pool = WorkerPool::new(1).unwrap();
    let session = running(&pool, fixture());
    collect_consume(&session);

    let tuples = collect_aggwalk(&session);
    assert_eq!(
        tuples,
        vec![
            vec![
                Value::Int(1),
                Value::from("count()"),
                Value::UInt(1),
                Value::from("read"),
                Value::Int(3),
            ],
            vec![
                Value::Int(2),
                Value::from("quantize()"),
                Value::UInt(0),
                Value::UInt(2),
                Value::Int(5),
                Value::UInt(4),
                Value::Int(3),
            ],
        ]
    );
    assert!(collect_aggwalk(&session).is_empty());

    collect_consume(&session);
    let tuples = collect_aggwalk(&session);
    assert_eq!(tuples.len(), 3);
    assert_eq!(tuples[0][4], Value::Int(5));
    assert_eq!(
        tuples[1],
        vec![
            Value::Int(3),
            Value::from("lquantize()"),
            Value::UInt(0),
            Value::Int(0),
            Value::UInt(10),
            Value::UInt(5),
            Value::UInt(1),
            Value::Int(3),
            Value::UInt(3),
            Value::Int(1),
        ]
    );
    assert_eq!(
        tuples[2],
        vec![
            Value::Int(4),
            Value::from("avg()"),
            Value::UInt(1),
            Value::from("libc.so.1"),
            Value::Float(2.5),
        ]
    );
}

#[test]
fn test_unsupported_aggregation_fails_walk() {
    let capture = Capture::from_json(
        r#"{
            "intervals": [{ "aggregations": [{
                "varid": 9, "name": "spread", "action": "stddev",
                "value": { "words": [2, 10, 58, 0] }
            }] }]
        }"#,
    )
    .unwrap();
    let pool = WorkerPool::new(1).unwrap();
    let session = running(&pool, capture);
    collect_consume(&session);

    let mut calls = 0;
    let err = session.aggwalk(|_| calls += 1).unwrap_err();
    assert_eq!(calls, 0);
    assert_eq!(
        err,
        SessionError::Decode(DecodeError::UnsupportedAggregation {
            action: ActionKind::STDDEV,
            aggregation: "spread".to_string(),
        })
    );
    assert!(err.to_string().contains("stddev()"));
    assert!(session.flags().is_idle());
}

#[test]
fn test_unsupported_record_fails_consume() {
    let capture = Capture::from_json(
        r#"{
            "intervals": [{ "firings": [{
                "probe": { "provider": "profile", "function": "", "name": "tick-1s" },
                "records": [{ "action": "stack", "payload": { "words": [4096, 8192] } }]
            }] }]
        }"#,
    )
    .unwrap();
    let pool = WorkerPool::new(1).unwrap();
    let session = running(&pool, capture);

    let err = session.consume(|_| {}).unwrap_err();
    assert_eq!(
        err.to_string(),
        "unsupported action stack() in record for profile:::tick-1s"
    );
    assert!(session.flags().is_idle());
}

#[test]
fn test_unsupported_aggregation_stops_later_tuples() {
    let capture = Capture::from_json(
        r#"{
            "intervals": [{ "aggregations": [
                { "varid": 1, "name": "a", "action": "count", "value": { "words": [1] } },
                { "varid": 2, "name": "b", "action": "stddev", "value": { "words": [2, 10, 58, 0] } },
                { "varid": 3, "name": "c", "action": "count", "value": { "words": [7] } }
            ] }]
        }"#,
    )
    .unwrap();
    let pool = WorkerPool::new(1).unwrap();
    let session = running(&pool, capture);
    collect_consume(&session);

    let mut seen = Vec::new();
    let err = session.aggwalk(|args| seen.push(args[0].clone())).unwrap_err();
    assert_eq!(seen, vec![Value::Int(1)]);
    assert_eq!(
        err,
        SessionError::Decode(DecodeError::UnsupportedAggregation {
            action: ActionKind::STDDEV,
            aggregation: "b".to_string(),
        })
    );
    assert!(session.flags().is_idle());
}

#[test]
fn test_unsupported_record_stops_later_records() {
    let capture = Capture::from_json(
        r#"{
            "intervals": [{ "firings": [
                {
                    "probe": { "provider": "profile", "function": "", "name": "tick-1s" },
                    "records": [
                        { "action": "difexpr", "payload": { "i64": 1 } },
                        { "action": "stack", "payload": { "words": [4096, 8192] } },
                        { "action": "difexpr", "payload": { "i64": 2 } }
                    ]
                },
                {
                    "probe": { "provider": "profile", "function": "", "name": "tick-1s" },
                    "records": [{ "action": "difexpr", "payload": { "i64": 3 } }]
                }
            ] }]
        }"#,
    )
    .unwrap();
    let pool = WorkerPool::new(1).unwrap();
    let session = running(&pool, capture);

    let mut calls = Vec::new();
    let err = session.consume(|args| calls.push(args.to_vec())).unwrap_err();
    let mut first = strs(&["profile", "", "", "tick-1s"]);
    first.push(Value::Int(1));
    assert_eq!(calls, vec![first]);
    assert_eq!(
        err.to_string(),
        "unsupported action stack() in record for profile:::tick-1s"
    );
    assert!(session.flags().is_idle());
}

#[test]
fn test_session_on_existing_runtime() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let pool = WorkerPool::from_handle(runtime.handle().clone());
    let session = running(&pool, fixture());

    let (calls, status) = collect_consume(&session);
    assert_eq!(status, WorkStatus::Okay);
    assert_eq!(calls.len(), 9);
    assert_eq!(collect_aggwalk(&session).len(), 2);
}

#[test]
fn test_walk_engine_failures_are_prefixed() {
    let pool = WorkerPool::new(1).unwrap();
    let mut capture = fixture();
    capture.faults.snap = Some("out of memory".to_string());
    capture.faults.work = Some("buffer drop".to_string());
    let session = running(&pool, capture);

    assert_eq!(
        session.aggwalk(|_| {}),
        Err(SessionError::Operation("couldn't snap aggregate: out of memory".to_string()))
    );
    assert_eq!(
        session.consume(|_| {}),
        Err(SessionError::Operation("couldn't consume trace data: buffer drop".to_string()))
    );
}

#[test]
fn test_stop_ends_consumption() {
    let pool = WorkerPool::new(1).unwrap();
    let session = running(&pool, fixture());

    control(&session, |s, cb| s.stop(cb)).unwrap();
    let (calls, status) = collect_consume(&session);
    assert!(calls.is_empty());
    assert_eq!(status, WorkStatus::Done);
}
