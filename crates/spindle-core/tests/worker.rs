//! Worker behaviour observed through instrumented stub backends.
//!
//! The stubs record what the worker asks of them, so these tests can check
//! ordering, exclusive access and teardown without depending on a real
//! interpreter.

use spindle_core::{
    mailbox, Connection, ConnectionConfig, CorrelationId, EngineError, EngineState, Mailbox,
    Outcome, Reply, Requester, ScriptBackend, Source, SubmitError, TaggedValue, WorkerState,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn id(raw: u64) -> CorrelationId {
    CorrelationId::from(raw)
}

/// Echoes its source back, failing loudly if it is ever entered twice at once.
struct Recorder {
    busy: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<String>>>,
}

impl ScriptBackend for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn open(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn eval(&mut self, source: &Source) -> Result<TaggedValue, TaggedValue> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let text = String::from_utf8_lossy(source.as_bytes()).into_owned();
        self.order.lock().unwrap().push(text.clone());
        thread::yield_now();
        self.busy.store(false, Ordering::SeqCst);
        Ok(TaggedValue::String(text))
    }
}

/// Blocks inside eval until released, announcing when it has entered.
struct Gate {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

impl ScriptBackend for Gate {
    fn name(&self) -> &'static str {
        "gate"
    }

    fn open(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn eval(&mut self, _source: &Source) -> Result<TaggedValue, TaggedValue> {
        let _ = self.entered.send(());
        let _ = self.release.recv();
        Ok(TaggedValue::Undefined)
    }
}

/// Panics on `panic`, echoes anything else.
struct Fragile;

impl ScriptBackend for Fragile {
    fn name(&self) -> &'static str {
        "fragile"
    }

    fn open(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn eval(&mut self, source: &Source) -> Result<TaggedValue, TaggedValue> {
        if source.as_bytes() == b"panic" {
            panic!("backend exploded");
        }
        Ok(TaggedValue::from_latin1(source.as_bytes()))
    }
}

/// Panics on every delivery.
struct Exploding;

impl Mailbox for Exploding {
    fn deliver(&self, _reply: Reply) -> bool {
        panic!("mailbox exploded")
    }
}

/// Forwards replies, then lets go of the connection handle it owns.
struct Owning {
    tx: mpsc::Sender<Reply>,
    conn: Mutex<Option<Connection>>,
}

impl Mailbox for Owning {
    fn deliver(&self, reply: Reply) -> bool {
        let delivered = self.tx.send(reply).is_ok();
        let released = self.conn.lock().unwrap().take();
        drop(released);
        delivered
    }
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Reply>) -> Vec<Reply> {
    let mut replies = Vec::new();
    while let Ok(reply) = rx.try_recv() {
        replies.push(reply);
    }
    replies
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Start a gated connection, park the worker inside eval `2` and queue `3..=5`
/// behind it.
fn parked_connection(
    config: ConnectionConfig,
) -> (
    Connection,
    Requester,
    tokio::sync::mpsc::UnboundedReceiver<Reply>,
    mpsc::Sender<()>,
) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let conn = Connection::start_with(config, move || Gate {
        entered: entered_tx,
        release: release_rx,
    })
    .expect("start");

    let (requester, rx) = mailbox();
    conn.open(id(1), requester.clone()).unwrap();
    conn.eval(id(2), requester.clone(), "block").unwrap();
    entered_rx
        .recv_timeout(TIMEOUT)
        .expect("worker never entered eval");

    for n in 3..=5 {
        conn.eval(id(n), requester.clone(), "queued").unwrap();
    }
    assert_eq!(conn.pending(), 3);

    (conn, requester, rx, release_tx)
}

/// Ten producers, ten commands each: one engine entry at a time and per-producer FIFO.
#[test]
fn test_fifo_and_exclusive_access() {
    let busy = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let backend = {
        let busy = Arc::clone(&busy);
        let overlaps = Arc::clone(&overlaps);
        let order = Arc::clone(&order);
        move || Recorder {
            busy,
            overlaps,
            order,
        }
    };
    let conn = Connection::start_with(ConnectionConfig::default(), backend).expect("start");

    let (setup_tx, setup_rx) = mpsc::channel::<Reply>();
    conn.open(id(0), Requester::from(setup_tx)).unwrap();
    assert_eq!(setup_rx.recv_timeout(TIMEOUT).unwrap().outcome, Outcome::Done);

    let producers: Vec<_> = (0..10u64)
        .map(|p| {
            let conn = conn.clone();
            thread::spawn(move || {
                let (tx, rx) = mpsc::channel::<Reply>();
                let requester = Requester::from(tx);
                for j in 0..10u64 {
                    let n = p * 10 + j + 1;
                    conn.eval(id(n), requester.clone(), &format!("{p}:{j}"))
                        .unwrap();
                }
                (0..10)
                    .map(|_| rx.recv_timeout(TIMEOUT).expect("reply"))
                    .collect::<Vec<Reply>>()
            })
        })
        .collect();

    for (p, producer) in producers.into_iter().enumerate() {
        let replies = producer.join().unwrap();
        for (j, reply) in replies.into_iter().enumerate() {
            let expected = (p * 10 + j + 1) as u64;
            assert_eq!(reply.id, id(expected));
            assert_eq!(
                reply.outcome,
                Outcome::Value(TaggedValue::String(format!("{p}:{j}")))
            );
        }
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);

    let order = order.lock().unwrap().clone();
    assert_eq!(order.len(), 100);
    for p in 0..10 {
        let prefix = format!("{p}:");
        let seq: Vec<usize> = order
            .iter()
            .filter_map(|s| s.strip_prefix(&prefix))
            .map(|j| j.parse().unwrap())
            .collect();
        assert_eq!(seq, (0..10).collect::<Vec<_>>());
    }
}

/// Teardown with three commands queued: none of them run or reply.
#[test]
fn test_teardown_discards_queued_commands() {
    let (conn, requester, mut rx, release) = parked_connection(ConnectionConfig::default());

    let tearing = conn.clone();
    let teardown = thread::spawn(move || tearing.teardown());

    wait_until(|| !conn.is_accepting());
    assert_eq!(
        conn.eval(id(6), requester.clone(), "late"),
        Err(SubmitError::QueueClosed)
    );
    release.send(()).unwrap();

    let report = teardown.join().unwrap();
    assert!(report.performed);
    assert_eq!(report.processed, 2);
    assert_eq!(report.abandoned, 3);

    let ids: Vec<CorrelationId> = drain(&mut rx).into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![id(1), id(2)]);

    assert_eq!(conn.worker_state(), WorkerState::Terminated);
    assert_eq!(conn.stats().abandoned(), 3);
    assert_eq!(
        conn.open(id(7), requester),
        Err(SubmitError::QueueClosed)
    );
}

/// With `notify_abandoned`, each discarded command gets exactly one `Cancelled`.
#[test]
fn test_notify_abandoned_sends_cancelled() {
    let config = ConnectionConfig::builder()
        .notify_abandoned(true)
        .build()
        .unwrap();
    let (conn, _requester, mut rx, release) = parked_connection(config);

    let tearing = conn.clone();
    let teardown = thread::spawn(move || tearing.teardown());
    wait_until(|| !conn.is_accepting());
    release.send(()).unwrap();
    assert_eq!(teardown.join().unwrap().abandoned, 3);

    let replies = drain(&mut rx);
    assert_eq!(replies.len(), 5);
    assert_eq!(replies[1].outcome, Outcome::Value(TaggedValue::Undefined));
    for (reply, expected) in replies[2..].iter().zip(3..=5) {
        assert_eq!(reply.id, id(expected));
        assert_eq!(reply.outcome, Outcome::Cancelled);
    }
}

/// Concurrent teardown callers all return once the worker is gone.
#[test]
fn test_concurrent_teardown() {
    let (conn, _requester, _rx, release) = parked_connection(ConnectionConfig::default());

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let conn = conn.clone();
            thread::spawn(move || conn.teardown())
        })
        .collect();
    wait_until(|| !conn.is_accepting());
    release.send(()).unwrap();

    let performed = callers
        .into_iter()
        .map(|c| c.join().unwrap())
        .filter(|r| r.performed)
        .count();
    assert_eq!(performed, 1);
    assert_eq!(conn.worker_state(), WorkerState::Terminated);
}

/// A panicking backend fails the command, closes the engine and keeps the worker.
#[test]
fn test_backend_panic_is_contained() {
    let conn = Connection::start_with(ConnectionConfig::default(), || Fragile).expect("start");
    let (tx, rx) = mpsc::channel::<Reply>();
    let requester = Requester::from(tx);

    conn.open(id(1), requester.clone()).unwrap();
    conn.eval(id(2), requester.clone(), "panic").unwrap();
    conn.eval(id(3), requester.clone(), "after").unwrap();
    conn.open(id(4), requester.clone()).unwrap();
    conn.eval(id(5), requester, "recovered").unwrap();

    let outcomes: Vec<Outcome> = (0..5)
        .map(|_| rx.recv_timeout(TIMEOUT).expect("reply").outcome)
        .collect();

    assert_eq!(outcomes[0], Outcome::Done);
    assert_eq!(
        outcomes[1],
        Outcome::Failed(EngineError::Panicked("backend exploded".into()))
    );
    assert_eq!(
        outcomes[2],
        Outcome::Failed(EngineError::NotOpen {
            state: EngineState::Closed
        })
    );
    assert_eq!(outcomes[3], Outcome::Done);
    assert_eq!(
        outcomes[4],
        Outcome::Value(TaggedValue::String("recovered".into()))
    );
    assert_eq!(conn.worker_state(), WorkerState::Running);
}

/// Dropping the last handle tears the connection down.
#[test]
fn test_drop_runs_teardown() {
    let closed = Arc::new(AtomicBool::new(false));

    struct Flagged(Arc<AtomicBool>);

    impl ScriptBackend for Flagged {
        fn name(&self) -> &'static str {
            "flagged"
        }

        fn open(&mut self) -> Result<(), EngineError> {
            Ok(())
        }

        fn close(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }

        fn eval(&mut self, _source: &Source) -> Result<TaggedValue, TaggedValue> {
            Ok(TaggedValue::None)
        }
    }

    let flag = Arc::clone(&closed);
    let conn = Connection::start_with(ConnectionConfig::default(), move || Flagged(flag))
        .expect("start");
    let (tx, rx) = mpsc::channel::<Reply>();
    conn.open(id(1), Requester::from(tx)).unwrap();
    rx.recv_timeout(TIMEOUT).unwrap();

    drop(conn);
    assert!(closed.load(Ordering::SeqCst));
}

/// Replies to a requester that went away are dropped without disturbing others.
#[test]
fn test_vanished_requester_does_not_stall_worker() {
    let conn = Connection::start_with(ConnectionConfig::default(), || Fragile).expect("start");

    let (gone_tx, gone_rx) = mpsc::channel::<Reply>();
    let gone = Requester::from(gone_tx);
    conn.open(id(1), gone.clone()).unwrap();
    conn.eval(id(2), gone, "lost").unwrap();
    drop(gone_rx);

    let (tx, rx) = mpsc::channel::<Reply>();
    conn.eval(id(3), Requester::from(tx), "kept").unwrap();
    let reply = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(reply.id, id(3));
    assert_eq!(
        reply.outcome,
        Outcome::Value(TaggedValue::String("kept".into()))
    );
}

/// A mailbox that panics loses its reply; the worker keeps serving others.
#[test]
fn test_panicking_mailbox_does_not_kill_worker() {
    let conn = Connection::start_with(ConnectionConfig::default(), || Fragile).expect("start");

    conn.open(id(1), Requester::new(Exploding)).unwrap();
    let (tx, rx) = mpsc::channel::<Reply>();
    conn.eval(id(2), Requester::from(tx), "still here").unwrap();

    let reply = rx.recv_timeout(TIMEOUT).expect("worker stopped replying");
    assert_eq!(reply.id, id(2));
    assert_eq!(
        reply.outcome,
        Outcome::Value(TaggedValue::String("still here".into()))
    );
    assert_eq!(conn.worker_state(), WorkerState::Running);
    assert!(conn.is_accepting());
}

/// A worker that dies before looping closes its queue behind it.
#[test]
fn test_factory_panic_closes_queue() {
    let conn = Connection::start_with(ConnectionConfig::default(), || -> Fragile {
        panic!("no engine today")
    })
    .expect("start");

    wait_until(|| conn.worker_state() == WorkerState::Terminated);
    assert!(!conn.is_accepting());

    let (requester, _rx) = mailbox();
    assert_eq!(conn.open(id(1), requester), Err(SubmitError::QueueClosed));

    let report = conn.teardown();
    assert!(report.performed);
    assert_eq!(report.processed, 0);
    assert_eq!(report.abandoned, 0);
}

/// The last handle released on the worker thread tears down without joining
/// itself, and commands queued behind still get `Cancelled`.
#[test]
fn test_last_handle_dropped_on_worker_thread() {
    let config = ConnectionConfig::builder()
        .notify_abandoned(true)
        .build()
        .unwrap();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let conn = Connection::start_with(config, move || Gate {
        entered: entered_tx,
        release: release_rx,
    })
    .expect("start");

    let (owner_tx, owner_rx) = mpsc::channel::<Reply>();
    let owner = Requester::new(Owning {
        tx: owner_tx,
        conn: Mutex::new(Some(conn.clone())),
    });
    let (tx, rx) = mpsc::channel::<Reply>();
    let bystander = Requester::from(tx);

    conn.open(id(1), bystander.clone()).unwrap();
    conn.eval(id(2), owner, "block").unwrap();
    entered_rx
        .recv_timeout(TIMEOUT)
        .expect("worker never entered eval");
    conn.eval(id(3), bystander, "queued").unwrap();

    // The owning mailbox now holds the only handle.
    drop(conn);
    release_tx.send(()).unwrap();

    let reply = owner_rx.recv_timeout(TIMEOUT).expect("eval reply");
    assert_eq!(reply.id, id(2));
    assert_eq!(reply.outcome, Outcome::Value(TaggedValue::Undefined));

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().outcome, Outcome::Done);
    let reply = rx.recv_timeout(TIMEOUT).expect("cancelled reply");
    assert_eq!(reply.id, id(3));
    assert_eq!(reply.outcome, Outcome::Cancelled);
}
