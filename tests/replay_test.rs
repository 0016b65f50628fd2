mod common;

use common::{fast_replay_config, wait_until, within};
use async_trait::async_trait;
use kitsvc_delivery::clients::InMemoryEventLog;
use kitsvc_delivery::delivery::{
    DeliveryCounters, DeliveryError, DeliveryResult, EventLog, RecordedEvent, StreamSlice,
};
use kitsvc_delivery::replay::{handler_fn, EventHandler, ReplayReader};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

type Seen = Arc<Mutex<Vec<RecordedEvent>>>;

fn recording_handler() -> (Arc<dyn EventHandler>, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn(move |event| {
        let sink = sink.clone();
        async move {
            sink.lock().push(event);
            Ok(())
        }
    });
    (Arc::new(handler), seen)
}

fn reader_for(log: &Arc<InMemoryEventLog>) -> (ReplayReader, Arc<DeliveryCounters>) {
    let counters = Arc::new(DeliveryCounters::new());
    let reader = ReplayReader::new(log.clone(), fast_replay_config(), counters.clone());
    (reader, counters)
}

/// The gate waits for the slowest stream and fires a single time
#[tokio::test]
async fn test_gate_fires_once_after_every_stream_ended() {
    let log = Arc::new(InMemoryEventLog::new());
    log.append("users", br#"{"id":1}"#.to_vec());
    log.append("orders", br#"{"id":10}"#.to_vec());
    log.append("orders", br#"{"id":11}"#.to_vec());

    // orders cannot finish until a permit is released
    let permits = Arc::new(Semaphore::new(0));
    let gate_keeper = permits.clone();
    let slow = handler_fn(move |_event| {
        let permits = gate_keeper.clone();
        async move {
            permits.acquire().await.map(|p| p.forget()).ok();
            Ok(())
        }
    });
    let (users, _) = recording_handler();

    let (mut reader, _) = reader_for(&log);
    reader.capture("users", users).capture("orders", Arc::new(slow));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = reader.start(shutdown_rx);
    let gate = handle.gate.clone();

    assert!(wait_until(Duration::from_secs(2), || handle.progress[0].has_reached_end()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!gate.is_complete());
    assert_eq!(gate.arrived(), 1);

    permits.add_permits(2);
    within(Duration::from_secs(2), gate.wait()).await;
    assert!(gate.is_complete());

    let mut fired = gate.subscribe();
    fired.borrow_and_update();

    log.append("users", br#"{"id":2}"#.to_vec());
    permits.add_permits(1);
    log.append("orders", br#"{"id":12}"#.to_vec());
    assert!(wait_until(Duration::from_secs(3), || handle.progress[1].position() == 3).await);
    assert!(!fired.has_changed().unwrap());

    shutdown_tx.send(true).unwrap();
    within(Duration::from_secs(2), handle.join()).await.unwrap();
}

#[tokio::test]
async fn test_placeholders_never_reach_the_handler() {
    let log = Arc::new(InMemoryEventLog::new());
    log.create_stream("users").await.unwrap();
    log.append("users", br#"{"username":"ada"}"#.to_vec());
    log.append("users", b" { } ".to_vec());
    log.append("users", Vec::new());
    log.append("users", br#"{"username":"grace"}"#.to_vec());

    let (handler, seen) = recording_handler();
    let (mut reader, counters) = reader_for(&log);
    reader.capture("users", handler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = reader.start(shutdown_rx);
    within(Duration::from_secs(2), handle.gate.wait()).await;

    let versions: Vec<u64> = seen.lock().iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 4]);
    assert!(seen.lock().iter().all(|e| !e.is_placeholder()));
    assert_eq!(counters.recv_total(), 2);

    let snapshot = &handle.snapshot()[0];
    assert_eq!(snapshot.skipped, 3);
    assert_eq!(snapshot.forwarded, 2);
    assert!(snapshot.has_reached_end);

    shutdown_tx.send(true).unwrap();
    within(Duration::from_secs(2), handle.join()).await.unwrap();
}

/// A missing stream is created once and replay completes on the empty stream
#[tokio::test]
async fn test_missing_stream_is_created_idempotently() {
    let log = Arc::new(InMemoryEventLog::new());
    let (handler, seen) = recording_handler();
    let (mut reader, _) = reader_for(&log);
    reader.capture("audit", handler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = reader.start(shutdown_rx);
    within(Duration::from_secs(2), handle.gate.wait()).await;

    assert_eq!(log.create_calls("audit"), 1);
    assert_eq!(log.events("audit").len(), 1);
    assert!(seen.lock().is_empty());

    log.create_stream("audit").await.unwrap();
    log.create_stream("audit").await.unwrap();
    assert_eq!(log.events("audit").len(), 1);

    shutdown_tx.send(true).unwrap();
    within(Duration::from_secs(2), handle.join()).await.unwrap();
}

#[tokio::test]
async fn test_replay_waits_out_an_unavailable_log() {
    let log = Arc::new(InMemoryEventLog::new());
    log.append("users", br#"{"id":1}"#.to_vec());
    log.set_available(false);

    let (handler, seen) = recording_handler();
    let (mut reader, _) = reader_for(&log);
    reader.capture("users", handler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = reader.start(shutdown_rx);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.gate.is_complete());
    assert!(seen.lock().is_empty());

    log.set_available(true);
    within(Duration::from_secs(3), handle.gate.wait()).await;
    assert_eq!(seen.lock().len(), 1);

    shutdown_tx.send(true).unwrap();
    within(Duration::from_secs(2), handle.join()).await.unwrap();
}

/// After catching up, new events arrive through long polling
#[tokio::test]
async fn test_live_events_are_forwarded_after_catch_up() {
    let log = Arc::new(InMemoryEventLog::new());
    log.append("users", br#"{"id":1}"#.to_vec());

    let (handler, seen) = recording_handler();
    let (mut reader, counters) = reader_for(&log);
    reader.capture("users", handler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = reader.start(shutdown_rx);
    within(Duration::from_secs(2), handle.gate.wait()).await;

    log.append("users", br#"{"id":2}"#.to_vec());
    log.append("users", br#"{"id":3}"#.to_vec());

    assert!(wait_until(Duration::from_secs(3), || seen.lock().len() == 3).await);
    assert_eq!(counters.recv_total(), 3);

    shutdown_tx.send(true).unwrap();
    within(Duration::from_secs(2), handle.join()).await.unwrap();
}

#[tokio::test]
async fn test_no_captures_means_ready_immediately() {
    let log = Arc::new(InMemoryEventLog::new());
    let (reader, _) = reader_for(&log);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = reader.start(shutdown_rx);

    assert!(handle.gate.is_complete());
    within(Duration::from_millis(100), handle.gate.wait()).await;
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_handler_errors_do_not_stop_replay() {
    let log = Arc::new(InMemoryEventLog::new());
    for i in 0..4 {
        log.append("users", format!(r#"{{"id":{}}}"#, i).into_bytes());
    }

    let handler = handler_fn(|event: RecordedEvent| async move {
        if event.version % 2 == 0 {
            Err(kitsvc_delivery::delivery::DeliveryError::Handler("boom".to_string()))
        } else {
            Ok(())
        }
    });

    let (mut reader, _) = reader_for(&log);
    reader.capture("users", Arc::new(handler));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = reader.start(shutdown_rx);
    within(Duration::from_secs(2), handle.gate.wait()).await;

    let snapshot = &handle.snapshot()[0];
    assert_eq!(snapshot.forwarded, 4);
    assert_eq!(snapshot.handler_failures, 2);
    assert_eq!(snapshot.position, 4);

    shutdown_tx.send(true).unwrap();
    within(Duration::from_secs(2), handle.join()).await.unwrap();
}

/// Event log that refuses reads (bad credentials) until told otherwise
struct RefusingLog {
    inner: InMemoryEventLog,
    refusing: AtomicBool,
    reads: AtomicUsize,
}

impl RefusingLog {
    fn new() -> Self {
        Self {
            inner: InMemoryEventLog::new(),
            refusing: AtomicBool::new(true),
            reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EventLog for RefusingLog {
    fn name(&self) -> &str {
        "refusing"
    }

    async fn read_forward(
        &self,
        stream: &str,
        from: u64,
        max_count: usize,
        long_poll: Option<Duration>,
    ) -> DeliveryResult<StreamSlice> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected {
                status: 401,
                message: "access denied".to_string(),
            });
        }
        self.inner.read_forward(stream, from, max_count, long_poll).await
    }

    async fn create_stream(&self, stream: &str) -> DeliveryResult<()> {
        self.inner.create_stream(stream).await
    }
}

/// A refused read backs off and keeps its position instead of skipping ahead
#[tokio::test]
async fn test_refused_reads_back_off_without_skipping_events() {
    let log = Arc::new(RefusingLog::new());
    log.inner.append("users", br#"{"id":0}"#.to_vec());
    log.inner.append("users", br#"{"id":1}"#.to_vec());

    let (handler, seen) = recording_handler();
    let counters = Arc::new(DeliveryCounters::new());
    let mut reader = ReplayReader::new(log.clone(), fast_replay_config(), counters);
    reader.capture("users", handler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = reader.start(shutdown_rx);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(log.reads.load(Ordering::SeqCst) <= 2);
    assert_eq!(handle.progress[0].position(), 0);
    assert!(!handle.gate.is_complete());

    log.refusing.store(false, Ordering::SeqCst);
    within(Duration::from_secs(3), handle.gate.wait()).await;

    let versions: Vec<u64> = seen.lock().iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![0, 1]);

    shutdown_tx.send(true).unwrap();
    within(Duration::from_secs(2), handle.join()).await.unwrap();
}
