mod common;

use common::{fast_delivery_config, wait_until, within};
use kitsvc_delivery::clients::InMemoryBroker;
use kitsvc_delivery::delivery::{
    spawn_flusher, CounterSource, DeliveryConfig, DeliveryError, DrainOrder, OutboundItem, OutboundQueue, SendOutcome,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn queue_for(broker: &Arc<InMemoryBroker>, config: DeliveryConfig) -> Arc<OutboundQueue> {
    Arc::new(OutboundQueue::new(broker.clone(), config))
}

/// A message sent while the broker is down reaches the topic on the next cycle
#[tokio::test]
async fn test_queued_message_is_delivered_after_recovery() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));
    let queue = queue_for(&broker, fast_delivery_config());
    broker.set_reachable(false);

    let item = OutboundItem::json("orders", &json!({"id": 1})).unwrap();
    assert_eq!(queue.send(item).await, SendOutcome::Queued);
    assert_eq!(queue.depth(), 1);
    assert!(!queue.monitor().is_connected());

    broker.set_reachable(true);
    let report = queue.flush_cycle().await;

    assert!(report.probed);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(queue.depth(), 0);
    assert!(queue.monitor().is_connected());

    let payloads = broker.payloads("orders");
    assert_eq!(payloads.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
    assert_eq!(body, json!({"id": 1}));
}

/// Every item sent during an outage arrives once the flusher catches up
#[tokio::test]
async fn test_at_least_once_through_an_outage() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));
    let queue = queue_for(&broker, fast_delivery_config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = spawn_flusher(queue.clone(), shutdown_rx);

    broker.set_reachable(false);

    let handles: Vec<_> = (0..20)
        .map(|i| queue.send_detached(OutboundItem::json("events", &json!({ "seq": i })).unwrap()))
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), SendOutcome::Queued);
    }
    assert_eq!(queue.snapshot().queue_total, 20);

    broker.set_reachable(true);
    assert!(wait_until(Duration::from_secs(5), || queue.is_empty()).await);

    let mut seqs: Vec<i64> = broker
        .payloads("events")
        .iter()
        .map(|p| serde_json::from_slice::<serde_json::Value>(p).unwrap()["seq"].as_i64().unwrap())
        .collect();
    seqs.sort_unstable();
    seqs.dedup();
    assert_eq!(seqs, (0..20).collect::<Vec<_>>());

    let snapshot = queue.snapshot();
    assert_eq!(snapshot.queue_total, 0);
    assert_eq!(snapshot.sent_total, 20);
    assert!(snapshot.all_connected);

    shutdown_tx.send(true).unwrap();
    flusher.await.unwrap();
}

/// Enqueueing never waits for the flusher or the downstream to recover
#[tokio::test]
async fn test_send_while_disconnected_does_not_block() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));
    let queue = queue_for(&broker, fast_delivery_config());
    broker.set_reachable(false);

    for i in 0..50 {
        let outcome = within(
            Duration::from_millis(200),
            queue.send(OutboundItem::json("orders", &json!({ "id": i })).unwrap()),
        )
        .await;
        assert_eq!(outcome, SendOutcome::Queued);
    }

    assert_eq!(queue.depth(), 50);
}

#[tokio::test]
async fn test_newest_item_is_redelivered_first() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));
    let queue = queue_for(&broker, fast_delivery_config());
    broker.set_reachable(false);

    queue.send(OutboundItem::new("orders", b"A".to_vec())).await;
    queue.send(OutboundItem::new("orders", b"B".to_vec())).await;

    broker.set_reachable(true);
    queue.flush_cycle().await;

    assert_eq!(broker.payloads("orders"), vec![b"B".to_vec(), b"A".to_vec()]);
}

#[tokio::test]
async fn test_oldest_first_drain_order() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));
    let config = DeliveryConfig {
        drain_order: DrainOrder::OldestFirst,
        ..fast_delivery_config()
    };
    let queue = queue_for(&broker, config);
    broker.set_reachable(false);

    queue.send(OutboundItem::new("orders", b"A".to_vec())).await;
    queue.send(OutboundItem::new("orders", b"B".to_vec())).await;

    broker.set_reachable(true);
    queue.flush_cycle().await;

    assert_eq!(broker.payloads("orders"), vec![b"A".to_vec(), b"B".to_vec()]);
}

/// A destination that never recovers is given up on without holding back others
#[tokio::test]
async fn test_failing_item_is_dropped_after_bounded_retries() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));
    let queue = queue_for(&broker, fast_delivery_config());
    broker.require_creation("stuck");
    broker.deny_creation("stuck");

    assert_eq!(
        queue.send(OutboundItem::new("stuck", b"x".to_vec())).await,
        SendOutcome::Queued
    );

    let mut dropped = 0;
    for cycle in 0..5 {
        assert_eq!(
            queue.send(OutboundItem::json("healthy", &json!({ "cycle": cycle })).unwrap()).await,
            SendOutcome::Delivered
        );
        dropped += queue.flush_cycle().await.dropped;
    }

    assert_eq!(dropped, 1);
    assert!(queue.is_empty());
    assert_eq!(broker.payloads("healthy").len(), 5);
    assert!(broker.payloads("stuck").is_empty());
    assert!(queue.monitor().is_connected());

    let snapshot = queue.snapshot();
    assert_eq!(snapshot.dropped_total, 1);
    assert_eq!(snapshot.queue_total, 0);
}

/// The broker answers but the topic keeps failing: the item outlives the
/// retry bound and goes out once the topic recovers
#[tokio::test]
async fn test_transient_failures_never_exhaust_retries() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));
    let config = fast_delivery_config();
    let cycles = config.max_failed_cycles * 2;
    let queue = queue_for(&broker, config);
    broker.block_destination("orders");

    let item = OutboundItem::json("orders", &json!({"id": 7})).unwrap();
    assert_eq!(queue.send(item).await, SendOutcome::Queued);

    for _ in 0..cycles {
        let report = queue.flush_cycle().await;
        assert_eq!(report.dropped, 0);
        assert_eq!(report.remaining, 1);
    }
    assert!(broker.attempts() > cycles as usize);

    broker.unblock_destination("orders");
    let report = queue.flush_cycle().await;

    assert_eq!(report.delivered, 1);
    assert!(queue.is_empty());
    assert_eq!(broker.payloads("orders"), vec![br#"{"id":7}"#.to_vec()]);

    let snapshot = queue.snapshot();
    assert_eq!(snapshot.dropped_total, 0);
    assert_eq!(snapshot.queue_total, 0);
}

#[tokio::test]
async fn test_rejected_item_is_dropped_immediately() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));
    let queue = queue_for(&broker, fast_delivery_config());
    broker.poison_destination("bad");

    let outcome = queue.send(OutboundItem::new("bad", b"x".to_vec())).await;

    assert_eq!(outcome, SendOutcome::Dropped);
    assert!(queue.is_empty());
    assert_eq!(queue.snapshot().dropped_total, 1);
    assert!(queue.monitor().is_connected());
}

#[tokio::test]
async fn test_missing_topic_is_created_and_item_queued() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));
    let queue = queue_for(&broker, fast_delivery_config());
    broker.require_creation("fresh");

    let outcome = queue.send(OutboundItem::new("fresh", b"{\"a\":1}".to_vec())).await;
    assert_eq!(outcome, SendOutcome::Queued);
    assert_eq!(broker.created_destinations(), vec!["fresh".to_string()]);

    let report = queue.flush_cycle().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(broker.payloads("fresh").len(), 1);
}

#[tokio::test]
async fn test_startup_probe_exhaustion_is_fatal() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));
    broker.set_reachable(false);

    let result = OutboundQueue::connect(broker.clone(), fast_delivery_config()).await;

    match result {
        Err(DeliveryError::ProbeExhausted { downstream, attempts }) => {
            assert_eq!(downstream, "nsq");
            assert_eq!(attempts, 3);
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("probe should have failed"),
    }
    assert_eq!(broker.probe_count(), 3);
}

#[tokio::test]
async fn test_startup_probe_succeeds_when_reachable() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));

    let queue = OutboundQueue::connect(broker.clone(), fast_delivery_config())
        .await
        .unwrap();

    assert!(queue.monitor().is_connected());
    assert_eq!(broker.probe_count(), 1);
}

/// Shutdown closes the queue and gives queued items one last chance
#[tokio::test]
async fn test_shutdown_rejects_sends_and_flushes_once_more() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));
    let config = DeliveryConfig {
        poll_interval_ms: 1_000,
        ..fast_delivery_config()
    };
    let queue = queue_for(&broker, config);
    broker.set_reachable(false);

    queue.send(OutboundItem::new("orders", b"late".to_vec())).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = spawn_flusher(queue.clone(), shutdown_rx);

    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.set_reachable(true);
    shutdown_tx.send(true).unwrap();
    within(Duration::from_secs(2), flusher).await.unwrap();

    assert!(queue.is_closed());
    assert!(queue.is_empty());
    assert_eq!(broker.payloads("orders"), vec![b"late".to_vec()]);

    let outcome = queue.send(OutboundItem::new("orders", b"after".to_vec())).await;
    assert_eq!(outcome, SendOutcome::Rejected);
    assert_eq!(broker.payloads("orders").len(), 1);
}

#[tokio::test]
async fn test_emit_serializes_and_sends_in_background() {
    let broker = Arc::new(InMemoryBroker::new("nsq"));
    let queue = queue_for(&broker, fast_delivery_config());

    let mut metadata = kitsvc_delivery::delivery::Metadata::new();
    metadata.insert("event_type".to_string(), "user_created".to_string());
    queue.emit("users", &json!({"username": "ada"}), metadata);

    assert!(wait_until(Duration::from_secs(2), || broker.published().len() == 1).await);

    let published = broker.published();
    assert_eq!(published[0].destination, "users");
    assert_eq!(published[0].metadata["event_type"], "user_created");
    assert_eq!(queue.source_name(), "nsq");
}
