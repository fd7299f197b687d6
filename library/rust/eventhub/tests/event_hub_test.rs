use std::sync::{Arc, Mutex};
use std::time::Duration;

use k1s0_eventhub::{
    handler_fn, CheckpointKey, EventEnvelope, EventHub, EventHubConfig, EventHubError,
    HandlerError, InMemoryTransport, ReceivedEvent,
};
use serde::{Deserialize, Serialize};

const CONFIG: &str = r#"
transport:
  endpoint: "memory://local"
checkpoint_store:
  backend: memory
producers:
  orders:
    destination: "orders"
    sending_period_ms: 50
    sending_workers: 2
    buffer_size: 100
consumers:
  audit:
    destination: "orders"
    group: "audit"
    checkpoint_interval_ms: 100
    handler_failure_policy: skip_and_log
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    order_id: String,
    amount: u64,
}

#[tokio::test]
async fn test_submitted_orders_reach_audit_consumer() {
    let config = EventHubConfig::from_yaml_str(CONFIG).unwrap();
    let transport = Arc::new(InMemoryTransport::new(3));
    let hub = EventHub::builder(config)
        .transport(transport.clone())
        .start()
        .await
        .unwrap();

    let received: Arc<Mutex<Vec<OrderCreated>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler = handler_fn(move |event: ReceivedEvent| {
        let sink = sink.clone();
        async move {
            let order: OrderCreated = event.envelope.deserialize_json()?;
            sink.lock().unwrap().push(order);
            Ok::<(), HandlerError>(())
        }
    });
    let consumer = hub.start_consumer("audit", handler).await.unwrap();
    transport.assign_all("orders", "audit").await;

    let mut handles = Vec::new();
    for i in 0..20u64 {
        let order = OrderCreated {
            order_id: format!("ord-{i:03}"),
            amount: 100 + i,
        };
        let envelope = EventEnvelope::json(format!("evt-{i}"), &order)
            .unwrap()
            .with_partition_key(format!("customer-{}", i % 4));
        handles.push(hub.submit("orders", envelope).await.unwrap());
    }
    for handle in handles {
        handle.wait().await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        while received.lock().unwrap().len() < 20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let mut ids: Vec<String> = received
        .lock()
        .unwrap()
        .iter()
        .map(|o| o.order_id.clone())
        .collect();
    ids.sort();
    let expected: Vec<String> = (0..20).map(|i| format!("ord-{i:03}")).collect();
    assert_eq!(ids, expected);
    assert_eq!(consumer.partition_states().len(), 3);

    let report = hub.shutdown().await;
    assert!(report.producers["orders"].is_clean());
    assert_eq!(report.consumers["audit"].aborted, 0);

    // 最終チェックポイントはパーティション末尾まで進んでいる
    for partition in 0..3 {
        let events = transport.partition_events("orders", partition).await;
        let key = CheckpointKey::new("orders", "audit", partition);
        let stored = hub.checkpoint_store().read(&key).await.unwrap();
        assert_eq!(stored, events.last().map(|e| e.offset));
    }

    let err = hub
        .submit("orders", EventEnvelope::new("evt-late", b"{}".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, EventHubError::Closed(_)));
}

#[tokio::test]
async fn test_consumer_cannot_start_twice() {
    let config = EventHubConfig::from_yaml_str(CONFIG).unwrap();
    let hub = EventHub::builder(config)
        .transport(Arc::new(InMemoryTransport::new(1)))
        .start()
        .await
        .unwrap();
    let handler = handler_fn(|_| async { Ok::<(), HandlerError>(()) });
    hub.start_consumer("audit", handler.clone()).await.unwrap();
    let err = hub.start_consumer("audit", handler).await.unwrap_err();
    assert!(matches!(err, EventHubError::Configuration(_)));
    hub.shutdown().await;
}

#[test]
fn test_consumer_without_failure_policy_fails_validation() {
    let yaml = r#"
transport:
  endpoint: "memory://local"
consumers:
  audit:
    destination: "orders"
    group: "audit"
"#;
    let err = EventHubConfig::from_yaml_str(yaml).unwrap_err();
    assert!(matches!(err, EventHubError::Configuration(_)));
}
