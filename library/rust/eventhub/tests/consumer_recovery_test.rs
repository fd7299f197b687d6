use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k1s0_eventhub::{
    CheckpointKey, CheckpointStore, ConsumerConfig, ConsumerPipeline, EventEnvelope,
    EventHandler, EventHubError, EventHubMetrics, EventPosition, FileCheckpointStore,
    HandlerError, HandlerFailurePolicy, InMemoryCheckpointStore, InMemoryTransport,
    OwnershipEvent, PartitionReader, PartitionState, ReceivedEvent, TransportError,
    TransportReceiver, TransportSender,
};
use tokio::sync::mpsc;

/// 受信した (パーティション, オフセット) を記録するハンドラー。
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<(u32, u64)>>,
}

impl RecordingHandler {
    fn seen(&self) -> Vec<(u32, u64)> {
        self.seen.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn offsets_for(&self, partition: u32) -> Vec<u64> {
        self.seen()
            .into_iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, o)| o)
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &ReceivedEvent) -> Result<(), HandlerError> {
        self.seen
            .lock()
            .unwrap()
            .push((event.partition, event.offset));
        Ok(())
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within 10s");
}

fn audit_config(policy: HandlerFailurePolicy) -> ConsumerConfig {
    ConsumerConfig::new("orders", "audit", policy)
        .with_checkpoint_interval(Duration::from_secs(10))
        .with_shutdown_grace(Duration::from_secs(2))
}

async fn start(
    transport: &Arc<InMemoryTransport>,
    store: Arc<dyn CheckpointStore>,
    handler: Arc<RecordingHandler>,
) -> ConsumerPipeline {
    ConsumerPipeline::builder(
        "audit",
        audit_config(HandlerFailurePolicy::SkipAndLog),
        transport.clone(),
        store,
    )
    .handler(handler)
    .start()
    .await
    .unwrap()
}

async fn append(transport: &InMemoryTransport, partition: u32, count: u64) {
    for i in 0..count {
        transport
            .append(
                "orders",
                partition,
                EventEnvelope::new(format!("p{partition}-{i}"), b"{}".to_vec()),
            )
            .await;
    }
}

#[tokio::test]
async fn test_restart_redelivers_only_events_after_checkpoint() {
    let transport = Arc::new(InMemoryTransport::new(1));
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let key = CheckpointKey::new("orders", "audit", 0);
    // チェックポイント K=3、処理済み K+5=8 の状態を作る
    append(&transport, 0, 9).await;
    store.write(&key, 3).await.unwrap();

    let first = Arc::new(RecordingHandler::default());
    let pipeline = start(&transport, store.clone(), first.clone()).await;
    transport.assign("orders", "audit", 0).await;
    wait_until(|| first.offsets_for(0).last() == Some(&8)).await;
    assert_eq!(first.offsets_for(0), vec![4, 5, 6, 7, 8]);

    // クラッシュ相当: 最終チェックポイントを書かずに停止
    pipeline.abort();
    assert_eq!(store.read(&key).await.unwrap(), Some(3));

    let second = Arc::new(RecordingHandler::default());
    let restarted = start(&transport, store.clone(), second.clone()).await;
    transport.assign("orders", "audit", 0).await;
    wait_until(|| second.offsets_for(0).last() == Some(&8)).await;
    assert_eq!(second.offsets_for(0), vec![4, 5, 6, 7, 8]);

    restarted.shutdown().await;
    assert_eq!(store.read(&key).await.unwrap(), Some(8));
}

#[tokio::test]
async fn test_audit_group_replays_from_start_without_checkpoint() {
    let transport = Arc::new(InMemoryTransport::new(3));
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

    let first = Arc::new(RecordingHandler::default());
    let pipeline = start(&transport, store.clone(), first.clone()).await;
    transport.assign_all("orders", "audit").await;

    // 1000 件を約 1 秒かけて配信する
    for chunk in 0..10 {
        let batch: Vec<EventEnvelope> = (0..100)
            .map(|i| EventEnvelope::new(format!("ord-{}", chunk * 100 + i), b"{}".to_vec()))
            .collect();
        transport.send("orders", &batch).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    wait_until(|| first.count() == 1000).await;

    // 最初のチェックポイント (10 秒) より前にクラッシュ
    pipeline.abort();
    assert!(store.list("orders", "audit").await.unwrap().is_empty());

    let second = Arc::new(RecordingHandler::default());
    let restarted = start(&transport, store.clone(), second.clone()).await;
    transport.assign_all("orders", "audit").await;
    wait_until(|| second.count() == 1000).await;

    for partition in 0..3 {
        let offsets = second.offsets_for(partition);
        assert_eq!(offsets.first(), Some(&0), "partition {partition}");
        let expected: Vec<u64> = (0..offsets.len() as u64).collect();
        assert_eq!(offsets, expected);
    }
    restarted.shutdown().await;
}

#[tokio::test]
async fn test_graceful_shutdown_writes_final_checkpoints() {
    let transport = Arc::new(InMemoryTransport::new(3));
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    for partition in 0..3 {
        append(&transport, partition, 10).await;
    }

    let handler = Arc::new(RecordingHandler::default());
    let pipeline = start(&transport, store.clone(), handler.clone()).await;
    transport.assign_all("orders", "audit").await;
    wait_until(|| handler.count() == 30).await;
    assert_eq!(pipeline.partition_states().len(), 3);

    let report = pipeline.shutdown().await;
    assert_eq!(report.stopped, 3);
    assert_eq!(report.aborted, 0);

    let offsets: BTreeMap<u32, u64> = store
        .list("orders", "audit")
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.key.partition, r.offset))
        .collect();
    assert_eq!(offsets, BTreeMap::from([(0, 9), (1, 9), (2, 9)]));
    assert!(pipeline.partition_states().is_empty());
}

#[tokio::test]
async fn test_revoke_checkpoints_and_releases_partition() {
    let transport = Arc::new(InMemoryTransport::new(2));
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    append(&transport, 0, 4).await;
    append(&transport, 1, 4).await;

    let handler = Arc::new(RecordingHandler::default());
    let pipeline = start(&transport, store.clone(), handler.clone()).await;
    transport.assign_all("orders", "audit").await;
    wait_until(|| handler.count() == 8).await;

    transport.revoke("orders", "audit", 1).await;
    wait_until(|| pipeline.partition_states().iter().all(|c| c.partition != 1)).await;

    let key = CheckpointKey::new("orders", "audit", 1);
    assert_eq!(store.read(&key).await.unwrap(), Some(3));
    let states = pipeline.partition_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].partition, 0);
    assert_eq!(states[0].state, PartitionState::Active);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_displacement_is_benign_and_counted() {
    let transport = Arc::new(InMemoryTransport::new(1));
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let metrics = Arc::new(EventHubMetrics::new("audit-server"));
    append(&transport, 0, 3).await;

    let handler = Arc::new(RecordingHandler::default());
    let pipeline = ConsumerPipeline::builder(
        "audit",
        audit_config(HandlerFailurePolicy::Halt),
        transport.clone(),
        store.clone(),
    )
    .handler(handler.clone())
    .metrics(metrics.clone())
    .start()
    .await
    .unwrap();
    transport.assign("orders", "audit", 0).await;
    wait_until(|| handler.count() == 3).await;

    // 別インスタンスがより高いエポックで同じパーティションを開いた
    transport.displace("orders", "audit", 0).await;
    wait_until(|| pipeline.partition_states().is_empty()).await;

    assert_eq!(
        metrics
            .transport_signals_suppressed_total
            .with_label_values(&["receiver-epoch-displacement"])
            .get(),
        1
    );
    let key = CheckpointKey::new("orders", "audit", 0);
    assert_eq!(store.read(&key).await.unwrap(), Some(2));
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_halt_policy_keeps_failed_partition_visible() {
    struct RejectingHandler;

    #[async_trait]
    impl EventHandler for RejectingHandler {
        async fn handle(&self, event: &ReceivedEvent) -> Result<(), HandlerError> {
            if event.offset == 1 {
                return Err(HandlerError::new("inventory service unavailable"));
            }
            Ok(())
        }
    }

    let transport = Arc::new(InMemoryTransport::new(1));
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    append(&transport, 0, 3).await;

    let pipeline = ConsumerPipeline::builder(
        "audit",
        audit_config(HandlerFailurePolicy::Halt),
        transport.clone(),
        store.clone(),
    )
    .handler(Arc::new(RejectingHandler))
    .start()
    .await
    .unwrap();
    transport.assign("orders", "audit", 0).await;

    wait_until(|| {
        pipeline
            .partition_states()
            .first()
            .is_some_and(|c| c.state == PartitionState::Halted)
    })
    .await;
    let cursor = pipeline.partition_states()[0];
    assert_eq!(cursor.last_processed, Some(0));
    let key = CheckpointKey::new("orders", "audit", 0);
    assert_eq!(store.read(&key).await.unwrap(), Some(0));
    pipeline.shutdown().await;
}

/// 所有権は付与するが、読み取りが恒久エラーになるレシーバー。
#[derive(Default)]
struct CorruptedPartitionReceiver {
    ownership: Mutex<Option<mpsc::Sender<OwnershipEvent>>>,
}

impl CorruptedPartitionReceiver {
    fn ownership(&self) -> mpsc::Sender<OwnershipEvent> {
        self.ownership.lock().unwrap().clone().unwrap()
    }
}

struct CorruptedReader;

#[async_trait]
impl PartitionReader for CorruptedReader {
    async fn next(&mut self) -> Result<Option<ReceivedEvent>, TransportError> {
        Err(TransportError::Permanent("partition log is corrupted".to_string()))
    }
}

#[async_trait]
impl TransportReceiver for CorruptedPartitionReceiver {
    async fn subscribe(
        &self,
        _destination: &str,
        _group: &str,
    ) -> Result<mpsc::Receiver<OwnershipEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(8);
        tx.try_send(OwnershipEvent::Granted { partition: 0, epoch: 1 })
            .unwrap();
        *self.ownership.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn open(
        &self,
        _destination: &str,
        _group: &str,
        _partition: u32,
        _epoch: u64,
        _position: EventPosition,
    ) -> Result<Box<dyn PartitionReader>, TransportError> {
        Ok(Box::new(CorruptedReader))
    }
}

#[tokio::test]
async fn test_permanent_receive_error_keeps_owned_partition_visible() {
    let receiver = Arc::new(CorruptedPartitionReceiver::default());
    let pipeline = ConsumerPipeline::builder(
        "audit",
        audit_config(HandlerFailurePolicy::SkipAndLog),
        receiver.clone(),
        Arc::new(InMemoryCheckpointStore::new()),
    )
    .handler(Arc::new(RecordingHandler::default()))
    .start()
    .await
    .unwrap();

    wait_until(|| {
        pipeline
            .partition_states()
            .first()
            .is_some_and(|c| c.state == PartitionState::Failed)
    })
    .await;
    assert!(pipeline.is_running());
    assert_eq!(pipeline.partition_states()[0].partition, 0);

    // 剥奪されたら停止済みのパーティションも表示から外れる
    receiver
        .ownership()
        .send(OwnershipEvent::Revoked { partition: 0 })
        .await
        .unwrap();
    wait_until(|| pipeline.partition_states().is_empty()).await;
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_start_without_handler_is_configuration_error() {
    let transport = Arc::new(InMemoryTransport::new(1));
    let result = ConsumerPipeline::builder(
        "audit",
        audit_config(HandlerFailurePolicy::Halt),
        transport,
        Arc::new(InMemoryCheckpointStore::new()),
    )
    .start()
    .await;
    match result {
        Err(EventHubError::Configuration(msg)) => assert!(msg.contains("handler")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("consumer started without a handler"),
    }
}

#[tokio::test]
async fn test_file_checkpoint_store_survives_consumer_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.json");
    let transport = Arc::new(InMemoryTransport::new(1));
    append(&transport, 0, 5).await;

    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::open(&path).await.unwrap());
    let first = Arc::new(RecordingHandler::default());
    let pipeline = start(&transport, store, first.clone()).await;
    transport.assign("orders", "audit", 0).await;
    wait_until(|| first.count() == 5).await;
    pipeline.shutdown().await;

    append(&transport, 0, 2).await;
    let reopened: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::open(&path).await.unwrap());
    let second = Arc::new(RecordingHandler::default());
    let restarted = start(&transport, reopened, second.clone()).await;
    transport.assign("orders", "audit", 0).await;
    wait_until(|| second.count() == 2).await;
    assert_eq!(second.offsets_for(0), vec![5, 6]);
    restarted.shutdown().await;
}
