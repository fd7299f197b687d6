//! InMemoryTransport: プロセス内で完結する分割ストリーミングトランスポート。
//! テストおよびローカル開発用。

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::envelope::{EventEnvelope, ReceivedEvent};
use crate::error::TransportError;
use crate::transport::{
    EventPosition, OwnershipEvent, PartitionReader, TransportReceiver, TransportSender,
};

const OWNERSHIP_CHANNEL_CAPACITY: usize = 256;

type GroupKey = (String, String);
type PartitionKey = (String, String, u32);

#[derive(Default)]
struct DestinationLog {
    partitions: Vec<Vec<ReceivedEvent>>,
    next_round_robin: usize,
}

#[derive(Default)]
struct Inner {
    logs: HashMap<String, DestinationLog>,
    subscribers: HashMap<GroupKey, mpsc::Sender<OwnershipEvent>>,
    pending_ownership: HashMap<GroupKey, Vec<OwnershipEvent>>,
    epochs: HashMap<PartitionKey, u64>,
    sent_batches: Vec<(String, Vec<EventEnvelope>)>,
    send_attempts: usize,
    injected_failures: VecDeque<TransportError>,
    send_delay: Option<Duration>,
}

impl Inner {
    fn log_mut(&mut self, destination: &str, partition_count: u32) -> &mut DestinationLog {
        self.logs
            .entry(destination.to_string())
            .or_insert_with(|| DestinationLog {
                partitions: vec![Vec::new(); partition_count as usize],
                next_round_robin: 0,
            })
    }

    fn current_epoch(&self, key: &PartitionKey) -> u64 {
        self.epochs.get(key).copied().unwrap_or(0)
    }

    fn notify_ownership(&mut self, group_key: GroupKey, event: OwnershipEvent) {
        if let Some(tx) = self.subscribers.get(&group_key) {
            if tx.try_send(event).is_ok() {
                return;
            }
        }
        self.pending_ownership
            .entry(group_key)
            .or_default()
            .push(event);
    }
}

/// InMemoryTransport は送信・受信の両プリミティブを実装する。
/// Clone したインスタンス同士は同じログを共有する。
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
    partition_count: u32,
}

impl InMemoryTransport {
    /// 送信先ごとに partition_count 個のパーティションを持つトランスポートを生成する。
    pub fn new(partition_count: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            appended: Arc::new(Notify::new()),
            partition_count: partition_count.max(1),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// パーティションキーのハッシュ、キーがなければラウンドロビンで振り分ける。
    fn route(&self, log: &mut DestinationLog, envelope: &EventEnvelope) -> usize {
        let count = self.partition_count as usize;
        match envelope.partition_key() {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                usize::try_from(hasher.finish() % u64::from(self.partition_count)).unwrap_or(0)
            }
            None => {
                let p = log.next_round_robin % count;
                log.next_round_robin = log.next_round_robin.wrapping_add(1);
                p
            }
        }
    }

    /// 次回以降の send 呼び出しで返すエラーを積む。
    pub async fn fail_next_sends(&self, errors: impl IntoIterator<Item = TransportError>) {
        let mut inner = self.inner.lock().await;
        inner.injected_failures.extend(errors);
    }

    /// send 呼び出しごとに遅延を入れる（遅いトランスポートの模擬）。
    pub async fn set_send_delay(&self, delay: Option<Duration>) {
        self.inner.lock().await.send_delay = delay;
    }

    /// 成功した send 呼び出しのバッチを呼び出し順に返す。
    pub async fn sent_batches(&self) -> Vec<(String, Vec<EventEnvelope>)> {
        self.inner.lock().await.sent_batches.clone()
    }

    /// 失敗を含む send 呼び出しの総数。
    pub async fn send_attempts(&self) -> usize {
        self.inner.lock().await.send_attempts
    }

    /// パーティションに格納済みのイベント。
    pub async fn partition_events(&self, destination: &str, partition: u32) -> Vec<ReceivedEvent> {
        let inner = self.inner.lock().await;
        inner
            .logs
            .get(destination)
            .and_then(|log| log.partitions.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// テスト用: 指定パーティションに直接イベントを追記する。
    /// パーティション番号はパーティション数で剰余を取る。
    pub async fn append(&self, destination: &str, partition: u32, envelope: EventEnvelope) -> u64 {
        let partition = partition % self.partition_count;
        let mut inner = self.inner.lock().await;
        let log = inner.log_mut(destination, self.partition_count);
        let events = &mut log.partitions[partition as usize];
        let offset = events.len() as u64;
        events.push(ReceivedEvent {
            destination: destination.to_string(),
            partition,
            offset,
            envelope,
        });
        drop(inner);
        self.appended.notify_waiters();
        offset
    }

    /// グループにパーティションの所有権を付与する。エポックを 1 つ進めて返す。
    pub async fn assign(&self, destination: &str, group: &str, partition: u32) -> u64 {
        let mut inner = self.inner.lock().await;
        let key = (destination.to_string(), group.to_string(), partition);
        let epoch = inner.current_epoch(&key) + 1;
        inner.epochs.insert(key, epoch);
        inner.notify_ownership(
            (destination.to_string(), group.to_string()),
            OwnershipEvent::Granted { partition, epoch },
        );
        drop(inner);
        self.appended.notify_waiters();
        epoch
    }

    /// 全パーティションの所有権を付与する。
    pub async fn assign_all(&self, destination: &str, group: &str) {
        for partition in 0..self.partition_count {
            self.assign(destination, group, partition).await;
        }
    }

    /// 所有権の剥奪を通知する（リバランス）。
    pub async fn revoke(&self, destination: &str, group: &str, partition: u32) {
        let mut inner = self.inner.lock().await;
        inner.notify_ownership(
            (destination.to_string(), group.to_string()),
            OwnershipEvent::Revoked { partition },
        );
    }

    /// 別インスタンスがより高いエポックで同じパーティションを開いたことを模擬する。
    /// 現在のレシーバーは次の受信で OwnershipLost を受け取る。
    pub async fn displace(&self, destination: &str, group: &str, partition: u32) -> u64 {
        let mut inner = self.inner.lock().await;
        let key = (destination.to_string(), group.to_string(), partition);
        let epoch = inner.current_epoch(&key) + 1;
        inner.epochs.insert(key, epoch);
        drop(inner);
        self.appended.notify_waiters();
        epoch
    }
}

#[async_trait]
impl TransportSender for InMemoryTransport {
    async fn send(&self, destination: &str, batch: &[EventEnvelope]) -> Result<(), TransportError> {
        let delay = {
            let mut inner = self.inner.lock().await;
            inner.send_attempts += 1;
            if let Some(err) = inner.injected_failures.pop_front() {
                return Err(err);
            }
            inner.send_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().await;
        inner
            .sent_batches
            .push((destination.to_string(), batch.to_vec()));
        let partition_count = self.partition_count;
        let log = inner.log_mut(destination, partition_count);
        for envelope in batch {
            let partition = self.route(log, envelope);
            let events = &mut log.partitions[partition];
            let offset = events.len() as u64;
            events.push(ReceivedEvent {
                destination: destination.to_string(),
                partition: u32::try_from(partition).unwrap_or(0),
                offset,
                envelope: envelope.clone(),
            });
        }
        drop(inner);
        self.appended.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl TransportReceiver for InMemoryTransport {
    async fn subscribe(
        &self,
        destination: &str,
        group: &str,
    ) -> Result<mpsc::Receiver<OwnershipEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(OWNERSHIP_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().await;
        let group_key = (destination.to_string(), group.to_string());
        for event in inner
            .pending_ownership
            .remove(&group_key)
            .unwrap_or_default()
        {
            tx.try_send(event)
                .map_err(|e| TransportError::Transient(e.to_string()))?;
        }
        inner.subscribers.insert(group_key, tx);
        Ok(rx)
    }

    async fn open(
        &self,
        destination: &str,
        group: &str,
        partition: u32,
        epoch: u64,
        position: EventPosition,
    ) -> Result<Box<dyn PartitionReader>, TransportError> {
        if partition >= self.partition_count {
            return Err(TransportError::Permanent(format!(
                "partition {partition} does not exist on {destination}"
            )));
        }
        let mut inner = self.inner.lock().await;
        let key = (destination.to_string(), group.to_string(), partition);
        let current = inner.current_epoch(&key);
        if current > epoch {
            return Err(TransportError::OwnershipLost { epoch: current });
        }
        let len = inner.log_mut(destination, self.partition_count).partitions
            [partition as usize]
            .len();
        let start = match position {
            EventPosition::Earliest => 0,
            EventPosition::Latest => len,
            EventPosition::After(offset) => usize::try_from(offset).map_or(len, |o| o + 1),
        };
        Ok(Box::new(InMemoryPartitionReader {
            inner: self.inner.clone(),
            appended: self.appended.clone(),
            key,
            epoch,
            position: start,
        }))
    }
}

struct InMemoryPartitionReader {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
    key: PartitionKey,
    epoch: u64,
    position: usize,
}

#[async_trait]
impl PartitionReader for InMemoryPartitionReader {
    async fn next(&mut self) -> Result<Option<ReceivedEvent>, TransportError> {
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().await;
                let current = inner.current_epoch(&self.key);
                if current > self.epoch {
                    return Err(TransportError::OwnershipLost { epoch: current });
                }
                let event = inner
                    .logs
                    .get(&self.key.0)
                    .and_then(|log| log.partitions.get(self.key.2 as usize))
                    .and_then(|events| events.get(self.position))
                    .cloned();
                if let Some(event) = event {
                    self.position += 1;
                    return Ok(Some(event));
                }
            }
            notified.await;
        }
    }
}
