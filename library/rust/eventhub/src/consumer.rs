//! コンシューマーパイプライン。
//!
//! トランスポートの所有権通知を購読し、付与されたパーティションごとに
//! プロセッサーを起動・停止する。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::config::ConsumerConfig;
use crate::diagnostics::DiagnosticsFilter;
use crate::error::EventHubError;
use crate::handler::EventHandler;
use crate::metrics::EventHubMetrics;
use crate::partition::{
    PartitionContext, PartitionCursor, PartitionExit, PartitionProcessor, PartitionState,
};
use crate::transport::{OwnershipEvent, TransportReceiver};

type CursorMap = Arc<Mutex<BTreeMap<u32, watch::Receiver<PartitionCursor>>>>;
type ProcessorResult = (u32, u64, PartitionExit);

/// ConsumerShutdownReport は停止時の結果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerShutdownReport {
    /// 猶予内に最終チェックポイントまで完了したパーティション数
    pub stopped: usize,
    /// 猶予切れで中断したパーティション数
    pub aborted: usize,
}

/// ConsumerPipelineBuilder はコンシューマーパイプラインの組み立てを行う。
/// ハンドラーは start より前に登録しなければならない。
pub struct ConsumerPipelineBuilder {
    name: String,
    config: ConsumerConfig,
    receiver: Arc<dyn TransportReceiver>,
    store: Arc<dyn CheckpointStore>,
    handler: Option<Arc<dyn EventHandler>>,
    metrics: Option<Arc<EventHubMetrics>>,
    diagnostics: Option<Arc<DiagnosticsFilter>>,
}

impl ConsumerPipelineBuilder {
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn metrics(mut self, metrics: Arc<EventHubMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<DiagnosticsFilter>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// 設定を検証し、所有権通知を購読して処理を開始する。
    pub async fn start(self) -> Result<ConsumerPipeline, EventHubError> {
        self.config.validate(&self.name)?;
        let handler = self.handler.ok_or_else(|| {
            EventHubError::Configuration(format!(
                "consumer '{}': handler must be registered before start",
                self.name
            ))
        })?;
        let diagnostics = match self.diagnostics {
            Some(d) => d,
            None => Arc::new(DiagnosticsFilter::with_defaults()?),
        };

        let ownership = self
            .receiver
            .subscribe(&self.config.destination, &self.config.group)
            .await
            .map_err(|e| EventHubError::TransientTransport(e.to_string()))?;

        let ctx = Arc::new(PartitionContext {
            consumer: self.name,
            config: self.config,
            receiver: self.receiver,
            store: self.store,
            handler,
            metrics: self.metrics.unwrap_or_default(),
            diagnostics,
        });
        let cancel = CancellationToken::new();
        let cursors = CursorMap::default();

        tracing::info!(
            consumer = %ctx.consumer,
            destination = %ctx.config.destination,
            group = %ctx.config.group,
            checkpoint_interval_ms = ctx.config.checkpoint_interval_ms,
            "consumer pipeline started"
        );

        let coordinator = tokio::spawn(coordinate(
            ctx.clone(),
            ownership,
            cancel.clone(),
            cursors.clone(),
        ));

        Ok(ConsumerPipeline {
            ctx,
            cancel,
            cursors,
            coordinator: Mutex::new(Some(coordinator)),
        })
    }
}

/// ConsumerPipeline は名前付きコンシューマー 1 つ分の受信パイプライン。
pub struct ConsumerPipeline {
    ctx: Arc<PartitionContext>,
    cancel: CancellationToken,
    cursors: CursorMap,
    coordinator: Mutex<Option<JoinHandle<ConsumerShutdownReport>>>,
}

impl std::fmt::Debug for ConsumerPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPipeline").finish_non_exhaustive()
    }
}

impl ConsumerPipeline {
    pub fn builder(
        name: impl Into<String>,
        config: ConsumerConfig,
        receiver: Arc<dyn TransportReceiver>,
        store: Arc<dyn CheckpointStore>,
    ) -> ConsumerPipelineBuilder {
        ConsumerPipelineBuilder {
            name: name.into(),
            config,
            receiver,
            store,
            handler: None,
            metrics: None,
            diagnostics: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.consumer
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.ctx.config
    }

    /// 現在このインスタンスが保持しているパーティションのカーソル。
    pub fn partition_states(&self) -> Vec<PartitionCursor> {
        lock(&self.cursors)
            .values()
            .map(|rx| *rx.borrow())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.coordinator)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// 新しいイベントの取り出しを止め、処理中のイベントの完了と最終チェックポイントを
    /// shutdown_grace まで待つ。猶予を超えたパーティションは中断して件数を報告する。
    pub async fn shutdown(&self) -> ConsumerShutdownReport {
        self.cancel.cancel();
        let Some(coordinator) = lock(&self.coordinator).take() else {
            return ConsumerShutdownReport::default();
        };
        match coordinator.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(consumer = %self.ctx.consumer, error = %e, "consumer coordinator failed");
                ConsumerShutdownReport::default()
            }
        }
    }

    /// 最終チェックポイントを書かずに即座に停止する。
    /// 直前のチェックポイント以降の処理済みイベントは再起動後に再配信される。
    pub fn abort(&self) {
        // キャンセル通知は送らない（プロセッサーに最終チェックポイントを書かせない）
        if let Some(coordinator) = lock(&self.coordinator).take() {
            coordinator.abort();
        }
        lock(&self.cursors).clear();
        tracing::warn!(consumer = %self.ctx.consumer, "consumer pipeline aborted");
    }
}

impl Drop for ConsumerPipeline {
    fn drop(&mut self) {
        if lock(&self.coordinator).is_some() {
            self.cancel.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Coordinator {
    ctx: Arc<PartitionContext>,
    cursors: CursorMap,
    tasks: JoinSet<ProcessorResult>,
    running: HashMap<u32, (u64, CancellationToken)>,
}

impl Coordinator {
    fn set_owned_gauge(&self) {
        self.ctx
            .metrics
            .consumer_owned_partitions
            .with_label_values(&[
                self.ctx.config.destination.as_str(),
                self.ctx.config.group.as_str(),
            ])
            .set(i64::try_from(self.running.len()).unwrap_or(i64::MAX));
    }

    fn grant(&mut self, partition: u32, epoch: u64, parent: &CancellationToken) {
        if let Some((old_epoch, token)) = self.running.remove(&partition) {
            tracing::debug!(
                consumer = %self.ctx.consumer,
                partition,
                old_epoch,
                epoch,
                "partition re-granted; replacing processor"
            );
            token.cancel();
        }
        let token = parent.child_token();
        let (tx, rx) = watch::channel(PartitionCursor::new(partition, epoch));
        lock(&self.cursors).insert(partition, rx);
        self.running.insert(partition, (epoch, token.clone()));
        self.tasks.spawn(
            PartitionProcessor::new(self.ctx.clone(), partition, epoch, tx, token).run(),
        );
        self.set_owned_gauge();
    }

    fn revoke(&mut self, partition: u32) {
        if let Some((_, token)) = self.running.remove(&partition) {
            tracing::info!(consumer = %self.ctx.consumer, partition, "partition ownership revoked");
            token.cancel();
        } else {
            // 停止済み（Halted / Failed）のパーティションは剥奪で表示から外す
            let mut cursors = lock(&self.cursors);
            if cursors.remove(&partition).is_some() {
                tracing::info!(
                    consumer = %self.ctx.consumer,
                    partition,
                    "stopped partition released on revoke"
                );
            }
        }
        self.set_owned_gauge();
    }

    fn reap(&mut self, joined: Result<ProcessorResult, JoinError>) {
        let (partition, epoch, exit) = match joined {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(consumer = %self.ctx.consumer, error = %e, "partition processor panicked");
                return;
            }
        };
        if self.running.get(&partition).is_some_and(|(e, _)| *e == epoch) {
            self.running.remove(&partition);
        }
        {
            let mut cursors = lock(&self.cursors);
            let current = cursors.get(&partition).map(|rx| *rx.borrow());
            if let Some(cursor) = current {
                if cursor.epoch == epoch && cursor.state == PartitionState::Revoked {
                    cursors.remove(&partition);
                }
            }
        }
        self.set_owned_gauge();

        let consumer = &self.ctx.consumer;
        match exit {
            PartitionExit::Stopped => {
                tracing::debug!(consumer = %consumer, partition, "partition processor stopped");
            }
            PartitionExit::OwnershipLost { epoch: newer } => {
                tracing::info!(
                    consumer = %consumer,
                    partition,
                    epoch,
                    newer_epoch = newer,
                    "partition taken over by another receiver"
                );
            }
            PartitionExit::StreamClosed => {
                tracing::warn!(consumer = %consumer, partition, "partition stream closed by transport");
            }
            PartitionExit::Halted(e) => {
                tracing::error!(consumer = %consumer, partition, error = %e, "partition halted");
            }
            PartitionExit::Failed(e) => {
                tracing::error!(consumer = %consumer, partition, error = %e, "partition processor failed");
            }
        }
    }
}

async fn coordinate(
    ctx: Arc<PartitionContext>,
    mut ownership: mpsc::Receiver<OwnershipEvent>,
    cancel: CancellationToken,
    cursors: CursorMap,
) -> ConsumerShutdownReport {
    let mut coordinator = Coordinator {
        ctx,
        cursors,
        tasks: JoinSet::new(),
        running: HashMap::new(),
    };
    let mut subscribed = true;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(joined) = coordinator.tasks.join_next(), if !coordinator.tasks.is_empty() => {
                coordinator.reap(joined);
            }
            event = ownership.recv(), if subscribed => match event {
                Some(OwnershipEvent::Granted { partition, epoch }) => {
                    coordinator.grant(partition, epoch, &cancel);
                }
                Some(OwnershipEvent::Revoked { partition }) => coordinator.revoke(partition),
                None => {
                    tracing::warn!(
                        consumer = %coordinator.ctx.consumer,
                        "ownership notifications closed by transport"
                    );
                    subscribed = false;
                }
            },
        }
    }

    // cancel の子トークンにより全プロセッサーが停止に向かう
    let deadline = Instant::now() + coordinator.ctx.config.shutdown_grace();
    let mut report = ConsumerShutdownReport::default();
    loop {
        match tokio::time::timeout_at(deadline, coordinator.tasks.join_next()).await {
            Ok(Some(joined)) => {
                report.stopped += 1;
                coordinator.reap(joined);
            }
            Ok(None) => break,
            Err(_) => {
                report.aborted = coordinator.tasks.len();
                coordinator.tasks.abort_all();
                while coordinator.tasks.join_next().await.is_some() {}
                tracing::warn!(
                    consumer = %coordinator.ctx.consumer,
                    aborted = report.aborted,
                    "partitions did not stop within shutdown grace"
                );
                break;
            }
        }
    }
    coordinator.running.clear();
    lock(&coordinator.cursors).clear();
    coordinator.set_owned_gauge();

    tracing::info!(
        consumer = %coordinator.ctx.consumer,
        stopped = report.stopped,
        aborted = report.aborted,
        "consumer pipeline stopped"
    );
    report
}
