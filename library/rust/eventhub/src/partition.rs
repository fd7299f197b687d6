//! パーティションプロセッサー。
//!
//! 所有権を付与されたパーティション 1 つにつき 1 タスクが動作し、イベントを配信順に
//! ハンドラーへ渡してオフセットを進め、チェックポイント間隔ごとに永続化する。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointKey, CheckpointStore, CheckpointWrite};
use crate::config::{ConsumerConfig, HandlerFailurePolicy};
use crate::diagnostics::{DiagnosticsFilter, Verdict};
use crate::envelope::ReceivedEvent;
use crate::error::{EventHubError, TransportError};
use crate::handler::EventHandler;
use crate::metrics::EventHubMetrics;
use crate::transport::{EventPosition, PartitionReader, TransportReceiver};

/// PartitionState はパーティションカーソルの状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Unassigned,
    Active,
    Checkpointing,
    /// halt ポリシーでハンドラー失敗により停止した
    Halted,
    /// 所有権を保持したまま回復不能な受信エラーで停止した
    Failed,
    Revoked,
}

/// PartitionCursor は (送信先, グループ, パーティション) ごとの処理位置。
/// last_checkpointed <= last_processed を常に満たす。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionCursor {
    pub partition: u32,
    pub epoch: u64,
    pub state: PartitionState,
    pub last_processed: Option<u64>,
    pub last_checkpointed: Option<u64>,
}

impl PartitionCursor {
    pub(crate) fn new(partition: u32, epoch: u64) -> Self {
        Self {
            partition,
            epoch,
            state: PartitionState::Unassigned,
            last_processed: None,
            last_checkpointed: None,
        }
    }
}

/// PartitionExit はプロセッサーの終了理由。
#[derive(Debug)]
pub(crate) enum PartitionExit {
    /// シャットダウンまたは剥奪通知による停止
    Stopped,
    /// より新しいエポックのレシーバーに所有権が移った
    OwnershipLost { epoch: u64 },
    StreamClosed,
    Halted(EventHubError),
    Failed(TransportError),
}

/// コンシューマー内の全プロセッサーが共有する依存。
pub(crate) struct PartitionContext {
    pub consumer: String,
    pub config: ConsumerConfig,
    pub receiver: Arc<dyn TransportReceiver>,
    pub store: Arc<dyn CheckpointStore>,
    pub handler: Arc<dyn EventHandler>,
    pub metrics: Arc<EventHubMetrics>,
    pub diagnostics: Arc<DiagnosticsFilter>,
}

impl PartitionContext {
    fn labels(&self) -> [&str; 2] {
        [self.config.destination.as_str(), self.config.group.as_str()]
    }
}

pub(crate) struct PartitionProcessor {
    ctx: Arc<PartitionContext>,
    key: CheckpointKey,
    epoch: u64,
    cursor: watch::Sender<PartitionCursor>,
    cancel: CancellationToken,
}

impl PartitionProcessor {
    pub(crate) fn new(
        ctx: Arc<PartitionContext>,
        partition: u32,
        epoch: u64,
        cursor: watch::Sender<PartitionCursor>,
        cancel: CancellationToken,
    ) -> Self {
        let key = CheckpointKey::new(
            ctx.config.destination.clone(),
            ctx.config.group.clone(),
            partition,
        );
        Self {
            ctx,
            key,
            epoch,
            cursor,
            cancel,
        }
    }

    /// 終了するまでパーティションを処理し、(パーティション, エポック, 終了理由) を返す。
    pub(crate) async fn run(self) -> (u32, u64, PartitionExit) {
        let exit = self.process().await;
        // 剥奪・停止時も保留中の進捗は可能な限り書き込む
        self.checkpoint().await;
        let state = match exit {
            PartitionExit::Halted(_) => PartitionState::Halted,
            PartitionExit::Failed(_) | PartitionExit::StreamClosed => PartitionState::Failed,
            PartitionExit::Stopped | PartitionExit::OwnershipLost { .. } => PartitionState::Revoked,
        };
        self.cursor.send_modify(|c| c.state = state);
        (self.key.partition, self.epoch, exit)
    }

    async fn process(&self) -> PartitionExit {
        let Some(position) = self.resolve_position().await else {
            return PartitionExit::Stopped;
        };
        let mut reader = match self.open_reader(position).await {
            Ok(Some(reader)) => reader,
            Ok(None) => return PartitionExit::Stopped,
            Err(exit) => return exit,
        };
        self.cursor.send_modify(|c| c.state = PartitionState::Active);
        tracing::info!(
            consumer = %self.ctx.consumer,
            partition = self.key.partition,
            epoch = self.epoch,
            position = ?position,
            "partition processing started"
        );

        let interval = self.ctx.config.checkpoint_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return PartitionExit::Stopped,
                _ = ticker.tick() => self.checkpoint().await,
                received = reader.next() => match received {
                    Ok(Some(event)) => {
                        // ハンドラー完了まで次のイベントは取り出さない
                        if let Err(e) = self.handle(&event).await {
                            return PartitionExit::Halted(e);
                        }
                    }
                    Ok(None) => return PartitionExit::StreamClosed,
                    Err(e) => {
                        self.report(&e);
                        match e {
                            TransportError::OwnershipLost { epoch } => {
                                return PartitionExit::OwnershipLost { epoch };
                            }
                            TransportError::Transient(_) => {
                                if !self.pause().await {
                                    return PartitionExit::Stopped;
                                }
                            }
                            other => return PartitionExit::Failed(other),
                        }
                    }
                },
            }
        }
    }

    /// 保存済みチェックポイントから読み取り開始位置を決める。キャンセル時は None。
    async fn resolve_position(&self) -> Option<EventPosition> {
        loop {
            match self.ctx.store.read(&self.key).await {
                Ok(Some(offset)) => {
                    self.cursor.send_modify(|c| {
                        c.last_processed = Some(offset);
                        c.last_checkpointed = Some(offset);
                    });
                    return Some(EventPosition::After(offset));
                }
                Ok(None) => return Some(self.ctx.config.initial_position.into()),
                Err(e) => {
                    tracing::warn!(
                        consumer = %self.ctx.consumer,
                        checkpoint = %self.key,
                        error = %e,
                        "failed to read checkpoint; retrying"
                    );
                    if !self.pause().await {
                        return None;
                    }
                }
            }
        }
    }

    async fn open_reader(
        &self,
        position: EventPosition,
    ) -> Result<Option<Box<dyn PartitionReader>>, PartitionExit> {
        loop {
            let opened = self
                .ctx
                .receiver
                .open(
                    &self.key.destination,
                    &self.key.group,
                    self.key.partition,
                    self.epoch,
                    position,
                )
                .await;
            match opened {
                Ok(reader) => return Ok(Some(reader)),
                Err(e) => {
                    self.report(&e);
                    match e {
                        TransportError::OwnershipLost { epoch } => {
                            return Err(PartitionExit::OwnershipLost { epoch });
                        }
                        TransportError::Transient(_) => {
                            if !self.pause().await {
                                return Ok(None);
                            }
                        }
                        other => return Err(PartitionExit::Failed(other)),
                    }
                }
            }
        }
    }

    async fn handle(&self, event: &ReceivedEvent) -> Result<(), EventHubError> {
        let labels = self.ctx.labels();
        let result = self.ctx.handler.handle(event).await;
        self.ctx
            .metrics
            .consumer_events_processed_total
            .with_label_values(&labels)
            .inc();

        if let Err(e) = result {
            self.ctx
                .metrics
                .consumer_handler_failures_total
                .with_label_values(&labels)
                .inc();
            match self.ctx.config.handler_failure_policy {
                HandlerFailurePolicy::SkipAndLog => {
                    tracing::warn!(
                        consumer = %self.ctx.consumer,
                        partition = event.partition,
                        offset = event.offset,
                        event_id = %event.envelope.id(),
                        error = %e,
                        "handler failed; skipping event"
                    );
                }
                HandlerFailurePolicy::Halt => {
                    tracing::error!(
                        consumer = %self.ctx.consumer,
                        partition = event.partition,
                        offset = event.offset,
                        event_id = %event.envelope.id(),
                        error = %e,
                        "handler failed; halting partition"
                    );
                    return Err(EventHubError::HandlerFailed {
                        partition: event.partition,
                        offset: event.offset,
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.cursor
            .send_modify(|c| c.last_processed = Some(event.offset));
        Ok(())
    }

    /// 処理済みオフセットがチェックポイントより進んでいれば書き込む。
    /// 失敗しても処理は継続し、次の間隔で再試行される。
    async fn checkpoint(&self) {
        let cursor = *self.cursor.borrow();
        let Some(offset) = cursor.last_processed else {
            return;
        };
        if cursor.last_checkpointed == Some(offset) {
            return;
        }

        let previous = cursor.state;
        self.cursor
            .send_modify(|c| c.state = PartitionState::Checkpointing);
        let labels = self.ctx.labels();

        match self.ctx.store.write(&self.key, offset).await {
            Ok(outcome) => {
                let label = match outcome {
                    CheckpointWrite::Written => "written",
                    CheckpointWrite::Ignored { .. } => "ignored",
                };
                self.ctx
                    .metrics
                    .checkpoint_writes_total
                    .with_label_values(&[labels[0], labels[1], label])
                    .inc();
                if let CheckpointWrite::Ignored { stored } = outcome {
                    tracing::warn!(
                        consumer = %self.ctx.consumer,
                        checkpoint = %self.key,
                        offset,
                        stored,
                        "checkpoint not advanced; stored offset is not older"
                    );
                } else {
                    tracing::debug!(
                        consumer = %self.ctx.consumer,
                        checkpoint = %self.key,
                        offset,
                        "checkpoint written"
                    );
                }
                self.cursor
                    .send_modify(|c| c.last_checkpointed = Some(offset));
            }
            Err(e) => {
                self.ctx
                    .metrics
                    .checkpoint_failures_total
                    .with_label_values(&labels)
                    .inc();
                tracing::warn!(
                    consumer = %self.ctx.consumer,
                    checkpoint = %self.key,
                    offset,
                    error = %e,
                    "checkpoint write failed"
                );
            }
        }
        self.cursor.send_modify(|c| c.state = previous);
    }

    fn report(&self, error: &TransportError) {
        let source = format!("consumer:{}:{}", self.ctx.consumer, self.key.partition);
        if let Verdict::BenignTransient { rule } =
            self.ctx.diagnostics.report_transport_error(&source, error)
        {
            self.ctx
                .metrics
                .transport_signals_suppressed_total
                .with_label_values(&[rule.as_str()])
                .inc();
        }
    }

    /// 受信リトライ間隔だけ待機する。キャンセルされた場合は false。
    async fn pause(&self) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(self.ctx.config.receive_retry_delay()) => true,
        }
    }
}
