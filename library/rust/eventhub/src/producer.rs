//! プロデューサーパイプライン。
//!
//! 名前付きプロデューサーごとに有界バッファと送信ワーカー群を持ち、
//! 送信周期ごと、またはバッファ満杯時にバッチをトランスポートへ送る。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, Notify, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{OverflowPolicy, ProducerConfig};
use crate::diagnostics::DiagnosticsFilter;
use crate::envelope::EventEnvelope;
use crate::error::{DeliveryFailure, EventHubError, FailureReason, TransportError};
use crate::metrics::EventHubMetrics;
use crate::retry::{send_with_retry, BatchFailure};
use crate::transport::TransportSender;

type DeliveryResult = Result<(), DeliveryFailure>;

/// DeliveryHandle は submit 済みイベントの最終結果を受け取るハンドル。
#[derive(Debug)]
pub struct DeliveryHandle {
    event_id: String,
    destination: String,
    rx: oneshot::Receiver<DeliveryResult>,
}

impl DeliveryHandle {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// 送信完了または配信失敗が確定するまで待機する。
    /// パイプラインが結果を通知せずに破棄された場合は Abandoned として扱う。
    pub async fn wait(self) -> DeliveryResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DeliveryFailure {
                event_id: self.event_id,
                destination: self.destination,
                attempts: 0,
                reason: FailureReason::Abandoned,
                detail: "producer pipeline dropped the event before reporting a result"
                    .to_string(),
            }),
        }
    }
}

/// ShutdownReport はシャットダウン時のドレイン結果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// 最終フラッシュで送信できた件数
    pub delivered: usize,
    /// 配信失敗として通知した件数
    pub failed: usize,
    /// 猶予切れで中断したワーカーが送信中だった件数
    pub abandoned: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.abandoned == 0
    }
}

struct Pending {
    envelope: EventEnvelope,
    reply: oneshot::Sender<DeliveryResult>,
    enqueued_at: Instant,
}

struct Batch {
    envelopes: Vec<EventEnvelope>,
    replies: Vec<oneshot::Sender<DeliveryResult>>,
    oldest: Instant,
}

#[derive(Default)]
struct Buffer {
    queue: VecDeque<Pending>,
    closed: bool,
}

struct Shared {
    name: String,
    config: ProducerConfig,
    sender: Arc<dyn TransportSender>,
    buffer: Mutex<Buffer>,
    /// バッファの空き枠。submit で消費し、ワーカーが取り出した分を戻す
    slots: Semaphore,
    full: Notify,
    in_flight: AtomicUsize,
    metrics: Arc<EventHubMetrics>,
    diagnostics: Arc<DiagnosticsFilter>,
}

impl Shared {
    fn lock_buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_depth_gauge(&self, depth: usize) {
        self.metrics
            .producer_queue_depth
            .with_label_values(&[self.name.as_str()])
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    fn enqueue(&self, envelope: EventEnvelope) -> Result<DeliveryHandle, EventHubError> {
        let (tx, rx) = oneshot::channel();
        let handle = DeliveryHandle {
            event_id: envelope.id().to_string(),
            destination: self.config.destination.clone(),
            rx,
        };

        let mut buffer = self.lock_buffer();
        if buffer.closed {
            return Err(EventHubError::Closed(self.name.clone()));
        }
        buffer.queue.push_back(Pending {
            envelope,
            reply: tx,
            enqueued_at: Instant::now(),
        });
        let depth = buffer.queue.len();
        drop(buffer);

        self.set_depth_gauge(depth);
        if depth >= self.config.buffer_size {
            self.full.notify_one();
        }
        Ok(handle)
    }

    /// 先頭から最大 batch_size 件を取り出す。複数ワーカーが同じイベントを取り出すことはない。
    fn take_batch(&self) -> Option<Batch> {
        let mut buffer = self.lock_buffer();
        if buffer.queue.is_empty() {
            return None;
        }
        let count = self.config.batch_size().min(buffer.queue.len());
        let drained: Vec<Pending> = buffer.queue.drain(..count).collect();
        let depth = buffer.queue.len();
        drop(buffer);

        self.slots.add_permits(count);
        self.in_flight.fetch_add(count, Ordering::SeqCst);
        self.set_depth_gauge(depth);

        let oldest = drained
            .first()
            .map_or_else(Instant::now, |p| p.enqueued_at);
        let mut envelopes = Vec::with_capacity(count);
        let mut replies = Vec::with_capacity(count);
        for pending in drained {
            envelopes.push(pending.envelope);
            replies.push(pending.reply);
        }
        Some(Batch {
            envelopes,
            replies,
            oldest,
        })
    }

    fn observe_transport_error(&self, error: &TransportError, attempt: u32) {
        let source = format!("producer:{}", self.name);
        if let crate::diagnostics::Verdict::BenignTransient { rule } =
            self.diagnostics.report_transport_error(&source, error)
        {
            self.metrics
                .transport_signals_suppressed_total
                .with_label_values(&[rule.as_str()])
                .inc();
        }
        tracing::debug!(producer = %self.name, attempt, "send attempt failed");
    }

    async fn send_batch(&self, envelopes: &[EventEnvelope]) -> Result<u32, BatchFailure> {
        send_with_retry(
            self.sender.as_ref(),
            &self.config.destination,
            envelopes,
            &self.config.retry,
            |e, attempt| self.observe_transport_error(e, attempt),
        )
        .await
    }

    /// 送信結果を各イベントの結果チャネルへ通知する。(送信済み件数, 失敗件数) を返す。
    fn complete(&self, batch: Batch, outcome: Result<u32, BatchFailure>) -> (usize, usize) {
        let count = batch.envelopes.len();
        self.in_flight.fetch_sub(count, Ordering::SeqCst);
        let labels = [self.name.as_str(), self.config.destination.as_str()];

        match outcome {
            Ok(attempts) => {
                self.metrics
                    .producer_events_sent_total
                    .with_label_values(&labels)
                    .inc_by(count as u64);
                #[allow(clippy::cast_precision_loss)]
                self.metrics
                    .producer_batch_size
                    .with_label_values(&[self.name.as_str()])
                    .observe(count as f64);
                tracing::debug!(
                    producer = %self.name,
                    destination = %self.config.destination,
                    batch_size = count,
                    attempts,
                    waited_ms = u64::try_from(batch.oldest.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "batch delivered"
                );
                for reply in batch.replies {
                    let _ = reply.send(Ok(()));
                }
                (count, 0)
            }
            Err(failure) => {
                self.metrics
                    .producer_events_failed_total
                    .with_label_values(&[
                        self.name.as_str(),
                        self.config.destination.as_str(),
                        failure.reason.as_str(),
                    ])
                    .inc_by(count as u64);
                tracing::error!(
                    producer = %self.name,
                    destination = %self.config.destination,
                    batch_size = count,
                    attempts = failure.attempts,
                    reason = %failure.reason,
                    error = %failure.detail,
                    "batch delivery failed"
                );
                for (envelope, reply) in batch.envelopes.iter().zip(batch.replies) {
                    let _ = reply.send(Err(DeliveryFailure {
                        event_id: envelope.id().to_string(),
                        destination: self.config.destination.clone(),
                        attempts: failure.attempts,
                        reason: failure.reason.clone(),
                        detail: failure.detail.clone(),
                    }));
                }
                (0, count)
            }
        }
    }

    /// バッファを閉じ、以降の submit を拒否する。待機中の submit も Closed で戻る。
    fn close(&self) {
        self.lock_buffer().closed = true;
        self.slots.close();
    }
}

/// ProducerPipelineBuilder はプロデューサーパイプラインの組み立てを行う。
pub struct ProducerPipelineBuilder {
    name: String,
    config: ProducerConfig,
    sender: Arc<dyn TransportSender>,
    metrics: Option<Arc<EventHubMetrics>>,
    diagnostics: Option<Arc<DiagnosticsFilter>>,
}

impl ProducerPipelineBuilder {
    pub fn metrics(mut self, metrics: Arc<EventHubMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<DiagnosticsFilter>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// 設定を検証し、送信ワーカーを起動する。tokio ランタイム上で呼び出すこと。
    pub fn start(self) -> Result<ProducerPipeline, EventHubError> {
        self.config.validate(&self.name)?;
        let diagnostics = match self.diagnostics {
            Some(d) => d,
            None => Arc::new(DiagnosticsFilter::with_defaults()?),
        };
        let shared = Arc::new(Shared {
            slots: Semaphore::new(self.config.buffer_size),
            name: self.name,
            config: self.config,
            sender: self.sender,
            buffer: Mutex::new(Buffer::default()),
            full: Notify::new(),
            in_flight: AtomicUsize::new(0),
            metrics: self.metrics.unwrap_or_default(),
            diagnostics,
        });

        let cancel = CancellationToken::new();
        let workers = (0..shared.config.sending_workers)
            .map(|worker| tokio::spawn(run_worker(shared.clone(), worker, cancel.clone())))
            .collect();

        tracing::info!(
            producer = %shared.name,
            destination = %shared.config.destination,
            workers = shared.config.sending_workers,
            buffer_size = shared.config.buffer_size,
            sending_period_ms = shared.config.sending_period_ms,
            "producer pipeline started"
        );

        Ok(ProducerPipeline {
            shared,
            cancel,
            workers: Mutex::new(workers),
        })
    }
}

/// ProducerPipeline は名前付きプロデューサー 1 つ分の送信パイプライン。
pub struct ProducerPipeline {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ProducerPipeline {
    pub fn builder(
        name: impl Into<String>,
        config: ProducerConfig,
        sender: Arc<dyn TransportSender>,
    ) -> ProducerPipelineBuilder {
        ProducerPipelineBuilder {
            name: name.into(),
            config,
            sender,
            metrics: None,
            diagnostics: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.shared.config
    }

    /// 送信待ちでバッファに残っている件数。
    pub fn queue_depth(&self) -> usize {
        self.shared.lock_buffer().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_buffer().closed
    }

    /// イベントをバッファへ投入する。
    ///
    /// バッファ満杯時は overflow_policy に従い、fail_fast なら即座に Backpressure を返し、
    /// block なら空きができるまで待機する。サイズ超過や空の識別子は InvalidEnvelope。
    pub async fn submit(&self, envelope: EventEnvelope) -> Result<DeliveryHandle, EventHubError> {
        let shared = &self.shared;
        envelope.validate(shared.config.max_message_bytes)?;

        match shared.config.overflow_policy {
            OverflowPolicy::FailFast => match shared.slots.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(TryAcquireError::NoPermits) => {
                    shared
                        .metrics
                        .producer_backpressure_total
                        .with_label_values(&[shared.name.as_str()])
                        .inc();
                    tracing::debug!(producer = %shared.name, event_id = %envelope.id(), "buffer full");
                    return Err(EventHubError::Backpressure {
                        producer: shared.name.clone(),
                        capacity: shared.config.buffer_size,
                    });
                }
                Err(TryAcquireError::Closed) => {
                    return Err(EventHubError::Closed(shared.name.clone()));
                }
            },
            OverflowPolicy::Block => match shared.slots.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(EventHubError::Closed(shared.name.clone())),
            },
        }

        shared.enqueue(envelope)
    }

    /// バッファをドレインしてから送信ワーカーを停止する。
    ///
    /// shutdown_timeout 内に送信できなかったイベントは ShutdownTimeout として
    /// 結果チャネルへ通知し、破棄はしない。2 回目以降の呼び出しは何もしない。
    pub async fn shutdown(&self) -> ShutdownReport {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.config.shutdown_timeout();
        shared.close();
        self.cancel.cancel();

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let mut report = ShutdownReport::default();

        let mut joined = futures::future::join_all(workers);
        if tokio::time::timeout_at(deadline, &mut joined).await.is_err() {
            for handle in &aborts {
                handle.abort();
            }
            joined.await;
            report.abandoned = shared.in_flight.swap(0, Ordering::SeqCst);
            tracing::warn!(
                producer = %shared.name,
                abandoned = report.abandoned,
                "flush workers did not finish within shutdown timeout"
            );
        }

        while let Some(batch) = shared.take_batch() {
            let outcome = if Instant::now() >= deadline {
                Err(BatchFailure {
                    attempts: 0,
                    reason: FailureReason::ShutdownTimeout,
                    detail: "shutdown timeout elapsed before the batch was sent".to_string(),
                })
            } else {
                match tokio::time::timeout_at(deadline, shared.send_batch(&batch.envelopes)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(BatchFailure {
                        attempts: 1,
                        reason: FailureReason::ShutdownTimeout,
                        detail: "shutdown timeout elapsed during the final flush".to_string(),
                    }),
                }
            };
            let (delivered, failed) = shared.complete(batch, outcome);
            report.delivered += delivered;
            report.failed += failed;
        }

        tracing::info!(
            producer = %shared.name,
            delivered = report.delivered,
            failed = report.failed,
            abandoned = report.abandoned,
            "producer pipeline stopped"
        );
        report
    }
}

impl Drop for ProducerPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker(shared: Arc<Shared>, worker: usize, cancel: CancellationToken) {
    let period = shared.config.sending_period();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            () = shared.full.notified() => {}
        }
        // 送信中のバッチはキャンセルされても完了させ、新しいバッチは取り出さない
        while !cancel.is_cancelled() {
            let Some(batch) = shared.take_batch() else {
                break;
            };
            let outcome = shared.send_batch(&batch.envelopes).await;
            shared.complete(batch, outcome);
        }
    }
    tracing::debug!(producer = %shared.name, worker, "flush worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::InMemoryTransport;
    use crate::retry::RetryConfig;
    use crate::transport::MockTransportSender;

    fn config(buffer_size: usize) -> ProducerConfig {
        ProducerConfig::new("orders")
            .with_sending_period(Duration::from_millis(50))
            .with_buffer_size(buffer_size)
            .with_retry(
                RetryConfig::new(3)
                    .with_initial_delay(Duration::from_millis(1))
                    .with_jitter(false),
            )
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    fn envelope(i: usize) -> EventEnvelope {
        EventEnvelope::new(format!("evt-{i}"), format!("payload-{i}").into_bytes())
    }

    #[tokio::test]
    async fn test_submit_and_deliver() {
        let transport = Arc::new(InMemoryTransport::new(1));
        let pipeline = ProducerPipeline::builder("orders", config(10), transport.clone())
            .start()
            .unwrap();

        let handle = pipeline.submit(envelope(1)).await.unwrap();
        assert_eq!(handle.event_id(), "evt-1");
        handle.wait().await.unwrap();

        let batches = transport.sent_batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, "orders");
        assert_eq!(batches[0].1[0].id(), "evt-1");
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_fail_fast_backpressure_when_full() {
        let transport = Arc::new(InMemoryTransport::new(1));
        let pipeline = ProducerPipeline::builder(
            "orders",
            config(3).with_sending_period(Duration::from_secs(60)),
            transport,
        )
        .start()
        .unwrap();

        // 満杯通知でワーカーが起きる前に投入し切る
        let mut handles = Vec::new();
        for i in 0..3 {
            handles.push(pipeline.submit(envelope(i)).await.unwrap());
        }
        let err = pipeline.submit(envelope(3)).await.unwrap_err();
        assert!(matches!(
            err,
            EventHubError::Backpressure { capacity: 3, .. }
        ));
        for handle in handles {
            handle.wait().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_invalid_envelope_rejected() {
        let transport = Arc::new(InMemoryTransport::new(1));
        let pipeline = ProducerPipeline::builder(
            "orders",
            config(10).with_max_message_bytes(16),
            transport,
        )
        .start()
        .unwrap();

        let err = pipeline
            .submit(EventEnvelope::new("evt-big", vec![0u8; 64]))
            .await
            .unwrap_err();
        assert!(matches!(err, EventHubError::InvalidEnvelope(_)));
        assert_eq!(pipeline.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_reported_through_handle() {
        let mut sender = MockTransportSender::new();
        sender
            .expect_send()
            .times(1)
            .returning(|_, _| Err(TransportError::Permanent("malformed payload".to_string())));

        let pipeline = ProducerPipeline::builder("orders", config(10), Arc::new(sender))
            .start()
            .unwrap();
        let handle = pipeline.submit(envelope(1)).await.unwrap();
        let failure = handle.wait().await.unwrap_err();
        assert_eq!(failure.event_id, "evt-1");
        assert_eq!(failure.reason, FailureReason::Permanent);
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_retries() {
        let mut sender = MockTransportSender::new();
        sender
            .expect_send()
            .times(3)
            .returning(|_, _| Err(TransportError::Transient("server busy".to_string())));

        let pipeline = ProducerPipeline::builder("orders", config(10), Arc::new(sender))
            .start()
            .unwrap();
        let handle = pipeline.submit(envelope(1)).await.unwrap();
        let failure = handle.wait().await.unwrap_err();
        assert_eq!(failure.reason, FailureReason::RetriesExhausted);
        assert_eq!(failure.attempts, 3);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffer_and_rejects_new_submissions() {
        let transport = Arc::new(InMemoryTransport::new(1));
        let pipeline = ProducerPipeline::builder(
            "orders",
            config(100).with_sending_period(Duration::from_secs(60)),
            transport.clone(),
        )
        .start()
        .unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            handles.push(pipeline.submit(envelope(i)).await.unwrap());
        }
        let report = pipeline.shutdown().await;
        assert_eq!(report.delivered, 5);
        assert!(report.is_clean());
        for handle in handles {
            handle.wait().await.unwrap();
        }

        let err = pipeline.submit(envelope(9)).await.unwrap_err();
        assert!(matches!(err, EventHubError::Closed(_)));
        assert!(pipeline.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_start() {
        let transport = Arc::new(InMemoryTransport::new(1));
        let result = ProducerPipeline::builder(
            "orders",
            ProducerConfig::new("orders").with_buffer_size(0),
            transport,
        )
        .start();
        assert!(matches!(result, Err(EventHubError::Configuration(_))));
    }
}
