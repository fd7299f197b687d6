//! EventHub: 名前付きプロデューサー・コンシューマーをまとめる入口。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::checkpoint::{open_checkpoint_store, CheckpointStore};
use crate::config::EventHubConfig;
use crate::consumer::{ConsumerPipeline, ConsumerShutdownReport};
use crate::diagnostics::DiagnosticsFilter;
use crate::envelope::EventEnvelope;
use crate::error::EventHubError;
use crate::handler::EventHandler;
use crate::metrics::EventHubMetrics;
use crate::producer::{DeliveryHandle, ProducerPipeline, ShutdownReport};
use crate::transport::{TransportReceiver, TransportSender};

/// HubShutdownReport はパイプラインごとの停止結果。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubShutdownReport {
    pub producers: BTreeMap<String, ShutdownReport>,
    pub consumers: BTreeMap<String, ConsumerShutdownReport>,
}

/// EventHubBuilder は設定とトランスポートから EventHub を組み立てる。
pub struct EventHubBuilder {
    config: EventHubConfig,
    sender: Option<Arc<dyn TransportSender>>,
    receiver: Option<Arc<dyn TransportReceiver>>,
    store: Option<Arc<dyn CheckpointStore>>,
    metrics: Option<Arc<EventHubMetrics>>,
    diagnostics: Option<Arc<DiagnosticsFilter>>,
}

impl EventHubBuilder {
    pub fn sender(mut self, sender: Arc<dyn TransportSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn receiver(mut self, receiver: Arc<dyn TransportReceiver>) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// 送受信の両方を実装するトランスポートをまとめて設定する。
    pub fn transport<T>(self, transport: Arc<T>) -> Self
    where
        T: TransportSender + TransportReceiver + 'static,
    {
        self.sender(transport.clone()).receiver(transport)
    }

    /// 指定しない場合は checkpoint_store 設定からストアを開く。
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
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

    /// 設定を検証し、全プロデューサーを起動する。
    /// コンシューマーはハンドラー登録後に EventHub::start_consumer で個別に起動する。
    pub async fn start(self) -> Result<EventHub, EventHubError> {
        self.config.validate()?;
        if !self.config.producers.is_empty() && self.sender.is_none() {
            return Err(EventHubError::Configuration(
                "producers are configured but no transport sender was provided".to_string(),
            ));
        }
        if !self.config.consumers.is_empty() && self.receiver.is_none() {
            return Err(EventHubError::Configuration(
                "consumers are configured but no transport receiver was provided".to_string(),
            ));
        }

        let store = match self.store {
            Some(store) => store,
            None => open_checkpoint_store(&self.config.checkpoint_store).await?,
        };
        let metrics = self.metrics.unwrap_or_default();
        let diagnostics = match self.diagnostics {
            Some(d) => d,
            None => Arc::new(DiagnosticsFilter::with_defaults()?),
        };

        let mut producers = BTreeMap::new();
        if let Some(sender) = &self.sender {
            for (name, config) in &self.config.producers {
                let pipeline = ProducerPipeline::builder(name.clone(), config.clone(), sender.clone())
                    .metrics(metrics.clone())
                    .diagnostics(diagnostics.clone())
                    .start()?;
                producers.insert(name.clone(), pipeline);
            }
        }

        tracing::info!(
            endpoint = %self.config.transport.endpoint,
            producers = producers.len(),
            consumers = self.config.consumers.len(),
            "event hub started"
        );

        Ok(EventHub {
            config: self.config,
            producers,
            consumers: Mutex::new(BTreeMap::new()),
            receiver: self.receiver,
            store,
            metrics,
            diagnostics,
        })
    }
}

/// EventHub は名前付きプロデューサー・コンシューマーを束ねる。
/// 各パイプラインは独立した状態を持ち、グローバルなレジストリは使用しない。
pub struct EventHub {
    config: EventHubConfig,
    producers: BTreeMap<String, ProducerPipeline>,
    /// 起動中の名前は None で予約する
    consumers: Mutex<BTreeMap<String, Option<Arc<ConsumerPipeline>>>>,
    receiver: Option<Arc<dyn TransportReceiver>>,
    store: Arc<dyn CheckpointStore>,
    metrics: Arc<EventHubMetrics>,
    diagnostics: Arc<DiagnosticsFilter>,
}

impl EventHub {
    pub fn builder(config: EventHubConfig) -> EventHubBuilder {
        EventHubBuilder {
            config,
            sender: None,
            receiver: None,
            store: None,
            metrics: None,
            diagnostics: None,
        }
    }

    pub fn config(&self) -> &EventHubConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<EventHubMetrics> {
        &self.metrics
    }

    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn producer(&self, name: &str) -> Option<&ProducerPipeline> {
        self.producers.get(name)
    }

    pub fn consumer(&self, name: &str) -> Option<Arc<ConsumerPipeline>> {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .flatten()
    }

    /// 名前付きプロデューサーへイベントを投入する。
    pub async fn submit(
        &self,
        producer: &str,
        envelope: EventEnvelope,
    ) -> Result<DeliveryHandle, EventHubError> {
        let pipeline = self
            .producers
            .get(producer)
            .ok_or_else(|| EventHubError::UnknownProducer(producer.to_string()))?;
        pipeline.submit(envelope).await
    }

    /// ハンドラーを登録して名前付きコンシューマーを起動する。
    pub async fn start_consumer(
        &self,
        name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Arc<ConsumerPipeline>, EventHubError> {
        let config = self
            .config
            .consumers
            .get(name)
            .cloned()
            .ok_or_else(|| EventHubError::UnknownConsumer(name.to_string()))?;
        let receiver = self.receiver.clone().ok_or_else(|| {
            EventHubError::Configuration("no transport receiver was provided".to_string())
        })?;
        {
            let mut consumers = self
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if consumers.contains_key(name) {
                return Err(EventHubError::Configuration(format!(
                    "consumer '{name}' is already started"
                )));
            }
            consumers.insert(name.to_string(), None);
        }

        let started = ConsumerPipeline::builder(name, config, receiver, self.store.clone())
            .handler(handler)
            .metrics(self.metrics.clone())
            .diagnostics(self.diagnostics.clone())
            .start()
            .await;
        let mut consumers = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match started {
            Ok(pipeline) => {
                let pipeline = Arc::new(pipeline);
                consumers.insert(name.to_string(), Some(pipeline.clone()));
                Ok(pipeline)
            }
            Err(e) => {
                consumers.remove(name);
                Err(e)
            }
        }
    }

    /// 全プロデューサーをドレインし、全コンシューマーを停止する。
    pub async fn shutdown(&self) -> HubShutdownReport {
        let mut report = HubShutdownReport::default();
        for (name, producer) in &self.producers {
            report
                .producers
                .insert(name.clone(), producer.shutdown().await);
        }
        let consumers = std::mem::take(
            &mut *self
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (name, consumer) in consumers {
            let Some(consumer) = consumer else {
                continue;
            };
            report.consumers.insert(name, consumer.shutdown().await);
        }
        report
    }
}
