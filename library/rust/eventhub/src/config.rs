//! YAML 設定とパイプラインごとの設定値。

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EventHubError;
use crate::retry::RetryConfig;
use crate::transport::EventPosition;

/// OverflowPolicy はバッファ満杯時の submit の振る舞い。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// 即座に Backpressure を返す
    #[default]
    FailFast,
    /// フラッシュで空きができるまで待機する
    Block,
}

/// HandlerFailurePolicy はハンドラー失敗時のパーティション処理方針。
/// 既定値は持たず、設定で明示しなければならない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerFailurePolicy {
    /// 失敗したイベントでパーティションの処理を停止し、オフセットを進めない
    Halt,
    /// 失敗をログに残してオフセットを進め、処理を継続する
    SkipAndLog,
}

/// InitialPosition はチェックポイントが存在しない場合の開始位置。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPosition {
    #[default]
    Earliest,
    Latest,
}

impl From<InitialPosition> for EventPosition {
    fn from(p: InitialPosition) -> Self {
        match p {
            InitialPosition::Earliest => EventPosition::Earliest,
            InitialPosition::Latest => EventPosition::Latest,
        }
    }
}

/// ProducerConfig は名前付きプロデューサー 1 つ分の設定。
/// プロセス起動時に静的設定から生成され、実行中は変更しない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// 送信先（パーティション分割されたストリーム名）
    pub destination: String,
    /// バッチのフラッシュ間隔（ミリ秒）
    #[serde(default = "default_sending_period_ms")]
    pub sending_period_ms: u64,
    /// 並列送信ワーカー数
    #[serde(default = "default_sending_workers")]
    pub sending_workers: usize,
    /// バッファ容量（この数を超えるとバックプレッシャー）
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// 1 バッチの最大件数。未指定ならバッファ容量
    #[serde(default)]
    pub max_batch_size: Option<usize>,
    /// 1 イベントの最大サイズ（バイト）
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    /// シャットダウン時のドレイン猶予（ミリ秒）
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_sending_period_ms() -> u64 {
    1000
}

fn default_sending_workers() -> usize {
    1
}

fn default_buffer_size() -> usize {
    1000
}

fn default_max_message_bytes() -> usize {
    1_000_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl ProducerConfig {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            sending_period_ms: default_sending_period_ms(),
            sending_workers: default_sending_workers(),
            buffer_size: default_buffer_size(),
            overflow_policy: OverflowPolicy::default(),
            max_batch_size: None,
            max_message_bytes: default_max_message_bytes(),
            retry: RetryConfig::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }

    pub fn with_sending_period(mut self, period: Duration) -> Self {
        self.sending_period_ms = duration_ms(period);
        self
    }

    pub fn with_sending_workers(mut self, workers: usize) -> Self {
        self.sending_workers = workers;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn sending_period(&self) -> Duration {
        Duration::from_millis(self.sending_period_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// 実効バッチサイズ（バッファ容量を上限とする）。
    pub fn batch_size(&self) -> usize {
        self.max_batch_size
            .unwrap_or(self.buffer_size)
            .clamp(1, self.buffer_size.max(1))
    }

    pub fn validate(&self, name: &str) -> Result<(), EventHubError> {
        if self.destination.trim().is_empty() {
            return Err(EventHubError::Configuration(format!(
                "producer '{name}': destination is required"
            )));
        }
        if self.sending_period_ms == 0 {
            return Err(EventHubError::Configuration(format!(
                "producer '{name}': sending_period_ms must be > 0"
            )));
        }
        if self.sending_workers == 0 {
            return Err(EventHubError::Configuration(format!(
                "producer '{name}': sending_workers must be > 0"
            )));
        }
        if self.buffer_size == 0 {
            return Err(EventHubError::Configuration(format!(
                "producer '{name}': buffer_size must be > 0"
            )));
        }
        if self.max_batch_size == Some(0) {
            return Err(EventHubError::Configuration(format!(
                "producer '{name}': max_batch_size must be > 0"
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(EventHubError::Configuration(format!(
                "producer '{name}': retry.max_attempts must be > 0"
            )));
        }
        Ok(())
    }
}

/// ConsumerConfig は名前付きコンシューマー 1 つ分の設定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub destination: String,
    /// コンシューマーグループ名
    pub group: String,
    /// チェックポイント書き込み間隔（ミリ秒）
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    #[serde(default)]
    pub initial_position: InitialPosition,
    pub handler_failure_policy: HandlerFailurePolicy,
    /// シャットダウン時に処理中レコードの完了を待つ猶予（ミリ秒）
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// 受信エラー後に再受信するまでの待機（ミリ秒）
    #[serde(default = "default_receive_retry_delay_ms")]
    pub receive_retry_delay_ms: u64,
}

fn default_checkpoint_interval_ms() -> u64 {
    10_000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_receive_retry_delay_ms() -> u64 {
    500
}

impl ConsumerConfig {
    pub fn new(
        destination: impl Into<String>,
        group: impl Into<String>,
        handler_failure_policy: HandlerFailurePolicy,
    ) -> Self {
        Self {
            destination: destination.into(),
            group: group.into(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            initial_position: InitialPosition::default(),
            handler_failure_policy,
            shutdown_grace_ms: default_shutdown_grace_ms(),
            receive_retry_delay_ms: default_receive_retry_delay_ms(),
        }
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_initial_position(mut self, position: InitialPosition) -> Self {
        self.initial_position = position;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = duration_ms(grace);
        self
    }

    pub fn with_receive_retry_delay(mut self, delay: Duration) -> Self {
        self.receive_retry_delay_ms = duration_ms(delay);
        self
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn receive_retry_delay(&self) -> Duration {
        Duration::from_millis(self.receive_retry_delay_ms)
    }

    pub fn validate(&self, name: &str) -> Result<(), EventHubError> {
        if self.destination.trim().is_empty() {
            return Err(EventHubError::Configuration(format!(
                "consumer '{name}': destination is required"
            )));
        }
        if self.group.trim().is_empty() {
            return Err(EventHubError::Configuration(format!(
                "consumer '{name}': group is required"
            )));
        }
        if self.checkpoint_interval_ms == 0 {
            return Err(EventHubError::Configuration(format!(
                "consumer '{name}': checkpoint_interval_ms must be > 0"
            )));
        }
        Ok(())
    }
}

/// TransportConfig はトランスポート接続パラメータ。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// 接続先エンドポイント（例: "sb://orders-ns.servicebus.windows.net"）
    pub endpoint: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), EventHubError> {
        if self.endpoint.trim().is_empty() {
            return Err(EventHubError::Configuration(
                "transport.endpoint is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// CheckpointBackend はチェックポイントの永続化先。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    #[default]
    Memory,
    File,
    Postgres,
}

/// CheckpointStoreConfig はチェックポイントストアの保存場所。
/// file の場合は JSON ファイルのパス、postgres の場合は接続 URL を location に指定する。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStoreConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,
    #[serde(default)]
    pub location: Option<String>,
}

impl CheckpointStoreConfig {
    pub fn validate(&self) -> Result<(), EventHubError> {
        match self.backend {
            CheckpointBackend::Memory => Ok(()),
            CheckpointBackend::File | CheckpointBackend::Postgres => {
                match self.location.as_deref() {
                    Some(l) if !l.trim().is_empty() => Ok(()),
                    _ => Err(EventHubError::Configuration(
                        "checkpoint_store.location is required for file/postgres backends"
                            .to_string(),
                    )),
                }
            }
        }
    }
}

/// EventHubConfig はイベントストリーミング層全体の設定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHubConfig {
    pub transport: TransportConfig,
    #[serde(default)]
    pub checkpoint_store: CheckpointStoreConfig,
    #[serde(default)]
    pub producers: BTreeMap<String, ProducerConfig>,
    #[serde(default)]
    pub consumers: BTreeMap<String, ConsumerConfig>,
}

impl EventHubConfig {
    /// YAML ファイルを読み込み、検証済みの設定を返す。
    pub fn load(path: &str) -> Result<Self, EventHubError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EventHubError::Configuration(format!("failed to read {path}: {e}"))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, EventHubError> {
        let config: EventHubConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// 設定値のバリデーション。失敗した場合は起動を継続してはならない。
    pub fn validate(&self) -> Result<(), EventHubError> {
        self.transport.validate()?;
        self.checkpoint_store.validate()?;
        for (name, producer) in &self.producers {
            producer.validate(name)?;
        }
        for (name, consumer) in &self.consumers {
            consumer.validate(name)?;
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
