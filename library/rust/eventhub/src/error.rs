use std::fmt;

/// TransportError はトランスポートの送受信プリミティブが返すエラーを表す。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// 一時的な障害（リトライ対象）
    #[error("transient transport error: {0}")]
    Transient(String),

    /// 恒久的な障害（リトライしない）
    #[error("permanent transport error: {0}")]
    Permanent(String),

    /// より新しいエポックのレシーバーによってパーティション所有権を奪われた
    #[error("receiver displaced by a receiver with higher epoch {epoch}")]
    OwnershipLost { epoch: u64 },

    /// トランスポート側でストリームが閉じられた
    #[error("transport closed: {0}")]
    Closed(String),
}

impl TransportError {
    /// リトライで回復しうるエラーかどうか判定する。
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// FailureReason は配信失敗の原因を表す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// リトライ上限まで一時エラーが続いた
    RetriesExhausted,
    /// リトライ不可能なエラー
    Permanent,
    /// シャットダウンタイムアウトまでに送信できなかった
    ShutdownTimeout,
    /// 送信中のワーカーが中断された
    Abandoned,
}

impl FailureReason {
    /// メトリクスのラベル値。
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::Permanent => "permanent",
            FailureReason::ShutdownTimeout => "shutdown_timeout",
            FailureReason::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::RetriesExhausted => "retries exhausted",
            FailureReason::Permanent => "permanent error",
            FailureReason::ShutdownTimeout => "shutdown timeout elapsed",
            FailureReason::Abandoned => "abandoned in flight",
        };
        f.write_str(s)
    }
}

/// DeliveryFailure は送信済みとならなかったイベントの結果を表す。
/// 結果チャネル経由で submit の呼び出し元に通知される。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("delivery of event {event_id} to {destination} failed after {attempts} attempt(s): {reason}: {detail}")]
pub struct DeliveryFailure {
    pub event_id: String,
    pub destination: String,
    pub attempts: u32,
    pub reason: FailureReason,
    pub detail: String,
}

/// EventHubError はイベントストリーミング層のエラーを表す。
#[derive(Debug, thiserror::Error)]
pub enum EventHubError {
    /// バッファが満杯（呼び出し元でリトライまたは流量調整が必要）
    #[error("producer '{producer}' buffer is full (capacity {capacity})")]
    Backpressure { producer: String, capacity: usize },

    #[error("transient transport error: {0}")]
    TransientTransport(String),

    #[error(transparent)]
    PermanentDelivery(#[from] DeliveryFailure),

    /// 所有権の喪失はライフサイクル上の想定内イベント
    #[error("ownership of partition {partition} revoked")]
    OwnershipRevoked { partition: u32 },

    #[error("checkpoint write failed: {0}")]
    CheckpointWrite(String),

    /// 読み取り失敗。コンシューマーは待機して再試行する
    #[error("checkpoint read failed: {0}")]
    CheckpointRead(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("unknown producer: {0}")]
    UnknownProducer(String),

    #[error("unknown consumer: {0}")]
    UnknownConsumer(String),

    #[error("pipeline '{0}' is shut down")]
    Closed(String),

    #[error("handler failed on partition {partition} at offset {offset}: {reason}")]
    HandlerFailed {
        partition: u32,
        offset: u64,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventHubError {
    fn from(e: serde_json::Error) -> Self {
        EventHubError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for EventHubError {
    fn from(e: serde_yaml::Error) -> Self {
        EventHubError::Configuration(e.to_string())
    }
}
