//! k1s0-eventhub: 分割ストリーミングトランスポート上のイベント送受信層。
//!
//! 名前付きプロデューサーのバッファリング・バッチ送信、コンシューマーグループの
//! パーティション処理とチェックポイント永続化、所有権移譲に伴うトランスポート
//! ノイズの分類を提供する。

pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod diagnostics;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod hub;
pub mod memory;
pub mod metrics;
pub mod partition;
pub mod producer;
pub mod retry;
pub mod telemetry;
pub mod transport;

#[cfg(feature = "postgres")]
pub mod postgres_store;

pub use checkpoint::{
    open_checkpoint_store, CheckpointKey, CheckpointRecord, CheckpointStore, CheckpointWrite,
    FileCheckpointStore, InMemoryCheckpointStore,
};
pub use config::{
    CheckpointBackend, CheckpointStoreConfig, ConsumerConfig, EventHubConfig,
    HandlerFailurePolicy, InitialPosition, OverflowPolicy, ProducerConfig, TransportConfig,
};
pub use consumer::{ConsumerPipeline, ConsumerPipelineBuilder, ConsumerShutdownReport};
pub use diagnostics::{BenignRule, DiagnosticsFilter, Severity, SignalKind, Verdict};
pub use envelope::{EventEnvelope, ReceivedEvent};
pub use error::{DeliveryFailure, EventHubError, FailureReason, TransportError};
pub use handler::{handler_fn, EventHandler, HandlerError};
pub use hub::{EventHub, EventHubBuilder, HubShutdownReport};
pub use memory::InMemoryTransport;
pub use metrics::EventHubMetrics;
pub use partition::{PartitionCursor, PartitionState};
pub use producer::{DeliveryHandle, ProducerPipeline, ProducerPipelineBuilder, ShutdownReport};
pub use retry::RetryConfig;
pub use transport::{
    EventPosition, OwnershipEvent, PartitionReader, TransportReceiver, TransportSender,
};

#[cfg(feature = "postgres")]
pub use postgres_store::PostgresCheckpointStore;

#[cfg(feature = "mock")]
pub use checkpoint::MockCheckpointStore;
#[cfg(feature = "mock")]
pub use handler::MockEventHandler;
#[cfg(feature = "mock")]
pub use transport::MockTransportSender;
