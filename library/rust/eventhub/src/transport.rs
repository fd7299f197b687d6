//! トランスポートの送受信プリミティブ。
//!
//! 下位の分割ストリーミングサービス（Event Hub 相当）のワイヤプロトコルはこの層の対象外であり、
//! ここでは送信・受信・所有権通知の契約のみを定義する。

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::{EventEnvelope, ReceivedEvent};
use crate::error::TransportError;

/// TransportSender はバッチ送信プリミティブ。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait TransportSender: Send + Sync {
    /// バッチをまとめて送信先へ送る。バッチ内の順序は保持されなければならない。
    async fn send(&self, destination: &str, batch: &[EventEnvelope]) -> Result<(), TransportError>;
}

/// EventPosition はパーティションの読み取り開始位置を表す。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPosition {
    /// 保持されている最古のイベントから
    Earliest,
    /// 読み取り開始時点の末尾から（以降に届いたイベントのみ）
    Latest,
    /// 指定オフセットの直後から
    After(u64),
}

/// OwnershipEvent はパーティション所有権の付与・剥奪通知。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipEvent {
    Granted { partition: u32, epoch: u64 },
    Revoked { partition: u32 },
}

/// PartitionReader は所有中のパーティションからイベントを 1 件ずつ取り出す。
/// 呼び出し側が次を要求するまで取り出さないため、ハンドラーが遅ければ受信も止まる。
#[async_trait]
pub trait PartitionReader: Send {
    /// 次のイベントを待機して返す。ストリームが閉じられた場合は None。
    /// select! で中断されても読み取り位置を進めてはならない。
    async fn next(&mut self) -> Result<Option<ReceivedEvent>, TransportError>;
}

/// TransportReceiver は受信プリミティブ。
#[async_trait]
pub trait TransportReceiver: Send + Sync {
    /// コンシューマーグループとして購読し、所有権通知のチャネルを返す。
    async fn subscribe(
        &self,
        destination: &str,
        group: &str,
    ) -> Result<mpsc::Receiver<OwnershipEvent>, TransportError>;

    /// 付与されたパーティションを指定エポックで開く。
    async fn open(
        &self,
        destination: &str,
        group: &str,
        partition: u32,
        epoch: u64,
        position: EventPosition,
    ) -> Result<Box<dyn PartitionReader>, TransportError>;
}
