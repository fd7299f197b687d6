//! イベントエンベロープ。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EventHubError;

/// EventEnvelope はシステム内を流れるイベントの単位。
/// 識別子は呼び出し側が採番する（冪等性・トレース用途）。
/// submit 後は変更されないため、フィールドは読み取り専用アクセサで公開する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    id: String,
    payload: Vec<u8>,
    partition_key: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// 任意のバイト列ペイロードで EventEnvelope を生成する。
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            partition_key: None,
            attributes: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// JSON ペイロードで EventEnvelope を生成する。
    pub fn json<T: Serialize>(id: impl Into<String>, payload: &T) -> Result<Self, EventHubError> {
        Ok(Self::new(id, serde_json::to_vec(payload)?))
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// ペイロードを JSON としてデシリアライズする。
    pub fn deserialize_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// ペイロードと属性を合わせたおおよそのサイズ（バイト）。
    pub fn encoded_len(&self) -> usize {
        self.payload.len()
            + self.id.len()
            + self.partition_key.as_ref().map_or(0, String::len)
            + self
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    /// 送信前の検証。空の識別子とサイズ超過は恒久的エラーとして扱う。
    pub(crate) fn validate(&self, max_message_bytes: usize) -> Result<(), EventHubError> {
        if self.id.trim().is_empty() {
            return Err(EventHubError::InvalidEnvelope(
                "event id must not be empty".to_string(),
            ));
        }
        let len = self.encoded_len();
        if len > max_message_bytes {
            return Err(EventHubError::InvalidEnvelope(format!(
                "event {} is {} bytes, exceeds limit of {} bytes",
                self.id, len, max_message_bytes
            )));
        }
        Ok(())
    }
}

/// ReceivedEvent はトランスポートから受信したイベントを表す。
/// オフセットはパーティション内で 0 から単調増加する。
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub destination: String,
    pub partition: u32,
    pub offset: u64,
    pub envelope: EventEnvelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_builder() {
        let envelope = EventEnvelope::new("evt-1", b"hello".to_vec())
            .with_partition_key("customer-7")
            .with_attribute("content-type", "text/plain");
        assert_eq!(envelope.id(), "evt-1");
        assert_eq!(envelope.payload(), b"hello");
        assert_eq!(envelope.partition_key(), Some("customer-7"));
        assert_eq!(envelope.attribute("content-type"), Some("text/plain"));
        assert!(envelope.attribute("missing").is_none());
    }

    #[test]
    fn test_envelope_json_payload() {
        let payload = serde_json::json!({"order_id": "ord-001", "amount": 100});
        let envelope = EventEnvelope::json("evt-2", &payload).unwrap();
        let parsed: serde_json::Value = envelope.deserialize_json().unwrap();
        assert_eq!(parsed["order_id"], "ord-001");
    }

    #[test]
    fn test_validate_rejects_empty_id() {
        let envelope = EventEnvelope::new("  ", b"x".to_vec());
        let err = envelope.validate(1024).unwrap_err();
        assert!(matches!(err, EventHubError::InvalidEnvelope(_)));
    }

    #[test]
    fn test_validate_rejects_oversized_payload() {
        let envelope = EventEnvelope::new("evt-3", vec![0u8; 2048]);
        assert!(envelope.validate(1024).is_err());
        assert!(envelope.validate(4096).is_ok());
    }
}
