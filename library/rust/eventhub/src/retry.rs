//! 送信リトライ設定と指数バックオフ付きの再送。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::EventEnvelope;
use crate::error::{FailureReason, TransportError};
use crate::transport::TransportSender;

/// RetryConfig は送信失敗時の指数バックオフ設定を表す。
/// max_attempts は初回送信を含む試行回数の上限。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// attempt 回目（0 始まり）の失敗後に待機する時間を計算する。
    /// ジッター有効時は ±10% の揺らぎを加える。
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);
        let delay_ms = if self.jitter {
            let jitter_range = capped * 0.1;
            capped - jitter_range + (rand::random::<f64>() * jitter_range * 2.0)
        } else {
            capped
        };
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// BatchFailure はバッチ送信が最終的に失敗したことを表す。
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BatchFailure {
    pub attempts: u32,
    pub reason: FailureReason,
    pub detail: String,
}

/// バッチを送信し、一時エラーのみ指数バックオフでリトライする。
/// 恒久エラーは即座に失敗とする。成功時は要した試行回数を返す。
pub(crate) async fn send_with_retry<F>(
    sender: &dyn TransportSender,
    destination: &str,
    batch: &[EventEnvelope],
    config: &RetryConfig,
    mut on_error: F,
) -> Result<u32, BatchFailure>
where
    F: FnMut(&TransportError, u32),
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match sender.send(destination, batch).await {
            Ok(()) => return Ok(attempt),
            Err(e) => {
                on_error(&e, attempt);
                if !e.is_transient() {
                    return Err(BatchFailure {
                        attempts: attempt,
                        reason: FailureReason::Permanent,
                        detail: e.to_string(),
                    });
                }
                if attempt >= max_attempts {
                    return Err(BatchFailure {
                        attempts: attempt,
                        reason: FailureReason::RetriesExhausted,
                        detail: e.to_string(),
                    });
                }
                tracing::debug!(
                    destination = %destination,
                    attempt,
                    max_attempts,
                    "retrying send after transient error"
                );
                tokio::time::sleep(config.compute_delay(attempt - 1)).await;
            }
        }
    }
}
