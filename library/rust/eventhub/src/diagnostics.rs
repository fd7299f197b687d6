//! トランスポート診断フィルタ。
//!
//! パーティション所有権の移譲（エポック上昇によるレシーバー切断）と、その直後に続く
//! リンク切断通知だけを想定内のノイズとして分類する。列挙したパターンと最低重大度の
//! 両方に一致したものだけが対象で、ログカテゴリ単位の抑止は行わない。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EventHubError, TransportError};

/// 既定のハンドオフ相関ウィンドウ。
pub const DEFAULT_HANDOFF_WINDOW: Duration = Duration::from_secs(30);

const RECEIVER_DISPLACED_PATTERN: &str = r"(?i)(new receiver .* with higher epoch|receiver displaced by a receiver with higher epoch|receiverdisconnectedexception|is getting disconnected|amqp:link:stolen)";

const LINK_DROPPED_PATTERN: &str =
    r"(?i)(link (was )?(closed|detached|dropped)|amqp:link:detach-forced|force detached)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// SignalKind は許可リストの規則が表す既知の事象。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// エポック上昇によるレシーバー切断（所有権の移譲）
    ReceiverDisplaced,
    /// リンク切断通知。直近にハンドオフがあった場合のみ想定内とみなす
    LinkDropped,
}

/// BenignRule は想定内ノイズの許可リスト 1 件（メッセージパターン + 最低重大度）。
#[derive(Debug, Clone)]
pub struct BenignRule {
    name: String,
    kind: SignalKind,
    pattern: Regex,
    min_severity: Severity,
}

impl BenignRule {
    pub fn new(
        name: impl Into<String>,
        kind: SignalKind,
        pattern: &str,
        min_severity: Severity,
    ) -> Result<Self, EventHubError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| EventHubError::Configuration(format!("invalid benign pattern: {e}")))?;
        Ok(Self {
            name: name.into(),
            kind,
            pattern,
            min_severity,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, message: &str) -> bool {
        self.pattern.is_match(message)
    }
}

/// Verdict は分類結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// 想定内の一時的事象。エラーレベルへのエスカレーションを抑止する
    BenignTransient { rule: String },
    /// 通常どおり扱うべき事象
    Actionable,
}

impl Verdict {
    pub fn is_benign(&self) -> bool {
        matches!(self, Verdict::BenignTransient { .. })
    }
}

/// DiagnosticsFilter はトランスポートのログ・エラー信号を分類する。
///
/// ハンドオフの相関は信号の発生元（`producer:<name>`、`consumer:<name>:<partition>`）
/// ごとに独立して追跡する。あるパーティションの所有権移譲が、別のパイプラインや
/// パーティションのリンク切断を想定内にすることはない。
///
/// リンク切断が想定内になるのは、同じ発生元でレシーバー切断を観測した後の
/// ウィンドウ内だけである。切断通知より先に出たリンク切断は、その時点では
/// ハンドオフと判別できないため元の重大度のまま報告する。
pub struct DiagnosticsFilter {
    rules: Vec<BenignRule>,
    handoff_window: Duration,
    last_handoff: Mutex<HashMap<String, Instant>>,
}

impl DiagnosticsFilter {
    pub fn new(rules: Vec<BenignRule>, handoff_window: Duration) -> Self {
        Self {
            rules,
            handoff_window,
            last_handoff: Mutex::new(HashMap::new()),
        }
    }

    /// 組み込みの規則（レシーバー切断 + ハンドオフ直後のリンク切断）で生成する。
    pub fn with_defaults() -> Result<Self, EventHubError> {
        Ok(Self::new(default_rules()?, DEFAULT_HANDOFF_WINDOW))
    }

    pub fn with_handoff_window(mut self, window: Duration) -> Self {
        self.handoff_window = window;
        self
    }

    pub fn rules(&self) -> &[BenignRule] {
        &self.rules
    }

    /// 現在時刻で分類する。
    pub fn classify(&self, source: &str, severity: Severity, message: &str) -> Verdict {
        self.classify_at(source, severity, message, Instant::now())
    }

    /// 指定時刻で分類する。
    /// レシーバー切断に一致したメッセージは重大度に関わらず発生元のハンドオフ時刻を記録する。
    pub fn classify_at(
        &self,
        source: &str,
        severity: Severity,
        message: &str,
        now: Instant,
    ) -> Verdict {
        let mut verdict = Verdict::Actionable;
        for rule in &self.rules {
            if !rule.matches(message) {
                continue;
            }
            let applies = match rule.kind {
                SignalKind::ReceiverDisplaced => {
                    self.record_handoff(source, now);
                    true
                }
                SignalKind::LinkDropped => self.within_handoff_window(source, now),
            };
            if applies && severity >= rule.min_severity && !verdict.is_benign() {
                verdict = Verdict::BenignTransient {
                    rule: rule.name.clone(),
                };
            }
        }
        verdict
    }

    fn record_handoff(&self, source: &str, now: Instant) {
        let mut last = self
            .last_handoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // 期限切れの発生元は記録のたびに掃除する
        let window = self.handoff_window;
        last.retain(|_, t| now.saturating_duration_since(*t) <= window);
        last.insert(source.to_string(), now);
    }

    fn within_handoff_window(&self, source: &str, now: Instant) -> bool {
        let last = self
            .last_handoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        last.get(source)
            .is_some_and(|t| now.saturating_duration_since(*t) <= self.handoff_window)
    }

    /// 分類結果に従って tracing にイベントを出力する。
    /// 想定内の事象は DEBUG に降格し、それ以外は元の重大度のまま出力する。
    pub fn report(&self, source: &str, severity: Severity, message: &str) -> Verdict {
        let verdict = self.classify(source, severity, message);
        match &verdict {
            Verdict::BenignTransient { rule } => {
                tracing::debug!(
                    source = %source,
                    original_severity = %severity,
                    rule = %rule,
                    benign = true,
                    "{}", message
                );
            }
            Verdict::Actionable => match severity {
                Severity::Error => tracing::error!(source = %source, "{}", message),
                Severity::Warn => tracing::warn!(source = %source, "{}", message),
                Severity::Info => tracing::info!(source = %source, "{}", message),
                Severity::Debug => tracing::debug!(source = %source, "{}", message),
                Severity::Trace => tracing::trace!(source = %source, "{}", message),
            },
        }
        verdict
    }

    /// トランスポートエラーを重大度付きで報告する。
    pub fn report_transport_error(&self, source: &str, error: &TransportError) -> Verdict {
        self.report(source, transport_error_severity(error), &error.to_string())
    }
}

/// トランスポートエラーの既定の重大度。
pub fn transport_error_severity(error: &TransportError) -> Severity {
    match error {
        TransportError::Transient(_) | TransportError::Closed(_) => Severity::Warn,
        TransportError::Permanent(_) | TransportError::OwnershipLost { .. } => Severity::Error,
    }
}

/// 組み込みの許可リスト。
pub fn default_rules() -> Result<Vec<BenignRule>, EventHubError> {
    Ok(vec![
        BenignRule::new(
            "receiver-epoch-displacement",
            SignalKind::ReceiverDisplaced,
            RECEIVER_DISPLACED_PATTERN,
            Severity::Warn,
        )?,
        BenignRule::new(
            "link-drop-during-handoff",
            SignalKind::LinkDropped,
            LINK_DROPPED_PATTERN,
            Severity::Warn,
        )?,
    ])
}
