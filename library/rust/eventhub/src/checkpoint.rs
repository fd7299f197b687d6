//! チェックポイントストア。
//!
//! (送信先, グループ, パーティション) ごとの処理済みオフセットを永続化する。
//! 保存済みより古いオフセットの書き込みは無視する。

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::{CheckpointBackend, CheckpointStoreConfig};
use crate::error::EventHubError;

/// CheckpointKey は (送信先, コンシューマーグループ, パーティション) の組。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub destination: String,
    pub group: String,
    pub partition: u32,
}

impl CheckpointKey {
    pub fn new(destination: impl Into<String>, group: impl Into<String>, partition: u32) -> Self {
        Self {
            destination: destination.into(),
            group: group.into(),
            partition,
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.destination, self.group, self.partition)
    }
}

/// CheckpointRecord は永続化されたチェックポイント 1 行。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub key: CheckpointKey,
    /// 最後に処理済みとなったオフセット
    pub offset: u64,
    pub updated_at: DateTime<Utc>,
}

/// CheckpointWrite は書き込み要求の結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointWrite {
    Written,
    /// 保存済みオフセット以下のため無視した（リバランス中の競合を含む）
    Ignored { stored: u64 },
}

/// CheckpointStore はパーティションカーソルの永続化インターフェース。
/// 単一ライターを前提とし、オフセットを巻き戻す書き込みは無視する。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 保存済みオフセットを返す。未保存なら None。
    async fn read(&self, key: &CheckpointKey) -> Result<Option<u64>, EventHubError>;

    /// オフセットを保存する。保存済み以下の値は書き込まない。
    async fn write(&self, key: &CheckpointKey, offset: u64)
        -> Result<CheckpointWrite, EventHubError>;

    /// 送信先・グループに属する全レコードを一覧する。
    async fn list(&self, destination: &str, group: &str)
        -> Result<Vec<CheckpointRecord>, EventHubError>;
}

/// 単調性チェック付きでマップを更新する。
fn apply_monotonic(
    records: &mut BTreeMap<CheckpointKey, CheckpointRecord>,
    key: &CheckpointKey,
    offset: u64,
) -> CheckpointWrite {
    if let Some(existing) = records.get(key) {
        if offset <= existing.offset {
            return CheckpointWrite::Ignored {
                stored: existing.offset,
            };
        }
    }
    records.insert(
        key.clone(),
        CheckpointRecord {
            key: key.clone(),
            offset,
            updated_at: Utc::now(),
        },
    );
    CheckpointWrite::Written
}

fn list_matching(
    records: &BTreeMap<CheckpointKey, CheckpointRecord>,
    destination: &str,
    group: &str,
) -> Vec<CheckpointRecord> {
    records
        .values()
        .filter(|r| r.key.destination == destination && r.key.group == group)
        .cloned()
        .collect()
}

/// InMemoryCheckpointStore はプロセス内のチェックポイントストア。
/// Clone したインスタンス同士は同じ状態を共有する。
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    records: Arc<RwLock<BTreeMap<CheckpointKey, CheckpointRecord>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn read(&self, key: &CheckpointKey) -> Result<Option<u64>, EventHubError> {
        let records = self.records.read().await;
        Ok(records.get(key).map(|r| r.offset))
    }

    async fn write(
        &self,
        key: &CheckpointKey,
        offset: u64,
    ) -> Result<CheckpointWrite, EventHubError> {
        let mut records = self.records.write().await;
        Ok(apply_monotonic(&mut records, key, offset))
    }

    async fn list(
        &self,
        destination: &str,
        group: &str,
    ) -> Result<Vec<CheckpointRecord>, EventHubError> {
        let records = self.records.read().await;
        Ok(list_matching(&records, destination, group))
    }
}

/// FileCheckpointStore は JSON ファイルにチェックポイントを保存する。
/// 書き込みは同一ディレクトリの一時ファイル経由でアトミックに置き換える。
pub struct FileCheckpointStore {
    path: PathBuf,
    records: Mutex<BTreeMap<CheckpointKey, CheckpointRecord>>,
}

impl FileCheckpointStore {
    /// ファイルを開く。存在しなければ空のストアとして扱う。
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, EventHubError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                let list: Vec<CheckpointRecord> = serde_json::from_slice(&bytes)?;
                list.into_iter().map(|r| (r.key.clone(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(
        &self,
        records: &BTreeMap<CheckpointKey, CheckpointRecord>,
    ) -> Result<(), EventHubError> {
        let list: Vec<&CheckpointRecord> = records.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| EventHubError::CheckpointWrite(e.to_string()))?
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), EventHubError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| EventHubError::CheckpointWrite(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn read(&self, key: &CheckpointKey) -> Result<Option<u64>, EventHubError> {
        let records = self.records.lock().await;
        Ok(records.get(key).map(|r| r.offset))
    }

    async fn write(
        &self,
        key: &CheckpointKey,
        offset: u64,
    ) -> Result<CheckpointWrite, EventHubError> {
        let mut records = self.records.lock().await;
        let mut next = records.clone();
        let outcome = apply_monotonic(&mut next, key, offset);
        if outcome == CheckpointWrite::Written {
            self.persist(&next).await?;
            *records = next;
        }
        Ok(outcome)
    }

    async fn list(
        &self,
        destination: &str,
        group: &str,
    ) -> Result<Vec<CheckpointRecord>, EventHubError> {
        let records = self.records.lock().await;
        Ok(list_matching(&records, destination, group))
    }
}

/// 設定に従ってチェックポイントストアを生成する。
pub async fn open_checkpoint_store(
    config: &CheckpointStoreConfig,
) -> Result<Arc<dyn CheckpointStore>, EventHubError> {
    config.validate()?;
    let location = config.location.clone().unwrap_or_default();
    match config.backend {
        CheckpointBackend::Memory => Ok(Arc::new(InMemoryCheckpointStore::new())),
        CheckpointBackend::File => Ok(Arc::new(FileCheckpointStore::open(location).await?)),
        #[cfg(feature = "postgres")]
        CheckpointBackend::Postgres => {
            let pool = sqlx::PgPool::connect(&location)
                .await
                .map_err(|e| EventHubError::Configuration(e.to_string()))?;
            Ok(Arc::new(crate::postgres_store::PostgresCheckpointStore::new(pool)))
        }
        #[cfg(not(feature = "postgres"))]
        CheckpointBackend::Postgres => Err(EventHubError::Configuration(
            "postgres checkpoint backend requires the 'postgres' feature".to_string(),
        )),
    }
}
