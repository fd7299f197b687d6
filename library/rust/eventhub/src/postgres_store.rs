//! PostgresCheckpointStore: sqlx を使用した CheckpointStore 実装。
//! feature = "postgres" で有効化される。
//!
//! 想定スキーマ:
//!
//! ```sql
//! CREATE TABLE eventhub.checkpoints (
//!     destination    TEXT        NOT NULL,
//!     consumer_group TEXT        NOT NULL,
//!     partition_id   BIGINT      NOT NULL,
//!     "offset"       BIGINT      NOT NULL,
//!     updated_at     TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (destination, consumer_group, partition_id)
//! );
//! ```

use async_trait::async_trait;
use sqlx::PgPool;

use crate::checkpoint::{CheckpointKey, CheckpointRecord, CheckpointStore, CheckpointWrite};
use crate::error::EventHubError;

/// PostgresCheckpointStore は PostgreSQL を使ったチェックポイントストア実装。
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_db_offset(offset: u64) -> Result<i64, EventHubError> {
    i64::try_from(offset)
        .map_err(|_| EventHubError::CheckpointWrite(format!("offset {offset} out of range")))
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn read(&self, key: &CheckpointKey) -> Result<Option<u64>, EventHubError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"SELECT "offset" FROM eventhub.checkpoints
               WHERE destination = $1 AND consumer_group = $2 AND partition_id = $3"#,
        )
        .bind(&key.destination)
        .bind(&key.group)
        .bind(i64::from(key.partition))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EventHubError::CheckpointRead(e.to_string()))?;

        Ok(row.and_then(|(offset,)| u64::try_from(offset).ok()))
    }

    async fn write(
        &self,
        key: &CheckpointKey,
        offset: u64,
    ) -> Result<CheckpointWrite, EventHubError> {
        // 保存済みより新しいオフセットのときだけ更新する
        let result = sqlx::query(
            r#"INSERT INTO eventhub.checkpoints
               (destination, consumer_group, partition_id, "offset", updated_at)
               VALUES ($1, $2, $3, $4, NOW())
               ON CONFLICT (destination, consumer_group, partition_id)
               DO UPDATE SET "offset" = EXCLUDED."offset", updated_at = EXCLUDED.updated_at
               WHERE eventhub.checkpoints."offset" < EXCLUDED."offset""#,
        )
        .bind(&key.destination)
        .bind(&key.group)
        .bind(i64::from(key.partition))
        .bind(to_db_offset(offset)?)
        .execute(&self.pool)
        .await
        .map_err(|e| EventHubError::CheckpointWrite(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(CheckpointWrite::Written);
        }
        let stored = self.read(key).await?.unwrap_or(offset);
        Ok(CheckpointWrite::Ignored { stored })
    }

    async fn list(
        &self,
        destination: &str,
        group: &str,
    ) -> Result<Vec<CheckpointRecord>, EventHubError> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            r#"SELECT destination, consumer_group, partition_id, "offset", updated_at
               FROM eventhub.checkpoints
               WHERE destination = $1 AND consumer_group = $2
               ORDER BY partition_id ASC"#,
        )
        .bind(destination)
        .bind(group)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EventHubError::CheckpointRead(e.to_string()))?;

        Ok(rows.into_iter().filter_map(CheckpointRow::into_record).collect())
    }
}

/// DB行と CheckpointRecord の変換用中間構造体。
#[derive(sqlx::FromRow)]
struct CheckpointRow {
    destination: String,
    consumer_group: String,
    partition_id: i64,
    offset: i64,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl CheckpointRow {
    fn into_record(self) -> Option<CheckpointRecord> {
        Some(CheckpointRecord {
            key: CheckpointKey::new(
                self.destination,
                self.consumer_group,
                u32::try_from(self.partition_id).ok()?,
            ),
            offset: u64::try_from(self.offset).ok()?,
            updated_at: self.updated_at,
        })
    }
}
