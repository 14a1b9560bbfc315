use crate::constants::DB_PRAGMAS;
use crate::crypto::MessageCipher;
use crate::store::{encrypt_turn, EncryptedRecord, HistorySource, TurnArchive};
use crate::types::{ConversationId, ParleyError, Result, Turn};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P, retention_days: i64) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(ParleyError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(ParleyError::Database(e).into()),
    };

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(ParleyError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    verify_schema_version(&pool).await;

    if let Err(e) = cleanup_old_data(&pool, retention_days).await {
        tracing::warn!("Database cleanup failed: {}", e);
    }

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(ParleyError::Database(e).into());
        }
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// Deletes persisted turns older than the retention window.
pub async fn cleanup_old_data(
    pool: &DbPool,
    retention_days: i64,
) -> std::result::Result<u64, sqlx::Error> {
    let threshold = format!("-{} days", retention_days);

    let deleted = sqlx::query("DELETE FROM turns WHERE created_at < datetime('now', ?)")
        .bind(&threshold)
        .execute(pool)
        .await?;

    if deleted.rows_affected() > 0 {
        tracing::info!(
            "Cleanup complete: removed {} turns older than {} days.",
            deleted.rows_affected(),
            retention_days
        );
    }

    Ok(deleted.rows_affected())
}

pub async fn insert_record(
    pool: &DbPool,
    conversation_id: &ConversationId,
    record: &EncryptedRecord,
    provider: &str,
    status: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO turns \
         (id, conversation_id, sequence, provider, encrypted_prompt, encrypted_answer, provider_metadata, status) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&conversation_id.0)
    .bind(record.sequence)
    .bind(provider)
    .bind(&record.encrypted_prompt)
    .bind(&record.encrypted_answer)
    .bind(record.provider_metadata.to_string())
    .bind(status)
    .execute(pool)
    .await?;
    Ok(())
}

/// Newest-first page of records with `sequence < before`.
pub async fn fetch_history_page(
    pool: &DbPool,
    conversation_id: &ConversationId,
    before: Option<i64>,
    limit: u32,
) -> Result<Vec<EncryptedRecord>> {
    let rows = sqlx::query(
        "SELECT id, sequence, encrypted_prompt, encrypted_answer, provider_metadata \
         FROM turns WHERE conversation_id = ? AND sequence < ? \
         ORDER BY sequence DESC LIMIT ?",
    )
    .bind(&conversation_id.0)
    .bind(before.unwrap_or(i64::MAX))
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let raw_meta: String = row.try_get("provider_metadata")?;
        let provider_metadata = match serde_json::from_str(&raw_meta) {
            Ok(v) => v,
            Err(_) => serde_json::Value::Null,
        };
        records.push(EncryptedRecord {
            id: row.try_get("id")?,
            encrypted_prompt: row.try_get("encrypted_prompt")?,
            encrypted_answer: row.try_get("encrypted_answer")?,
            sequence: row.try_get("sequence")?,
            provider_metadata,
        });
    }
    Ok(records)
}

/// SQLite-backed history: serves pages and archives finished turns.
#[derive(Clone)]
pub struct SqliteHistory {
    pool: DbPool,
    cipher: Arc<MessageCipher>,
}

impl SqliteHistory {
    pub fn new(pool: DbPool, cipher: Arc<MessageCipher>) -> Self {
        Self { pool, cipher }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl HistorySource for SqliteHistory {
    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        before: Option<i64>,
        limit: u32,
    ) -> Result<Vec<EncryptedRecord>> {
        fetch_history_page(&self.pool, conversation_id, before, limit).await
    }
}

#[async_trait]
impl TurnArchive for SqliteHistory {
    async fn persist_turn(&self, turn: &Turn) -> Result<()> {
        if !turn.status.is_terminal() {
            return Err(ParleyError::InvalidRequest(format!(
                "Turn {} is still {}",
                turn.id.short(),
                turn.status.as_str()
            ))
            .into());
        }
        let record = encrypt_turn(turn, &self.cipher)?;
        insert_record(
            &self.pool,
            &turn.conversation_id,
            &record,
            turn.response_provider.as_str(),
            turn.status.as_str(),
        )
        .await?;
        tracing::debug!(
            "Persisted turn {} (seq {}) for conversation {}",
            turn.id.short(),
            turn.sequence,
            turn.conversation_id.short()
        );
        Ok(())
    }
}
