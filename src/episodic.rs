//! SQLite-backed episodic memory.
//!
//! Every question, answer, and ingestion note is appended to the
//! `interactions` table. Rows are never updated or deleted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use reporover_core::capability::{EpisodicMemory, Interaction, InteractionKind};
use reporover_core::error::CapabilityError;

pub struct SqliteEpisodic {
    pool: SqlitePool,
}

impl SqliteEpisodic {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn db_error(e: sqlx::Error) -> CapabilityError {
    match e {
        sqlx::Error::PoolTimedOut => CapabilityError::Transient(format!("episodic memory: {}", e)),
        other => CapabilityError::Fatal(format!("episodic memory: {}", other)),
    }
}

#[async_trait]
impl EpisodicMemory for SqliteEpisodic {
    async fn append(&self, interaction: Interaction) -> Result<(), CapabilityError> {
        let metadata = if interaction.metadata.is_null() {
            "{}".to_string()
        } else {
            interaction.metadata.to_string()
        };
        sqlx::query(
            "INSERT INTO interactions (timestamp, agent, kind, content, metadata_json) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(interaction.timestamp.to_rfc3339())
        .bind(&interaction.agent)
        .bind(interaction.kind.as_str())
        .bind(&interaction.content)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Interaction>, CapabilityError> {
        let rows = sqlx::query(
            "SELECT timestamp, agent, kind, content, metadata_json FROM interactions \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            let kind: String = row.get("kind");
            let Some(kind) = InteractionKind::parse(&kind) else {
                tracing::warn!(kind = %kind, "skipping interaction of unknown kind");
                continue;
            };
            let timestamp: String = row.get("timestamp");
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default();
            let metadata: String = row.get("metadata_json");
            out.push(Interaction {
                timestamp,
                agent: row.get("agent"),
                kind,
                content: row.get("content"),
                metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(out)
    }
}
