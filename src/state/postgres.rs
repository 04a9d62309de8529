//! Postgres session store
//!
//! Sessions are stored as serialized JSON next to a few indexed columns.

use crate::error::AssistantError;
use crate::state::{Session, SessionStore};
use crate::Result;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

pub struct PostgresSessionStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS deposit_sessions (
                      session_id UUID PRIMARY KEY,
                      stage TEXT NOT NULL,
                      payload TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_deposit_sessions_stage_time
                    ON deposit_sessions (stage, updated_at);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                AssistantError::DatabaseError(format!(
                    "Failed to initialize session store schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionStore for PostgresSessionStore {
    async fn get(&self, session_id: Uuid) -> Result<Option<Session>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT payload FROM deposit_sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AssistantError::DatabaseError(format!("Failed to load session: {}", e))
            })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: String = row.try_get("payload").map_err(|e| {
            AssistantError::DatabaseError(format!("Failed to read session payload: {}", e))
        })?;

        Ok(Some(serde_json::from_str(&payload)?))
    }

    async fn put(&self, session: &Session) -> Result<()> {
        self.ensure_schema().await?;

        let payload = serde_json::to_string(session)?;

        sqlx::query(
            r#"
            INSERT INTO deposit_sessions (session_id, stage, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (session_id) DO UPDATE
              SET stage = EXCLUDED.stage,
                  payload = EXCLUDED.payload,
                  updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(session.session_id)
        .bind(session.stage.name())
        .bind(payload)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AssistantError::DatabaseError(format!("Failed to save session: {}", e)))?;

        Ok(())
    }

    async fn delete(&self, session_id: Uuid) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query("DELETE FROM deposit_sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AssistantError::DatabaseError(format!("Failed to delete session: {}", e))
            })?;

        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>> {
        self.ensure_schema().await?;

        let rows = sqlx::query("SELECT session_id FROM deposit_sessions")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AssistantError::DatabaseError(format!("Failed to list sessions: {}", e))
            })?;

        rows.iter()
            .map(|row| {
                row.try_get("session_id").map_err(|e| {
                    AssistantError::DatabaseError(format!("Failed to read session id: {}", e))
                })
            })
            .collect()
    }
}
