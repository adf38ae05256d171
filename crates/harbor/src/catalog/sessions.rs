//! Session persistence.

use anyhow::{Context, Result};
use harbor_protocol::DerivedMetadata;
use sqlx::SqlitePool;

use super::models::{SessionDetail, SessionRow};

const SESSION_COLUMNS: &str = r#"
    id, project_id, user_id, message_count, total_tokens,
    first_message_preview, last_message_at, created_at
"#;

const DETAIL_COLUMNS: &str = r#"
    s.id, s.project_id, s.user_id, s.message_count, s.total_tokens,
    s.first_message_preview, s.last_message_at, s.created_at,
    p.name AS project_name, p.path AS project_path
"#;

/// Repository for session rows.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a session joined with its project.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<SessionDetail>> {
        let query = format!(
            "SELECT {} FROM sessions s JOIN projects p ON p.id = s.project_id WHERE s.id = ?",
            DETAIL_COLUMNS
        );
        let session = sqlx::query_as::<_, SessionDetail>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;
        Ok(session)
    }

    /// Insert a session, or refresh its derived metadata if it exists.
    ///
    /// The metadata columns have no other writer.
    pub async fn upsert(
        &self,
        id: &str,
        project_id: &str,
        user_id: &str,
        metadata: &DerivedMetadata,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, project_id, user_id, message_count, total_tokens,
                first_message_preview, last_message_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                message_count = excluded.message_count,
                total_tokens = excluded.total_tokens,
                first_message_preview = excluded.first_message_preview,
                last_message_at = excluded.last_message_at
            "#,
        )
        .bind(id)
        .bind(project_id)
        .bind(user_id)
        .bind(metadata.message_count)
        .bind(metadata.total_tokens)
        .bind(&metadata.first_message_preview)
        .bind(metadata.last_message_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("upserting session")?;
        Ok(())
    }

    /// Delete a batch of sessions by id.
    pub async fn delete_many(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let query = format!("DELETE FROM sessions WHERE id IN ({placeholders})");
        let mut stmt = sqlx::query(&query);
        for id in ids {
            stmt = stmt.bind(id);
        }
        let result = stmt
            .execute(&self.pool)
            .await
            .context("deleting sessions")?;
        Ok(result.rows_affected())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;
        Ok(())
    }

    /// List a user's sessions in one project, most recent first.
    pub async fn list_by_project(&self, project_id: &str, user_id: &str) -> Result<Vec<SessionRow>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE project_id = ? AND user_id = ? ORDER BY last_message_at DESC",
            SESSION_COLUMNS
        );
        let sessions = sqlx::query_as::<_, SessionRow>(&query)
            .bind(project_id)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions by project")?;
        Ok(sessions)
    }

    /// All session ids recorded for a project, regardless of owner.
    pub async fn ids_for_project(&self, project_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM sessions WHERE project_id = ?")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await
                .context("listing session ids for project")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
