//! Project persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::Project;

const PROJECT_COLUMNS: &str = "id, name, path, created_at";

/// Repository for project rows.
#[derive(Debug, Clone)]
pub struct ProjectRepository {
    pool: SqlitePool,
}

impl ProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a project by path, or update its name if the path exists.
    pub async fn upsert_by_path(&self, name: &str, path: &str) -> Result<Project> {
        if let Some(existing) = self.get_by_path(path).await? {
            if existing.name != name {
                sqlx::query("UPDATE projects SET name = ? WHERE id = ?")
                    .bind(name)
                    .bind(&existing.id)
                    .execute(&self.pool)
                    .await
                    .context("renaming project")?;
            }
            return Ok(Project {
                name: name.to_string(),
                ..existing
            });
        }

        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            path: path.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        sqlx::query("INSERT INTO projects (id, name, path, created_at) VALUES (?, ?, ?, ?)")
            .bind(&project.id)
            .bind(&project.name)
            .bind(&project.path)
            .bind(&project.created_at)
            .execute(&self.pool)
            .await
            .context("creating project")?;

        Ok(project)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Project>> {
        let query = format!("SELECT {} FROM projects WHERE id = ?", PROJECT_COLUMNS);
        let project = sqlx::query_as::<_, Project>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching project")?;
        Ok(project)
    }

    pub async fn get_by_path(&self, path: &str) -> Result<Option<Project>> {
        let query = format!("SELECT {} FROM projects WHERE path = ?", PROJECT_COLUMNS);
        let project = sqlx::query_as::<_, Project>(&query)
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .context("fetching project by path")?;
        Ok(project)
    }

    pub async fn list(&self) -> Result<Vec<Project>> {
        let query = format!(
            "SELECT {} FROM projects ORDER BY name ASC",
            PROJECT_COLUMNS
        );
        let projects = sqlx::query_as::<_, Project>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing projects")?;
        Ok(projects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn upsert_is_idempotent_on_path() {
        let db = Database::in_memory().await.unwrap();
        let repo = ProjectRepository::new(db.pool().clone());

        let first = repo.upsert_by_path("app", "/work/app").await.unwrap();
        let second = repo.upsert_by_path("app-renamed", "/work/app").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "app-renamed");
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_by_path_misses_cleanly() {
        let db = Database::in_memory().await.unwrap();
        let repo = ProjectRepository::new(db.pool().clone());
        assert!(repo.get_by_path("/nope").await.unwrap().is_none());
    }
}
