// backend/api/src/store/sqlite.rs
//
// SQLite document store.
//
// Each project row carries the serialized document and a `version` counter.
// Writes read the document, apply the change in memory, then update with
// `WHERE version = ?`; if another writer got there first no row matches and
// the write fails with `StoreError::Conflict` instead of silently losing an
// update.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, SqlitePool,
};
use tracing::{debug, info};

use super::{AttestationStore, CommentStore, ProjectStore, StoreError};
use crate::types::{
    Attestation, Backer, Comment, NewComment, Project, ProjectId, ProjectPatch, Vote,
    WalletAddress,
};

#[derive(FromRow)]
struct DocumentRow {
    id: String,
    version: i64,
    document: String,
}

#[derive(FromRow)]
struct AttestationRow {
    address: String,
    signature: String,
    verified_at: String,
}

#[derive(FromRow)]
struct CommentRow {
    id: i64,
    project_id: String,
    user_address: String,
    content: String,
    timestamp: String,
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::migrate(pool).await
    }

    /// A private in-memory database. One connection, kept for the pool's
    /// lifetime, because every SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("SQLite store ready");
        Ok(Self { pool })
    }

    async fn load(&self, id: &ProjectId) -> Result<Option<(Project, i64)>, StoreError> {
        let row: Option<DocumentRow> =
            sqlx::query_as("SELECT id, version, document FROM projects WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|row| {
            let version = row.version;
            decode_document(row).map(|project| (project, version))
        })
        .transpose()
    }

    async fn modify<T, F>(&self, id: &ProjectId, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Project) -> Result<T, StoreError> + Send,
        T: Send,
    {
        let (mut project, version) = self
            .load(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let output = f(&mut project)?;
        let document = encode_document(&project)?;

        let result =
            sqlx::query("UPDATE projects SET document = ?, version = version + 1 WHERE id = ? AND version = ?")
                .bind(document)
                .bind(id.as_str())
                .bind(version)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            debug!(project_id = %id, version, "conditional update lost the race");
            return Err(StoreError::Conflict(id.clone()));
        }

        Ok(output)
    }
}

fn encode_document(project: &Project) -> Result<String, StoreError> {
    serde_json::to_string(project).map_err(|e| StoreError::Corrupt {
        key: project.id.to_string(),
        reason: e.to_string(),
    })
}

fn decode_document(row: DocumentRow) -> Result<Project, StoreError> {
    serde_json::from_str(&row.document).map_err(|e| StoreError::Corrupt {
        key: row.id,
        reason: e.to_string(),
    })
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    // Fixed width so lexicographic order matches chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(key: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>, StoreError> {
        Ok(self.load(id).await?.map(|(project, _)| project))
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let rows: Vec<DocumentRow> =
            sqlx::query_as("SELECT id, version, document FROM projects ORDER BY created_at, id")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(decode_document).collect()
    }

    async fn insert_project(&self, project: &Project) -> Result<(), StoreError> {
        let document = encode_document(project)?;

        let result = sqlx::query(
            "INSERT INTO projects (id, version, document, created_at) VALUES (?, 0, ?, ?) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(project.id.as_str())
        .bind(document)
        .bind(format_timestamp(project.created_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(project.id.clone()));
        }
        Ok(())
    }

    async fn delete_project(&self, id: &ProjectId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_details(
        &self,
        id: &ProjectId,
        patch: &ProjectPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.modify(id, |project| Ok(patch.apply_to(project, now)))
            .await
    }

    async fn add_backer(&self, id: &ProjectId, backer: Backer) -> Result<(), StoreError> {
        self.modify(id, |project| {
            project.push_backer(backer);
            Ok(())
        })
        .await
    }

    async fn update_milestone_votes(
        &self,
        id: &ProjectId,
        milestone_id: u32,
        vote: Vote,
    ) -> Result<Project, StoreError> {
        self.modify(id, |project| {
            project.record_vote(milestone_id, vote)?;
            Ok(project.clone())
        })
        .await
    }

    async fn mark_milestone_completed(
        &self,
        id: &ProjectId,
        milestone_id: u32,
    ) -> Result<(), StoreError> {
        self.modify(id, |project| project.complete_milestone(milestone_id).map(|_| ()))
            .await
    }

    async fn toggle_upvote(
        &self,
        id: &ProjectId,
        voter: &WalletAddress,
    ) -> Result<bool, StoreError> {
        self.modify(id, |project| Ok(project.toggle_upvote(voter)))
            .await
    }
}

#[async_trait]
impl AttestationStore for SqliteStore {
    async fn record_attestation(&self, attestation: &Attestation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO attestations (address, signature, verified_at) VALUES (?, ?, ?) \
             ON CONFLICT(address) DO UPDATE SET signature = excluded.signature, \
             verified_at = excluded.verified_at",
        )
        .bind(&attestation.address)
        .bind(&attestation.signature)
        .bind(format_timestamp(attestation.verified_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_attestation(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<Attestation>, StoreError> {
        let row: Option<AttestationRow> = sqlx::query_as(
            "SELECT address, signature, verified_at FROM attestations WHERE address = ?",
        )
        .bind(address.normalized())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Attestation {
                verified_at: parse_timestamp(&row.address, &row.verified_at)?,
                address: row.address,
                signature: row.signature,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl CommentStore for SqliteStore {
    async fn add_comment(&self, comment: NewComment) -> Result<Comment, StoreError> {
        let result = sqlx::query(
            "INSERT INTO comments (project_id, user_address, content, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(comment.project_id.as_str())
        .bind(comment.user_address.as_str())
        .bind(&comment.content)
        .bind(format_timestamp(comment.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(Comment {
            id: result.last_insert_rowid(),
            project_id: comment.project_id,
            user_address: comment.user_address,
            content: comment.content,
            timestamp: comment.timestamp,
        })
    }

    async fn list_comments(&self, project_id: &ProjectId) -> Result<Vec<Comment>, StoreError> {
        let rows: Vec<CommentRow> = sqlx::query_as(
            "SELECT id, project_id, user_address, content, timestamp FROM comments \
             WHERE project_id = ? ORDER BY timestamp DESC, id DESC",
        )
        .bind(project_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let key = format!("comment {}", row.id);
                Ok(Comment {
                    id: row.id,
                    project_id: ProjectId::from(row.project_id),
                    user_address: WalletAddress::parse(&row.user_address).map_err(|e| {
                        StoreError::Corrupt {
                            key: key.clone(),
                            reason: e.to_string(),
                        }
                    })?,
                    content: row.content,
                    timestamp: parse_timestamp(&key, &row.timestamp)?,
                })
            })
            .collect()
    }
}
