// backend/api/src/store/mod.rs
//
// Storage seams. The voting engine, identity gate and HTTP handlers only see
// these traits; `memory` backs tests and throwaway deployments, `sqlite`
// persists one JSON document per project.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{
    Attestation, Backer, Comment, NewComment, Project, ProjectId, ProjectPatch, Vote,
    WalletAddress,
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project {0} not found")]
    NotFound(ProjectId),

    #[error("milestone {milestone_id} not found on project {project_id}")]
    MilestoneNotFound {
        project_id: ProjectId,
        milestone_id: u32,
    },

    #[error("project {0} was modified concurrently")]
    Conflict(ProjectId),

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unavailable(format!("migration failed: {err}"))
    }
}

/// Single-document operations on projects.
///
/// Every write is atomic with respect to its own document; nothing here spans
/// documents.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>, StoreError>;

    /// All projects, oldest first.
    async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;

    async fn insert_project(&self, project: &Project) -> Result<(), StoreError>;

    /// Returns `false` if there was nothing to delete.
    async fn delete_project(&self, id: &ProjectId) -> Result<bool, StoreError>;

    /// Returns whether any field changed.
    async fn update_details(
        &self,
        id: &ProjectId,
        patch: &ProjectPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Append a contribution and bump `raised`/`backersCount` in the same write.
    async fn add_backer(&self, id: &ProjectId, backer: Backer) -> Result<(), StoreError>;

    /// Upsert one vote into a milestone's ledger in a single write and return
    /// the project as committed. Completion must be decided from this copy,
    /// never from an earlier read.
    async fn update_milestone_votes(
        &self,
        id: &ProjectId,
        milestone_id: u32,
        vote: Vote,
    ) -> Result<Project, StoreError>;

    /// No-op when the milestone is already completed.
    async fn mark_milestone_completed(
        &self,
        id: &ProjectId,
        milestone_id: u32,
    ) -> Result<(), StoreError>;

    /// Returns whether `voter` has upvoted after the toggle.
    async fn toggle_upvote(&self, id: &ProjectId, voter: &WalletAddress)
        -> Result<bool, StoreError>;
}

#[async_trait]
pub trait AttestationStore: Send + Sync {
    /// Insert or overwrite the attestation for `attestation.address`.
    async fn record_attestation(&self, attestation: &Attestation) -> Result<(), StoreError>;

    async fn get_attestation(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<Attestation>, StoreError>;
}

#[async_trait]
pub trait CommentStore: Send + Sync {
    async fn add_comment(&self, comment: NewComment) -> Result<Comment, StoreError>;

    /// Comments on a project, newest first.
    async fn list_comments(&self, project_id: &ProjectId) -> Result<Vec<Comment>, StoreError>;
}
