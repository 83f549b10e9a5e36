// backend/api/src/store/memory.rs

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{AttestationStore, CommentStore, ProjectStore, StoreError};
use crate::types::{
    Attestation, Backer, Comment, NewComment, Project, ProjectId, ProjectPatch, Vote,
    WalletAddress,
};

/// Process-local store. Each project entry is mutated under its shard lock,
/// which gives the same single-document atomicity as the SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    projects: DashMap<ProjectId, Project>,
    attestations: DashMap<String, Attestation>,
    comments: DashMap<ProjectId, Vec<Comment>>,
    next_comment_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn modify<T>(
        &self,
        id: &ProjectId,
        f: impl FnOnce(&mut Project) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut entry = self
            .projects
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        f(entry.value_mut())
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>, StoreError> {
        Ok(self.projects.get(id).map(|p| p.value().clone()))
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let mut projects: Vec<Project> = self.projects.iter().map(|p| p.value().clone()).collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(projects)
    }

    async fn insert_project(&self, project: &Project) -> Result<(), StoreError> {
        if self.projects.contains_key(&project.id) {
            return Err(StoreError::Conflict(project.id.clone()));
        }
        self.projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn delete_project(&self, id: &ProjectId) -> Result<bool, StoreError> {
        Ok(self.projects.remove(id).is_some())
    }

    async fn update_details(
        &self,
        id: &ProjectId,
        patch: &ProjectPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.modify(id, |project| Ok(patch.apply_to(project, now)))
    }

    async fn add_backer(&self, id: &ProjectId, backer: Backer) -> Result<(), StoreError> {
        self.modify(id, |project| {
            project.push_backer(backer);
            Ok(())
        })
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
    }

    async fn mark_milestone_completed(
        &self,
        id: &ProjectId,
        milestone_id: u32,
    ) -> Result<(), StoreError> {
        self.modify(id, |project| project.complete_milestone(milestone_id).map(|_| ()))
    }

    async fn toggle_upvote(
        &self,
        id: &ProjectId,
        voter: &WalletAddress,
    ) -> Result<bool, StoreError> {
        self.modify(id, |project| Ok(project.toggle_upvote(voter)))
    }
}

#[async_trait]
impl AttestationStore for MemoryStore {
    async fn record_attestation(&self, attestation: &Attestation) -> Result<(), StoreError> {
        self.attestations
            .insert(attestation.address.clone(), attestation.clone());
        Ok(())
    }

    async fn get_attestation(
        &self,
        address: &WalletAddress,
    ) -> Result<Option<Attestation>, StoreError> {
        Ok(self
            .attestations
            .get(&address.normalized())
            .map(|a| a.value().clone()))
    }
}

#[async_trait]
impl CommentStore for MemoryStore {
    async fn add_comment(&self, comment: NewComment) -> Result<Comment, StoreError> {
        let stored = Comment {
            id: self.next_comment_id.fetch_add(1, Ordering::Relaxed) + 1,
            project_id: comment.project_id,
            user_address: comment.user_address,
            content: comment.content,
            timestamp: comment.timestamp,
        };
        self.comments
            .entry(stored.project_id.clone())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn list_comments(&self, project_id: &ProjectId) -> Result<Vec<Comment>, StoreError> {
        let mut comments = self
            .comments
            .get(project_id)
            .map(|c| c.value().clone())
            .unwrap_or_default();
        comments.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(comments)
    }
}
