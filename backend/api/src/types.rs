// backend/api/src/types.rs
//
// Document model for the project store.
//
// A project is persisted as one document. Backers are append-only, the vote
// ledger is keyed by 1-based milestone id, and `raised` always equals the sum
// of backer amounts because `push_backer` is the only way to add funds.

use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid wallet address: {0}")]
pub struct InvalidAddress(pub String);

/// An EVM wallet address (`0x` + 40 hex digits).
///
/// Keeps the casing it was submitted with but compares and hashes
/// case-insensitively, so `0xAbC…` and `0xabc…` are the same backer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(raw: &str) -> Result<Self, InvalidAddress> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| InvalidAddress(raw.to_string()))?;

        if digits.len() != 40 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidAddress(raw.to_string()));
        }

        Ok(Self(format!("0x{digits}")))
    }

    /// The address embedded in the low 20 bytes of a Keccak-256 key hash.
    pub(crate) fn from_key_hash(hash: &[u8; 32]) -> Self {
        Self(format!("0x{}", hex::encode(&hash[12..])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased form, used as the lookup key for attestations and upvotes.
    pub fn normalized(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl PartialEq for WalletAddress {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for WalletAddress {}

impl Hash for WalletAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WalletAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = InvalidAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.0
    }
}

/// Opaque project identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ProjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ProjectId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Yes,
    No,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("vote must be \"yes\" or \"no\", got {0:?}")]
pub struct InvalidVote(pub String);

impl FromStr for VoteChoice {
    type Err = InvalidVote;

    // Exact match only; "YES" or " yes" are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            other => Err(InvalidVote(other.to_string())),
        }
    }
}

/// One backer's current position on a milestone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub address: WalletAddress,
    pub vote: VoteChoice,
    pub timestamp: DateTime<Utc>,
}

/// Insert `vote` into a milestone ledger, replacing any earlier vote from the
/// same address in place. Returns `true` when an earlier vote was replaced.
pub fn upsert_vote(ledger: &mut Vec<Vote>, vote: Vote) -> bool {
    match ledger.iter_mut().find(|v| v.address == vote.address) {
        Some(existing) => {
            *existing = vote;
            true
        }
        None => {
            ledger.push(vote);
            false
        }
    }
}

/// A single contribution. One address may appear several times.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backer {
    pub address: WalletAddress,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    /// On-chain payment evidence, when the client supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub description: String,
    pub target_amount: f64,
    /// Monotonic: only the voting engine flips it, and only to `true`.
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_details: Option<String>,
}

/// A crowdfunding project document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(alias = "_id")]
    pub id: ProjectId,
    pub title: String,
    pub description: String,
    pub category: String,
    pub funding_goal: f64,
    /// Sum of `backers[].amount`.
    pub raised: f64,
    pub backers_count: u32,
    pub creator_address: WalletAddress,
    #[serde(default)]
    pub creator_name: String,
    #[serde(default)]
    pub creator_bio: String,
    #[serde(default)]
    pub backers: Vec<Backer>,
    /// Campaign length in days.
    pub duration: u32,
    pub deadline: DateTime<Utc>,
    pub status: String,
    #[serde(default)]
    pub image: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    /// Vote ledger keyed by 1-based milestone id.
    #[serde(default)]
    pub milestone_votes: BTreeMap<u32, Vec<Vote>>,
    /// Lowercased addresses that upvoted the project.
    #[serde(default)]
    pub upvotes: Vec<String>,
}

pub const DEFAULT_CATEGORY: &str = "Other";
pub const DEFAULT_DURATION_DAYS: u32 = 30;

/// Fields accepted when a creator registers a project.
#[derive(Clone, Debug)]
pub struct ProjectDraft {
    pub title: String,
    pub description: String,
    pub category: Option<String>,
    pub funding_goal: f64,
    pub creator: WalletAddress,
    pub creator_name: Option<String>,
    pub creator_bio: Option<String>,
    pub duration: Option<u32>,
    pub image: Option<String>,
    pub milestones: Vec<MilestoneDraft>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneDraft {
    pub description: String,
    #[serde(default)]
    pub target_amount: f64,
    #[serde(default)]
    pub submission_details: Option<String>,
}

impl Project {
    pub fn from_draft(draft: ProjectDraft, now: DateTime<Utc>) -> Self {
        let duration = draft.duration.filter(|d| *d > 0).unwrap_or(DEFAULT_DURATION_DAYS);

        Self {
            id: ProjectId::generate(),
            title: draft.title,
            description: draft.description,
            category: draft
                .category
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            funding_goal: draft.funding_goal,
            raised: 0.0,
            backers_count: 0,
            creator_address: draft.creator,
            creator_name: draft.creator_name.unwrap_or_default(),
            creator_bio: draft.creator_bio.unwrap_or_default(),
            backers: Vec::new(),
            duration,
            deadline: now + Duration::days(i64::from(duration)),
            status: "active".to_string(),
            image: draft.image.unwrap_or_default(),
            created_at: now,
            milestones: draft
                .milestones
                .into_iter()
                .map(|m| Milestone {
                    description: m.description,
                    target_amount: m.target_amount,
                    is_completed: false,
                    submission_details: m.submission_details,
                })
                .collect(),
            milestone_votes: BTreeMap::new(),
            upvotes: Vec::new(),
        }
    }

    pub fn is_backer(&self, address: &WalletAddress) -> bool {
        self.backers.iter().any(|b| &b.address == address)
    }

    /// Milestone by 1-based id.
    pub fn milestone(&self, milestone_id: u32) -> Option<&Milestone> {
        let index = usize::try_from(milestone_id).ok()?.checked_sub(1)?;
        self.milestones.get(index)
    }

    pub fn votes_for(&self, milestone_id: u32) -> &[Vote] {
        self.milestone_votes
            .get(&milestone_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn push_backer(&mut self, backer: Backer) {
        self.raised += backer.amount;
        self.backers_count += 1;
        self.backers.push(backer);
    }

    /// Upsert `vote` into the ledger of one milestone. Returns `true` when it
    /// replaced an earlier vote from the same address.
    pub fn record_vote(&mut self, milestone_id: u32, vote: Vote) -> Result<bool, StoreError> {
        if self.milestone(milestone_id).is_none() {
            return Err(StoreError::MilestoneNotFound {
                project_id: self.id.clone(),
                milestone_id,
            });
        }
        Ok(upsert_vote(
            self.milestone_votes.entry(milestone_id).or_default(),
            vote,
        ))
    }

    /// Flip a milestone to completed. Returns `false` if it already was.
    pub fn complete_milestone(&mut self, milestone_id: u32) -> Result<bool, StoreError> {
        let project_id = self.id.clone();
        let milestone = usize::try_from(milestone_id)
            .ok()
            .and_then(|id| id.checked_sub(1))
            .and_then(|index| self.milestones.get_mut(index))
            .ok_or(StoreError::MilestoneNotFound {
                project_id,
                milestone_id,
            })?;

        if milestone.is_completed {
            return Ok(false);
        }
        milestone.is_completed = true;
        Ok(true)
    }

    /// Add or remove `voter` from the upvote set. Returns the new state.
    pub fn toggle_upvote(&mut self, voter: &WalletAddress) -> bool {
        let key = voter.normalized();
        if let Some(position) = self.upvotes.iter().position(|a| *a == key) {
            self.upvotes.remove(position);
            false
        } else {
            self.upvotes.push(key);
            true
        }
    }
}

/// Partial update of the descriptive fields of a project.
///
/// Backers, milestones and votes are deliberately absent: they have their
/// own write paths.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub funding_goal: Option<f64>,
    pub duration: Option<u32>,
    pub image: Option<String>,
    pub status: Option<String>,
    pub creator_name: Option<String>,
    pub creator_bio: Option<String>,
}

impl ProjectPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.funding_goal.is_none()
            && self.duration.is_none()
            && self.image.is_none()
            && self.status.is_none()
            && self.creator_name.is_none()
            && self.creator_bio.is_none()
    }

    /// Returns whether anything changed.
    pub fn apply_to(&self, project: &mut Project, now: DateTime<Utc>) -> bool {
        let before = project.clone();

        fn set(target: &mut String, value: &Option<String>) {
            if let Some(v) = value.as_ref().filter(|v| !v.is_empty()) {
                *target = v.clone();
            }
        }

        set(&mut project.title, &self.title);
        set(&mut project.description, &self.description);
        set(&mut project.category, &self.category);
        set(&mut project.image, &self.image);
        set(&mut project.status, &self.status);
        set(&mut project.creator_name, &self.creator_name);
        set(&mut project.creator_bio, &self.creator_bio);

        if let Some(goal) = self.funding_goal.filter(|g| *g > 0.0) {
            project.funding_goal = goal;
        }
        if let Some(duration) = self.duration.filter(|d| *d > 0) {
            project.duration = duration;
            project.deadline = now + Duration::days(i64::from(duration));
        }

        *project != before
    }
}

/// Proof that an address signed a message at `verified_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    /// Lowercased address.
    pub address: String,
    pub signature: String,
    pub verified_at: DateTime<Utc>,
}

impl Attestation {
    /// Valid while no more than `ttl` has elapsed since verification.
    pub fn is_valid_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.verified_at) <= ttl
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: i64,
    pub project_id: ProjectId,
    pub user_address: WalletAddress,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewComment {
    pub project_id: ProjectId,
    pub user_address: WalletAddress,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}
