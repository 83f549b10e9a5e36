// backend/api/src/voting.rs
//
// Milestone disbursement voting.
//
// `cast_vote` is the only path that writes a vote ledger or a milestone's
// completion flag. Calls for the same (project, milestone) are serialized by
// an async mutex within the process. The vote itself is upserted by the store
// in one conditional write, and completion is decided from the document that
// write committed, so a writer in another process either lands before ours
// and is counted or surfaces as `Conflict`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    error::Error,
    identity::IdentityGate,
    store::ProjectStore,
    tally::Tally,
    types::{ProjectId, Vote, VoteChoice, WalletAddress},
};

/// A vote as submitted, before any validation beyond field presence.
#[derive(Debug, Clone)]
pub struct Ballot {
    pub project_id: ProjectId,
    pub milestone_id: u32,
    /// Raw `voterAddress`. A malformed address can never match a backer.
    pub voter: String,
    pub vote: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Ledger updated; the milestone stays as it was.
    Recorded,
    /// Ledger updated and this vote pushed the milestone over both thresholds.
    MilestoneCompleted,
    /// Ledger updated and the thresholds were crossed, but writing the
    /// completion flag failed. The next vote re-runs the check.
    CompletionDeferred(String),
}

impl VoteOutcome {
    pub fn milestone_completed(&self) -> bool {
        matches!(self, VoteOutcome::MilestoneCompleted)
    }

    pub fn warning(&self) -> Option<&str> {
        match self {
            VoteOutcome::CompletionDeferred(reason) => Some(reason),
            _ => None,
        }
    }
}

type LockKey = (ProjectId, u32);
type LockTable = DashMap<LockKey, Arc<Mutex<()>>>;

/// Drops the table entry for `key` once nobody else holds or awaits it.
/// Runs on cancellation too.
struct LockSlot<'a> {
    locks: &'a LockTable,
    key: LockKey,
}

impl Drop for LockSlot<'_> {
    fn drop(&mut self) {
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct VotingEngine {
    projects: Arc<dyn ProjectStore>,
    identity: Arc<IdentityGate>,
    locks: LockTable,
}

impl VotingEngine {
    pub fn new(projects: Arc<dyn ProjectStore>, identity: Arc<IdentityGate>) -> Self {
        Self {
            projects,
            identity,
            locks: DashMap::new(),
        }
    }

    pub async fn cast_vote(&self, ballot: Ballot) -> Result<VoteOutcome, Error> {
        self.cast_vote_at(ballot, Utc::now()).await
    }

    /// Validate and record `ballot` as of `now`.
    ///
    /// Preconditions are checked in order and the first failure wins:
    /// project exists, voter is a backer, voter holds a live attestation,
    /// milestone exists, vote is `yes` or `no`.
    #[instrument(
        skip(self, ballot, now),
        fields(project_id = %ballot.project_id, milestone_id = ballot.milestone_id, voter = %ballot.voter)
    )]
    pub async fn cast_vote_at(
        &self,
        ballot: Ballot,
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome, Error> {
        let key = (ballot.project_id.clone(), ballot.milestone_id);
        // Declared first so it drops last, after our clone of the mutex.
        let _slot = LockSlot {
            locks: &self.locks,
            key: key.clone(),
        };
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        self.apply(ballot, now).await
    }

    async fn apply(&self, ballot: Ballot, now: DateTime<Utc>) -> Result<VoteOutcome, Error> {
        let Ballot {
            project_id,
            milestone_id,
            voter,
            vote,
        } = ballot;

        let project = self
            .projects
            .get_project(&project_id)
            .await?
            .ok_or_else(|| Error::NotFound("Project not found".to_string()))?;

        let voter = WalletAddress::parse(&voter)
            .ok()
            .filter(|address| project.is_backer(address))
            .ok_or_else(|| {
                Error::Forbidden("Only backers can vote on milestone disbursements".to_string())
            })?;

        self.identity.require_attestation(&voter, now).await?;

        if project.milestone(milestone_id).is_none() {
            return Err(Error::NotFound(format!("Milestone {milestone_id} not found")));
        }

        let choice: VoteChoice = vote.parse()?;

        let committed = self
            .projects
            .update_milestone_votes(
                &project_id,
                milestone_id,
                Vote {
                    address: voter,
                    vote: choice,
                    timestamp: now,
                },
            )
            .await?;
        let ledger = committed.votes_for(milestone_id);
        info!(?choice, ledger_size = ledger.len(), "Vote recorded");

        let already_completed = committed
            .milestone(milestone_id)
            .is_some_and(|m| m.is_completed);
        if already_completed {
            return Ok(VoteOutcome::Recorded);
        }

        let tally = Tally::compute(&committed.backers, ledger);
        if !tally.approves() {
            return Ok(VoteOutcome::Recorded);
        }

        match self
            .projects
            .mark_milestone_completed(&project_id, milestone_id)
            .await
        {
            Ok(()) => {
                info!(
                    yes_votes = tally.yes_votes,
                    total_votes = tally.total_votes,
                    yes_power = tally.yes_power,
                    total_power = tally.total_power,
                    "Milestone approved"
                );
                Ok(VoteOutcome::MilestoneCompleted)
            }
            Err(e) => {
                warn!(error = %e, "Vote recorded but milestone completion was not persisted");
                Ok(VoteOutcome::CompletionDeferred(format!(
                    "Vote recorded, milestone completion pending: {e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::Duration;
    use proptest::prelude::*;
    use tokio::sync::Barrier;

    use super::*;
    use crate::{
        identity::test_support::TestWallet,
        store::{MemoryStore, SqliteStore, StoreError},
        types::{Backer, MilestoneDraft, Project, ProjectDraft, ProjectPatch},
    };

    struct Fixture {
        store: Arc<dyn ProjectStore>,
        gate: Arc<IdentityGate>,
        engine: VotingEngine,
        project_id: ProjectId,
        now: DateTime<Utc>,
    }

    /// Seeds a two-milestone project into `store`. The engine talks to
    /// `wrap(store)`, which lets tests interpose on its store calls.
    async fn fixture_with(
        amounts: &[(u8, f64)],
        store: Arc<dyn ProjectStore>,
        wrap: impl FnOnce(Arc<dyn ProjectStore>) -> Arc<dyn ProjectStore>,
    ) -> Fixture {
        let now = Utc::now();
        let gate = Arc::new(IdentityGate::new(
            Arc::new(MemoryStore::new()),
            Duration::seconds(3600),
        ));
        let engine = VotingEngine::new(wrap(store.clone()), gate.clone());
        let mut project = Project::from_draft(
            ProjectDraft {
                title: "Well".into(),
                description: "Village water well".into(),
                category: None,
                funding_goal: 1000.0,
                creator: TestWallet::new(200).address(),
                creator_name: None,
                creator_bio: None,
                duration: None,
                image: None,
                milestones: vec![
                    MilestoneDraft {
                        description: "Survey".into(),
                        target_amount: 300.0,
                        submission_details: None,
                    },
                    MilestoneDraft {
                        description: "Drilling".into(),
                        target_amount: 700.0,
                        submission_details: None,
                    },
                ],
            },
            now,
        );
        for (seed, amount) in amounts {
            project.push_backer(Backer {
                address: TestWallet::new(*seed).address(),
                amount: *amount,
                timestamp: now,
                transaction_hash: None,
            });
        }
        let project_id = project.id.clone();
        store.insert_project(&project).await.unwrap();

        Fixture {
            store,
            gate,
            engine,
            project_id,
            now,
        }
    }

    const WHALE_AND_MINNOWS: &[(u8, f64)] = &[(1, 100.0), (2, 100.0), (3, 800.0)];

    /// Backers A=1 (100), B=2 (100), C=3 (800).
    async fn fixture() -> Fixture {
        fixture_with(WHALE_AND_MINNOWS, Arc::new(MemoryStore::new()), |s| s).await
    }

    impl Fixture {
        async fn attest(&self, seed: u8) {
            let wallet = TestWallet::new(seed);
            self.gate
                .verify_at(&wallet.address(), "vote", &wallet.sign("vote"), self.now)
                .await
                .unwrap();
        }

        fn ballot(&self, seed: u8, milestone_id: u32, vote: &str) -> Ballot {
            Ballot {
                project_id: self.project_id.clone(),
                milestone_id,
                voter: TestWallet::new(seed).address().to_string(),
                vote: vote.to_string(),
            }
        }

        async fn vote(&self, seed: u8, milestone_id: u32, vote: &str) -> Result<VoteOutcome, Error> {
            self.engine
                .cast_vote_at(self.ballot(seed, milestone_id, vote), self.now)
                .await
        }

        async fn project(&self) -> Project {
            self.store.get_project(&self.project_id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_unknown_project_is_not_found() {
        let fx = fixture().await;
        let mut ballot = fx.ballot(1, 1, "yes");
        ballot.project_id = ProjectId::from("nope");

        let err = fx.engine.cast_vote_at(ballot, fx.now).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        // Project lookup comes before any look at the address.
        let mut ballot = fx.ballot(1, 1, "yes");
        ballot.project_id = ProjectId::from("nope");
        ballot.voter = "0x1234".into();
        let err = fx.engine.cast_vote_at(ballot, fx.now).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_non_backer_is_forbidden_before_other_checks() {
        let fx = fixture().await;
        fx.attest(9).await;

        // Bad vote value and bad milestone still lose to the backer check.
        for (milestone, vote) in [(1, "yes"), (99, "maybe"), (0, "no")] {
            let err = fx.vote(9, milestone, vote).await.unwrap_err();
            assert!(matches!(err, Error::Forbidden(_)), "{milestone}/{vote}: {err:?}");
        }
    }

    #[tokio::test]
    async fn test_malformed_voter_address_is_forbidden() {
        let fx = fixture().await;

        for voter in ["alice", "0x1234", "", "0xzz"] {
            let mut ballot = fx.ballot(1, 1, "yes");
            ballot.voter = voter.to_string();
            let err = fx.engine.cast_vote_at(ballot, fx.now).await.unwrap_err();
            assert!(matches!(err, Error::Forbidden(_)), "{voter:?}: {err:?}");
        }
        assert!(fx.project().await.milestone_votes.is_empty());
    }

    #[tokio::test]
    async fn test_backer_without_attestation_is_unauthorized() {
        let fx = fixture().await;
        let err = fx.vote(1, 1, "yes").await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert!(fx.project().await.votes_for(1).is_empty());
    }

    #[tokio::test]
    async fn test_attestation_expiry_boundary() {
        let fx = fixture().await;
        fx.attest(1).await;

        let at = |secs| fx.now + Duration::seconds(secs);
        assert!(fx.engine.cast_vote_at(fx.ballot(1, 1, "yes"), at(3599)).await.is_ok());

        let err = fx
            .engine
            .cast_vote_at(fx.ballot(1, 1, "yes"), at(3601))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_milestone_is_not_found() {
        let fx = fixture().await;
        fx.attest(1).await;

        for milestone in [0, 3] {
            let err = fx.vote(1, milestone, "yes").await.unwrap_err();
            assert!(matches!(err, Error::NotFound(_)));
        }
        assert!(fx.project().await.milestone_votes.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_vote_value_is_rejected() {
        let fx = fixture().await;
        fx.attest(1).await;

        for bad in ["maybe", "YES", ""] {
            let err = fx.vote(1, 1, bad).await.unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        }
        assert!(fx.project().await.votes_for(1).is_empty());
    }

    #[tokio::test]
    async fn test_last_vote_wins() {
        let fx = fixture().await;
        fx.attest(1).await;

        fx.vote(1, 1, "yes").await.unwrap();
        fx.vote(1, 1, "no").await.unwrap();

        let project = fx.project().await;
        let ledger = project.votes_for(1);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].vote, VoteChoice::No);
    }

    #[tokio::test]
    async fn test_minnows_alone_do_not_complete() {
        let fx = fixture().await;
        for seed in [1, 2, 3] {
            fx.attest(seed).await;
        }

        assert_eq!(fx.vote(1, 1, "yes").await.unwrap(), VoteOutcome::Recorded);
        assert_eq!(fx.vote(2, 1, "yes").await.unwrap(), VoteOutcome::Recorded);
        assert!(!fx.project().await.milestones[0].is_completed);

        assert_eq!(fx.vote(3, 1, "no").await.unwrap(), VoteOutcome::Recorded);
        assert!(!fx.project().await.milestones[0].is_completed);
    }

    #[tokio::test]
    async fn test_headcount_and_power_majority_completes() {
        let fx = fixture().await;
        for seed in [1, 2, 3] {
            fx.attest(seed).await;
        }

        fx.vote(2, 1, "no").await.unwrap();
        fx.vote(1, 1, "yes").await.unwrap();
        let outcome = fx.vote(3, 1, "yes").await.unwrap();

        assert_eq!(outcome, VoteOutcome::MilestoneCompleted);
        let project = fx.project().await;
        assert!(project.milestones[0].is_completed);
        assert!(!project.milestones[1].is_completed);
    }

    #[tokio::test]
    async fn test_exact_half_headcount_does_not_complete() {
        let fx = fixture().await;
        for seed in [1, 3] {
            fx.attest(seed).await;
        }

        fx.vote(3, 1, "yes").await.unwrap();
        fx.vote(1, 1, "no").await.unwrap();

        assert!(!fx.project().await.milestones[0].is_completed);
    }

    #[tokio::test]
    async fn test_completed_milestone_stays_completed() {
        let fx = fixture().await;
        for seed in [1, 2, 3] {
            fx.attest(seed).await;
        }
        fx.vote(1, 1, "yes").await.unwrap();
        assert_eq!(fx.vote(3, 1, "yes").await.unwrap(), VoteOutcome::MilestoneCompleted);

        // Everyone turns against it; completion is monotonic.
        for seed in [1, 2, 3] {
            assert_eq!(fx.vote(seed, 1, "no").await.unwrap(), VoteOutcome::Recorded);
        }

        let project = fx.project().await;
        assert!(project.milestones[0].is_completed);
        assert!(project
            .votes_for(1)
            .iter()
            .all(|v| v.vote == VoteChoice::No));
    }

    #[tokio::test]
    async fn test_raised_is_untouched_by_voting() {
        let fx = fixture().await;
        fx.attest(3).await;
        let before = fx.project().await;

        fx.vote(3, 2, "yes").await.unwrap();

        let after = fx.project().await;
        assert_eq!(after.raised, before.raised);
        assert_eq!(after.backers, before.backers);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_votes_are_not_lost() {
        let seeds: Vec<u8> = (1..=24).collect();
        let amounts: Vec<(u8, f64)> = seeds.iter().map(|s| (*s, 10.0)).collect();
        let fx = Arc::new(fixture_with(&amounts, Arc::new(MemoryStore::new()), |s| s).await);
        for seed in &seeds {
            fx.attest(*seed).await;
        }

        let handles: Vec<_> = seeds
            .iter()
            .map(|seed| {
                let fx = fx.clone();
                let seed = *seed;
                tokio::spawn(async move { fx.vote(seed, 1, "yes").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let project = fx.project().await;
        assert_eq!(project.votes_for(1).len(), seeds.len());
        assert!(project.milestones[0].is_completed);
        assert!(fx.engine.locks.is_empty());
    }

    /// Delegates to `inner`. Reads can be held at a barrier so two callers
    /// act on the same snapshot, and completion writes can be made to fail.
    struct Interposed {
        inner: Arc<dyn ProjectStore>,
        read_gate: Option<Barrier>,
        fail_completion: AtomicBool,
    }

    impl Interposed {
        fn new(inner: Arc<dyn ProjectStore>) -> Self {
            Self {
                inner,
                read_gate: None,
                fail_completion: AtomicBool::new(false),
            }
        }

        fn gated(inner: Arc<dyn ProjectStore>, readers: usize) -> Self {
            Self {
                read_gate: Some(Barrier::new(readers)),
                ..Self::new(inner)
            }
        }
    }

    #[async_trait]
    impl ProjectStore for Interposed {
        async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>, StoreError> {
            let project = self.inner.get_project(id).await?;
            if let Some(gate) = &self.read_gate {
                gate.wait().await;
            }
            Ok(project)
        }
        async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
            self.inner.list_projects().await
        }
        async fn insert_project(&self, project: &Project) -> Result<(), StoreError> {
            self.inner.insert_project(project).await
        }
        async fn delete_project(&self, id: &ProjectId) -> Result<bool, StoreError> {
            self.inner.delete_project(id).await
        }
        async fn update_details(
            &self,
            id: &ProjectId,
            patch: &ProjectPatch,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.update_details(id, patch, now).await
        }
        async fn add_backer(&self, id: &ProjectId, backer: Backer) -> Result<(), StoreError> {
            self.inner.add_backer(id, backer).await
        }
        async fn update_milestone_votes(
            &self,
            id: &ProjectId,
            milestone_id: u32,
            vote: Vote,
        ) -> Result<Project, StoreError> {
            self.inner.update_milestone_votes(id, milestone_id, vote).await
        }
        async fn mark_milestone_completed(
            &self,
            id: &ProjectId,
            milestone_id: u32,
        ) -> Result<(), StoreError> {
            if self.fail_completion.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.mark_milestone_completed(id, milestone_id).await
        }
        async fn toggle_upvote(
            &self,
            id: &ProjectId,
            voter: &WalletAddress,
        ) -> Result<bool, StoreError> {
            self.inner.toggle_upvote(id, voter).await
        }
    }

    #[tokio::test]
    async fn test_failed_completion_write_is_reported_and_retried() {
        let memory = Arc::new(MemoryStore::new());
        let flaky = Arc::new(Interposed::new(memory.clone()));
        flaky.fail_completion.store(true, Ordering::SeqCst);
        let engine_store: Arc<dyn ProjectStore> = flaky.clone();
        let fx = fixture_with(WHALE_AND_MINNOWS, memory, |_| engine_store).await;
        for seed in [1, 3] {
            fx.attest(seed).await;
        }

        fx.vote(1, 1, "yes").await.unwrap();
        let outcome = fx.vote(3, 1, "yes").await.unwrap();
        assert!(outcome.warning().is_some());
        assert!(!outcome.milestone_completed());

        let project = fx.project().await;
        assert_eq!(project.votes_for(1).len(), 2);
        assert!(!project.milestones[0].is_completed);

        flaky.fail_completion.store(false, Ordering::SeqCst);
        let outcome = fx.vote(3, 1, "yes").await.unwrap();
        assert_eq!(outcome, VoteOutcome::MilestoneCompleted);
    }

    /// Two engines (as two processes would) read the same snapshot, then
    /// both vote. Every vote reported as recorded must be in the ledger.
    async fn race_two_engines(
        store: Arc<dyn ProjectStore>,
    ) -> (Vec<Result<VoteOutcome, Error>>, Project) {
        let gated: Arc<dyn ProjectStore> = Arc::new(Interposed::gated(store.clone(), 2));
        let engine_store = gated.clone();
        let fx = fixture_with(WHALE_AND_MINNOWS, store, |_| engine_store).await;
        let other = VotingEngine::new(gated, fx.gate.clone());
        for seed in [1, 2] {
            fx.attest(seed).await;
        }

        let (first, second) = tokio::join!(
            fx.engine.cast_vote_at(fx.ballot(1, 1, "yes"), fx.now),
            other.cast_vote_at(fx.ballot(2, 1, "yes"), fx.now),
        );
        (vec![first, second], fx.project().await)
    }

    #[tokio::test]
    async fn test_engines_sharing_sqlite_never_drop_a_recorded_vote() {
        let sqlite = Arc::new(SqliteStore::in_memory().await.unwrap());
        let (results, project) = race_two_engines(sqlite).await;

        let recorded = results.iter().filter(|r| r.is_ok()).count();
        for result in &results {
            if let Err(err) = result {
                assert!(matches!(err, Error::Conflict(_)), "{err:?}");
            }
        }
        assert!(recorded >= 1);
        assert_eq!(project.votes_for(1).len(), recorded);
    }

    #[tokio::test]
    async fn test_engines_sharing_memory_store_record_both_votes() {
        let (results, project) = race_two_engines(Arc::new(MemoryStore::new())).await;

        assert!(results.iter().all(Result::is_ok), "{results:?}");
        assert_eq!(project.votes_for(1).len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_vote_releases_its_lock() {
        // A lone reader never gets past a two-party barrier.
        let fx = fixture_with(WHALE_AND_MINNOWS, Arc::new(MemoryStore::new()), |s| {
            Arc::new(Interposed::gated(s, 2)) as Arc<dyn ProjectStore>
        })
        .await;
        fx.attest(1).await;

        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(20), fx.vote(1, 1, "yes")).await;

        assert!(cancelled.is_err());
        assert!(fx.engine.locks.is_empty());
        assert!(fx.project().await.votes_for(1).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_non_backers_are_always_forbidden(
            seed in 10u8..200,
            milestone_id in 0u32..10,
            vote in prop_oneof![Just("yes".to_string()), Just("no".to_string()), "[a-z]{0,6}"],
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let err = runtime.block_on(async {
                let fx = fixture().await;
                fx.attest(seed).await;
                fx.vote(seed, milestone_id, &vote).await.unwrap_err()
            });
            prop_assert!(matches!(err, Error::Forbidden(_)));
        }
    }
}
