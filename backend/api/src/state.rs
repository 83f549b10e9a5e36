use std::sync::Arc;

use tracing::info;

use crate::{
    config::Config,
    identity::IdentityGate,
    store::{AttestationStore, CommentStore, MemoryStore, ProjectStore, SqliteStore, StoreError},
    voting::VotingEngine,
};

/// Shared handles injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub projects: Arc<dyn ProjectStore>,
    pub comments: Arc<dyn CommentStore>,
    pub identity: Arc<IdentityGate>,
    pub voting: Arc<VotingEngine>,
}

impl AppState {
    /// Open the store named by `config.database_url` and wire the services.
    pub async fn from_config(config: Config) -> Result<Self, StoreError> {
        if config.uses_memory_store() {
            info!("Using in-memory store; data is lost on restart");
            return Ok(Self::with_store(config, Arc::new(MemoryStore::new())));
        }

        info!(url = %config.database_url, "Connecting to SQLite");
        let store =
            SqliteStore::connect(&config.database_url, config.database_max_connections).await?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    pub fn with_store<S>(config: Config, store: Arc<S>) -> Self
    where
        S: ProjectStore + AttestationStore + CommentStore + 'static,
    {
        let projects: Arc<dyn ProjectStore> = store.clone();
        let attestations: Arc<dyn AttestationStore> = store.clone();
        let comments: Arc<dyn CommentStore> = store;

        let identity = Arc::new(IdentityGate::new(attestations, config.attestation_ttl()));
        let voting = Arc::new(VotingEngine::new(projects.clone(), identity.clone()));

        Self {
            config: Arc::new(config),
            projects,
            comments,
            identity,
            voting,
        }
    }
}
