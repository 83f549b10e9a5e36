use std::{net::SocketAddr, time::Duration};

use clap::Parser;

use crate::identity::DEFAULT_ATTESTATION_TTL_SECS;

/// Runtime configuration. Every flag falls back to an environment variable,
/// and `.env` is loaded before parsing.
#[derive(Debug, Clone, Parser)]
#[command(name = "crowdfund-api", about = "Crowdfunding projects and milestone voting API")]
pub struct Config {
    /// Address the HTTP server binds to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: SocketAddr,

    /// `sqlite://path/to.db`, or `memory` for a process-local store.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://crowdfund.db")]
    pub database_url: String,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 5)]
    pub database_max_connections: u32,

    /// How long a wallet signature attestation authorizes voting.
    #[arg(long, env = "ATTESTATION_TTL_SECS", default_value_t = DEFAULT_ATTESTATION_TTL_SECS)]
    pub attestation_ttl_secs: u64,

    /// Upper bound on a single vote request, store round-trips included.
    #[arg(long, env = "VOTE_TIMEOUT_SECS", default_value_t = 10)]
    pub vote_timeout_secs: u64,
}

pub const MEMORY_DATABASE: &str = "memory";

impl Config {
    pub fn uses_memory_store(&self) -> bool {
        self.database_url.eq_ignore_ascii_case(MEMORY_DATABASE)
    }

    pub fn attestation_ttl(&self) -> chrono::Duration {
        let secs = i64::try_from(self.attestation_ttl_secs).unwrap_or(i64::MAX);
        chrono::Duration::seconds(secs.min(i64::MAX / 1_000))
    }

    pub fn vote_timeout(&self) -> Duration {
        Duration::from_secs(self.vote_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: MEMORY_DATABASE.to_string(),
            database_max_connections: 5,
            attestation_ttl_secs: DEFAULT_ATTESTATION_TTL_SECS,
            vote_timeout_secs: 10,
        }
    }
}
