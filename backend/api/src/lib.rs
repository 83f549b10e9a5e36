//! Crowdfunding backend.
//!
//! Projects are documents holding their backers, milestones and a per-milestone
//! vote ledger. Backers prove wallet ownership with a signed message and may
//! then vote `yes`/`no` on whether a milestone was achieved. A milestone is
//! marked completed once yes-voters form a strict majority both by headcount
//! and by contributed amount; an external payout process watches that flag.
//!
//! # Routes
//!
//! | Method | Path | |
//! |---|---|---|
//! | `GET` | `/projects[?id=]` | list projects, or fetch one |
//! | `POST` | `/projects` | create a project |
//! | `PATCH` | `/projects?id=` | add a backer or edit details |
//! | `DELETE` | `/projects?id=` | remove a project |
//! | `POST` | `/projects/vote` | cast a milestone vote |
//! | `POST` | `/projects/upvote` | toggle an upvote |
//! | `POST` | `/auth/verify-signature` | attest wallet ownership |
//! | `GET` | `/auth/signature-status?address=` | attestation status |
//! | `GET`/`POST` | `/comments` | project comments |
//!
//! # Running
//!
//! ```sh
//! DATABASE_URL=sqlite://crowdfund.db RUST_LOG=info cargo run -p crowdfund-api
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod routes;
pub mod state;
pub mod store;
pub mod tally;
pub mod types;
pub mod voting;

pub use config::Config;
pub use error::Error;
pub use routes::router;
pub use state::AppState;
