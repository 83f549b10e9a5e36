use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{error, warn};

use super::required;
use crate::{
    error::Error,
    state::AppState,
    types::{ProjectId, WalletAddress},
    voting::Ballot,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub project_id: Option<String>,
    pub milestone_id: Option<u32>,
    pub voter_address: Option<String>,
    pub vote: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub success: bool,
    pub milestone_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// `POST /projects/vote`
pub async fn cast_vote(
    State(state): State<AppState>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Json<VoteResponse>, Error> {
    let Json(body) = payload?;

    let (Some(project_id), Some(milestone_id), Some(voter), Some(vote)) = (
        required(body.project_id),
        body.milestone_id,
        required(body.voter_address),
        required(body.vote),
    ) else {
        return Err(Error::missing_fields());
    };

    let ballot = Ballot {
        project_id: ProjectId::from(project_id),
        milestone_id,
        voter,
        vote,
    };

    // The vote runs to completion on its own task; only our wait is bounded.
    let voting = state.voting.clone();
    let task = tokio::spawn(async move { voting.cast_vote(ballot).await });

    let outcome = match timeout(state.config.vote_timeout(), task).await {
        Ok(joined) => joined.map_err(|e| {
            error!(error = %e, "Vote task failed");
            Error::Unavailable("Failed to process vote".to_string())
        })??,
        Err(_) => {
            warn!("Vote still running after timeout");
            return Err(Error::Unavailable(
                "Vote is still being processed; check the project before voting again"
                    .to_string(),
            ));
        }
    };

    Ok(Json(VoteResponse {
        success: true,
        milestone_completed: outcome.milestone_completed(),
        warning: outcome.warning().map(str::to_string),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpvoteRequest {
    pub project_id: Option<String>,
    pub voter_address: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpvoteResponse {
    pub success: bool,
    pub has_upvoted: bool,
}

/// `POST /projects/upvote` toggles the caller's upvote.
pub async fn toggle_upvote(
    State(state): State<AppState>,
    payload: Result<Json<UpvoteRequest>, JsonRejection>,
) -> Result<Json<UpvoteResponse>, Error> {
    let Json(body) = payload?;

    let (Some(project_id), Some(voter)) =
        (required(body.project_id), required(body.voter_address))
    else {
        return Err(Error::missing_fields());
    };

    let has_upvoted = state
        .projects
        .toggle_upvote(&ProjectId::from(project_id), &WalletAddress::parse(&voter)?)
        .await?;

    Ok(Json(UpvoteResponse {
        success: true,
        has_upvoted,
    }))
}
