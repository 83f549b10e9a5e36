use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    Json,
};
use chrono::Utc;
use serde::Deserialize;

use super::required;
use crate::{
    error::Error,
    state::AppState,
    types::{Comment, NewComment, ProjectId, WalletAddress},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentsQuery {
    pub project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCommentRequest {
    pub project_id: Option<String>,
    pub user_address: Option<String>,
    pub content: Option<String>,
}

/// `GET /comments?projectId=`
pub async fn list_comments(
    State(state): State<AppState>,
    query: Result<Query<CommentsQuery>, QueryRejection>,
) -> Result<Json<Vec<Comment>>, Error> {
    let Query(query) = query?;
    let project_id = required(query.project_id)
        .ok_or_else(|| Error::InvalidArgument("Project ID is required".to_string()))?;

    Ok(Json(
        state
            .comments
            .list_comments(&ProjectId::from(project_id))
            .await?,
    ))
}

/// `POST /comments`
pub async fn add_comment(
    State(state): State<AppState>,
    payload: Result<Json<NewCommentRequest>, JsonRejection>,
) -> Result<Json<Comment>, Error> {
    let Json(body) = payload?;

    let (Some(project_id), Some(user_address), Some(content)) = (
        required(body.project_id),
        required(body.user_address),
        required(body.content),
    ) else {
        return Err(Error::missing_fields());
    };

    let comment = state
        .comments
        .add_comment(NewComment {
            project_id: ProjectId::from(project_id),
            user_address: WalletAddress::parse(&user_address)?,
            content,
            timestamp: Utc::now(),
        })
        .await?;

    Ok(Json(comment))
}
