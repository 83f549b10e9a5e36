use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::required;
use crate::{
    error::Error,
    state::AppState,
    types::{Backer, MilestoneDraft, Project, ProjectDraft, ProjectId, ProjectPatch, WalletAddress},
};

#[derive(Debug, Deserialize)]
pub struct ProjectQuery {
    pub id: Option<String>,
}

impl ProjectQuery {
    fn require_id(self) -> Result<ProjectId, Error> {
        required(self.id)
            .map(ProjectId::from)
            .ok_or_else(|| Error::InvalidArgument("Project ID is required".to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub funding_goal: Option<f64>,
    pub creator: Option<String>,
    pub creator_name: Option<String>,
    pub creator_bio: Option<String>,
    pub duration: Option<u32>,
    pub image: Option<String>,
    #[serde(default)]
    pub milestones: Vec<MilestoneDraft>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProjectRequest {
    #[serde(default)]
    pub add_backer: bool,
    pub backer_address: Option<String>,
    pub amount: Option<f64>,
    pub transaction_hash: Option<String>,
    #[serde(flatten)]
    pub patch: ProjectPatch,
}

/// `GET /projects` lists everything; `GET /projects?id=` returns one document.
pub async fn get_projects(
    State(state): State<AppState>,
    query: Result<Query<ProjectQuery>, QueryRejection>,
) -> Result<Response, Error> {
    let Query(query) = query?;

    match required(query.id) {
        Some(id) => {
            let project = state
                .projects
                .get_project(&ProjectId::from(id))
                .await?
                .ok_or_else(|| Error::NotFound("Project not found".to_string()))?;
            Ok(Json(project).into_response())
        }
        None => Ok(Json(state.projects.list_projects().await?).into_response()),
    }
}

pub async fn create_project(
    State(state): State<AppState>,
    payload: Result<Json<CreateProjectRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let Json(body) = payload?;

    let (Some(title), Some(description), Some(funding_goal), Some(creator)) = (
        required(body.title),
        required(body.description),
        body.funding_goal.filter(|g| g.is_finite() && *g > 0.0),
        required(body.creator),
    ) else {
        return Err(Error::InvalidArgument(
            "Missing required fields (title, description, fundingGoal, creator)".to_string(),
        ));
    };

    let project = Project::from_draft(
        ProjectDraft {
            title,
            description,
            category: body.category,
            funding_goal,
            creator: WalletAddress::parse(&creator)?,
            creator_name: body.creator_name,
            creator_bio: body.creator_bio,
            duration: body.duration,
            image: body.image,
            milestones: body.milestones,
        },
        Utc::now(),
    );
    state.projects.insert_project(&project).await?;

    info!(project_id = %project.id, creator = %project.creator_address, "Project created");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Project created successfully",
            "id": project.id,
            "project": project,
        })),
    )
        .into_response())
}

/// `PATCH /projects?id=` either registers a backer (`addBacker: true`) or
/// updates descriptive fields.
pub async fn update_project(
    State(state): State<AppState>,
    query: Result<Query<ProjectQuery>, QueryRejection>,
    payload: Result<Json<UpdateProjectRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let Query(query) = query?;
    let id = query.require_id()?;
    let Json(body) = payload?;

    if body.add_backer {
        let (Some(address), Some(amount)) = (
            required(body.backer_address),
            body.amount.filter(|a| a.is_finite() && *a > 0.0),
        ) else {
            return Err(Error::InvalidArgument(
                "Backer address and a positive amount are required".to_string(),
            ));
        };

        let backer = Backer {
            address: WalletAddress::parse(&address)?,
            amount,
            timestamp: Utc::now(),
            transaction_hash: required(body.transaction_hash).map(|h| h.trim().to_string()),
        };
        info!(project_id = %id, backer = %backer.address, amount, "Backer added");
        state.projects.add_backer(&id, backer).await?;

        return Ok(Json(json!({ "message": "Backer added successfully" })).into_response());
    }

    if body.patch.is_empty() {
        return Ok(Json(json!({ "message": "No fields to update" })).into_response());
    }

    let updated = state
        .projects
        .update_details(&id, &body.patch, Utc::now())
        .await?;

    Ok(Json(json!({
        "message": "Project updated successfully",
        "updated": updated,
    }))
    .into_response())
}

pub async fn delete_project(
    State(state): State<AppState>,
    query: Result<Query<ProjectQuery>, QueryRejection>,
) -> Result<Response, Error> {
    let Query(query) = query?;
    let id = query.require_id()?;

    if !state.projects.delete_project(&id).await? {
        return Err(Error::NotFound("Project not found".to_string()));
    }

    info!(project_id = %id, "Project deleted");
    Ok(Json(json!({ "message": "Project deleted successfully" })).into_response())
}
