use std::time::Duration;

use axum::{
    http::{header::CONTENT_TYPE, Method},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

pub mod auth;
pub mod comments;
pub mod projects;
pub mod vote;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(health))
        .route(
            "/projects",
            get(projects::get_projects)
                .post(projects::create_project)
                .patch(projects::update_project)
                .delete(projects::delete_project),
        )
        .route("/projects/vote", post(vote::cast_vote))
        .route("/projects/upvote", post(vote::toggle_upvote))
        .route("/auth/verify-signature", post(auth::verify_signature))
        .route("/auth/signature-status", get(auth::signature_status))
        .route(
            "/comments",
            get(comments::list_comments).post(comments::add_comment),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Treat absent and empty strings alike, as the web client sends both.
pub(crate) fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
