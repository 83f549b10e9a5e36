use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::required;
use crate::{error::Error, identity::SignatureStatus, state::AppState, types::WalletAddress};

#[derive(Debug, Deserialize)]
pub struct VerifySignatureRequest {
    pub address: Option<String>,
    pub signature: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifySignatureResponse {
    pub success: bool,
    pub verified: bool,
    pub address: WalletAddress,
}

/// `POST /auth/verify-signature`
pub async fn verify_signature(
    State(state): State<AppState>,
    payload: Result<Json<VerifySignatureRequest>, JsonRejection>,
) -> Result<Json<VerifySignatureResponse>, Error> {
    let Json(body) = payload?;

    let (Some(address), Some(signature), Some(message)) = (
        required(body.address),
        required(body.signature),
        body.message.filter(|m| !m.is_empty()),
    ) else {
        return Err(Error::missing_fields());
    };

    let address = WalletAddress::parse(&address)?;
    state.identity.verify(&address, &message, &signature).await?;

    Ok(Json(VerifySignatureResponse {
        success: true,
        verified: true,
        address,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub address: Option<String>,
}

/// `GET /auth/signature-status?address=`
pub async fn signature_status(
    State(state): State<AppState>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<SignatureStatus>, Error> {
    let Query(query) = query?;
    let address = required(query.address)
        .ok_or_else(|| Error::InvalidArgument("Address is required".to_string()))?;

    let status = state
        .identity
        .status_at(&WalletAddress::parse(&address)?, Utc::now())
        .await?;

    Ok(Json(status))
}
