pub mod account_handlers;
pub mod admin_handlers;
pub mod file_handlers;
pub mod folder_handlers;
pub mod health_handlers;
pub mod identity;
pub mod trash_handlers;

use crate::{errors::AppError, services::tree::MoveOutcome};
use axum::{Json, http::StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `{"name": "..."}` body used by the rename endpoints.
#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub destination: Uuid,
}

/// Files and folders addressed by one batch request.
#[derive(Debug, Default, Deserialize)]
pub struct ItemsRequest {
    #[serde(default)]
    pub file_ids: Vec<Uuid>,
    #[serde(default)]
    pub folder_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct MoveResponse {
    pub outcome: MoveOutcome,
}

/// Turn a rejected move into an error response. A destination owned by
/// someone else is reported as missing.
pub(crate) fn move_response(outcome: MoveOutcome) -> Result<Json<MoveResponse>, AppError> {
    match outcome {
        MoveOutcome::Moved => Ok(Json(MoveResponse { outcome })),
        MoveOutcome::RejectedCycle => Err(AppError::new(
            StatusCode::CONFLICT,
            "a folder cannot be moved into itself or one of its subfolders",
        )),
        MoveOutcome::RejectedCrossOwner => Err(AppError::new(
            StatusCode::NOT_FOUND,
            "destination folder not found",
        )),
    }
}
