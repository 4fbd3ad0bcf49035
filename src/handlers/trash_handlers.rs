//! Trash listing and batch lifecycle endpoints.

use crate::{
    errors::AppError,
    handlers::{ItemsRequest, identity::ActingUser},
    services::{
        drive_service::DriveService,
        trash::{PurgeSummary, TrashListing},
        tree::BatchOutcome,
    },
};
use axum::{Json, extract::State};

/// `GET /trash`: top-level trashed items with their expiry dates.
pub async fn list_trash(
    State(service): State<DriveService>,
    user: ActingUser,
) -> Result<Json<TrashListing>, AppError> {
    Ok(Json(service.trash().list_trash(user.id()).await?))
}

/// `DELETE /trash`: purge everything in the caller's trash.
pub async fn empty_trash(
    State(service): State<DriveService>,
    user: ActingUser,
) -> Result<Json<PurgeSummary>, AppError> {
    Ok(Json(service.trash().empty_trash(user.id()).await?))
}

/// `POST /trash/items`
pub async fn trash_items(
    State(service): State<DriveService>,
    user: ActingUser,
    Json(req): Json<ItemsRequest>,
) -> Result<Json<BatchOutcome>, AppError> {
    Ok(Json(
        service
            .trash()
            .trash_items(user.id(), &req.file_ids, &req.folder_ids)
            .await?,
    ))
}

/// `POST /trash/restore`
pub async fn restore_items(
    State(service): State<DriveService>,
    user: ActingUser,
    Json(req): Json<ItemsRequest>,
) -> Result<Json<BatchOutcome>, AppError> {
    Ok(Json(
        service
            .trash()
            .restore_items(user.id(), &req.file_ids, &req.folder_ids)
            .await?,
    ))
}
