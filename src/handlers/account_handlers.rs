//! The caller's own account: profile, quota usage and recent activity.

use crate::{
    errors::AppError,
    handlers::identity::ActingUser,
    models::{activity::Activity, user::User},
    services::{drive_service::DriveService, quota::QuotaUsage},
};
use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;

const DEFAULT_ACTIVITY_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

pub async fn me(user: ActingUser) -> Json<User> {
    Json(user.0)
}

pub async fn quota_usage(
    State(service): State<DriveService>,
    user: ActingUser,
) -> Result<Json<QuotaUsage>, AppError> {
    Ok(Json(service.quota().usage(user.id()).await?))
}

pub async fn my_activity(
    State(service): State<DriveService>,
    user: ActingUser,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<Activity>>, AppError> {
    let limit = q.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    Ok(Json(
        service.activity().recent_for_user(user.id(), limit).await?,
    ))
}
