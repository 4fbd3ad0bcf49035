//! Administration: accounts, quotas, system settings, manual sweeps and the
//! system activity feed. Every handler requires [`AdminUser`].

use crate::{
    errors::AppError,
    handlers::{account_handlers::LimitQuery, identity::AdminUser},
    models::{
        activity::Activity,
        setting::SystemSetting,
        user::{Role, User},
    },
    services::{
        activity::{Actor, NewActivity},
        drive_service::DriveService,
        trash::PurgeSummary,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub role: Option<Role>,
    /// Defaults to the `default_user_quota` setting.
    pub storage_quota: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct QuotaRequest {
    pub storage_quota: i64,
}

/// `{"days": null}` clears the personal override.
#[derive(Debug, Deserialize)]
pub struct RetentionRequest {
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SettingRequest {
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct RecomputeResponse {
    pub user_id: Uuid,
    pub storage_used: i64,
}

pub async fn list_users(
    State(service): State<DriveService>,
    _admin: AdminUser,
) -> Result<Json<Vec<User>>, AppError> {
    Ok(Json(service.users().list().await?))
}

pub async fn create_user(
    State(service): State<DriveService>,
    _admin: AdminUser,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), AppError> {
    let user = service
        .users()
        .create(&req.username, req.role.unwrap_or(Role::User), req.storage_quota)
        .await?;
    info!("created user {} ({})", user.username, user.id);
    Ok((StatusCode::CREATED, Json(user)))
}

/// `DELETE /admin/users/{id}`: remove an account with all of its files and
/// folders. An admin cannot delete their own account.
pub async fn delete_user(
    State(service): State<DriveService>,
    AdminUser(admin): AdminUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<PurgeSummary>, AppError> {
    if user_id == admin.id {
        return Err(AppError::bad_request("cannot delete your own account"));
    }
    let user = service.users().get(user_id).await?;
    let summary = service.users().delete(&service.blobs, user_id).await?;
    service
        .activity()
        .record(
            NewActivity::new(Actor::User(admin.id), "delete_user")
                .target(user.username)
                .details(format!(
                    "{} folders, {} files",
                    summary.folders_purged, summary.files_purged
                ))
                .file_size(summary.bytes_reclaimed),
        )
        .await;
    Ok(Json(summary))
}

pub async fn set_quota(
    State(service): State<DriveService>,
    _admin: AdminUser,
    Path(user_id): Path<Uuid>,
    Json(req): Json<QuotaRequest>,
) -> Result<Json<User>, AppError> {
    Ok(Json(
        service.users().set_quota(user_id, req.storage_quota).await?,
    ))
}

pub async fn set_retention(
    State(service): State<DriveService>,
    _admin: AdminUser,
    Path(user_id): Path<Uuid>,
    Json(req): Json<RetentionRequest>,
) -> Result<Json<User>, AppError> {
    Ok(Json(service.users().set_retention(user_id, req.days).await?))
}

/// `POST /admin/users/{id}/recompute`: reconcile the cached usage counter
/// with the stored files.
pub async fn recompute_quota(
    State(service): State<DriveService>,
    _admin: AdminUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<RecomputeResponse>, AppError> {
    let storage_used = service.quota().recompute(user_id).await?;
    Ok(Json(RecomputeResponse {
        user_id,
        storage_used,
    }))
}

pub async fn list_settings(
    State(service): State<DriveService>,
    _admin: AdminUser,
) -> Result<Json<Vec<SystemSetting>>, AppError> {
    Ok(Json(service.settings().list().await?))
}

pub async fn update_setting(
    State(service): State<DriveService>,
    AdminUser(admin): AdminUser,
    Path(key): Path<String>,
    Json(req): Json<SettingRequest>,
) -> Result<Json<SystemSetting>, AppError> {
    let setting = service.settings().update(&key, &req.value).await?;
    info!("setting {} changed to {} by {}", setting.key, setting.value, admin.username);
    service
        .activity()
        .record(
            NewActivity::new(Actor::User(admin.id), "settings_update")
                .target(setting.key.clone())
                .details(setting.value.clone()),
        )
        .await;
    Ok(Json(setting))
}

/// `POST /admin/sweep`: run the expired-trash sweep now.
pub async fn run_sweep(
    State(service): State<DriveService>,
    _admin: AdminUser,
) -> Result<Json<PurgeSummary>, AppError> {
    Ok(Json(service.trash().sweep_expired(Utc::now()).await?))
}

/// `GET /admin/activity`: system-attributed events, newest first.
pub async fn system_activity(
    State(service): State<DriveService>,
    _admin: AdminUser,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<Activity>>, AppError> {
    Ok(Json(
        service.activity().recent_system(q.limit.unwrap_or(50)).await?,
    ))
}

#[cfg(test)]
mod tests {
    use crate::{
        handlers::test_client::{request, send, send_json},
        services::{settings::KEY_MAX_UPLOAD_SIZE, test_support::TestDrive},
    };
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn regular_users_are_forbidden() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("ada", 1000).await;
        let (status, _) = send(&drive, request("GET", "/admin/users", user.id, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_creates_users_and_sets_quota() {
        let drive = TestDrive::new().await;
        let admin = drive.admin("root").await;

        let (status, created) = send_json(
            &drive,
            request(
                "POST",
                "/admin/users",
                admin.id,
                Some(json!({ "username": "bob", "storage_quota": 2048 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["role"], "user");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, updated) = send_json(
            &drive,
            request(
                "PUT",
                &format!("/admin/users/{}/quota", id),
                admin.id,
                Some(json!({ "storage_quota": 4096 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["storage_quota"], 4096);

        let (status, _) = send(
            &drive,
            request(
                "POST",
                "/admin/users",
                admin.id,
                Some(json!({ "username": "bob" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn admins_delete_other_accounts_but_not_their_own() {
        let drive = TestDrive::new().await;
        let admin = drive.admin("root").await;
        let user = drive.user_with_quota("ada", 1000).await;
        drive.upload(user.id, None, "a.bin", &[1u8; 8]).await;

        let (status, _) = send(
            &drive,
            request("DELETE", &format!("/admin/users/{}", admin.id), admin.id, None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send_json(
            &drive,
            request("DELETE", &format!("/admin/users/{}", user.id), admin.id, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["files_purged"], 1);
        assert_eq!(body["bytes_reclaimed"], 8);

        let (status, _) = send(&drive, request("GET", "/me", user.id, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(
            &drive,
            request("DELETE", &format!("/admin/users/{}", user.id), admin.id, None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn setting_updates_are_type_checked_and_audited() {
        let drive = TestDrive::new().await;
        let admin = drive.admin("root").await;
        let uri = format!("/admin/settings/{}", KEY_MAX_UPLOAD_SIZE);

        let (status, _) = send(
            &drive,
            request("PUT", &uri, admin.id, Some(json!({ "value": "lots" }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, setting) = send_json(
            &drive,
            request("PUT", &uri, admin.id, Some(json!({ "value": "1024" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(setting["value"], "1024");

        let activity = drive
            .service
            .activity()
            .recent_for_user(admin.id, 10)
            .await
            .unwrap();
        assert_eq!(activity[0].action, "settings_update");
        assert_eq!(
            drive.service.settings().snapshot().await.unwrap().max_upload_size,
            1024
        );
    }

    #[tokio::test]
    async fn recompute_reports_stored_bytes() {
        let drive = TestDrive::new().await;
        let admin = drive.admin("root").await;
        let user = drive.user_with_quota("ada", 1000).await;
        drive.upload(user.id, None, "a.bin", &[0u8; 40]).await;
        drive.set_used(user.id, 999).await;

        let (status, body) = send_json(
            &drive,
            request(
                "POST",
                &format!("/admin/users/{}/recompute", user.id),
                admin.id,
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storage_used"], 40);
    }
}
