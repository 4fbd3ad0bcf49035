//! Defines routes for the drive API.
//!
//! ## Structure
//! - **Files**
//!   - `POST   /files?filename=&folder_id=` — upload, raw body
//!   - `POST   /files/multipart?folder_id=` — upload one or more multipart parts
//!   - `GET    /files/{id}` — download; `HEAD` for metadata only
//!   - `PATCH  /files/{id}` — rename
//!   - `POST   /files/{id}/move` | `/trash` | `/restore`
//!   - `DELETE /files/{id}` — permanent deletion (trashed files only)
//!
//! - **Folders**
//!   - `GET    /folders` — root listing; `POST /folders` — create
//!   - `POST   /folders/path` — create a nested path
//!   - `GET    /folders/{id}`, `PATCH`, `DELETE`
//!   - `POST   /folders/{id}/move` | `/trash` | `/restore`
//!   - `GET    /folders/{id}/archive`, `GET /archive` — zip download
//!   - `POST   /items/move`, `GET /search?q=`
//!
//! - **Trash**: `GET|DELETE /trash`, `POST /trash/items`, `POST /trash/restore`
//! - **Account**: `GET /me`, `/me/quota`, `/me/activity`
//! - **Admin**: `/admin/users`, `DELETE /admin/users/{id}`, `/admin/settings`, `/admin/sweep`, `/admin/activity`

use crate::{
    handlers::{
        account_handlers::{me, my_activity, quota_usage},
        admin_handlers::{
            create_user, delete_user, list_settings, list_users, recompute_quota, run_sweep, set_quota,
            set_retention, system_activity, update_setting,
        },
        file_handlers::{
            download_file, head_file, move_file, purge_file, rename_file, restore_file,
            trash_file, upload_file, upload_multipart,
        },
        folder_handlers::{
            create_folder, create_folder_path, download_folder_archive, download_root_archive,
            list_folder, list_root, move_folder, move_items, purge_folder, rename_folder,
            restore_folder, search, trash_folder,
        },
        health_handlers::{healthz, readyz},
        trash_handlers::{empty_trash, list_trash, restore_items, trash_items},
    },
    services::drive_service::DriveService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
};

/// Build the router. Upload size is enforced by the upload service from the
/// `max_upload_size` setting, so axum's default body limit is lifted.
pub fn routes() -> Router<DriveService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // files
        .route("/files", post(upload_file))
        .route("/files/multipart", post(upload_multipart))
        .route(
            "/files/{id}",
            get(download_file)
                .head(head_file)
                .patch(rename_file)
                .delete(purge_file),
        )
        .route("/files/{id}/move", post(move_file))
        .route("/files/{id}/trash", post(trash_file))
        .route("/files/{id}/restore", post(restore_file))
        // folders
        .route("/folders", get(list_root).post(create_folder))
        .route("/folders/path", post(create_folder_path))
        .route(
            "/folders/{id}",
            get(list_folder).patch(rename_folder).delete(purge_folder),
        )
        .route("/folders/{id}/move", post(move_folder))
        .route("/folders/{id}/trash", post(trash_folder))
        .route("/folders/{id}/restore", post(restore_folder))
        .route("/folders/{id}/archive", get(download_folder_archive))
        .route("/archive", get(download_root_archive))
        .route("/items/move", post(move_items))
        .route("/search", get(search))
        // trash
        .route("/trash", get(list_trash).delete(empty_trash))
        .route("/trash/items", post(trash_items))
        .route("/trash/restore", post(restore_items))
        // account
        .route("/me", get(me))
        .route("/me/quota", get(quota_usage))
        .route("/me/activity", get(my_activity))
        // admin
        .route("/admin/users", get(list_users).post(create_user))
        .route("/admin/users/{id}", delete(delete_user))
        .route("/admin/users/{id}/quota", put(set_quota))
        .route("/admin/users/{id}/retention", put(set_retention))
        .route("/admin/users/{id}/recompute", post(recompute_quota))
        .route("/admin/settings", get(list_settings))
        .route("/admin/settings/{key}", put(update_setting))
        .route("/admin/sweep", post(run_sweep))
        .route("/admin/activity", get(system_activity))
        .layer(DefaultBodyLimit::disable())
}
