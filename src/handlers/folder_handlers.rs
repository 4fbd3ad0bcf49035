//! HTTP handlers for folders: listing, creation, rename, move, trash
//! lifecycle, archive download and search.

use crate::{
    errors::AppError,
    handlers::{
        ItemsRequest, MoveRequest, MoveResponse, RenameRequest, file_handlers::attachment,
        identity::ActingUser, move_response,
    },
    models::folder::Folder,
    services::{
        drive_service::DriveService,
        trash::{CascadeSummary, PurgeSummary},
        tree::{BatchOutcome, FolderListing, SearchResults},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateFolderRequest {
    pub parent_id: Option<Uuid>,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateFolderPathRequest {
    pub parent_id: Option<Uuid>,
    /// Slash separated, e.g. `photos/2024/summer`.
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MoveItemsRequest {
    #[serde(flatten)]
    pub items: ItemsRequest,
    pub destination: Uuid,
}

/// `GET /folders`: the root folder's live contents.
pub async fn list_root(
    State(service): State<DriveService>,
    user: ActingUser,
) -> Result<Json<FolderListing>, AppError> {
    Ok(Json(service.tree().list_children(user.id(), None).await?))
}

pub async fn list_folder(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(folder_id): Path<Uuid>,
) -> Result<Json<FolderListing>, AppError> {
    Ok(Json(
        service.tree().list_children(user.id(), Some(folder_id)).await?,
    ))
}

pub async fn create_folder(
    State(service): State<DriveService>,
    user: ActingUser,
    Json(req): Json<CreateFolderRequest>,
) -> Result<(StatusCode, Json<Folder>), AppError> {
    let folder = service
        .tree()
        .create_folder(user.id(), req.parent_id, &req.name)
        .await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

/// `POST /folders/path`: create every missing folder along `path` and return
/// the deepest one.
pub async fn create_folder_path(
    State(service): State<DriveService>,
    user: ActingUser,
    Json(req): Json<CreateFolderPathRequest>,
) -> Result<(StatusCode, Json<Folder>), AppError> {
    let folder = service
        .tree()
        .create_folder_path(user.id(), req.parent_id, &req.path)
        .await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

pub async fn rename_folder(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(folder_id): Path<Uuid>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<Folder>, AppError> {
    Ok(Json(
        service
            .tree()
            .rename_folder(user.id(), folder_id, &req.name)
            .await?,
    ))
}

pub async fn move_folder(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(folder_id): Path<Uuid>,
    Json(req): Json<MoveRequest>,
) -> Result<Json<MoveResponse>, AppError> {
    let outcome = service
        .tree()
        .move_folder(user.id(), folder_id, req.destination)
        .await?;
    move_response(outcome)
}

/// `POST /items/move`: batch move; rejected items are counted as skipped.
pub async fn move_items(
    State(service): State<DriveService>,
    user: ActingUser,
    Json(req): Json<MoveItemsRequest>,
) -> Result<Json<BatchOutcome>, AppError> {
    Ok(Json(
        service
            .tree()
            .move_items(
                user.id(),
                &req.items.file_ids,
                &req.items.folder_ids,
                req.destination,
            )
            .await?,
    ))
}

pub async fn trash_folder(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(folder_id): Path<Uuid>,
) -> Result<Json<CascadeSummary>, AppError> {
    Ok(Json(service.trash().trash_folder(user.id(), folder_id).await?))
}

pub async fn restore_folder(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(folder_id): Path<Uuid>,
) -> Result<Json<CascadeSummary>, AppError> {
    Ok(Json(
        service.trash().restore_folder(user.id(), folder_id).await?,
    ))
}

pub async fn purge_folder(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(folder_id): Path<Uuid>,
) -> Result<Json<PurgeSummary>, AppError> {
    Ok(Json(service.trash().purge_folder(user.id(), folder_id).await?))
}

/// `GET /archive`: zip of the whole drive.
pub async fn download_root_archive(
    State(service): State<DriveService>,
    user: ActingUser,
) -> Result<Response, AppError> {
    archive_response(&service, user.id(), None).await
}

/// `GET /folders/{id}/archive`: zip of one folder, live items only.
pub async fn download_folder_archive(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(folder_id): Path<Uuid>,
) -> Result<Response, AppError> {
    archive_response(&service, user.id(), Some(folder_id)).await
}

async fn archive_response(
    service: &DriveService,
    owner: Uuid,
    folder_id: Option<Uuid>,
) -> Result<Response, AppError> {
    let archive = service
        .archives()
        .build_folder_archive(owner, folder_id)
        .await?;

    let strategy = serde_json::to_value(archive.strategy)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    let mut response = Response::new(Body::from_stream(archive.stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(header::CONTENT_DISPOSITION, attachment(&archive.file_name));
    if let Ok(value) = HeaderValue::from_str(&strategy) {
        headers.insert(HeaderName::from_static("x-archive-strategy"), value);
    }
    Ok(response)
}

pub async fn search(
    State(service): State<DriveService>,
    user: ActingUser,
    Query(q): Query<SearchQuery>,
) -> Result<Json<SearchResults>, AppError> {
    Ok(Json(service.tree().search(user.id(), &q.q, q.limit).await?))
}

#[cfg(test)]
mod tests {
    use crate::{
        handlers::test_client::{request, send, send_json},
        services::test_support::TestDrive,
    };
    use axum::http::StatusCode;
    use serde_json::json;
    use std::io::{Cursor, Read};

    #[tokio::test]
    async fn create_list_and_search_folders() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("ada", 1000).await;

        let (status, docs) = send_json(
            &drive,
            request("POST", "/folders", user.id, Some(json!({ "name": "Docs" }))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(
            &drive,
            request("POST", "/folders", user.id, Some(json!({ "name": "Docs" }))),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let docs_id: uuid::Uuid = docs["id"].as_str().unwrap().parse().unwrap();
        drive.upload(user.id, Some(docs_id), "report.pdf", b"%PDF").await;

        let (status, listing) = send_json(&drive, request("GET", "/folders", user.id, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing["path"], "/");
        assert_eq!(listing["folders"][0]["name"], "Docs");

        let (_, found) =
            send_json(&drive, request("GET", "/search?q=repo", user.id, None)).await;
        assert_eq!(found["files"][0]["original_filename"], "report.pdf");
    }

    #[tokio::test]
    async fn moving_a_folder_into_its_child_is_a_conflict() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("ada", 1000).await;
        let tree = drive.service.tree();
        let parent = tree.create_folder(user.id, None, "parent").await.unwrap();
        let child = tree.create_folder(user.id, Some(parent.id), "child").await.unwrap();

        let (status, _) = send(
            &drive,
            request(
                "POST",
                &format!("/folders/{}/move", parent.id),
                user.id,
                Some(json!({ "destination": child.id })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn archive_download_is_a_zip_of_live_files() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("ada", 1000).await;
        let folder = drive
            .service
            .tree()
            .create_folder(user.id, None, "album")
            .await
            .unwrap();
        drive.upload(user.id, Some(folder.id), "one.txt", b"one").await;

        let (status, bytes) = send(
            &drive,
            request("GET", &format!("/folders/{}/archive", folder.id), user.id, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut contents = String::new();
        zip.by_name("one.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "one");
    }
}
