//! HTTP handlers for single files: upload, download, rename, move and the
//! trash lifecycle. Bodies are streamed in both directions.

use crate::{
    errors::AppError,
    handlers::{MoveRequest, MoveResponse, RenameRequest, identity::ActingUser, move_response},
    models::file::FileRecord,
    services::{
        drive_service::DriveService,
        placement::{Placement, PlacementReason},
        trash::{CascadeSummary, PurgeSummary},
        upload::UploadReceipt,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub folder_id: Option<Uuid>,
    /// May carry a relative path (`album/2024/a.jpg`).
    pub filename: String,
}

#[derive(Debug, Deserialize)]
pub struct FolderQuery {
    pub folder_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file: FileRecord,
    pub placement: &'static str,
    pub reason: PlacementReason,
}

impl From<UploadReceipt> for UploadResponse {
    fn from(receipt: UploadReceipt) -> Self {
        let placement = match receipt.placement {
            Placement::Staged { .. } => "staged",
            Placement::Direct => "direct",
        };
        Self {
            file: receipt.file,
            placement,
            reason: receipt.reason,
        }
    }
}

/// `POST /files?filename=..&folder_id=..` with the raw file as the body.
/// `Content-Length`, when present, is used as the size hint.
pub async fn upload_file(
    State(service): State<DriveService>,
    user: ActingUser,
    Query(q): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let size_hint = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let receipt = service
        .uploads()
        .place_upload(user.id(), q.folder_id, &q.filename, size_hint, stream)
        .await?;

    Ok((StatusCode::CREATED, Json(receipt.into())))
}

/// `POST /files/multipart?folder_id=..`. Every part with a file name is
/// stored; file names may carry relative paths for folder uploads.
pub async fn upload_multipart(
    State(service): State<DriveService>,
    user: ActingUser,
    Query(q): Query<FolderQuery>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<UploadResponse>>), AppError> {
    let mut uploaded = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.to_string()))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let stream = field.map(|chunk| chunk.map_err(|err| io::Error::other(err.to_string())));
        let receipt = service
            .uploads()
            .place_upload(user.id(), q.folder_id, &filename, None, stream)
            .await?;
        uploaded.push(UploadResponse::from(receipt));
    }

    if uploaded.is_empty() {
        return Err(AppError::bad_request("no file parts in request"));
    }
    Ok((StatusCode::CREATED, Json(uploaded)))
}

/// `GET /files/{id}`, streamed.
pub async fn download_file(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(file_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (meta, file) = service.open_download(user.id(), file_id).await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    set_file_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `HEAD /files/{id}`: same headers as GET, no body.
pub async fn head_file(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(file_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let meta = service.tree().get_live_file(user.id(), file_id).await?;
    let mut response = Response::new(Body::empty());
    set_file_headers(response.headers_mut(), &meta);
    Ok(response)
}

pub async fn rename_file(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(file_id): Path<Uuid>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<FileRecord>, AppError> {
    let file = service.tree().rename_file(user.id(), file_id, &req.name).await?;
    Ok(Json(file))
}

pub async fn move_file(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(file_id): Path<Uuid>,
    Json(req): Json<MoveRequest>,
) -> Result<Json<MoveResponse>, AppError> {
    let outcome = service
        .tree()
        .move_file(user.id(), file_id, req.destination)
        .await?;
    move_response(outcome)
}

pub async fn trash_file(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(file_id): Path<Uuid>,
) -> Result<Json<CascadeSummary>, AppError> {
    Ok(Json(service.trash().trash_file(user.id(), file_id).await?))
}

pub async fn restore_file(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(file_id): Path<Uuid>,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(service.trash().restore_file(user.id(), file_id).await?))
}

/// `DELETE /files/{id}`: permanent deletion of a trashed file.
pub async fn purge_file(
    State(service): State<DriveService>,
    user: ActingUser,
    Path(file_id): Path<Uuid>,
) -> Result<Json<PurgeSummary>, AppError> {
    Ok(Json(service.trash().purge_file(user.id(), file_id).await?))
}

fn set_file_headers(headers: &mut HeaderMap, meta: &FileRecord) {
    let content_type = mime_guess::from_path(&meta.original_filename)
        .first_or_octet_stream()
        .to_string();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes.max(0)));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.checksum)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) =
        HeaderValue::from_str(&meta.updated_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
    {
        headers.insert(header::LAST_MODIFIED, value);
    }
    headers.insert(header::CONTENT_DISPOSITION, attachment(&meta.original_filename));
}

/// `attachment; filename="..."` with characters outside printable ASCII
/// replaced.
pub(crate) fn attachment(name: &str) -> HeaderValue {
    let safe: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", safe))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
