//! Represents an uploaded file stored in a folder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata for a single stored file. The payload lives on disk at
/// `storage_path`; this struct never carries content bytes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    pub id: Uuid,

    /// Server-generated, collision-free name of the payload on disk.
    #[serde(skip_serializing)]
    pub stored_filename: String,

    /// User-facing name. De-duplicated with a timestamp suffix on upload.
    pub original_filename: String,

    /// Physical location of the payload.
    #[serde(skip_serializing)]
    pub storage_path: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Coarse category (image, video, document, ...).
    pub file_type: String,

    /// Hex MD5 of the payload, used as the download ETag.
    pub checksum: String,

    pub folder_id: Uuid,

    /// Owner. Always equal to the owning folder's owner.
    pub user_id: Uuid,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,

    #[serde(skip_serializing)]
    pub trash_batch: Option<Uuid>,
}
