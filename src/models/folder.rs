//! Represents a node of a user's folder tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A folder. `parent_id == None` marks the user's single root folder.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Folder {
    pub id: Uuid,

    /// Display name, unique among live siblings.
    pub name: String,

    pub parent_id: Option<Uuid>,

    /// Owner. Always equal to the parent folder's owner.
    pub user_id: Uuid,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Soft-delete flag. `true` exactly when `deleted_at` is set.
    pub is_deleted: bool,

    pub deleted_at: Option<DateTime<Utc>>,

    /// When the automatic sweep may purge this folder.
    pub expiry_date: Option<DateTime<Utc>>,

    /// Identifier shared by every item trashed in the same cascade.
    #[serde(skip_serializing)]
    pub trash_batch: Option<Uuid>,
}

impl Folder {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
