//! Append-only audit trail entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A recorded action. System-initiated work (the expiry sweep) has no
/// `user_id` and `actor == "system"`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Activity {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub actor: String,

    /// Action name, e.g. `upload`, `trash_folder`, `auto_cleanup`.
    pub action: String,

    pub target: Option<String>,
    pub details: Option<String>,
    pub file_size: Option<i64>,
    pub created_at: DateTime<Utc>,
}
