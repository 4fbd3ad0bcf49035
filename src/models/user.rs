//! Represents an account that owns a folder tree and a storage quota.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Account role. Admins may manage users, settings and run sweeps.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// A drive user with a fixed quota ceiling and a cached usage counter.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct User {
    /// Unique identifier for this user.
    pub id: Uuid,

    /// Login name, unique across the instance.
    pub username: String,

    pub role: Role,

    /// Maximum bytes this user may hold (live + trashed files).
    pub storage_quota: i64,

    /// Cached counter of bytes held. Reconciled by `QuotaLedger::recompute`.
    pub storage_used: i64,

    /// Personal retention override for the trash, in days.
    pub trash_retention_days: Option<i64>,

    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
