//! Append-only audit sink.
//!
//! Recording is fire-and-forget from the caller's point of view: a failed
//! insert is logged and swallowed, it never fails the operation it describes.

use crate::models::activity::Activity;
use crate::services::error::DriveResult;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::warn;
use uuid::Uuid;

/// Who performed an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Actor {
    User(Uuid),
    /// Background work such as the expiry sweep.
    System,
}

/// An activity about to be recorded.
#[derive(Clone, Debug)]
pub struct NewActivity {
    pub actor: Actor,
    pub action: &'static str,
    pub target: Option<String>,
    pub details: Option<String>,
    pub file_size: Option<i64>,
}

impl NewActivity {
    pub fn new(actor: Actor, action: &'static str) -> Self {
        Self {
            actor,
            action,
            target: None,
            details: None,
            file_size: None,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn file_size(mut self, size: i64) -> Self {
        self.file_size = Some(size);
        self
    }
}

pub struct ActivityLog<'a> {
    db: &'a SqlitePool,
}

impl<'a> ActivityLog<'a> {
    pub fn new(db: &'a SqlitePool) -> Self {
        Self { db }
    }

    pub async fn record(&self, event: NewActivity) {
        let (user_id, actor) = match event.actor {
            Actor::User(id) => (Some(id), "user"),
            Actor::System => (None, "system"),
        };

        let result = sqlx::query(
            "INSERT INTO activities (id, user_id, actor, action, target, details, file_size, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(actor)
        .bind(event.action)
        .bind(&event.target)
        .bind(&event.details)
        .bind(event.file_size)
        .bind(Utc::now())
        .execute(self.db)
        .await;

        if let Err(err) = result {
            warn!("failed to record `{}` activity: {}", event.action, err);
        }
    }

    /// Most recent activities of a user, newest first.
    pub async fn recent_for_user(&self, user_id: Uuid, limit: i64) -> DriveResult<Vec<Activity>> {
        Ok(sqlx::query_as::<_, Activity>(
            "SELECT id, user_id, actor, action, target, details, file_size, created_at
             FROM activities WHERE user_id = ?
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(self.db)
        .await?)
    }

    /// Most recent system-attributed activities, newest first.
    pub async fn recent_system(&self, limit: i64) -> DriveResult<Vec<Activity>> {
        Ok(sqlx::query_as::<_, Activity>(
            "SELECT id, user_id, actor, action, target, details, file_size, created_at
             FROM activities WHERE actor = 'system'
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(self.db)
        .await?)
    }
}
