//! User accounts: creation, lookup and quota/retention administration.

use crate::{
    models::user::{Role, User},
    services::{
        blob_store::BlobStore,
        error::{DriveError, DriveResult},
        settings::SettingsStore,
        trash::{PurgeSummary, purge_account, remove_payloads},
    },
};
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;
use uuid::Uuid;

const USER_COLUMNS: &str =
    "id, username, role, storage_quota, storage_used, trash_retention_days, created_at";

const MAX_USERNAME_LEN: usize = 64;

pub struct UserDirectory<'a> {
    db: &'a SqlitePool,
}

impl<'a> UserDirectory<'a> {
    pub fn new(db: &'a SqlitePool) -> Self {
        Self { db }
    }

    /// Create a user. Without an explicit quota, `default_user_quota` applies.
    pub async fn create(
        &self,
        username: &str,
        role: Role,
        storage_quota: Option<i64>,
    ) -> DriveResult<User> {
        let username = username.trim();
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            return Err(DriveError::Validation(format!(
                "username must be between 1 and {} characters",
                MAX_USERNAME_LEN
            )));
        }
        let storage_quota = match storage_quota {
            Some(quota) if quota < 0 => {
                return Err(DriveError::Validation("quota cannot be negative".into()));
            }
            Some(quota) => quota,
            None => SettingsStore::new(self.db).snapshot().await?.default_user_quota,
        };

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            role,
            storage_quota,
            storage_used: 0,
            trash_retention_days: None,
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO users (id, username, role, storage_quota, storage_used, trash_retention_days, created_at)
             VALUES (?, ?, ?, ?, 0, NULL, ?)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(user.role)
        .bind(user.storage_quota)
        .bind(user.created_at)
        .execute(self.db)
        .await
        {
            Ok(_) => Ok(user),
            Err(err) if is_unique_violation(&err) => Err(DriveError::Conflict(format!(
                "username `{}` is already taken",
                username
            ))),
            Err(err) => Err(DriveError::Sqlx(err)),
        }
    }

    pub async fn get(&self, user_id: Uuid) -> DriveResult<User> {
        let mut conn = self.db.acquire().await?;
        fetch_user(&mut conn, user_id).await
    }

    pub async fn list(&self) -> DriveResult<Vec<User>> {
        Ok(sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users ORDER BY username",
            USER_COLUMNS
        ))
        .fetch_all(self.db)
        .await?)
    }

    /// Change the quota ceiling. Lowering it below current usage is allowed;
    /// further uploads are then rejected until usage drops.
    pub async fn set_quota(&self, user_id: Uuid, storage_quota: i64) -> DriveResult<User> {
        if storage_quota < 0 {
            return Err(DriveError::Validation("quota cannot be negative".into()));
        }
        let result = sqlx::query("UPDATE users SET storage_quota = ? WHERE id = ?")
            .bind(storage_quota)
            .bind(user_id)
            .execute(self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DriveError::NotFound("user"));
        }
        self.get(user_id).await
    }

    /// Set or clear (with `None`) the personal trash retention override.
    pub async fn set_retention(&self, user_id: Uuid, days: Option<i64>) -> DriveResult<User> {
        if matches!(days, Some(d) if d <= 0) {
            return Err(DriveError::Validation(
                "retention must be at least one day".into(),
            ));
        }
        let result = sqlx::query("UPDATE users SET trash_retention_days = ? WHERE id = ?")
            .bind(days)
            .bind(user_id)
            .execute(self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DriveError::NotFound("user"));
        }
        self.get(user_id).await
    }

    /// Delete a user together with every file and folder they own, live or
    /// trashed. Rows go in one transaction; payloads are removed afterwards,
    /// best-effort.
    pub async fn delete(&self, blobs: &BlobStore, user_id: Uuid) -> DriveResult<PurgeSummary> {
        let mut tx = self.db.begin().await?;
        let user = fetch_user(&mut tx, user_id).await?;
        let rows = purge_account(&mut tx, user_id).await?;
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let summary = remove_payloads(blobs, rows).await;
        info!("deleted user {} ({}): {:?}", user.username, user_id, summary);
        Ok(summary)
    }
}

/// Load a user on an existing connection or transaction.
pub(crate) async fn fetch_user(conn: &mut SqliteConnection, user_id: Uuid) -> DriveResult<User> {
    sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
        .bind(user_id)
        .fetch_one(conn)
        .await
        .map_err(|err| DriveError::from_lookup(err, "user"))
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
