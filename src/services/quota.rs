//! Quota ledger: per-user `storage_used` against `storage_quota`.
//!
//! Trashed files keep counting until they are purged, because their bytes
//! are still on disk. Only purge releases quota.

use crate::services::{
    error::{DriveError, DriveResult},
    users::fetch_user,
};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

/// Usage report for one user.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    pub quota: i64,
    pub used: i64,
    pub available: i64,
    pub percent: f64,
}

impl QuotaUsage {
    fn new(quota: i64, used: i64) -> Self {
        let percent = if quota > 0 {
            (used as f64 / quota as f64) * 100.0
        } else {
            100.0
        };
        Self {
            quota,
            used,
            available: (quota - used).max(0),
            percent,
        }
    }
}

pub struct QuotaLedger<'a> {
    db: &'a SqlitePool,
}

impl<'a> QuotaLedger<'a> {
    pub fn new(db: &'a SqlitePool) -> Self {
        Self { db }
    }

    /// `storage_used + additional <= storage_quota`.
    pub async fn has_space_for(&self, user_id: Uuid, additional: u64) -> DriveResult<bool> {
        Ok(self.usage(user_id).await?.fits(additional))
    }

    pub async fn usage(&self, user_id: Uuid) -> DriveResult<QuotaUsage> {
        let mut conn = self.db.acquire().await?;
        let user = fetch_user(&mut conn, user_id).await?;
        Ok(QuotaUsage::new(user.storage_quota, user.storage_used))
    }

    /// Recalculate `storage_used` from the file rows still present for the
    /// user (live and trashed). Idempotent; a single statement, so it never
    /// observes half of another transaction.
    pub async fn recompute(&self, user_id: Uuid) -> DriveResult<i64> {
        let used = sqlx::query_scalar::<_, i64>(
            "UPDATE users
             SET storage_used = (SELECT COALESCE(SUM(size_bytes), 0) FROM files WHERE user_id = users.id)
             WHERE id = ?
             RETURNING storage_used",
        )
        .bind(user_id)
        .fetch_one(self.db)
        .await
        .map_err(|err| DriveError::from_lookup(err, "user"))?;

        info!("recomputed storage usage for user {}: {} bytes", user_id, used);
        Ok(used)
    }
}

impl QuotaUsage {
    pub fn fits(&self, additional: u64) -> bool {
        i64::try_from(additional)
            .ok()
            .and_then(|add| self.used.checked_add(add))
            .map(|total| total <= self.quota)
            .unwrap_or(false)
    }
}

/// Atomically add `bytes` to the user's usage if it stays within quota.
///
/// Runs on the caller's transaction so the increment commits together with
/// the file row it pays for.
pub(crate) async fn reserve(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    bytes: u64,
) -> DriveResult<()> {
    let amount = i64::try_from(bytes).map_err(|_| DriveError::QuotaExceeded {
        requested: bytes,
        available: 0,
    })?;

    let result = sqlx::query(
        "UPDATE users SET storage_used = storage_used + ?
         WHERE id = ? AND storage_used + ? <= storage_quota",
    )
    .bind(amount)
    .bind(user_id)
    .bind(amount)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        let user = fetch_user(conn, user_id).await?;
        return Err(DriveError::QuotaExceeded {
            requested: bytes,
            available: (user.storage_quota - user.storage_used).max(0) as u64,
        });
    }
    debug!("reserved {} bytes for user {}", bytes, user_id);
    Ok(())
}

/// Subtract purged bytes from the user's usage, never going below zero.
pub(crate) async fn release(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    bytes: i64,
) -> DriveResult<()> {
    if bytes <= 0 {
        return Ok(());
    }
    sqlx::query("UPDATE users SET storage_used = MAX(storage_used - ?, 0) WHERE id = ?")
        .bind(bytes)
        .bind(user_id)
        .execute(conn)
        .await?;
    debug!("released {} bytes for user {}", bytes, user_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::TestDrive;

    #[test]
    fn usage_fits_is_inclusive_of_the_ceiling() {
        let usage = QuotaUsage::new(1000, 900);
        assert!(usage.fits(100));
        assert!(!usage.fits(101));
        assert_eq!(usage.available, 100);
        assert!((usage.percent - 90.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn reserve_rejects_beyond_quota_and_leaves_usage_unchanged() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("dana", 1000).await;
        drive.set_used(user.id, 900).await;

        let mut tx = drive.service.db.begin().await.unwrap();
        reserve(&mut tx, user.id, 50).await.unwrap();
        let err = reserve(&mut tx, user.id, 100).await.unwrap_err();
        assert!(matches!(
            err,
            DriveError::QuotaExceeded { requested: 100, available: 50 }
        ));
        tx.commit().await.unwrap();

        let usage = QuotaLedger::new(&drive.service.db).usage(user.id).await.unwrap();
        assert_eq!(usage.used, 950);
    }

    #[tokio::test]
    async fn release_never_goes_negative() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("erin", 1000).await;
        drive.set_used(user.id, 10).await;

        let mut tx = drive.service.db.begin().await.unwrap();
        release(&mut tx, user.id, 500).await.unwrap();
        tx.commit().await.unwrap();

        let ledger = QuotaLedger::new(&drive.service.db);
        assert_eq!(ledger.usage(user.id).await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn recompute_corrects_drift() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("frank", 10_000).await;
        drive.upload(user.id, None, "a.txt", b"0123456789").await;
        drive.upload(user.id, None, "b.txt", b"01234").await;
        drive.set_used(user.id, 9_999).await;

        let ledger = QuotaLedger::new(&drive.service.db);
        assert_eq!(ledger.recompute(user.id).await.unwrap(), 15);
        assert_eq!(ledger.usage(user.id).await.unwrap().used, 15);
        // idempotent
        assert_eq!(ledger.recompute(user.id).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn has_space_for_reads_current_counter() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("gina", 100).await;
        let ledger = QuotaLedger::new(&drive.service.db);

        assert!(ledger.has_space_for(user.id, 100).await.unwrap());
        assert!(!ledger.has_space_for(user.id, 101).await.unwrap());
    }
}
