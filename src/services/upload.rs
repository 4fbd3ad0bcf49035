//! Upload placement: admission checks, write path selection, and the
//! transactional commit of quota plus file row.

use crate::{
    models::file::FileRecord,
    services::{
        activity::{ActivityLog, Actor, NewActivity},
        blob_store::{BlobStore, WrittenBlob},
        error::{DriveError, DriveResult},
        names::{file_category, sanitize_name, stored_name, timestamped_name},
        placement::{Placement, PlacementReason, PlacementSelector, SpaceProbe},
        quota::{self, QuotaLedger},
        settings::SettingsStore,
        tree::{ensure_folder_path, fetch_folder, live_file_named, resolve_live_folder},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use sqlx::SqlitePool;
use std::io;
use tracing::{info, warn};
use uuid::Uuid;

/// A committed upload and how its bytes travelled.
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub file: FileRecord,
    pub placement: Placement,
    pub reason: PlacementReason,
}

pub struct UploadPlacer<'a> {
    db: &'a SqlitePool,
    blobs: &'a BlobStore,
    probe: &'a dyn SpaceProbe,
}

impl<'a> UploadPlacer<'a> {
    pub fn new(db: &'a SqlitePool, blobs: &'a BlobStore, probe: &'a dyn SpaceProbe) -> Self {
        Self { db, blobs, probe }
    }

    /// Store `stream` as `filename` in `folder_id` (the root when `None`).
    ///
    /// `filename` may carry a relative path (`album/2024/a.jpg`), in which
    /// case the missing folders are created before any bytes are read; those
    /// folders are kept even if the upload itself fails. The file row, the
    /// quota charge and the payload are all-or-nothing.
    ///
    /// The destination folder is checked again when the row is inserted, so a
    /// folder trashed while the bytes stream in never gains a live file.
    pub async fn place_upload<S>(
        &self,
        owner: Uuid,
        folder_id: Option<Uuid>,
        filename: &str,
        size_hint: Option<u64>,
        stream: S,
    ) -> DriveResult<UploadReceipt>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let settings = SettingsStore::new(self.db).snapshot().await?;

        let (dir, base) = split_relative(filename);
        let name = sanitize_name(base)?;
        if !settings.allowed_types.permits(&name) {
            return Err(DriveError::TypeNotAllowed(name));
        }
        if let Some(size) = size_hint {
            if size > settings.max_upload_size {
                return Err(DriveError::TooLarge {
                    size,
                    limit: settings.max_upload_size,
                });
            }
            let usage = QuotaLedger::new(self.db).usage(owner).await?;
            if !usage.fits(size) {
                return Err(DriveError::QuotaExceeded {
                    requested: size,
                    available: usage.available.max(0) as u64,
                });
            }
        }

        let folder = {
            let mut tx = self.db.begin().await?;
            let folder = match dir {
                Some(dir) => ensure_folder_path(&mut tx, owner, folder_id, dir).await?,
                None => resolve_live_folder(&mut tx, owner, folder_id).await?,
            };
            tx.commit().await?;
            folder
        };

        let now = Utc::now();
        let display_name = {
            let mut conn = self.db.acquire().await?;
            if live_file_named(&mut conn, folder.id, &name, None).await? {
                timestamped_name(&name, now)
            } else {
                name.clone()
            }
        };

        let stored = stored_name(&name);
        let target = self.blobs.blob_path(folder.id, &stored);
        let (placement, reason) = PlacementSelector::new(self.probe, self.blobs.cache_dir())
            .select(size_hint, settings.force_direct_write);

        let written = self
            .blobs
            .write_stream(stream, &target, &placement, settings.max_upload_size)
            .await?;

        let record = FileRecord {
            id: Uuid::new_v4(),
            stored_filename: stored,
            original_filename: display_name,
            storage_path: target.to_string_lossy().into_owned(),
            size_bytes: 0,
            file_type: file_category(&name).to_string(),
            checksum: written.checksum.clone(),
            folder_id: folder.id,
            user_id: owner,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            deleted_at: None,
            expiry_date: None,
            trash_batch: None,
        };

        let file = match self.commit(record, &written).await {
            Ok(file) => file,
            Err(err) => {
                warn!("upload of {} rolled back: {}", name, err);
                self.blobs.remove_best_effort(&target).await;
                return Err(err);
            }
        };

        info!(
            "stored {} ({} bytes) for user {} via {:?}",
            file.id, file.size_bytes, owner, reason
        );
        ActivityLog::new(self.db)
            .record(
                NewActivity::new(Actor::User(owner), "upload")
                    .target(file.original_filename.clone())
                    .file_size(file.size_bytes),
            )
            .await;

        Ok(UploadReceipt {
            file,
            placement,
            reason,
        })
    }

    /// Charge the final size against the quota and insert the row, in one
    /// transaction. For uploads without a size hint this is the first quota
    /// check that sees the real size.
    async fn commit(&self, mut record: FileRecord, written: &WrittenBlob) -> DriveResult<FileRecord> {
        record.size_bytes = i64::try_from(written.size).map_err(|_| DriveError::TooLarge {
            size: written.size,
            limit: i64::MAX as u64,
        })?;

        let mut tx = self.db.begin().await?;
        // the write comes first so the transaction holds the write lock
        // before it reads the folder
        quota::reserve(&mut tx, record.user_id, written.size).await?;
        let folder = fetch_folder(&mut tx, record.user_id, record.folder_id).await?;
        if folder.is_deleted {
            return Err(DriveError::NotFound("folder"));
        }
        sqlx::query(
            "INSERT INTO files (id, stored_filename, original_filename, storage_path, size_bytes, file_type,
                 checksum, folder_id, user_id, created_at, updated_at, is_deleted)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(record.id)
        .bind(&record.stored_filename)
        .bind(&record.original_filename)
        .bind(&record.storage_path)
        .bind(record.size_bytes)
        .bind(&record.file_type)
        .bind(&record.checksum)
        .bind(record.folder_id)
        .bind(record.user_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(record)
    }
}

/// Split `a/b/c.txt` into (`Some("a/b")`, `c.txt`).
fn split_relative(filename: &str) -> (Option<&str>, &str) {
    let trimmed = filename.trim_matches(|c| c == '/' || c == '\\');
    match trimmed.rfind(['/', '\\']) {
        Some(idx) => {
            let dir = Some(&trimmed[..idx]).filter(|d| !d.trim().is_empty());
            (dir, &trimmed[idx + 1..])
        }
        None => (None, trimmed),
    }
}
