//! `DriveService` is the shared application state: the database pool, the
//! blob store and the free-space probe. Each concern is reached through a
//! short-lived borrowing accessor (`tree()`, `trash()`, `uploads()`, ...).

use crate::{
    models::file::FileRecord,
    services::{
        activity::{ActivityLog, Actor, NewActivity},
        archive::ArchiveBuilder,
        blob_store::BlobStore,
        error::DriveResult,
        placement::{SpaceProbe, StatvfsProbe},
        quota::QuotaLedger,
        settings::SettingsStore,
        trash::TrashLifecycle,
        tree::ResourceTree,
        upload::UploadPlacer,
        users::UserDirectory,
    },
};
use sqlx::SqlitePool;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs::File;
use uuid::Uuid;

/// Default upper bound for archives built in memory.
pub const DEFAULT_ARCHIVE_MEMORY_LIMIT: u64 = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct DriveService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Payload storage (and optional cache volume).
    pub blobs: BlobStore,

    probe: Arc<dyn SpaceProbe>,
    archive_memory_limit: u64,
}

impl DriveService {
    pub fn new(db: Arc<SqlitePool>, storage_dir: PathBuf, cache_dir: Option<PathBuf>) -> Self {
        Self {
            db,
            blobs: BlobStore::new(storage_dir, cache_dir),
            probe: Arc::new(StatvfsProbe),
            archive_memory_limit: DEFAULT_ARCHIVE_MEMORY_LIMIT,
        }
    }

    /// Replace the free-space probe.
    pub fn with_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_archive_memory_limit(mut self, limit: u64) -> Self {
        self.archive_memory_limit = limit;
        self
    }

    pub fn settings(&self) -> SettingsStore<'_> {
        SettingsStore::new(&self.db)
    }

    pub fn users(&self) -> UserDirectory<'_> {
        UserDirectory::new(&self.db)
    }

    pub fn quota(&self) -> QuotaLedger<'_> {
        QuotaLedger::new(&self.db)
    }

    pub fn tree(&self) -> ResourceTree<'_> {
        ResourceTree::new(&self.db)
    }

    pub fn trash(&self) -> TrashLifecycle<'_> {
        TrashLifecycle::new(&self.db, &self.blobs)
    }

    pub fn uploads(&self) -> UploadPlacer<'_> {
        UploadPlacer::new(&self.db, &self.blobs, self.probe.as_ref())
    }

    pub fn archives(&self) -> ArchiveBuilder<'_> {
        ArchiveBuilder::new(&self.db, &self.blobs, self.probe.as_ref(), self.archive_memory_limit)
    }

    pub fn activity(&self) -> ActivityLog<'_> {
        ActivityLog::new(&self.db)
    }

    /// Open a live file for download and record the access.
    pub async fn open_download(&self, owner: Uuid, file_id: Uuid) -> DriveResult<(FileRecord, File)> {
        let file = self.tree().get_live_file(owner, file_id).await?;
        let handle = self.blobs.open(Path::new(&file.storage_path)).await?;
        self.activity()
            .record(
                NewActivity::new(Actor::User(owner), "download")
                    .target(file.original_filename.clone())
                    .file_size(file.size_bytes),
            )
            .await;
        Ok((file, handle))
    }
}
