//! Fixtures shared by the service and handler tests.

use crate::{
    db,
    models::{
        file::FileRecord,
        user::{Role, User},
    },
    services::{drive_service::DriveService, placement::SpaceProbe},
};
use bytes::Bytes;
use futures::{Stream, stream};
use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tempfile::TempDir;
use uuid::Uuid;

/// Reports a fixed amount of free space and counts how often it was asked.
#[derive(Debug)]
pub struct FixedProbe {
    available: u64,
    calls: AtomicUsize,
}

impl FixedProbe {
    pub fn new(available: u64) -> Self {
        Self {
            available,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SpaceProbe for FixedProbe {
    fn available_space(&self, _path: &Path) -> io::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.available)
    }
}

#[derive(Debug)]
pub struct FailingProbe;

impl SpaceProbe for FailingProbe {
    fn available_space(&self, _path: &Path) -> io::Result<u64> {
        Err(io::Error::other("statvfs unavailable"))
    }
}

/// A drive backed by a throwaway directory: SQLite file plus blob storage.
pub struct TestDrive {
    pub service: DriveService,
    _dir: TempDir,
}

impl TestDrive {
    /// Unlimited free space, no cache volume.
    pub async fn new() -> Self {
        Self::with_cache(Arc::new(FixedProbe::new(u64::MAX)), None).await
    }

    pub async fn with_cache(probe: Arc<FixedProbe>, cache_dir: Option<PathBuf>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("drive.db").display());
        let pool = db::connect(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();

        let service = DriveService::new(Arc::new(pool), dir.path().join("files"), cache_dir)
            .with_probe(probe);
        Self { service, _dir: dir }
    }

    pub async fn user_with_quota(&self, username: &str, quota: i64) -> User {
        self.service
            .users()
            .create(username, Role::User, Some(quota))
            .await
            .unwrap()
    }

    pub async fn admin(&self, username: &str) -> User {
        self.service
            .users()
            .create(username, Role::Admin, Some(1 << 30))
            .await
            .unwrap()
    }

    /// Overwrite the cached usage counter.
    pub async fn set_used(&self, user_id: Uuid, used: i64) {
        sqlx::query("UPDATE users SET storage_used = ? WHERE id = ?")
            .bind(used)
            .bind(user_id)
            .execute(&*self.service.db)
            .await
            .unwrap();
    }

    pub async fn upload(
        &self,
        owner: Uuid,
        folder_id: Option<Uuid>,
        filename: &str,
        data: &[u8],
    ) -> FileRecord {
        self.service
            .uploads()
            .place_upload(owner, folder_id, filename, Some(data.len() as u64), body(data))
            .await
            .unwrap()
            .file
    }
}

/// A single-chunk upload body.
pub fn body(data: &[u8]) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    stream::iter(vec![Ok(Bytes::copy_from_slice(data))])
}
