//! On-disk payload storage.
//!
//! Payloads live under `base_path/{folder_id}/{stored_filename}`. Uploads are
//! written either straight into that path or first into the cache directory
//! and then moved, depending on the `Placement` the selector picked. Partial
//! files are removed on every error path.

use crate::services::{
    error::{DriveError, DriveResult},
    placement::Placement,
};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Size of each write issued while streaming an upload to disk.
pub const WRITE_CHUNK_SIZE: usize = 8 * 1024;

/// Directory below the storage root that holds fallback archive temp files.
const ARCHIVE_TMP_DIR: &str = ".archives";

/// Size and checksum of a completely written payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenBlob {
    pub size: u64,
    pub checksum: String,
}

#[derive(Clone, Debug)]
pub struct BlobStore {
    /// Base directory on disk where payloads are stored.
    base_path: PathBuf,

    /// Fast local volume for staging, if one is configured.
    cache_dir: Option<PathBuf>,
}

impl BlobStore {
    pub fn new(base_path: impl Into<PathBuf>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            cache_dir,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Directory used to stage folder archives: the cache volume when
    /// configured, the system temp directory otherwise.
    pub fn archive_staging_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Directory on the storage volume for last-resort archive temp files.
    pub fn archive_fallback_dir(&self) -> PathBuf {
        self.base_path.join(ARCHIVE_TMP_DIR)
    }

    /// Physical path for a payload in a folder.
    pub fn blob_path(&self, folder_id: Uuid, stored_name: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(folder_id.simple().to_string());
        path.push(stored_name);
        path
    }

    /// Stream `stream` into `target`, honoring `placement` and aborting with
    /// `TooLarge` once more than `limit` bytes arrive.
    ///
    /// On any failure nothing is left behind at `target` or in the cache.
    pub async fn write_stream<S>(
        &self,
        stream: S,
        target: &Path,
        placement: &Placement,
        limit: u64,
    ) -> DriveResult<WrittenBlob>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            DriveError::Io(io::Error::new(
                ErrorKind::Other,
                "blob path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;

        let landing = match placement {
            Placement::Staged { cache_dir } => cache_dir.join(format!(".upload-{}", Uuid::new_v4())),
            Placement::Direct => target.to_path_buf(),
        };

        let written = match copy_stream(stream, &landing, limit).await {
            Ok(written) => written,
            Err(err) => {
                remove_partial(&landing).await;
                return Err(err);
            }
        };

        if landing != target {
            if let Err(err) = move_into_place(&landing, target).await {
                remove_partial(&landing).await;
                remove_partial(target).await;
                return Err(DriveError::Io(err));
            }
        }

        debug!(
            "wrote {} bytes to {} ({:?})",
            written.size,
            target.display(),
            placement
        );
        Ok(written)
    }

    /// Open a payload for reading. A missing payload is `NotFound`.
    pub async fn open(&self, path: &Path) -> DriveResult<File> {
        File::open(path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                DriveError::NotFound("file content")
            } else {
                DriveError::Io(err)
            }
        })
    }

    /// Remove a payload, logging instead of failing. Returns whether the
    /// bytes were actually removed.
    pub async fn remove_best_effort(&self, path: &Path) -> bool {
        match fs::remove_file(path).await {
            Ok(_) => {
                debug!("removed physical file {}", path.display());
                if let Some(parent) = path.parent() {
                    self.prune_empty_dirs(parent, &self.base_path).await;
                }
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("physical file {} already missing", path.display());
                false
            }
            Err(err) => {
                warn!("failed to remove physical file {}: {}", path.display(), err);
                false
            }
        }
    }

    /// Recursively remove empty directories up to the storage root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Write every chunk of `stream` to a new file at `path` in
/// `WRITE_CHUNK_SIZE` pieces, computing size and MD5 on the way.
async fn copy_stream<S>(stream: S, path: &Path, limit: u64) -> DriveResult<WrittenBlob>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let mut file = File::create(path).await?;
    let mut size: u64 = 0;
    let mut digest = Context::new();

    pin_mut!(stream);
    while let Some(chunk_res) = stream.next().await {
        let chunk = chunk_res?;
        size += chunk.len() as u64;
        if size > limit {
            return Err(DriveError::TooLarge { size, limit });
        }
        digest.consume(&chunk);
        for piece in chunk.chunks(WRITE_CHUNK_SIZE) {
            file.write_all(piece).await?;
        }
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok(WrittenBlob {
        size,
        checksum: format!("{:x}", digest.compute()),
    })
}

/// Rename when both paths share a volume, otherwise copy and remove.
async fn move_into_place(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(
                "rename {} -> {} failed ({}), copying instead",
                from.display(),
                to.display(),
                err
            );
            fs::copy(from, to).await?;
            if let Err(err) = fs::remove_file(from).await {
                warn!("failed to remove staged file {}: {}", from.display(), err);
            }
            Ok(())
        }
    }
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(_) => debug!("removed partial file {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove partial file {}: {}", path.display(), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = io::Result<Bytes>> + Send + use<> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(*p)))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn direct_write_lands_in_target_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), None);
        let target = store.blob_path(Uuid::new_v4(), "abc_hello.txt");

        let written = store
            .write_stream(chunks(&[b"hello ", b"world"]), &target, &Placement::Direct, 1024)
            .await
            .unwrap();

        assert_eq!(written.size, 11);
        assert_eq!(written.checksum, format!("{:x}", md5::compute(b"hello world")));
        assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn staged_write_moves_out_of_cache() {
        let storage = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let store = BlobStore::new(storage.path(), Some(cache.path().to_path_buf()));
        let target = store.blob_path(Uuid::new_v4(), "abc_staged.bin");
        let placement = Placement::Staged {
            cache_dir: cache.path().to_path_buf(),
        };

        store
            .write_stream(chunks(&[b"staged"]), &target, &placement, 1024)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"staged");
        assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn oversized_stream_is_rejected_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), None);
        let target = store.blob_path(Uuid::new_v4(), "abc_big.bin");

        let err = store
            .write_stream(chunks(&[b"12345", b"67890"]), &target, &Placement::Direct, 8)
            .await
            .unwrap_err();

        assert!(matches!(err, DriveError::TooLarge { size: 10, limit: 8 }));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn failing_source_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), None);
        let target = store.blob_path(Uuid::new_v4(), "abc_broken.bin");
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ]);

        let err = store
            .write_stream(source, &target, &Placement::Direct, 1024)
            .await
            .unwrap_err();

        assert!(matches!(err, DriveError::Io(_)));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn remove_prunes_empty_folder_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), None);
        let target = store.blob_path(Uuid::new_v4(), "abc_gone.txt");
        store
            .write_stream(chunks(&[b"x"]), &target, &Placement::Direct, 1024)
            .await
            .unwrap();

        assert!(store.remove_best_effort(&target).await);
        assert!(!target.parent().unwrap().exists());
        assert!(!store.remove_best_effort(&target).await);
    }
}
