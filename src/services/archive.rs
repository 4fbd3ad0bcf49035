//! Folder archives.
//!
//! A folder download is planned once (entries plus estimated size), then one
//! of four construction strategies is picked by [`select_strategy`] and the
//! archive is exposed as a byte stream. Temporary archive files live exactly
//! as long as that stream.

use crate::{
    models::{file::FileRecord, folder::Folder},
    services::{
        activity::{ActivityLog, Actor, NewActivity},
        blob_store::BlobStore,
        error::{DriveError, DriveResult},
        names::split_extension,
        placement::{SpaceProbe, has_headroom},
        settings::SettingsStore,
        tree::{FILE_COLUMNS, FOLDER_COLUMNS, resolve_live_folder},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, stream::BoxStream};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::{
    collections::HashSet,
    io::{self, Cursor, Seek, Write},
    path::PathBuf,
};
use tempfile::NamedTempFile;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::{
    CompressionMethod, ZipWriter,
    result::{ZipError, ZipResult},
    write::SimpleFileOptions,
};

/// Free space kept on the staging volume beyond the estimated archive size.
pub const ARCHIVE_SAFETY_MARGIN: u64 = 20 * 1024 * 1024;

/// Entries at or above this size need ZIP64 headers.
const LARGE_FILE_THRESHOLD: u64 = u32::MAX as u64;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStrategy {
    /// Build the whole archive in a memory buffer.
    InMemory,
    /// Build into a temp file on the staging (cache) volume.
    CachedFile,
    /// Write entries straight into the response as they are read.
    Streaming,
    /// Build into a temp file beside the storage root.
    StorageTempFile,
}

/// Pick how to build an archive of `estimate` bytes.
///
/// `staging_fits` tells whether the staging area has room for the estimate
/// plus [`ARCHIVE_SAFETY_MARGIN`].
pub fn select_strategy(
    estimate: u64,
    staging_fits: bool,
    memory_limit: u64,
    streaming_enabled: bool,
) -> ArchiveStrategy {
    if staging_fits && estimate <= memory_limit {
        ArchiveStrategy::InMemory
    } else if staging_fits {
        ArchiveStrategy::CachedFile
    } else if streaming_enabled {
        ArchiveStrategy::Streaming
    } else {
        ArchiveStrategy::StorageTempFile
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ArchiveEntry {
    /// Directory entry, name ends with `/`.
    Directory(String),
    File { name: String, path: PathBuf, size: u64 },
}

#[derive(Debug, Default)]
struct ArchivePlan {
    entries: Vec<ArchiveEntry>,
    estimated_size: u64,
}

/// A ready-to-send folder archive.
pub struct FolderArchive {
    pub file_name: String,
    pub strategy: ArchiveStrategy,
    pub estimated_size: u64,
    pub stream: BoxStream<'static, io::Result<Bytes>>,
}

pub struct ArchiveBuilder<'a> {
    db: &'a SqlitePool,
    blobs: &'a BlobStore,
    probe: &'a dyn SpaceProbe,
    memory_limit: u64,
}

impl<'a> ArchiveBuilder<'a> {
    pub fn new(
        db: &'a SqlitePool,
        blobs: &'a BlobStore,
        probe: &'a dyn SpaceProbe,
        memory_limit: u64,
    ) -> Self {
        Self {
            db,
            blobs,
            probe,
            memory_limit,
        }
    }

    /// Archive every live file beneath a live folder, keeping the folder
    /// structure (empty folders included).
    pub async fn build_folder_archive(
        &self,
        owner: Uuid,
        folder_id: Option<Uuid>,
    ) -> DriveResult<FolderArchive> {
        let settings = SettingsStore::new(self.db).snapshot().await?;
        let (folder, plan) = {
            let mut conn = self.db.acquire().await?;
            let folder = resolve_live_folder(&mut conn, owner, folder_id).await?;
            let plan = plan_archive(&mut conn, &folder).await?;
            (folder, plan)
        };

        let staging_dir = self.blobs.archive_staging_dir();
        let staging_fits = has_headroom(
            self.probe,
            &staging_dir,
            plan.estimated_size,
            ARCHIVE_SAFETY_MARGIN,
        );
        let strategy = select_strategy(
            plan.estimated_size,
            staging_fits,
            self.memory_limit,
            settings.archive_streaming,
        );
        debug!(
            "archiving folder {} ({} entries, ~{} bytes) with {:?}",
            folder.id,
            plan.entries.len(),
            plan.estimated_size,
            strategy
        );

        let estimated_size = plan.estimated_size;
        let stream = match strategy {
            ArchiveStrategy::InMemory => build_in_memory(plan.entries).await?,
            ArchiveStrategy::CachedFile => build_temp_file(plan.entries, staging_dir).await?,
            ArchiveStrategy::Streaming => stream_entries(plan.entries),
            ArchiveStrategy::StorageTempFile => {
                build_temp_file(plan.entries, self.blobs.archive_fallback_dir()).await?
            }
        };

        info!(
            "serving archive of folder {} for user {} via {:?}",
            folder.id, owner, strategy
        );
        ActivityLog::new(self.db)
            .record(
                NewActivity::new(Actor::User(owner), "download_folder")
                    .target(folder.name.clone())
                    .file_size(i64::try_from(estimated_size).unwrap_or(i64::MAX)),
            )
            .await;

        Ok(FolderArchive {
            file_name: format!("{}_{}.zip", folder.name, Utc::now().format("%Y%m%d%H%M%S")),
            strategy,
            estimated_size,
            stream,
        })
    }
}

/// Enumerate the live subtree depth-first with an explicit stack.
async fn plan_archive(conn: &mut SqliteConnection, root: &Folder) -> DriveResult<ArchivePlan> {
    let mut plan = ArchivePlan::default();
    let mut visited = HashSet::from([root.id]);
    let mut stack = vec![(root.id, String::new())];

    while let Some((folder_id, prefix)) = stack.pop() {
        let mut used = HashSet::new();

        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM files WHERE folder_id = ? AND is_deleted = 0 ORDER BY original_filename",
            FILE_COLUMNS
        ))
        .bind(folder_id)
        .fetch_all(&mut *conn)
        .await?;
        for file in files {
            let size = u64::try_from(file.size_bytes).unwrap_or(0);
            plan.estimated_size = plan.estimated_size.saturating_add(size);
            plan.entries.push(ArchiveEntry::File {
                name: format!("{}{}", prefix, unique_entry_name(&mut used, &file.original_filename)),
                path: PathBuf::from(file.storage_path),
                size,
            });
        }

        let folders = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {} FROM folders WHERE parent_id = ? AND is_deleted = 0 ORDER BY name DESC",
            FOLDER_COLUMNS
        ))
        .bind(folder_id)
        .fetch_all(&mut *conn)
        .await?;
        for sub in folders {
            if !visited.insert(sub.id) {
                continue;
            }
            let dir = format!("{}{}/", prefix, unique_entry_name(&mut used, &sub.name));
            plan.entries.push(ArchiveEntry::Directory(dir.clone()));
            stack.push((sub.id, dir));
        }
    }
    Ok(plan)
}

/// `name`, or `name (n).ext` for the first free `n` within one directory.
fn unique_entry_name(used: &mut HashSet<String>, name: &str) -> String {
    if used.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    let mut n = 1;
    loop {
        let candidate = format!("{} ({}){}", stem, n, ext);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Write every entry. Files whose payload is missing are skipped.
fn write_entries<W: Write + Seek>(zip: &mut ZipWriter<W>, entries: &[ArchiveEntry]) -> ZipResult<usize> {
    let dir_options = SimpleFileOptions::default().unix_permissions(0o775);
    let mut written = 0;
    for entry in entries {
        match entry {
            ArchiveEntry::Directory(name) => zip.add_directory(name.as_str(), dir_options)?,
            ArchiveEntry::File { name, path, size } => {
                let mut source = match std::fs::File::open(path) {
                    Ok(source) => source,
                    Err(err) => {
                        warn!("skipping {} in archive, payload unavailable: {}", name, err);
                        continue;
                    }
                };
                let options = SimpleFileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .unix_permissions(0o644)
                    .large_file(*size >= LARGE_FILE_THRESHOLD);
                zip.start_file(name.as_str(), options)?;
                io::copy(&mut source, &mut *zip)?;
                written += 1;
            }
        }
    }
    Ok(written)
}

fn join_error(err: tokio::task::JoinError) -> DriveError {
    DriveError::Io(io::Error::other(err))
}

async fn build_in_memory(entries: Vec<ArchiveEntry>) -> DriveResult<BoxStream<'static, io::Result<Bytes>>> {
    let buffer = tokio::task::spawn_blocking(move || -> ZipResult<Vec<u8>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        write_entries(&mut zip, &entries)?;
        Ok(zip.finish()?.into_inner())
    })
    .await
    .map_err(join_error)??;

    Ok(futures::stream::once(async move { Ok(Bytes::from(buffer)) }).boxed())
}

/// Build into a named temp file under `dir`. The file is removed when the
/// returned stream is dropped, whether or not it was read to the end.
async fn build_temp_file(
    entries: Vec<ArchiveEntry>,
    dir: PathBuf,
) -> DriveResult<BoxStream<'static, io::Result<Bytes>>> {
    tokio::fs::create_dir_all(&dir).await?;
    let temp_path = tokio::task::spawn_blocking(move || -> ZipResult<tempfile::TempPath> {
        let (file, path) = NamedTempFile::new_in(&dir)?.into_parts();
        let mut zip = ZipWriter::new(file);
        write_entries(&mut zip, &entries)?;
        zip.finish()?.sync_all()?;
        Ok(path)
    })
    .await
    .map_err(join_error)??;

    let file = tokio::fs::File::open(&temp_path).await?;
    Ok(ReaderStream::new(file)
        .map(move |chunk| {
            let _keep_alive = &temp_path;
            chunk
        })
        .boxed())
}

/// Write the archive into a pipe from a blocking task while the caller reads
/// the other end. Dropping the stream closes the pipe and stops the writer.
fn stream_entries(entries: Vec<ArchiveEntry>) -> BoxStream<'static, io::Result<Bytes>> {
    let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
    let bridge = SyncIoBridge::new(writer);

    tokio::task::spawn_blocking(move || {
        let mut zip = ZipWriter::new_stream(bridge);
        let result = write_entries(&mut zip, &entries).and_then(|count| {
            let mut inner = zip.finish()?.into_inner();
            inner.flush()?;
            inner.shutdown()?;
            Ok(count)
        });
        match result {
            Ok(count) => debug!("streamed archive with {} files", count),
            Err(ZipError::Io(err)) if err.kind() == io::ErrorKind::BrokenPipe => {
                debug!("archive reader went away, stopping")
            }
            Err(err) => warn!("streaming archive failed: {}", err),
        }
    });

    ReaderStream::new(reader).boxed()
}
