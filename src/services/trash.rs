//! Trash lifecycle: `live -> trashed -> purged`, with `trashed -> live`
//! restores.
//!
//! Folder transitions cascade over the whole subtree in one transaction.
//! Items trashed together share a `trash_batch` id, which is what a folder
//! restore uses to bring back exactly the items its own trash took away.
//! Purge commits the row deletion before touching the disk; removing bytes is
//! best-effort and never blocks the logical delete.

use crate::{
    models::{file::FileRecord, folder::Folder},
    services::{
        activity::{ActivityLog, Actor, NewActivity},
        blob_store::BlobStore,
        error::{DriveError, DriveResult},
        names::timestamped_name,
        quota,
        settings::{Settings, SettingsStore},
        tree::{
            BatchOutcome, FILE_COLUMNS, FOLDER_COLUMNS, IN_CHUNK, fetch_file, fetch_folder,
            live_file_named, live_folder_named, subtree_folder_ids,
        },
        users::fetch_user,
    },
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, SqliteConnection, SqlitePool, sqlite::Sqlite};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::PathBuf,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Totals of one purge, explicit or automatic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub files_purged: usize,
    pub folders_purged: usize,
    pub bytes_reclaimed: i64,
    /// Payloads whose removal failed; their rows are gone regardless.
    pub blob_failures: usize,
}

/// Items affected by one trash or restore.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CascadeSummary {
    pub files: u64,
    pub folders: u64,
    pub expiry_date: Option<DateTime<Utc>>,
}

/// Top-level contents of a user's trash.
#[derive(Debug, Serialize)]
pub struct TrashListing {
    pub folders: Vec<Folder>,
    pub files: Vec<FileRecord>,
}

#[derive(Clone, Copy)]
enum Table {
    Files,
    Folders,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Files => "files",
            Table::Folders => "folders",
        }
    }

    /// Column holding the folder ids a cascade selects on.
    fn scope_column(self) -> &'static str {
        match self {
            Table::Files => "folder_id",
            Table::Folders => "id",
        }
    }
}

/// Which rows a purge may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PurgeScope {
    /// Only rows already in the trash. Live rows, and the folders that still
    /// lead to them, stay in place.
    Trashed,
    /// Every selected row, live or trashed.
    Everything,
}

/// Rows removed inside the transaction, and what is left to do on disk.
#[derive(Default)]
pub(crate) struct PurgedRows {
    blobs: Vec<PathBuf>,
    files: usize,
    folders: usize,
    bytes: i64,
    per_user: BTreeMap<Uuid, (usize, i64)>,
}

pub struct TrashLifecycle<'a> {
    db: &'a SqlitePool,
    blobs: &'a BlobStore,
}

impl<'a> TrashLifecycle<'a> {
    pub fn new(db: &'a SqlitePool, blobs: &'a BlobStore) -> Self {
        Self { db, blobs }
    }

    /// Move a live file to the trash.
    pub async fn trash_file(&self, owner: Uuid, file_id: Uuid) -> DriveResult<CascadeSummary> {
        let settings = SettingsStore::new(self.db).snapshot().await?;
        let mut tx = self.db.begin().await?;
        let file = fetch_file(&mut tx, owner, file_id).await?;
        if file.is_deleted {
            return Err(DriveError::Conflict(format!(
                "`{}` is already in the trash",
                file.original_filename
            )));
        }
        let (now, expiry) = trash_window(&mut tx, owner, &settings).await?;

        sqlx::query(
            "UPDATE files SET is_deleted = 1, deleted_at = ?, expiry_date = ?, trash_batch = ?, updated_at = ?
             WHERE id = ? AND is_deleted = 0",
        )
        .bind(now)
        .bind(expiry)
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(file.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!("trashed file {} of user {}, expires {}", file.id, owner, expiry);
        ActivityLog::new(self.db)
            .record(
                NewActivity::new(Actor::User(owner), "trash")
                    .target(file.original_filename)
                    .file_size(file.size_bytes),
            )
            .await;
        Ok(CascadeSummary {
            files: 1,
            folders: 0,
            expiry_date: Some(expiry),
        })
    }

    /// Trash a folder and every live item beneath it, all stamped with the
    /// same deletion time, expiry and batch id.
    pub async fn trash_folder(&self, owner: Uuid, folder_id: Uuid) -> DriveResult<CascadeSummary> {
        let settings = SettingsStore::new(self.db).snapshot().await?;
        let mut tx = self.db.begin().await?;
        let folder = fetch_folder(&mut tx, owner, folder_id).await?;
        if folder.is_root() {
            return Err(DriveError::Validation("the root folder cannot be trashed".into()));
        }
        if folder.is_deleted {
            return Err(DriveError::Conflict(format!(
                "`{}` is already in the trash",
                folder.name
            )));
        }
        let (now, expiry) = trash_window(&mut tx, owner, &settings).await?;
        let batch = Uuid::new_v4();

        let subtree = subtree_folder_ids(&mut tx, folder.id).await?;
        let folders = mark_trashed(&mut tx, Table::Folders, &subtree, now, expiry, batch).await?;
        let files = mark_trashed(&mut tx, Table::Files, &subtree, now, expiry, batch).await?;
        tx.commit().await?;

        info!(
            "trashed folder {} of user {}: {} folders, {} files, expires {}",
            folder.id, owner, folders, files, expiry
        );
        ActivityLog::new(self.db)
            .record(
                NewActivity::new(Actor::User(owner), "trash")
                    .target(folder.name)
                    .details(format!("{} folders, {} files", folders, files)),
            )
            .await;
        Ok(CascadeSummary {
            files,
            folders,
            expiry_date: Some(expiry),
        })
    }

    /// Restore a trashed file along with any trashed ancestor folders.
    pub async fn restore_file(&self, owner: Uuid, file_id: Uuid) -> DriveResult<FileRecord> {
        let mut tx = self.db.begin().await?;
        let file = fetch_file(&mut tx, owner, file_id).await?;
        if !file.is_deleted {
            return Err(DriveError::Conflict(format!(
                "`{}` is not in the trash",
                file.original_filename
            )));
        }
        let now = Utc::now();
        let ancestors = restore_ancestors(&mut tx, file.folder_id, now).await?;

        let name = if live_file_named(&mut tx, file.folder_id, &file.original_filename, None).await? {
            timestamped_name(&file.original_filename, now)
        } else {
            file.original_filename.clone()
        };
        sqlx::query(
            "UPDATE files SET is_deleted = 0, deleted_at = NULL, expiry_date = NULL, trash_batch = NULL,
                 original_filename = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&name)
        .bind(now)
        .bind(file.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(
            "restored file {} of user {} ({} ancestor folders restored)",
            file.id, owner, ancestors
        );
        ActivityLog::new(self.db)
            .record(NewActivity::new(Actor::User(owner), "restore").target(name.clone()))
            .await;
        Ok(FileRecord {
            original_filename: name,
            is_deleted: false,
            deleted_at: None,
            expiry_date: None,
            trash_batch: None,
            updated_at: now,
            ..file
        })
    }

    /// Restore a trashed folder and the items trashed in the same cascade.
    /// Items that were trashed on their own beforehand stay in the trash.
    pub async fn restore_folder(&self, owner: Uuid, folder_id: Uuid) -> DriveResult<CascadeSummary> {
        let mut tx = self.db.begin().await?;
        let folder = fetch_folder(&mut tx, owner, folder_id).await?;
        if !folder.is_deleted {
            return Err(DriveError::Conflict(format!("`{}` is not in the trash", folder.name)));
        }
        let now = Utc::now();
        let Some(parent_id) = folder.parent_id else {
            return Err(DriveError::Validation("the root folder cannot be restored".into()));
        };
        let ancestors = restore_ancestors(&mut tx, parent_id, now).await?;

        let (folders, files) = match folder.trash_batch {
            Some(batch) => {
                let subtree = subtree_folder_ids(&mut tx, folder.id).await?;
                let folders = clear_trashed(&mut tx, Table::Folders, &subtree, batch, now).await?;
                let files = clear_trashed(&mut tx, Table::Files, &subtree, batch, now).await?;
                (folders, files)
            }
            None => {
                clear_one(&mut tx, Table::Folders, folder.id, now).await?;
                (1, 0)
            }
        };

        if live_folder_named(&mut tx, parent_id, &folder.name, Some(folder.id))
            .await?
            .is_some()
        {
            let renamed = timestamped_name(&folder.name, now);
            warn!(
                "restored folder {} clashes with a live sibling, renamed to {}",
                folder.id, renamed
            );
            sqlx::query("UPDATE folders SET name = ? WHERE id = ?")
                .bind(&renamed)
                .bind(folder.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(
            "restored folder {} of user {}: {} folders, {} files, {} ancestors",
            folder.id, owner, folders, files, ancestors
        );
        ActivityLog::new(self.db)
            .record(
                NewActivity::new(Actor::User(owner), "restore")
                    .target(folder.name)
                    .details(format!("{} folders, {} files", folders, files)),
            )
            .await;
        Ok(CascadeSummary {
            files,
            folders: folders + ancestors,
            expiry_date: None,
        })
    }

    /// Permanently delete a trashed file.
    pub async fn purge_file(&self, owner: Uuid, file_id: Uuid) -> DriveResult<PurgeSummary> {
        let mut tx = self.db.begin().await?;
        let file = fetch_file(&mut tx, owner, file_id).await?;
        if !file.is_deleted {
            return Err(DriveError::Conflict(format!(
                "`{}` must be moved to the trash before it can be deleted permanently",
                file.original_filename
            )));
        }
        let rows = purge_rows(&mut tx, PurgeScope::Trashed, &[], &[file.id]).await?;
        tx.commit().await?;

        let summary = self.finish_purge(rows).await;
        ActivityLog::new(self.db)
            .record(
                NewActivity::new(Actor::User(owner), "purge")
                    .target(file.original_filename)
                    .file_size(file.size_bytes),
            )
            .await;
        Ok(summary)
    }

    /// Permanently delete a trashed folder and its whole subtree.
    pub async fn purge_folder(&self, owner: Uuid, folder_id: Uuid) -> DriveResult<PurgeSummary> {
        let mut tx = self.db.begin().await?;
        let folder = fetch_folder(&mut tx, owner, folder_id).await?;
        if !folder.is_deleted {
            return Err(DriveError::Conflict(format!(
                "`{}` must be moved to the trash before it can be deleted permanently",
                folder.name
            )));
        }
        let subtree = subtree_folder_ids(&mut tx, folder.id).await?;
        let rows = purge_rows(&mut tx, PurgeScope::Trashed, &subtree, &[]).await?;
        tx.commit().await?;

        let summary = self.finish_purge(rows).await;
        ActivityLog::new(self.db)
            .record(
                NewActivity::new(Actor::User(owner), "purge")
                    .target(folder.name)
                    .details(format!(
                        "{} folders, {} files",
                        summary.folders_purged, summary.files_purged
                    ))
                    .file_size(summary.bytes_reclaimed),
            )
            .await;
        Ok(summary)
    }

    /// Purge everything in the user's trash.
    pub async fn empty_trash(&self, owner: Uuid) -> DriveResult<PurgeSummary> {
        let mut tx = self.db.begin().await?;
        fetch_user(&mut tx, owner).await?;

        let folder_ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM folders WHERE user_id = ? AND is_deleted = 1",
        )
        .bind(owner)
        .fetch_all(&mut *tx)
        .await?;
        let file_ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM files WHERE user_id = ? AND is_deleted = 1",
        )
        .bind(owner)
        .fetch_all(&mut *tx)
        .await?;

        let subtrees = collect_subtrees(&mut tx, &folder_ids).await?;
        let rows = purge_rows(&mut tx, PurgeScope::Trashed, &subtrees, &file_ids).await?;
        tx.commit().await?;

        let summary = self.finish_purge(rows).await;
        info!("emptied trash of user {}: {:?}", owner, summary);
        ActivityLog::new(self.db)
            .record(
                NewActivity::new(Actor::User(owner), "empty_trash")
                    .details(format!(
                        "{} folders, {} files",
                        summary.folders_purged, summary.files_purged
                    ))
                    .file_size(summary.bytes_reclaimed),
            )
            .await;
        Ok(summary)
    }

    /// Purge every trashed item whose expiry date is at or before `now`.
    /// Does nothing when `auto_clean_trash` is off. Audit records are
    /// attributed to the system, one per affected owner.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> DriveResult<PurgeSummary> {
        let settings = SettingsStore::new(self.db).snapshot().await?;
        if !settings.auto_clean_trash {
            info!("automatic trash cleanup is disabled, skipping sweep");
            return Ok(PurgeSummary::default());
        }

        let mut tx = self.db.begin().await?;
        let folder_ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM folders WHERE is_deleted = 1 AND expiry_date IS NOT NULL AND expiry_date <= ?",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;
        let file_ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM files WHERE is_deleted = 1 AND expiry_date IS NOT NULL AND expiry_date <= ?",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        if folder_ids.is_empty() && file_ids.is_empty() {
            return Ok(PurgeSummary::default());
        }

        let subtrees = collect_subtrees(&mut tx, &folder_ids).await?;
        let rows = purge_rows(&mut tx, PurgeScope::Trashed, &subtrees, &file_ids).await?;
        tx.commit().await?;

        let per_user = rows.per_user.clone();
        let summary = self.finish_purge(rows).await;
        info!("expired trash sweep finished: {:?}", summary);

        let log = ActivityLog::new(self.db);
        for (user_id, (files, bytes)) in per_user {
            log.record(
                NewActivity::new(Actor::System, "auto_cleanup")
                    .target(user_id.to_string())
                    .details(format!("purged {} expired files", files))
                    .file_size(bytes),
            )
            .await;
        }
        Ok(summary)
    }

    /// Top-level trashed items: those whose container is not itself trashed.
    pub async fn list_trash(&self, owner: Uuid) -> DriveResult<TrashListing> {
        let folders = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {} FROM folders f
             WHERE f.user_id = ? AND f.is_deleted = 1
               AND NOT EXISTS (SELECT 1 FROM folders p WHERE p.id = f.parent_id AND p.is_deleted = 1)
             ORDER BY f.deleted_at DESC",
            FOLDER_COLUMNS
        ))
        .bind(owner)
        .fetch_all(self.db)
        .await?;

        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM files f
             WHERE f.user_id = ? AND f.is_deleted = 1
               AND NOT EXISTS (SELECT 1 FROM folders p WHERE p.id = f.folder_id AND p.is_deleted = 1)
             ORDER BY f.deleted_at DESC",
            FILE_COLUMNS
        ))
        .bind(owner)
        .fetch_all(self.db)
        .await?;

        Ok(TrashListing { folders, files })
    }

    /// Trash several items. Missing, already-trashed or protected items are
    /// counted as skipped.
    pub async fn trash_items(&self, owner: Uuid, file_ids: &[Uuid], folder_ids: &[Uuid]) -> DriveResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for id in folder_ids {
            tally(&mut outcome, self.trash_folder(owner, *id).await)?;
        }
        for id in file_ids {
            tally(&mut outcome, self.trash_file(owner, *id).await)?;
        }
        Ok(outcome)
    }

    pub async fn restore_items(&self, owner: Uuid, file_ids: &[Uuid], folder_ids: &[Uuid]) -> DriveResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for id in folder_ids {
            tally(&mut outcome, self.restore_folder(owner, *id).await)?;
        }
        for id in file_ids {
            tally(&mut outcome, self.restore_file(owner, *id).await)?;
        }
        Ok(outcome)
    }

    async fn finish_purge(&self, rows: PurgedRows) -> PurgeSummary {
        remove_payloads(self.blobs, rows).await
    }
}

/// Remove the payloads of a committed purge and build the summary.
pub(crate) async fn remove_payloads(blobs: &BlobStore, rows: PurgedRows) -> PurgeSummary {
    let mut failures = 0;
    for path in &rows.blobs {
        if !blobs.remove_best_effort(path).await {
            failures += 1;
        }
    }
    if failures > 0 {
        warn!("{} payloads could not be removed after purge", failures);
    }
    PurgeSummary {
        files_purged: rows.files,
        folders_purged: rows.folders,
        bytes_reclaimed: rows.bytes,
        blob_failures: failures,
    }
}

fn tally<T>(outcome: &mut BatchOutcome, result: DriveResult<T>) -> DriveResult<()> {
    match result {
        Ok(_) => outcome.applied += 1,
        Err(DriveError::NotFound(_)) | Err(DriveError::Conflict(_)) | Err(DriveError::Validation(_)) => {
            outcome.skipped += 1
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

/// Deletion time and expiry for a trash operation by `owner`.
async fn trash_window(
    conn: &mut SqliteConnection,
    owner: Uuid,
    settings: &Settings,
) -> DriveResult<(DateTime<Utc>, DateTime<Utc>)> {
    let user = fetch_user(conn, owner).await?;
    let days = settings.retention_days_for(user.trash_retention_days);
    let now = Utc::now();
    let expiry = TimeDelta::try_days(days)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| DriveError::Validation(format!("retention of {} days is out of range", days)))?;
    Ok((now, expiry))
}

async fn mark_trashed(
    conn: &mut SqliteConnection,
    table: Table,
    scope: &[Uuid],
    now: DateTime<Utc>,
    expiry: DateTime<Utc>,
    batch: Uuid,
) -> DriveResult<u64> {
    let mut affected = 0;
    for chunk in scope.chunks(IN_CHUNK) {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {} SET is_deleted = 1, deleted_at = ",
            table.name()
        ));
        builder.push_bind(now);
        builder.push(", expiry_date = ");
        builder.push_bind(expiry);
        builder.push(", trash_batch = ");
        builder.push_bind(batch);
        builder.push(", updated_at = ");
        builder.push_bind(now);
        builder.push(format!(" WHERE is_deleted = 0 AND {} IN (", table.scope_column()));
        let mut ids = builder.separated(", ");
        for id in chunk {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
        affected += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

async fn clear_trashed(
    conn: &mut SqliteConnection,
    table: Table,
    scope: &[Uuid],
    batch: Uuid,
    now: DateTime<Utc>,
) -> DriveResult<u64> {
    let mut affected = 0;
    for chunk in scope.chunks(IN_CHUNK) {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {} SET is_deleted = 0, deleted_at = NULL, expiry_date = NULL, trash_batch = NULL, updated_at = ",
            table.name()
        ));
        builder.push_bind(now);
        builder.push(" WHERE is_deleted = 1 AND trash_batch = ");
        builder.push_bind(batch);
        builder.push(format!(" AND {} IN (", table.scope_column()));
        let mut ids = builder.separated(", ");
        for id in chunk {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
        affected += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

async fn clear_one(conn: &mut SqliteConnection, table: Table, id: Uuid, now: DateTime<Utc>) -> DriveResult<u64> {
    Ok(sqlx::query(&format!(
        "UPDATE {} SET is_deleted = 0, deleted_at = NULL, expiry_date = NULL, trash_batch = NULL, updated_at = ?
         WHERE id = ? AND is_deleted = 1",
        table.name()
    ))
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected())
}

/// Restore trashed folders from `start` upward until a live folder or the
/// root is reached. Only the ancestors themselves come back, not their
/// other contents.
async fn restore_ancestors(conn: &mut SqliteConnection, start: Uuid, now: DateTime<Utc>) -> DriveResult<u64> {
    let mut restored = 0;
    let mut visited = HashSet::new();
    let mut current = Some(start);
    while let Some(id) = current {
        if !visited.insert(id) {
            warn!("cycle detected in folder chain at {}", id);
            break;
        }
        let folder = sqlx::query_as::<_, Folder>(&format!("SELECT {} FROM folders WHERE id = ?", FOLDER_COLUMNS))
            .bind(id)
            .fetch_one(&mut *conn)
            .await
            .map_err(|err| DriveError::from_lookup(err, "folder"))?;
        if !folder.is_deleted {
            break;
        }
        restored += clear_one(conn, Table::Folders, folder.id, now).await?;
        current = folder.parent_id;
    }
    Ok(restored)
}

/// Union of the subtrees of `roots`, each in breadth-first order. Roots lying
/// inside another root's subtree are folded into it, so every parent still
/// precedes its children in the result.
async fn collect_subtrees(conn: &mut SqliteConnection, roots: &[Uuid]) -> DriveResult<Vec<Uuid>> {
    let mut subtrees = Vec::with_capacity(roots.len());
    let mut nested = HashSet::new();
    for root in roots {
        let subtree = subtree_folder_ids(conn, *root).await?;
        nested.extend(subtree.iter().skip(1).copied());
        subtrees.push(subtree);
    }

    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for subtree in subtrees {
        if nested.contains(&subtree[0]) {
            continue;
        }
        for id in subtree {
            if seen.insert(id) {
                ordered.push(id);
            }
        }
    }
    Ok(ordered)
}

/// Every folder and file `user_id` owns, live or trashed, removed in one go.
/// The user row itself is left to the caller.
pub(crate) async fn purge_account(conn: &mut SqliteConnection, user_id: Uuid) -> DriveResult<PurgedRows> {
    let roots = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM folders WHERE user_id = ? AND parent_id IS NULL",
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;
    let file_ids = sqlx::query_scalar::<_, Uuid>("SELECT id FROM files WHERE user_id = ?")
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;

    let folders = collect_subtrees(conn, &roots).await?;
    purge_rows(conn, PurgeScope::Everything, &folders, &file_ids).await
}

/// Delete the rows of every file in `folder_ids` or `file_ids`, then the
/// folders deepest first, and release the reclaimed bytes from each owner.
/// `folder_ids` must list parents before their children.
async fn purge_rows(
    conn: &mut SqliteConnection,
    scope: PurgeScope,
    folder_ids: &[Uuid],
    file_ids: &[Uuid],
) -> DriveResult<PurgedRows> {
    let mut victims: HashMap<Uuid, FileRecord> = HashMap::new();
    for chunk in folder_ids.chunks(IN_CHUNK) {
        for file in select_files(conn, scope, "folder_id", chunk).await? {
            victims.insert(file.id, file);
        }
    }
    for chunk in file_ids.chunks(IN_CHUNK) {
        for file in select_files(conn, scope, "id", chunk).await? {
            victims.insert(file.id, file);
        }
    }

    let mut rows = PurgedRows::default();
    let ids: Vec<Uuid> = victims.keys().copied().collect();
    for chunk in ids.chunks(IN_CHUNK) {
        rows.files += delete_in(conn, "files", chunk).await? as usize;
    }

    let pinned = match scope {
        PurgeScope::Trashed => pinned_folders(conn, folder_ids).await?,
        PurgeScope::Everything => HashSet::new(),
    };
    if !pinned.is_empty() {
        warn!(
            "{} folders still lead to live items and were kept out of the purge",
            pinned.len()
        );
    }

    // children before parents, so no statement removes a referenced folder
    let reversed: Vec<Uuid> = folder_ids
        .iter()
        .rev()
        .filter(|id| !pinned.contains(*id))
        .copied()
        .collect();
    for chunk in reversed.chunks(IN_CHUNK) {
        rows.folders += delete_in(conn, "folders", chunk).await? as usize;
    }

    for file in victims.into_values() {
        let entry = rows.per_user.entry(file.user_id).or_default();
        entry.0 += 1;
        entry.1 += file.size_bytes;
        rows.bytes += file.size_bytes;
        rows.blobs.push(PathBuf::from(file.storage_path));
    }
    for (user_id, (_, bytes)) in &rows.per_user {
        quota::release(conn, *user_id, *bytes).await?;
    }
    Ok(rows)
}

/// Folders of `folder_ids` a trash purge must keep: live folders, folders
/// holding live files or live sub-folders, and their ancestors in the set.
async fn pinned_folders(conn: &mut SqliteConnection, folder_ids: &[Uuid]) -> DriveResult<HashSet<Uuid>> {
    let mut parents = HashMap::new();
    let mut pinned = HashSet::new();
    for chunk in folder_ids.chunks(IN_CHUNK) {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT id, parent_id, is_deleted FROM folders WHERE id IN (");
        push_ids(&mut builder, chunk);
        for (id, parent_id, is_deleted) in builder
            .build_query_as::<(Uuid, Option<Uuid>, bool)>()
            .fetch_all(&mut *conn)
            .await?
        {
            if !is_deleted {
                pinned.insert(id);
            }
            if let Some(parent_id) = parent_id {
                parents.insert(id, parent_id);
            }
        }

        for query in [
            "SELECT DISTINCT folder_id FROM files WHERE is_deleted = 0 AND folder_id IN (",
            "SELECT DISTINCT parent_id FROM folders WHERE is_deleted = 0 AND parent_id IN (",
        ] {
            let mut builder = QueryBuilder::<Sqlite>::new(query);
            push_ids(&mut builder, chunk);
            pinned.extend(builder.build_query_scalar::<Uuid>().fetch_all(&mut *conn).await?);
        }
    }

    let mut pending: Vec<Uuid> = pinned.iter().copied().collect();
    while let Some(id) = pending.pop() {
        if let Some(parent_id) = parents.get(&id) {
            if pinned.insert(*parent_id) {
                pending.push(*parent_id);
            }
        }
    }
    Ok(pinned)
}

fn push_ids(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[Uuid]) {
    let mut list = builder.separated(", ");
    for id in ids {
        list.push_bind(*id);
    }
    list.push_unseparated(")");
}

async fn select_files(
    conn: &mut SqliteConnection,
    scope: PurgeScope,
    column: &str,
    ids: &[Uuid],
) -> DriveResult<Vec<FileRecord>> {
    let filter = match scope {
        PurgeScope::Trashed => "is_deleted = 1 AND ",
        PurgeScope::Everything => "",
    };
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM files WHERE {}{} IN (",
        FILE_COLUMNS, filter, column
    ));
    push_ids(&mut builder, ids);
    Ok(builder.build_query_as::<FileRecord>().fetch_all(&mut *conn).await?)
}

async fn delete_in(conn: &mut SqliteConnection, table: &str, ids: &[Uuid]) -> DriveResult<u64> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {} WHERE id IN (", table));
    push_ids(&mut builder, ids);
    Ok(builder.build().execute(&mut *conn).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        quota::QuotaLedger,
        settings::{KEY_AUTO_CLEAN_TRASH, KEY_RETENTION_DAYS},
        test_support::TestDrive,
    };
    use chrono::Duration;

    #[tokio::test]
    async fn trashed_file_expires_after_system_retention() {
        let drive = TestDrive::new().await;
        drive.service.settings().update(KEY_RETENTION_DAYS, "7").await.unwrap();
        let user = drive.user_with_quota("pia", 1000).await;
        let file = drive.upload(user.id, None, "notes.txt", b"abc").await;

        drive.service.trash().trash_file(user.id, file.id).await.unwrap();

        let trashed = drive.service.tree().get_file(user.id, file.id).await.unwrap();
        assert!(trashed.is_deleted);
        let deleted_at = trashed.deleted_at.unwrap();
        assert_eq!(trashed.expiry_date.unwrap(), deleted_at + Duration::days(7));
    }

    #[tokio::test]
    async fn user_override_beats_system_retention() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("quinn", 1000).await;
        drive.service.users().set_retention(user.id, Some(2)).await.unwrap();
        let folder = drive.service.tree().create_folder(user.id, None, "tmp").await.unwrap();

        let summary = drive.service.trash().trash_folder(user.id, folder.id).await.unwrap();
        let trashed = drive.service.tree().get_folder(user.id, folder.id).await.unwrap();
        assert_eq!(summary.expiry_date, trashed.expiry_date);
        assert_eq!(trashed.expiry_date.unwrap(), trashed.deleted_at.unwrap() + Duration::days(2));
    }

    #[tokio::test]
    async fn folder_restore_brings_back_only_its_own_cascade() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("rosa", 10_000).await;
        let tree = drive.service.tree();
        let trash = drive.service.trash();

        let top = tree.create_folder(user.id, None, "top").await.unwrap();
        let sub = tree.create_folder(user.id, Some(top.id), "sub").await.unwrap();
        let early = drive.upload(user.id, Some(sub.id), "early.txt", b"1").await;
        let kept = drive.upload(user.id, Some(sub.id), "kept.txt", b"2").await;
        let direct = drive.upload(user.id, Some(top.id), "direct.txt", b"3").await;

        trash.trash_file(user.id, early.id).await.unwrap();
        let cascade = trash.trash_folder(user.id, top.id).await.unwrap();
        assert_eq!((cascade.folders, cascade.files), (2, 2));
        assert!(tree.get_file(user.id, kept.id).await.unwrap().is_deleted);

        trash.restore_folder(user.id, top.id).await.unwrap();
        assert!(!tree.get_folder(user.id, top.id).await.unwrap().is_deleted);
        assert!(!tree.get_folder(user.id, sub.id).await.unwrap().is_deleted);
        assert!(!tree.get_file(user.id, kept.id).await.unwrap().is_deleted);
        assert!(!tree.get_file(user.id, direct.id).await.unwrap().is_deleted);
        assert!(tree.get_file(user.id, early.id).await.unwrap().is_deleted);
    }

    #[tokio::test]
    async fn restoring_a_file_restores_trashed_ancestors() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("sami", 10_000).await;
        let tree = drive.service.tree();
        let trash = drive.service.trash();

        let a = tree.create_folder(user.id, None, "a").await.unwrap();
        let b = tree.create_folder(user.id, Some(a.id), "b").await.unwrap();
        let deep = drive.upload(user.id, Some(b.id), "deep.txt", b"x").await;
        let sibling = drive.upload(user.id, Some(a.id), "sibling.txt", b"y").await;
        trash.trash_folder(user.id, a.id).await.unwrap();

        let restored = trash.restore_file(user.id, deep.id).await.unwrap();
        assert!(!restored.is_deleted);
        assert!(!tree.get_folder(user.id, a.id).await.unwrap().is_deleted);
        assert!(!tree.get_folder(user.id, b.id).await.unwrap().is_deleted);
        // only the chain comes back, not the rest of the cascade
        assert!(tree.get_file(user.id, sibling.id).await.unwrap().is_deleted);
    }

    #[tokio::test]
    async fn purge_requires_trash_and_removes_bytes_and_row() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("tara", 1000).await;
        let trash = drive.service.trash();
        let file = drive.upload(user.id, None, "bye.txt", b"12345").await;

        let err = trash.purge_file(user.id, file.id).await.unwrap_err();
        assert!(matches!(err, DriveError::Conflict(_)));

        trash.trash_file(user.id, file.id).await.unwrap();
        let ledger = QuotaLedger::new(&drive.service.db);
        assert_eq!(ledger.usage(user.id).await.unwrap().used, 5);

        let summary = trash.purge_file(user.id, file.id).await.unwrap();
        assert_eq!(summary.files_purged, 1);
        assert_eq!(summary.bytes_reclaimed, 5);
        assert_eq!(summary.blob_failures, 0);
        assert!(!std::path::Path::new(&file.storage_path).exists());

        let err = drive.service.tree().get_file(user.id, file.id).await.unwrap_err();
        assert!(matches!(err, DriveError::NotFound("file")));
        assert_eq!(ledger.usage(user.id).await.unwrap().used, 0);
    }

    #[tokio::test]
    async fn purge_survives_missing_payload() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("uma", 1000).await;
        let trash = drive.service.trash();
        let file = drive.upload(user.id, None, "lost.bin", b"123").await;
        std::fs::remove_file(&file.storage_path).unwrap();

        trash.trash_file(user.id, file.id).await.unwrap();
        let summary = trash.purge_file(user.id, file.id).await.unwrap();
        assert_eq!(summary.files_purged, 1);
        assert_eq!(summary.blob_failures, 1);
        assert!(trash.list_trash(user.id).await.unwrap().files.is_empty());
    }

    #[tokio::test]
    async fn empty_trash_purges_nested_folders() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("vera", 10_000).await;
        let tree = drive.service.tree();
        let trash = drive.service.trash();

        let outer = tree.create_folder(user.id, None, "outer").await.unwrap();
        let inner = tree.create_folder(user.id, Some(outer.id), "inner").await.unwrap();
        drive.upload(user.id, Some(inner.id), "a.txt", b"aaaa").await;
        let loose = drive.upload(user.id, None, "b.txt", b"bb").await;
        let live = drive.upload(user.id, None, "c.txt", b"c").await;
        trash.trash_folder(user.id, outer.id).await.unwrap();
        trash.trash_file(user.id, loose.id).await.unwrap();

        let listing = trash.list_trash(user.id).await.unwrap();
        assert_eq!(listing.folders.len(), 1);
        assert_eq!(listing.files.len(), 1);

        let summary = trash.empty_trash(user.id).await.unwrap();
        assert_eq!(summary.folders_purged, 2);
        assert_eq!(summary.files_purged, 2);
        assert_eq!(summary.bytes_reclaimed, 6);

        let ledger = QuotaLedger::new(&drive.service.db);
        assert_eq!(ledger.usage(user.id).await.unwrap().used, 1);
        assert_eq!(ledger.recompute(user.id).await.unwrap(), 1);
        assert!(!tree.get_file(user.id, live.id).await.unwrap().is_deleted);
    }

    #[tokio::test]
    async fn sweep_purges_only_expired_items_as_system() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("wes", 10_000).await;
        let trash = drive.service.trash();
        let old = drive.upload(user.id, None, "old.txt", b"old").await;
        let fresh = drive.upload(user.id, None, "fresh.txt", b"fresh").await;
        trash.trash_file(user.id, old.id).await.unwrap();
        trash.trash_file(user.id, fresh.id).await.unwrap();
        sqlx::query("UPDATE files SET expiry_date = ? WHERE id = ?")
            .bind(Utc::now() - Duration::days(1))
            .bind(old.id)
            .execute(&*drive.service.db)
            .await
            .unwrap();

        let summary = trash.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(summary.files_purged, 1);
        assert!(drive.service.tree().get_file(user.id, fresh.id).await.is_ok());

        let system = drive.service.activity().recent_system(10).await.unwrap();
        assert_eq!(system.len(), 1);
        assert_eq!(system[0].action, "auto_cleanup");
        assert_eq!(system[0].user_id, None);
    }

    #[tokio::test]
    async fn sweep_respects_auto_clean_switch() {
        let drive = TestDrive::new().await;
        drive
            .service
            .settings()
            .update(KEY_AUTO_CLEAN_TRASH, "false")
            .await
            .unwrap();
        let user = drive.user_with_quota("xia", 1000).await;
        let file = drive.upload(user.id, None, "x.txt", b"x").await;
        drive.service.trash().trash_file(user.id, file.id).await.unwrap();

        let far_future = Utc::now() + Duration::days(365);
        let summary = drive.service.trash().sweep_expired(far_future).await.unwrap();
        assert_eq!(summary, PurgeSummary::default());
        assert!(drive.service.tree().get_file(user.id, file.id).await.is_ok());
    }

    #[tokio::test]
    async fn purging_a_folder_removes_the_whole_trashed_tree() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("zane", 10_000).await;
        let tree = drive.service.tree();
        let trash = drive.service.trash();

        let top = tree.create_folder(user.id, None, "top").await.unwrap();
        let mid = tree.create_folder(user.id, Some(top.id), "mid").await.unwrap();
        let leaf = tree.create_folder(user.id, Some(mid.id), "leaf").await.unwrap();
        let files = [
            drive.upload(user.id, Some(top.id), "a.txt", b"a").await,
            drive.upload(user.id, Some(mid.id), "b.txt", b"bb").await,
            drive.upload(user.id, Some(leaf.id), "c.txt", b"ccc").await,
        ];
        let outside = drive.upload(user.id, None, "d.txt", b"dddd").await;

        let err = trash.purge_folder(user.id, top.id).await.unwrap_err();
        assert!(matches!(err, DriveError::Conflict(_)));

        trash.trash_folder(user.id, top.id).await.unwrap();
        let summary = trash.purge_folder(user.id, top.id).await.unwrap();
        assert_eq!(summary.folders_purged, 3);
        assert_eq!(summary.files_purged, 3);
        assert_eq!(summary.bytes_reclaimed, 6);
        assert_eq!(summary.blob_failures, 0);

        for file in &files {
            assert!(!std::path::Path::new(&file.storage_path).exists());
            let err = tree.get_file(user.id, file.id).await.unwrap_err();
            assert!(matches!(err, DriveError::NotFound("file")));
        }
        for folder in [&top, &mid, &leaf] {
            let err = tree.get_folder(user.id, folder.id).await.unwrap_err();
            assert!(matches!(err, DriveError::NotFound("folder")));
        }
        assert!(!tree.get_file(user.id, outside.id).await.unwrap().is_deleted);
        assert_eq!(QuotaLedger::new(&drive.service.db).usage(user.id).await.unwrap().used, 4);
    }

    #[tokio::test]
    async fn purges_never_take_live_files_under_a_trashed_folder() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("abel", 10_000).await;
        let tree = drive.service.tree();
        let trash = drive.service.trash();

        let folder = tree.create_folder(user.id, None, "shared").await.unwrap();
        let stray = drive.upload(user.id, Some(folder.id), "stray.txt", b"stray").await;
        // a trashed folder whose file somehow stayed live
        let past = Utc::now() - Duration::days(1);
        sqlx::query("UPDATE folders SET is_deleted = 1, deleted_at = ?, expiry_date = ? WHERE id = ?")
            .bind(past)
            .bind(past)
            .bind(folder.id)
            .execute(&*drive.service.db)
            .await
            .unwrap();

        let summary = trash.purge_folder(user.id, folder.id).await.unwrap();
        assert_eq!((summary.files_purged, summary.folders_purged), (0, 0));
        let summary = trash.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!((summary.files_purged, summary.folders_purged), (0, 0));

        assert!(!tree.get_file(user.id, stray.id).await.unwrap().is_deleted);
        assert!(std::path::Path::new(&stray.storage_path).exists());
        assert_eq!(QuotaLedger::new(&drive.service.db).usage(user.id).await.unwrap().used, 5);
    }

    #[tokio::test]
    async fn batch_trash_and_restore_count_skipped_items() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("bria", 10_000).await;
        let tree = drive.service.tree();
        let trash = drive.service.trash();

        let folder = tree.create_folder(user.id, None, "old").await.unwrap();
        let inside = drive.upload(user.id, Some(folder.id), "in.txt", b"1").await;
        let loose = drive.upload(user.id, None, "loose.txt", b"2").await;
        let root = tree.root_folder(user.id).await.unwrap();

        let outcome = trash
            .trash_items(user.id, &[loose.id, Uuid::new_v4()], &[folder.id, root.id])
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome { applied: 2, skipped: 2 });
        assert!(tree.get_file(user.id, inside.id).await.unwrap().is_deleted);

        let again = trash.trash_items(user.id, &[loose.id], &[]).await.unwrap();
        assert_eq!(again, BatchOutcome { applied: 0, skipped: 1 });

        let outcome = trash
            .restore_items(user.id, &[loose.id], &[folder.id, Uuid::new_v4()])
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome { applied: 2, skipped: 1 });
        assert!(!tree.get_file(user.id, inside.id).await.unwrap().is_deleted);
        assert!(!tree.get_file(user.id, loose.id).await.unwrap().is_deleted);

        let outcome = trash.restore_items(user.id, &[loose.id], &[]).await.unwrap();
        assert_eq!(outcome, BatchOutcome { applied: 0, skipped: 1 });
    }

    #[tokio::test]
    async fn trash_and_restore_leave_usage_alone() {
        let drive = TestDrive::new().await;
        let user = drive.user_with_quota("yuri", 1000).await;
        let file = drive.upload(user.id, None, "keep.bin", b"0123456789").await;
        let ledger = QuotaLedger::new(&drive.service.db);

        drive.service.trash().trash_file(user.id, file.id).await.unwrap();
        assert_eq!(ledger.usage(user.id).await.unwrap().used, 10);
        drive.service.trash().restore_file(user.id, file.id).await.unwrap();
        assert_eq!(ledger.usage(user.id).await.unwrap().used, 10);
        assert_eq!(ledger.recompute(user.id).await.unwrap(), 10);
    }
}
