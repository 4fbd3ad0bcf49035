//! Folder/file tree: owner-scoped lookups, listings, paths, moves, renames
//! and search.
//!
//! Lookups take the owner alongside the id and never return another user's
//! rows, so a foreign id is indistinguishable from a missing one.

use crate::{
    models::{file::FileRecord, folder::Folder},
    services::{
        activity::{ActivityLog, Actor, NewActivity},
        error::{DriveError, DriveResult},
        names::{keep_extension, sanitize_name, timestamped_name},
        users::{fetch_user, is_unique_violation},
    },
};
use chrono::Utc;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{HashSet, VecDeque};
use tracing::{info, warn};
use uuid::Uuid;

pub(crate) const FOLDER_COLUMNS: &str =
    "id, name, parent_id, user_id, created_at, updated_at, is_deleted, deleted_at, expiry_date, trash_batch";

pub(crate) const FILE_COLUMNS: &str = "id, stored_filename, original_filename, storage_path, size_bytes, \
     file_type, checksum, folder_id, user_id, created_at, updated_at, is_deleted, deleted_at, \
     expiry_date, trash_batch";

/// Largest number of ids bound into one `IN (...)` list.
pub(crate) const IN_CHUNK: usize = 500;

const ROOT_FOLDER_NAME: &str = "root";
const DEFAULT_SEARCH_LIMIT: i64 = 100;

/// Result of a move request. Rejections are reported, never silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveOutcome {
    Moved,
    /// Destination is the folder itself or lies beneath it.
    RejectedCycle,
    /// Destination belongs to a different user.
    RejectedCrossOwner,
}

/// Live contents of one folder.
#[derive(Debug, Serialize)]
pub struct FolderListing {
    pub folder: Folder,
    pub path: String,
    pub folders: Vec<Folder>,
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Default, Serialize)]
pub struct SearchResults {
    pub folders: Vec<Folder>,
    pub files: Vec<FileRecord>,
}

/// Counts reported by batch operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub applied: usize,
    pub skipped: usize,
}

pub struct ResourceTree<'a> {
    db: &'a SqlitePool,
}

impl<'a> ResourceTree<'a> {
    pub fn new(db: &'a SqlitePool) -> Self {
        Self { db }
    }

    /// The user's root folder, created on first access.
    pub async fn root_folder(&self, owner: Uuid) -> DriveResult<Folder> {
        let mut conn = self.db.acquire().await?;
        ensure_root(&mut conn, owner).await
    }

    /// Folder by id, in any state.
    pub async fn get_folder(&self, owner: Uuid, folder_id: Uuid) -> DriveResult<Folder> {
        let mut conn = self.db.acquire().await?;
        fetch_folder(&mut conn, owner, folder_id).await
    }

    /// File by id, in any state.
    pub async fn get_file(&self, owner: Uuid, file_id: Uuid) -> DriveResult<FileRecord> {
        let mut conn = self.db.acquire().await?;
        fetch_file(&mut conn, owner, file_id).await
    }

    /// Live file by id; trashed files are `NotFound`.
    pub async fn get_live_file(&self, owner: Uuid, file_id: Uuid) -> DriveResult<FileRecord> {
        let file = self.get_file(owner, file_id).await?;
        if file.is_deleted {
            return Err(DriveError::NotFound("file"));
        }
        Ok(file)
    }

    /// Resolve an optional destination: `None` is the root, otherwise the
    /// folder must be live and owned by `owner`.
    pub async fn resolve_folder(&self, owner: Uuid, folder_id: Option<Uuid>) -> DriveResult<Folder> {
        let mut conn = self.db.acquire().await?;
        resolve_live_folder(&mut conn, owner, folder_id).await
    }

    /// Live sub-folders and files of a live folder.
    pub async fn list_children(
        &self,
        owner: Uuid,
        folder_id: Option<Uuid>,
    ) -> DriveResult<FolderListing> {
        let mut conn = self.db.acquire().await?;
        let folder = resolve_live_folder(&mut conn, owner, folder_id).await?;

        let folders = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {} FROM folders WHERE parent_id = ? AND is_deleted = 0 ORDER BY name",
            FOLDER_COLUMNS
        ))
        .bind(folder.id)
        .fetch_all(&mut *conn)
        .await?;

        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM files WHERE folder_id = ? AND is_deleted = 0 ORDER BY original_filename",
            FILE_COLUMNS
        ))
        .bind(folder.id)
        .fetch_all(&mut *conn)
        .await?;

        let path = folder_path(&mut conn, &folder).await?;
        Ok(FolderListing {
            folder,
            path,
            folders,
            files,
        })
    }

    /// `/`-separated path of a folder below the root (the root itself is `/`).
    pub async fn path(&self, owner: Uuid, folder_id: Uuid) -> DriveResult<String> {
        let mut conn = self.db.acquire().await?;
        let folder = fetch_folder(&mut conn, owner, folder_id).await?;
        folder_path(&mut conn, &folder).await
    }

    /// True when `node` lies strictly beneath `ancestor`.
    pub async fn is_descendant(&self, ancestor: Uuid, node: Uuid) -> DriveResult<bool> {
        let mut conn = self.db.acquire().await?;
        is_descendant(&mut conn, ancestor, node).await
    }

    /// Create a folder under a live parent (root when `None`).
    pub async fn create_folder(
        &self,
        owner: Uuid,
        parent_id: Option<Uuid>,
        name: &str,
    ) -> DriveResult<Folder> {
        let name = sanitize_name(name)?;
        let mut tx = self.db.begin().await?;
        let parent = resolve_live_folder(&mut tx, owner, parent_id).await?;
        if live_folder_named(&mut tx, parent.id, &name, None).await?.is_some() {
            return Err(DriveError::Conflict(format!(
                "a folder named `{}` already exists here",
                name
            )));
        }
        let folder = insert_folder(&mut tx, owner, parent.id, &name).await?;
        tx.commit().await?;

        info!("created folder {} ({}) for user {}", folder.name, folder.id, owner);
        ActivityLog::new(self.db)
            .record(NewActivity::new(Actor::User(owner), "create_folder").target(folder.name.clone()))
            .await;
        Ok(folder)
    }

    /// Create every missing segment of `a/b/c` below `parent_id`, reusing
    /// live folders that already exist. Returns the deepest folder.
    pub async fn create_folder_path(
        &self,
        owner: Uuid,
        parent_id: Option<Uuid>,
        path: &str,
    ) -> DriveResult<Folder> {
        let mut tx = self.db.begin().await?;
        let folder = ensure_folder_path(&mut tx, owner, parent_id, path).await?;
        tx.commit().await?;
        Ok(folder)
    }

    /// Move a live file into another live folder of the same owner.
    ///
    /// A live file with the same name at the destination gets a timestamp
    /// suffix, as uploads do.
    pub async fn move_file(
        &self,
        owner: Uuid,
        file_id: Uuid,
        destination: Uuid,
    ) -> DriveResult<MoveOutcome> {
        let mut tx = self.db.begin().await?;
        let file = fetch_file(&mut tx, owner, file_id).await?;
        if file.is_deleted {
            return Err(DriveError::NotFound("file"));
        }
        let dest = match check_destination(&mut tx, owner, destination).await? {
            Ok(dest) => dest,
            Err(outcome) => return Ok(outcome),
        };
        if dest.id == file.folder_id {
            return Ok(MoveOutcome::Moved);
        }

        let now = Utc::now();
        let name = if live_file_named(&mut tx, dest.id, &file.original_filename, None).await? {
            timestamped_name(&file.original_filename, now)
        } else {
            file.original_filename.clone()
        };
        sqlx::query(
            "UPDATE files SET folder_id = ?, original_filename = ?, updated_at = ? WHERE id = ?",
        )
        .bind(dest.id)
        .bind(&name)
        .bind(now)
        .bind(file.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        ActivityLog::new(self.db)
            .record(
                NewActivity::new(Actor::User(owner), "move")
                    .target(name)
                    .details(format!("to folder {}", dest.name)),
            )
            .await;
        Ok(MoveOutcome::Moved)
    }

    /// Re-parent a live folder. The root cannot be moved; a destination that
    /// is the folder itself or one of its descendants is `RejectedCycle`.
    pub async fn move_folder(
        &self,
        owner: Uuid,
        folder_id: Uuid,
        destination: Uuid,
    ) -> DriveResult<MoveOutcome> {
        let mut tx = self.db.begin().await?;
        let folder = fetch_folder(&mut tx, owner, folder_id).await?;
        if folder.is_deleted {
            return Err(DriveError::NotFound("folder"));
        }
        if folder.is_root() {
            return Err(DriveError::Validation("the root folder cannot be moved".into()));
        }
        let dest = match check_destination(&mut tx, owner, destination).await? {
            Ok(dest) => dest,
            Err(outcome) => return Ok(outcome),
        };
        if dest.id == folder.id || is_descendant(&mut tx, folder.id, dest.id).await? {
            return Ok(MoveOutcome::RejectedCycle);
        }
        if folder.parent_id == Some(dest.id) {
            return Ok(MoveOutcome::Moved);
        }
        if live_folder_named(&mut tx, dest.id, &folder.name, Some(folder.id))
            .await?
            .is_some()
        {
            return Err(DriveError::Conflict(format!(
                "a folder named `{}` already exists in the destination",
                folder.name
            )));
        }

        sqlx::query("UPDATE folders SET parent_id = ?, updated_at = ? WHERE id = ?")
            .bind(dest.id)
            .bind(Utc::now())
            .bind(folder.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        ActivityLog::new(self.db)
            .record(
                NewActivity::new(Actor::User(owner), "move")
                    .target(folder.name)
                    .details(format!("to folder {}", dest.name)),
            )
            .await;
        Ok(MoveOutcome::Moved)
    }

    /// Move several files and folders into one destination. Items that are
    /// missing or rejected are counted as skipped.
    pub async fn move_items(
        &self,
        owner: Uuid,
        file_ids: &[Uuid],
        folder_ids: &[Uuid],
        destination: Uuid,
    ) -> DriveResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for id in file_ids {
            tally(&mut outcome, self.move_file(owner, *id, destination).await)?;
        }
        for id in folder_ids {
            tally(&mut outcome, self.move_folder(owner, *id, destination).await)?;
        }
        Ok(outcome)
    }

    /// Rename a live file. The old extension is kept when the new name has
    /// none; a live sibling with the resulting name is a conflict.
    pub async fn rename_file(&self, owner: Uuid, file_id: Uuid, new_name: &str) -> DriveResult<FileRecord> {
        let mut tx = self.db.begin().await?;
        let file = fetch_file(&mut tx, owner, file_id).await?;
        if file.is_deleted {
            return Err(DriveError::NotFound("file"));
        }
        let name = keep_extension(&file.original_filename, &sanitize_name(new_name)?);
        if live_file_named(&mut tx, file.folder_id, &name, Some(file.id)).await? {
            return Err(DriveError::Conflict(format!(
                "a file named `{}` already exists here",
                name
            )));
        }

        let now = Utc::now();
        sqlx::query("UPDATE files SET original_filename = ?, updated_at = ? WHERE id = ?")
            .bind(&name)
            .bind(now)
            .bind(file.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        ActivityLog::new(self.db)
            .record(
                NewActivity::new(Actor::User(owner), "rename")
                    .target(name.clone())
                    .details(format!("from {}", file.original_filename)),
            )
            .await;
        Ok(FileRecord {
            original_filename: name,
            updated_at: now,
            ..file
        })
    }

    /// Rename a live folder, rejecting a clash with a live sibling.
    pub async fn rename_folder(&self, owner: Uuid, folder_id: Uuid, new_name: &str) -> DriveResult<Folder> {
        let name = sanitize_name(new_name)?;
        let mut tx = self.db.begin().await?;
        let folder = fetch_folder(&mut tx, owner, folder_id).await?;
        if folder.is_deleted {
            return Err(DriveError::NotFound("folder"));
        }
        let Some(parent_id) = folder.parent_id else {
            return Err(DriveError::Validation("the root folder cannot be renamed".into()));
        };
        if live_folder_named(&mut tx, parent_id, &name, Some(folder.id))
            .await?
            .is_some()
        {
            return Err(DriveError::Conflict(format!(
                "a folder named `{}` already exists here",
                name
            )));
        }

        let now = Utc::now();
        sqlx::query("UPDATE folders SET name = ?, updated_at = ? WHERE id = ?")
            .bind(&name)
            .bind(now)
            .bind(folder.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        ActivityLog::new(self.db)
            .record(
                NewActivity::new(Actor::User(owner), "rename")
                    .target(name.clone())
                    .details(format!("from {}", folder.name)),
            )
            .await;
        Ok(Folder {
            name,
            updated_at: now,
            ..folder
        })
    }

    /// Case-insensitive substring search over the user's live items.
    pub async fn search(&self, owner: Uuid, query: &str, limit: Option<i64>) -> DriveResult<SearchResults> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(SearchResults::default());
        }
        let pattern = format!("%{}%", escape_like(query));
        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, 1000);

        let folders = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {} FROM folders
             WHERE user_id = ? AND is_deleted = 0 AND parent_id IS NOT NULL
               AND name LIKE ? ESCAPE '\\'
             ORDER BY name LIMIT ?",
            FOLDER_COLUMNS
        ))
        .bind(owner)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(self.db)
        .await?;

        let files = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM files
             WHERE user_id = ? AND is_deleted = 0 AND original_filename LIKE ? ESCAPE '\\'
             ORDER BY original_filename LIMIT ?",
            FILE_COLUMNS
        ))
        .bind(owner)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(self.db)
        .await?;

        Ok(SearchResults { folders, files })
    }
}

fn tally(outcome: &mut BatchOutcome, result: DriveResult<MoveOutcome>) -> DriveResult<()> {
    match result {
        Ok(MoveOutcome::Moved) => outcome.applied += 1,
        Ok(_) | Err(DriveError::NotFound(_)) | Err(DriveError::Conflict(_)) | Err(DriveError::Validation(_)) => {
            outcome.skipped += 1
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Look up a destination folder without owner scoping so a foreign folder
/// can be reported as `RejectedCrossOwner`. Missing or trashed is `NotFound`.
async fn check_destination(
    conn: &mut SqliteConnection,
    owner: Uuid,
    destination: Uuid,
) -> DriveResult<Result<Folder, MoveOutcome>> {
    let dest = sqlx::query_as::<_, Folder>(&format!("SELECT {} FROM folders WHERE id = ?", FOLDER_COLUMNS))
        .bind(destination)
        .fetch_optional(&mut *conn)
        .await?;
    match dest {
        Some(dest) if dest.user_id != owner => {
            warn!("user {} tried to move an item into folder {} of another user", owner, destination);
            Ok(Err(MoveOutcome::RejectedCrossOwner))
        }
        Some(dest) if !dest.is_deleted => Ok(Ok(dest)),
        _ => Err(DriveError::NotFound("folder")),
    }
}

pub(crate) async fn fetch_folder(
    conn: &mut SqliteConnection,
    owner: Uuid,
    folder_id: Uuid,
) -> DriveResult<Folder> {
    sqlx::query_as::<_, Folder>(&format!(
        "SELECT {} FROM folders WHERE id = ? AND user_id = ?",
        FOLDER_COLUMNS
    ))
    .bind(folder_id)
    .bind(owner)
    .fetch_one(conn)
    .await
    .map_err(|err| DriveError::from_lookup(err, "folder"))
}

pub(crate) async fn fetch_file(
    conn: &mut SqliteConnection,
    owner: Uuid,
    file_id: Uuid,
) -> DriveResult<FileRecord> {
    sqlx::query_as::<_, FileRecord>(&format!(
        "SELECT {} FROM files WHERE id = ? AND user_id = ?",
        FILE_COLUMNS
    ))
    .bind(file_id)
    .bind(owner)
    .fetch_one(conn)
    .await
    .map_err(|err| DriveError::from_lookup(err, "file"))
}

/// Return the user's root, inserting it if this is the first access.
/// Concurrent first accesses race on the partial unique index; the loser's
/// insert is ignored and both read the same row.
pub(crate) async fn ensure_root(conn: &mut SqliteConnection, owner: Uuid) -> DriveResult<Folder> {
    fetch_user(conn, owner).await?;

    let now = Utc::now();
    sqlx::query(
        "INSERT OR IGNORE INTO folders (id, name, parent_id, user_id, created_at, updated_at, is_deleted)
         VALUES (?, ?, NULL, ?, ?, ?, 0)",
    )
    .bind(Uuid::new_v4())
    .bind(ROOT_FOLDER_NAME)
    .bind(owner)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(sqlx::query_as::<_, Folder>(&format!(
        "SELECT {} FROM folders WHERE user_id = ? AND parent_id IS NULL",
        FOLDER_COLUMNS
    ))
    .bind(owner)
    .fetch_one(&mut *conn)
    .await?)
}

pub(crate) async fn resolve_live_folder(
    conn: &mut SqliteConnection,
    owner: Uuid,
    folder_id: Option<Uuid>,
) -> DriveResult<Folder> {
    match folder_id {
        None => ensure_root(conn, owner).await,
        Some(id) => {
            let folder = fetch_folder(conn, owner, id).await?;
            if folder.is_deleted {
                return Err(DriveError::NotFound("folder"));
            }
            Ok(folder)
        }
    }
}

/// Walk up from `node`'s parent; true when `ancestor` is met. Stops on a
/// repeated id so a corrupt chain cannot loop forever.
pub(crate) async fn is_descendant(
    conn: &mut SqliteConnection,
    ancestor: Uuid,
    node: Uuid,
) -> DriveResult<bool> {
    let mut visited = HashSet::new();
    let mut current = parent_of(conn, node).await?;
    while let Some(id) = current {
        if id == ancestor {
            return Ok(true);
        }
        if !visited.insert(id) {
            warn!("cycle detected in folder chain at {}", id);
            return Ok(false);
        }
        current = parent_of(conn, id).await?;
    }
    Ok(false)
}

async fn parent_of(conn: &mut SqliteConnection, folder_id: Uuid) -> DriveResult<Option<Uuid>> {
    Ok(
        sqlx::query_scalar::<_, Option<Uuid>>("SELECT parent_id FROM folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(&mut *conn)
            .await?
            .flatten(),
    )
}

pub(crate) async fn folder_path(conn: &mut SqliteConnection, folder: &Folder) -> DriveResult<String> {
    let mut names = Vec::new();
    let mut visited = HashSet::new();
    let mut current = Some(folder.clone());
    while let Some(node) = current {
        if node.parent_id.is_none() || !visited.insert(node.id) {
            break;
        }
        let parent_id = node.parent_id;
        names.push(node.name);
        current = match parent_id {
            Some(pid) => sqlx::query_as::<_, Folder>(&format!(
                "SELECT {} FROM folders WHERE id = ?",
                FOLDER_COLUMNS
            ))
            .bind(pid)
            .fetch_optional(&mut *conn)
            .await?,
            None => None,
        };
    }
    names.reverse();
    Ok(format!("/{}", names.join("/")))
}

/// Every folder id of the subtree rooted at `root` in breadth-first order,
/// `root` first, regardless of trash state.
pub(crate) async fn subtree_folder_ids(conn: &mut SqliteConnection, root: Uuid) -> DriveResult<Vec<Uuid>> {
    let mut order = vec![root];
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        let children = sqlx::query_scalar::<_, Uuid>("SELECT id FROM folders WHERE parent_id = ?")
            .bind(id)
            .fetch_all(&mut *conn)
            .await?;
        for child in children {
            if seen.insert(child) {
                order.push(child);
                queue.push_back(child);
            }
        }
    }
    Ok(order)
}

pub(crate) async fn live_folder_named(
    conn: &mut SqliteConnection,
    parent_id: Uuid,
    name: &str,
    exclude: Option<Uuid>,
) -> DriveResult<Option<Folder>> {
    let found = sqlx::query_as::<_, Folder>(&format!(
        "SELECT {} FROM folders WHERE parent_id = ? AND name = ? AND is_deleted = 0",
        FOLDER_COLUMNS
    ))
    .bind(parent_id)
    .bind(name)
    .fetch_all(&mut *conn)
    .await?;
    Ok(found.into_iter().find(|f| Some(f.id) != exclude))
}

pub(crate) async fn live_file_named(
    conn: &mut SqliteConnection,
    folder_id: Uuid,
    name: &str,
    exclude: Option<Uuid>,
) -> DriveResult<bool> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM files WHERE folder_id = ? AND original_filename = ? AND is_deleted = 0",
    )
    .bind(folder_id)
    .bind(name)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids.into_iter().any(|id| Some(id) != exclude))
}

async fn insert_folder(
    conn: &mut SqliteConnection,
    owner: Uuid,
    parent_id: Uuid,
    name: &str,
) -> DriveResult<Folder> {
    let now = Utc::now();
    let folder = Folder {
        id: Uuid::new_v4(),
        name: name.to_string(),
        parent_id: Some(parent_id),
        user_id: owner,
        created_at: now,
        updated_at: now,
        is_deleted: false,
        deleted_at: None,
        expiry_date: None,
        trash_batch: None,
    };
    sqlx::query(
        "INSERT INTO folders (id, name, parent_id, user_id, created_at, updated_at, is_deleted)
         VALUES (?, ?, ?, ?, ?, ?, 0)",
    )
    .bind(folder.id)
    .bind(&folder.name)
    .bind(parent_id)
    .bind(owner)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|err| {
        if is_unique_violation(&err) {
            DriveError::Conflict(format!("folder `{}` already exists", name))
        } else {
            DriveError::Sqlx(err)
        }
    })?;
    Ok(folder)
}

/// Walk `path` segment by segment from `parent_id`, creating what is missing.
pub(crate) async fn ensure_folder_path(
    conn: &mut SqliteConnection,
    owner: Uuid,
    parent_id: Option<Uuid>,
    path: &str,
) -> DriveResult<Folder> {
    let mut current = resolve_live_folder(conn, owner, parent_id).await?;
    for segment in path.split(['/', '\\']).filter(|s| !s.trim().is_empty()) {
        let name = sanitize_name(segment)?;
        current = match live_folder_named(conn, current.id, &name, None).await? {
            Some(existing) => existing,
            None => insert_folder(conn, owner, current.id, &name).await?,
        };
    }
    Ok(current)
}
