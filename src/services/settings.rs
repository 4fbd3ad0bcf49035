//! Typed view over the `system_settings` table.
//!
//! Settings are read once per operation into a [`Settings`] snapshot, so a
//! cascade or an upload sees one consistent set of values even if an admin
//! edits them concurrently.

use crate::{
    models::setting::SystemSetting,
    services::error::{DriveError, DriveResult},
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Retention used when neither the user nor the settings table provide one.
pub const FALLBACK_RETENTION_DAYS: i64 = 30;

pub const KEY_RETENTION_DAYS: &str = "default_trash_retention_days";
pub const KEY_MAX_UPLOAD_SIZE: &str = "max_upload_size";
pub const KEY_ALLOWED_FILE_TYPES: &str = "allowed_file_types";
pub const KEY_FORCE_DIRECT_WRITE: &str = "force_direct_write";
pub const KEY_AUTO_CLEAN_TRASH: &str = "auto_clean_trash";
pub const KEY_DEFAULT_USER_QUOTA: &str = "default_user_quota";
pub const KEY_ARCHIVE_STREAMING: &str = "archive_streaming";

/// Which file extensions an upload may carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllowedTypes {
    Any,
    Extensions(BTreeSet<String>),
}

impl AllowedTypes {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" || raw.is_empty() {
            return AllowedTypes::Any;
        }
        AllowedTypes::Extensions(
            raw.split(',')
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
        )
    }

    /// Check `filename`'s extension (case-insensitive) against the list.
    pub fn permits(&self, filename: &str) -> bool {
        match self {
            AllowedTypes::Any => true,
            AllowedTypes::Extensions(allowed) => filename
                .rsplit_once('.')
                .map(|(_, ext)| allowed.contains(&ext.to_ascii_lowercase()))
                .unwrap_or(false),
        }
    }
}

/// Snapshot of every setting the core consumes.
#[derive(Clone, Debug)]
pub struct Settings {
    pub default_retention_days: Option<i64>,
    pub max_upload_size: u64,
    pub allowed_types: AllowedTypes,
    pub force_direct_write: bool,
    pub auto_clean_trash: bool,
    pub default_user_quota: i64,
    pub archive_streaming: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_retention_days: Some(FALLBACK_RETENTION_DAYS),
            max_upload_size: 1024 * 1024 * 1024,
            allowed_types: AllowedTypes::Any,
            force_direct_write: false,
            auto_clean_trash: true,
            default_user_quota: 5 * 1024 * 1024 * 1024,
            archive_streaming: true,
        }
    }
}

impl Settings {
    /// Resolve the retention period for a user: personal override, then the
    /// system default, then [`FALLBACK_RETENTION_DAYS`].
    pub fn retention_days_for(&self, user_override: Option<i64>) -> i64 {
        user_override
            .filter(|days| *days > 0)
            .or(self.default_retention_days.filter(|days| *days > 0))
            .unwrap_or(FALLBACK_RETENTION_DAYS)
    }

    fn from_rows(rows: &HashMap<String, String>) -> Self {
        let defaults = Settings::default();
        Self {
            default_retention_days: rows
                .get(KEY_RETENTION_DAYS)
                .and_then(|raw| parse_or_warn::<i64>(KEY_RETENTION_DAYS, raw))
                .or(defaults.default_retention_days),
            max_upload_size: rows
                .get(KEY_MAX_UPLOAD_SIZE)
                .and_then(|raw| parse_or_warn(KEY_MAX_UPLOAD_SIZE, raw))
                .unwrap_or(defaults.max_upload_size),
            allowed_types: rows
                .get(KEY_ALLOWED_FILE_TYPES)
                .map(|raw| AllowedTypes::parse(raw))
                .unwrap_or(defaults.allowed_types),
            force_direct_write: rows
                .get(KEY_FORCE_DIRECT_WRITE)
                .and_then(|raw| parse_bool_or_warn(KEY_FORCE_DIRECT_WRITE, raw))
                .unwrap_or(defaults.force_direct_write),
            auto_clean_trash: rows
                .get(KEY_AUTO_CLEAN_TRASH)
                .and_then(|raw| parse_bool_or_warn(KEY_AUTO_CLEAN_TRASH, raw))
                .unwrap_or(defaults.auto_clean_trash),
            default_user_quota: rows
                .get(KEY_DEFAULT_USER_QUOTA)
                .and_then(|raw| parse_or_warn(KEY_DEFAULT_USER_QUOTA, raw))
                .unwrap_or(defaults.default_user_quota),
            archive_streaming: rows
                .get(KEY_ARCHIVE_STREAMING)
                .and_then(|raw| parse_bool_or_warn(KEY_ARCHIVE_STREAMING, raw))
                .unwrap_or(defaults.archive_streaming),
        }
    }
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("setting `{}` has invalid value `{}`, using default", key, raw);
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "t" => Some(true),
        "false" | "no" | "n" | "0" | "f" => Some(false),
        _ => None,
    }
}

fn parse_bool_or_warn(key: &str, raw: &str) -> Option<bool> {
    let parsed = parse_bool(raw);
    if parsed.is_none() {
        warn!("setting `{}` has invalid value `{}`, using default", key, raw);
    }
    parsed
}

/// Reads and updates the settings table.
#[derive(Clone)]
pub struct SettingsStore<'a> {
    db: &'a SqlitePool,
}

impl<'a> SettingsStore<'a> {
    pub fn new(db: &'a SqlitePool) -> Self {
        Self { db }
    }

    /// Load every row and build a typed snapshot.
    pub async fn snapshot(&self) -> DriveResult<Settings> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM system_settings")
            .fetch_all(self.db)
            .await?;
        Ok(Settings::from_rows(&rows.into_iter().collect::<HashMap<_, _>>()))
    }

    pub async fn list(&self) -> DriveResult<Vec<SystemSetting>> {
        Ok(sqlx::query_as::<_, SystemSetting>(
            "SELECT key, value, value_type, description FROM system_settings ORDER BY key",
        )
        .fetch_all(self.db)
        .await?)
    }

    /// Update an existing setting, rejecting values that do not match the
    /// row's type tag.
    pub async fn update(&self, key: &str, value: &str) -> DriveResult<SystemSetting> {
        let current = sqlx::query_as::<_, SystemSetting>(
            "SELECT key, value, value_type, description FROM system_settings WHERE key = ?",
        )
        .bind(key)
        .fetch_one(self.db)
        .await
        .map_err(|err| DriveError::from_lookup(err, "setting"))?;

        let value = value.trim();
        let valid = match current.value_type.as_str() {
            "integer" => value.parse::<i64>().map(|v| v >= 0).unwrap_or(false),
            "boolean" => parse_bool(value).is_some(),
            _ => true,
        };
        if !valid {
            return Err(DriveError::Validation(format!(
                "setting `{}` expects a {} value",
                key, current.value_type
            )));
        }

        sqlx::query("UPDATE system_settings SET value = ?, updated_at = ? WHERE key = ?")
            .bind(value)
            .bind(Utc::now())
            .bind(key)
            .execute(self.db)
            .await?;

        Ok(SystemSetting {
            value: value.to_string(),
            ..current
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::TestDrive;

    #[test]
    fn retention_prefers_user_override_then_system_default() {
        let settings = Settings {
            default_retention_days: Some(7),
            ..Settings::default()
        };
        assert_eq!(settings.retention_days_for(Some(3)), 3);
        assert_eq!(settings.retention_days_for(None), 7);
        assert_eq!(settings.retention_days_for(Some(0)), 7);

        let no_default = Settings {
            default_retention_days: None,
            ..Settings::default()
        };
        assert_eq!(no_default.retention_days_for(None), FALLBACK_RETENTION_DAYS);
    }

    #[test]
    fn allowed_types_match_extensions_case_insensitively() {
        let any = AllowedTypes::parse("*");
        assert!(any.permits("README"));

        let listed = AllowedTypes::parse("pdf, .PNG,txt");
        assert!(listed.permits("scan.PDF"));
        assert!(listed.permits("photo.png"));
        assert!(!listed.permits("tool.exe"));
        assert!(!listed.permits("noext"));
    }

    #[tokio::test]
    async fn snapshot_reads_seeded_defaults() {
        let drive = TestDrive::new().await;
        let settings = SettingsStore::new(&drive.service.db).snapshot().await.unwrap();

        assert_eq!(settings.default_retention_days, Some(30));
        assert_eq!(settings.allowed_types, AllowedTypes::Any);
        assert!(settings.auto_clean_trash);
        assert!(!settings.force_direct_write);
    }

    #[tokio::test]
    async fn invalid_stored_values_fall_back_to_defaults() {
        let drive = TestDrive::new().await;
        sqlx::query("UPDATE system_settings SET value = 'lots' WHERE key = ?")
            .bind(KEY_MAX_UPLOAD_SIZE)
            .execute(&*drive.service.db)
            .await
            .unwrap();

        let settings = SettingsStore::new(&drive.service.db).snapshot().await.unwrap();
        assert_eq!(settings.max_upload_size, Settings::default().max_upload_size);
    }

    #[tokio::test]
    async fn update_is_type_checked() {
        let drive = TestDrive::new().await;
        let store = SettingsStore::new(&drive.service.db);

        let err = store.update(KEY_FORCE_DIRECT_WRITE, "maybe").await.unwrap_err();
        assert!(matches!(err, DriveError::Validation(_)));

        store.update(KEY_FORCE_DIRECT_WRITE, "true").await.unwrap();
        assert!(store.snapshot().await.unwrap().force_direct_write);

        let err = store.update("no_such_key", "1").await.unwrap_err();
        assert!(matches!(err, DriveError::NotFound("setting")));
    }
}
