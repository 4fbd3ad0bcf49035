//! Raw rows of the `system_settings` table.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A string-keyed setting with a type tag (`integer`, `boolean`, `string`).
///
/// The core never reads these directly; `SettingsStore::snapshot` turns them
/// into a typed `Settings` value.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct SystemSetting {
    pub key: String,
    pub value: String,
    pub value_type: String,
    pub description: Option<String>,
}
