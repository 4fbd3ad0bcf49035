//! Name handling for user-facing file and folder names.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::services::error::{DriveError, DriveResult};

pub const MAX_NAME_LEN: usize = 255;

/// Make a user-supplied name filesystem-safe.
///
/// Path separators, control characters and characters that are reserved on
/// common filesystems are dropped, whitespace runs become `_`, and leading
/// dots are stripped so a name can never be `.`/`..` or hidden. Non-ASCII
/// letters are kept.
pub fn sanitize_name(raw: &str) -> DriveResult<String> {
    let mut cleaned = String::with_capacity(raw.len());
    let mut last_was_space = false;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                cleaned.push('_');
            }
            last_was_space = true;
            continue;
        }
        last_was_space = false;
        if ch.is_control() || matches!(ch, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
            continue;
        }
        cleaned.push(ch);
    }

    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        return Err(DriveError::Validation(format!("invalid name `{}`", raw)));
    }
    if cleaned.len() > MAX_NAME_LEN {
        return Err(DriveError::Validation(format!(
            "name is longer than {} bytes",
            MAX_NAME_LEN
        )));
    }
    Ok(cleaned)
}

/// Split `name` into stem and extension (extension includes the dot).
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

/// `report.pdf` -> `report_20240131120000.pdf`, used when a live sibling
/// already carries the name.
pub fn timestamped_name(name: &str, at: DateTime<Utc>) -> String {
    let (stem, ext) = split_extension(name);
    format!("{}_{}{}", stem, at.format("%Y%m%d%H%M%S"), ext)
}

/// Keep the old extension when a rename drops it.
pub fn keep_extension(old_name: &str, new_name: &str) -> String {
    let (_, old_ext) = split_extension(old_name);
    if !old_ext.is_empty() && !new_name.contains('.') {
        format!("{}{}", new_name, old_ext)
    } else {
        new_name.to_string()
    }
}

/// Collision-free on-disk name for a payload.
pub fn stored_name(sanitized: &str) -> String {
    format!("{}_{}", Uuid::new_v4().simple(), sanitized)
}

/// Coarse category used for listings and activity records.
pub fn file_category(name: &str) -> &'static str {
    let (_, ext) = split_extension(name);
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();

    if let Some(mime) = mime_guess::from_path(name).first() {
        let essence = mime.essence_str();
        match mime.type_().as_str() {
            "image" => return "image",
            "video" => return "video",
            "audio" => return "audio",
            "text" => return "document",
            _ => {}
        }
        if essence == "application/pdf" {
            return "document";
        }
        if essence.contains("spreadsheet") || essence.contains("excel") {
            return "spreadsheet";
        }
        if essence.contains("presentation") || essence.contains("powerpoint") {
            return "presentation";
        }
        if matches!(ext.as_str(), "zip" | "rar" | "7z" | "tar" | "gz") {
            return "archive";
        }
        if mime.type_().as_str() == "application" {
            return "application";
        }
    }

    if matches!(ext.as_str(), "zip" | "rar" | "7z" | "tar" | "gz") {
        return "archive";
    }
    "other"
}
