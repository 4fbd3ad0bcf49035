//! Core data models for the personal drive.
//!
//! These entities describe users, the folder/file tree and the bookkeeping
//! tables around it. They map cleanly to database tables via `sqlx::FromRow`
//! and serialize naturally as JSON via `serde`.

pub mod activity;
pub mod file;
pub mod folder;
pub mod setting;
pub mod user;
