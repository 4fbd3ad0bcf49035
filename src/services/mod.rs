pub mod activity;
pub mod archive;
pub mod blob_store;
pub mod drive_service;
pub mod error;
pub mod names;
pub mod placement;
pub mod quota;
pub mod settings;
pub mod sweeper;
pub mod trash;
pub mod tree;
pub mod upload;
pub mod users;

#[cfg(test)]
pub mod test_support;
