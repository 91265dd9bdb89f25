//! SQLite-backed storage layer

pub mod sqlite;
pub mod templates;

pub use sqlite::DbClient;
