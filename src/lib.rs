//! # Structdb - Structure-Oriented Document Persistence
//!
//! Stores structured records inside SQLite by decomposing each record into
//! three correlated tables: a structure table (id + serialized body), an
//! index table (flattened member paths and values for querying), and a
//! uniques table (enforced uniqueness constraints).
//!
//! Structdb provides:
//! - Explicit type descriptors mapped to a three-table storage shape
//! - A serializable query IR compiled to parameterized SQL
//! - Atomic multi-table bulk insertion
//! - A cache-aware read path for id-level existence checks
//! - A transactional unit-of-work session as the outward-facing API

pub mod bulk;
pub mod cache;
pub mod config;
pub mod database;
pub mod query;
pub mod schema;
pub mod serialization;
pub mod session;
pub mod storage;
pub mod structure;

// Re-exports for convenient access
pub use cache::{CacheProvider, MemoryCacheProvider, NullCacheProvider};
pub use config::ConnectionInfo;
pub use database::Database;
pub use query::{QueryBuilder, QueryCommand};
pub use schema::{IdType, MemberDescriptor, StructureSchema, TypeDescriptor, ValueType};
pub use session::Session;
pub use structure::{IndexValue, Structure, StructureId};

/// Result type alias for structdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for structdb operations
///
/// Every public session operation classifies underlying failures into one of
/// these variants before surfacing; no raw backing-store error crosses the
/// boundary unclassified.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or incomplete configuration, e.g. connection info missing
    /// the required database name component
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A query referenced a member path unknown to the schema, or an
    /// existing physical table has an incompatible shape
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Unique constraint breach on insert or update
    #[error("Constraint violation on member '{path}' with value '{value}'")]
    ConstraintViolation { path: String, value: String },

    /// Operation attempted on a committed or disposed session
    #[error("Session is closed: {0}")]
    SessionClosed(String),

    /// Opaque failure surfaced from the storage connection
    #[error("Backing store error: {0}")]
    BackingStore(#[from] rusqlite::Error),

    /// Document (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// True when a backing-store error is a SQLite unique-constraint failure
pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::ConstraintViolation,
                ..
            },
            _,
        )
    )
}
