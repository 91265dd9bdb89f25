//! Database handle and session factory
//!
//! A `Database` owns the connection info, the schema registry and the cache
//! provider, all passed in explicitly; sessions are created from it and each
//! session owns its own connection for its lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::{CacheProvider, NullCacheProvider};
use crate::config::{ensure_db_dir, ConnectionInfo};
use crate::schema::{SchemaRegistry, TypeDescriptor};
use crate::session::Session;
use crate::storage::DbClient;
use crate::Result;

/// Distinguishes in-memory databases of different `Database` instances
/// within one process (shared-cache SQLite URIs are process-global).
static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct Database {
    connection_info: ConnectionInfo,
    registry: SchemaRegistry,
    cache: Arc<dyn CacheProvider>,
    /// In-memory databases live only while at least one connection is open,
    /// so the database pins one for its own lifetime.
    keeper: Option<DbClient>,
    memory_uri: Option<String>,
}

impl Database {
    pub fn new(connection_info: ConnectionInfo) -> Result<Self> {
        Self::with_cache_provider(connection_info, Arc::new(NullCacheProvider))
    }

    pub fn with_cache_provider(
        connection_info: ConnectionInfo,
        cache: Arc<dyn CacheProvider>,
    ) -> Result<Self> {
        let (keeper, memory_uri) = if connection_info.is_in_memory() {
            let uri = format!(
                "file:structdb-mem-{}-{}?mode=memory&cache=shared",
                connection_info.name,
                MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed)
            );
            (Some(DbClient::open_uri(&uri)?), Some(uri))
        } else {
            (None, None)
        };

        Ok(Self {
            connection_info,
            registry: SchemaRegistry::new(),
            cache,
            keeper,
            memory_uri,
        })
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.connection_info
    }

    /// True when the backing database physically exists: the file is present
    /// for file-backed databases, the keeper connection for in-memory ones.
    pub fn exists(&self) -> bool {
        match self.connection_info.database_path() {
            Some(path) => path.exists(),
            None => self.keeper.is_some(),
        }
    }

    /// Drop the backing database when present. The file is removed for
    /// file-backed databases; an in-memory database is released by closing
    /// its keeper connection. A no-op when nothing exists.
    pub fn delete_if_exists(&mut self) -> Result<()> {
        match self.connection_info.database_path() {
            Some(path) => {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                    tracing::debug!("deleted database file {}", path.display());
                }
            }
            None => {
                self.keeper = None;
                self.memory_uri = None;
            }
        }
        Ok(())
    }

    /// Register a structure type with this database
    pub fn register_type(&self, descriptor: TypeDescriptor) -> Result<()> {
        self.registry.register(descriptor)
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn cache_provider(&self) -> &Arc<dyn CacheProvider> {
        &self.cache
    }

    pub(crate) fn open_client(&self) -> Result<DbClient> {
        if let Some(uri) = &self.memory_uri {
            return DbClient::open_uri(uri);
        }
        let path = self.connection_info.database_path().ok_or_else(|| {
            crate::Error::Configuration(
                "in-memory database has been deleted".to_string(),
            )
        })?;
        ensure_db_dir(&path).map_err(|e| {
            crate::Error::Configuration(format!("cannot create database directory: {}", e))
        })?;
        DbClient::open(&path)
    }

    /// Begin a unit of work. The session owns its connection and an open
    /// transaction until commit or disposal; it is not safe for concurrent
    /// use from multiple threads. Independent sessions may run concurrently.
    pub fn begin_session(&self) -> Result<Session<'_>> {
        Session::begin(self)
    }
}
