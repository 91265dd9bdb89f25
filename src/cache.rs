//! Cache-aware read path
//!
//! The cache provider is a process-wide collaborator shared across sessions,
//! keyed by structure id. Enablement is a static, per-schema decision made
//! once; when a schema is not enabled the provider is never consulted, and
//! when it is enabled it is never bypassed for id-level existence checks.
//! Query-shaped operations (any/count with a where) always go to the
//! backing store since the cache knows nothing about query shapes.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::schema::StructureSchema;
use crate::structure::StructureId;
use crate::Result;

/// Fallback probe invoked on a cache miss, at most once per miss
pub type ExistsFallback<'a> = &'a mut dyn FnMut(&StructureId) -> Result<bool>;

/// External cache capability for id-level existence checks
pub trait CacheProvider: Send + Sync {
    fn is_enabled_for(&self, schema: &StructureSchema) -> bool;

    /// Get-or-compute: consult the cache for `id`, invoking `fallback` on a
    /// miss and remembering its outcome before returning it.
    fn exists(
        &self,
        schema: &StructureSchema,
        id: &StructureId,
        fallback: ExistsFallback<'_>,
    ) -> Result<bool>;

    /// Drop any cached facts for an id whose structure was written
    fn evict(&self, schema: &StructureSchema, id: &StructureId);
}

/// Provider that disables caching for every schema
#[derive(Debug, Default)]
pub struct NullCacheProvider;

impl CacheProvider for NullCacheProvider {
    fn is_enabled_for(&self, _schema: &StructureSchema) -> bool {
        false
    }

    fn exists(
        &self,
        _schema: &StructureSchema,
        id: &StructureId,
        fallback: ExistsFallback<'_>,
    ) -> Result<bool> {
        fallback(id)
    }

    fn evict(&self, _schema: &StructureSchema, _id: &StructureId) {}
}

/// In-process cache provider with per-schema enablement
///
/// Concurrent get-or-compute calls for the same key collapse to at most one
/// backing-store probe: the map lock is held across the fallback.
pub struct MemoryCacheProvider {
    enabled: HashSet<String>,
    entries: Mutex<HashMap<(String, String), bool>>,
}

impl MemoryCacheProvider {
    /// Enable caching for the named structure types
    pub fn enabled_for(names: &[&str]) -> Self {
        Self {
            enabled: names.iter().map(|n| (*n).to_string()).collect(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(schema: &StructureSchema, id: &StructureId) -> (String, String) {
        (schema.name.clone(), id.as_key())
    }
}

impl CacheProvider for MemoryCacheProvider {
    fn is_enabled_for(&self, schema: &StructureSchema) -> bool {
        self.enabled.contains(&schema.name)
    }

    fn exists(
        &self,
        schema: &StructureSchema,
        id: &StructureId,
        fallback: ExistsFallback<'_>,
    ) -> Result<bool> {
        let key = Self::key(schema, id);
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(known) = entries.get(&key) {
            return Ok(*known);
        }
        let outcome = fallback(id)?;
        entries.insert(key, outcome);
        Ok(outcome)
    }

    fn evict(&self, schema: &StructureSchema, id: &StructureId) {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .remove(&Self::key(schema, id));
    }
}
