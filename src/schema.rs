//! Structure schema model
//!
//! Maps a statically declared type descriptor to its three-table storage
//! shape and per-member index accessors. Derivation is pure and idempotent;
//! physical persistence happens lazily in the storage layer on first use.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::{Error, Result};

/// Name of the id member every structure document carries, always serialized
/// as the first top-level key.
pub const ID_MEMBER: &str = "StructureId";

/// Semantic type of an indexable member value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    String,
    Int,
    Fractal,
    Bool,
    DateTime,
}

/// Id strategy for a structure type
///
/// Identity ids are server-assigned at insert time; Guid and String ids are
/// client-generated before storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdType {
    Identity,
    BigIdentity,
    Guid,
    StringValue,
}

impl IdType {
    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity | Self::BigIdentity)
    }
}

/// One declared member of a structure type
///
/// `path` uses dot notation for nested members ("Address.Zip"). Enumerable
/// members contribute one index row per collection element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDescriptor {
    pub path: String,
    pub value_type: ValueType,
    pub is_unique: bool,
    pub is_enumerable: bool,
}

impl MemberDescriptor {
    pub fn new(path: &str, value_type: ValueType) -> Self {
        Self {
            path: path.to_string(),
            value_type,
            is_unique: false,
            is_enumerable: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn enumerable(mut self) -> Self {
        self.is_enumerable = true;
        self
    }
}

/// Statically declared descriptor for a record type
///
/// Replaces runtime type introspection: the caller layer declares the type
/// name, id strategy and indexable members explicitly. The id member is
/// implicit and must not appear in `members`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub id_type: IdType,
    pub members: Vec<MemberDescriptor>,
}

impl TypeDescriptor {
    pub fn new(name: &str, id_type: IdType, members: Vec<MemberDescriptor>) -> Self {
        Self {
            name: name.to_string(),
            id_type,
            members,
        }
    }
}

/// One indexable member path of a derived schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexAccessor {
    pub path: String,
    pub value_type: ValueType,
    pub is_unique: bool,
    pub is_enumerable: bool,
}

/// Derived mapping from a record type to its three physical tables and
/// indexable paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureSchema {
    pub name: String,
    pub id_type: IdType,
    pub index_accessors: Vec<IndexAccessor>,
}

impl StructureSchema {
    pub fn structure_table(&self) -> String {
        self.name.clone()
    }

    pub fn indexes_table(&self) -> String {
        format!("{}Indexes", self.name)
    }

    pub fn uniques_table(&self) -> String {
        format!("{}Uniques", self.name)
    }

    /// Look up the accessor for a member path, failing with a schema
    /// mismatch when the path is not indexable.
    pub fn accessor(&self, path: &str) -> Result<&IndexAccessor> {
        self.index_accessors
            .iter()
            .find(|a| a.path == path)
            .ok_or_else(|| {
                Error::SchemaMismatch(format!(
                    "member path '{}' is not indexed on structure '{}'",
                    path, self.name
                ))
            })
    }

    pub fn has_uniques(&self) -> bool {
        self.index_accessors.iter().any(|a| a.is_unique)
    }

    /// Top-level document member names in declared order, id excluded.
    /// Nested paths collapse to their first segment, deduplicated.
    pub fn top_level_members(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for accessor in &self.index_accessors {
            let head = accessor.path.split('.').next().unwrap_or(&accessor.path);
            if !seen.contains(&head) {
                seen.push(head);
            }
        }
        seen
    }
}

/// Derive a structure schema from a type descriptor
///
/// Pure and deterministic: re-deriving for the same descriptor yields a
/// value-identical schema.
pub fn derive_schema(descriptor: &TypeDescriptor) -> Result<StructureSchema> {
    if descriptor.name.is_empty() {
        return Err(Error::Configuration(
            "type descriptor has an empty name".to_string(),
        ));
    }
    for member in &descriptor.members {
        if member.path.is_empty() || member.path == ID_MEMBER {
            return Err(Error::SchemaMismatch(format!(
                "invalid member path '{}' on type '{}'",
                member.path, descriptor.name
            )));
        }
    }

    let index_accessors = descriptor
        .members
        .iter()
        .map(|m| IndexAccessor {
            path: m.path.clone(),
            value_type: m.value_type,
            is_unique: m.is_unique,
            is_enumerable: m.is_enumerable,
        })
        .collect();

    Ok(StructureSchema {
        name: descriptor.name.clone(),
        id_type: descriptor.id_type,
        index_accessors,
    })
}

/// Session-lifetime schema cache
///
/// Owned by the database and shared across its sessions; an explicit object
/// rather than process-wide static state. Derivation happens on first
/// reference to a type and the result is cached by name.
pub struct SchemaRegistry {
    descriptors: Mutex<HashMap<String, TypeDescriptor>>,
    schemas: Mutex<HashMap<String, StructureSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            descriptors: Mutex::new(HashMap::new()),
            schemas: Mutex::new(HashMap::new()),
        }
    }

    /// Register a type descriptor. Re-registering the same descriptor is a
    /// no-op; registering a different shape under an existing name fails.
    pub fn register(&self, descriptor: TypeDescriptor) -> Result<()> {
        let mut descriptors = self.descriptors.lock().expect("registry lock poisoned");
        if let Some(existing) = descriptors.get(&descriptor.name) {
            if *existing != descriptor {
                return Err(Error::SchemaMismatch(format!(
                    "type '{}' is already registered with a different shape",
                    descriptor.name
                )));
            }
            return Ok(());
        }
        descriptors.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Fetch (deriving and caching on first use) the schema for a type name
    pub fn get_schema(&self, name: &str) -> Result<StructureSchema> {
        if let Some(schema) = self
            .schemas
            .lock()
            .expect("registry lock poisoned")
            .get(name)
        {
            return Ok(schema.clone());
        }

        let descriptor = {
            let descriptors = self.descriptors.lock().expect("registry lock poisoned");
            descriptors.get(name).cloned().ok_or_else(|| {
                Error::SchemaMismatch(format!("no type descriptor registered for '{}'", name))
            })?
        };
        let schema = derive_schema(&descriptor)?;
        self.schemas
            .lock()
            .expect("registry lock poisoned")
            .insert(name.to_string(), schema.clone());
        Ok(schema)
    }

    pub fn get_descriptor(&self, name: &str) -> Result<TypeDescriptor> {
        self.descriptors
            .lock()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                Error::SchemaMismatch(format!("no type descriptor registered for '{}'", name))
            })
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
