//! Structure instances and their derived index/unique rows
//!
//! A `Structure` is one persisted document: an id, the canonical serialized
//! body, and the index/unique rows derived from that body. Derivation is
//! deterministic and always recomputed whole when a structure is rewritten.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::fmt;
use uuid::Uuid;

use crate::schema::{IdType, StructureSchema, ID_MEMBER};
use crate::{Error, Result};

/// Id of one persisted structure, in the domain of its schema's `IdType`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructureId {
    Identity(i32),
    BigIdentity(i64),
    Guid(Uuid),
    String(String),
}

impl StructureId {
    /// Canonical text form, used as cache key and for diagnostics
    pub fn as_key(&self) -> String {
        match self {
            Self::Identity(v) => v.to_string(),
            Self::BigIdentity(v) => v.to_string(),
            Self::Guid(v) => v.to_string(),
            Self::String(v) => v.clone(),
        }
    }

    /// JSON value embedded as the document's first top-level member
    pub fn to_json(&self) -> Json {
        match self {
            Self::Identity(v) => Json::from(*v),
            Self::BigIdentity(v) => Json::from(*v),
            Self::Guid(v) => Json::from(v.to_string()),
            Self::String(v) => Json::from(v.clone()),
        }
    }
}

impl fmt::Display for StructureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

/// One indexed member value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Fractal(f64),
    Bool(bool),
    Null,
}

impl IndexValue {
    /// Convert a JSON scalar to an index value. Objects and arrays are not
    /// scalar and yield no value.
    pub fn from_json(value: &Json) -> Option<Self> {
        match value {
            Json::Null => Some(Self::Null),
            Json::Bool(b) => Some(Self::Bool(*b)),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Int(i))
                } else {
                    n.as_f64().map(Self::Fractal)
                }
            }
            Json::String(s) => Some(Self::String(s.clone())),
            Json::Array(_) | Json::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Self::String(s) => Json::from(s.clone()),
            Self::Int(i) => Json::from(*i),
            Self::Fractal(f) => Json::from(*f),
            Self::Bool(b) => Json::from(*b),
            Self::Null => Json::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Fractal(v) => write!(f, "{}", v),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for IndexValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for IndexValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for IndexValue {
    fn from(v: f64) -> Self {
        Self::Fractal(v)
    }
}

impl From<bool> for IndexValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// One (member path, value) fact about a structure, stored in the narrow
/// index table to support querying
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    pub path: String,
    pub value: IndexValue,
}

/// One uniqueness-constrained (member path, value) fact tied to a structure
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueItem {
    pub path: String,
    pub value: IndexValue,
    pub structure_id: StructureId,
}

/// One logical document instance ready for storage
#[derive(Debug, Clone)]
pub struct Structure {
    pub id: StructureId,
    pub body: String,
    pub indexes: Vec<IndexRow>,
    pub uniques: Vec<UniqueItem>,
}

/// Resolve the id carried by a source document, generating one where the
/// id strategy allows it.
///
/// Identity ids return `None` here; they are server-assigned by the session
/// at insert time. Missing Guid ids are generated; missing String ids fail.
pub fn resolve_id(schema: &StructureSchema, source: &Json) -> Result<Option<StructureId>> {
    let raw = source.get(ID_MEMBER);
    match schema.id_type {
        IdType::Identity => match raw.and_then(Json::as_i64).filter(|v| *v > 0) {
            Some(v) => {
                let v = i32::try_from(v).map_err(|_| {
                    Error::SchemaMismatch(format!(
                        "id {} exceeds the Identity range on structure '{}'",
                        v, schema.name
                    ))
                })?;
                Ok(Some(StructureId::Identity(v)))
            }
            None => Ok(None),
        },
        IdType::BigIdentity => Ok(raw
            .and_then(Json::as_i64)
            .filter(|v| *v > 0)
            .map(StructureId::BigIdentity)),
        IdType::Guid => match raw.and_then(Json::as_str) {
            Some(text) if !text.is_empty() => {
                let parsed = Uuid::parse_str(text).map_err(|e| {
                    Error::SchemaMismatch(format!(
                        "invalid Guid id '{}' on structure '{}': {}",
                        text, schema.name, e
                    ))
                })?;
                if parsed.is_nil() {
                    Ok(Some(StructureId::Guid(Uuid::new_v4())))
                } else {
                    Ok(Some(StructureId::Guid(parsed)))
                }
            }
            _ => Ok(Some(StructureId::Guid(Uuid::new_v4()))),
        },
        IdType::StringValue => match raw.and_then(Json::as_str) {
            Some(text) if !text.is_empty() => Ok(Some(StructureId::String(text.to_string()))),
            _ => Err(Error::SchemaMismatch(format!(
                "structure '{}' uses string ids; the id must be assigned before insert",
                schema.name
            ))),
        },
    }
}

/// Build a storable structure from a source document
///
/// Produces the canonical body (id first, then top-level members in declared
/// order) and derives one index row per indexable path instance. Members
/// inside collections contribute one row per element. Unique members yield
/// unique items for each non-null value.
pub fn build_structure(
    schema: &StructureSchema,
    id: StructureId,
    source: &Json,
) -> Result<Structure> {
    let source_map = source.as_object().ok_or_else(|| {
        Error::SchemaMismatch(format!(
            "structure '{}' source document must be a JSON object",
            schema.name
        ))
    })?;

    let mut canonical = serde_json::Map::new();
    canonical.insert(ID_MEMBER.to_string(), id.to_json());
    for member in schema.top_level_members() {
        let value = source_map.get(member).cloned().unwrap_or(Json::Null);
        canonical.insert(member.to_string(), value);
    }
    let canonical = Json::Object(canonical);

    let mut indexes = Vec::new();
    let mut uniques = Vec::new();
    for accessor in &schema.index_accessors {
        let segments: Vec<&str> = accessor.path.split('.').collect();
        let mut values = Vec::new();
        collect_path_values(&canonical, &segments, &mut values);

        for value in values {
            if accessor.is_unique && !value.is_null() {
                uniques.push(UniqueItem {
                    path: accessor.path.clone(),
                    value: value.clone(),
                    structure_id: id.clone(),
                });
            }
            indexes.push(IndexRow {
                path: accessor.path.clone(),
                value,
            });
        }
    }

    Ok(Structure {
        id,
        body: crate::serialization::serialize(&canonical)?,
        indexes,
        uniques,
    })
}

/// Walk a member path through the document, fanning out across arrays.
/// A missing member contributes no row; an explicit null contributes a
/// null row.
fn collect_path_values(value: &Json, segments: &[&str], out: &mut Vec<IndexValue>) {
    match value {
        Json::Array(elements) => {
            for element in elements {
                collect_path_values(element, segments, out);
            }
        }
        Json::Object(map) => {
            if let Some((head, rest)) = segments.split_first() {
                if let Some(inner) = map.get(*head) {
                    collect_path_values(inner, rest, out);
                }
            }
        }
        scalar => {
            if segments.is_empty() {
                if let Some(v) = IndexValue::from_json(scalar) {
                    out.push(v);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{derive_schema, MemberDescriptor, TypeDescriptor, ValueType};
    use serde_json::json;

    fn item_schema() -> StructureSchema {
        derive_schema(&TypeDescriptor::new(
            "QueryItem",
            IdType::Identity,
            vec![
                MemberDescriptor::new("SortOrder", ValueType::Int),
                MemberDescriptor::new("StringValue", ValueType::String),
            ],
        ))
        .unwrap()
    }

    #[test]
    fn test_canonical_body_puts_id_first_in_declared_order() {
        let schema = item_schema();
        let source = json!({"StringValue": "A", "SortOrder": 1});
        let s = build_structure(&schema, StructureId::Identity(1), &source).unwrap();

        assert_eq!(s.body, r#"{"StructureId":1,"SortOrder":1,"StringValue":"A"}"#);
    }

    #[test]
    fn test_index_rows_derived_per_accessor() {
        let schema = item_schema();
        let source = json!({"SortOrder": 2, "StringValue": "B"});
        let s = build_structure(&schema, StructureId::Identity(7), &source).unwrap();

        assert_eq!(s.indexes.len(), 2);
        assert_eq!(s.indexes[0].path, "SortOrder");
        assert_eq!(s.indexes[0].value, IndexValue::Int(2));
        assert_eq!(s.indexes[1].value, IndexValue::String("B".to_string()));
        assert!(s.uniques.is_empty());
    }

    #[test]
    fn test_enumerable_member_yields_row_per_element() {
        let schema = derive_schema(&TypeDescriptor::new(
            "Order",
            IdType::Guid,
            vec![MemberDescriptor::new("Lines.Amount", ValueType::Int).enumerable()],
        ))
        .unwrap();

        let source = json!({"Lines": [{"Amount": 10}, {"Amount": 20}, {"Amount": 30}]});
        let s = build_structure(&schema, StructureId::Guid(Uuid::new_v4()), &source).unwrap();

        let amounts: Vec<_> = s.indexes.iter().map(|r| r.value.clone()).collect();
        assert_eq!(
            amounts,
            vec![IndexValue::Int(10), IndexValue::Int(20), IndexValue::Int(30)]
        );
    }

    #[test]
    fn test_unique_member_yields_unique_items() {
        let schema = derive_schema(&TypeDescriptor::new(
            "Account",
            IdType::Identity,
            vec![MemberDescriptor::new("Email", ValueType::String).unique()],
        ))
        .unwrap();

        let s = build_structure(
            &schema,
            StructureId::Identity(1),
            &json!({"Email": "a@b.se"}),
        )
        .unwrap();

        assert_eq!(s.uniques.len(), 1);
        assert_eq!(s.uniques[0].path, "Email");
        assert_eq!(s.uniques[0].structure_id, StructureId::Identity(1));
    }

    #[test]
    fn test_missing_member_contributes_no_row_null_contributes_null_row() {
        let schema = item_schema();

        let missing = build_structure(
            &schema,
            StructureId::Identity(1),
            &json!({"SortOrder": 1}),
        )
        .unwrap();
        // StringValue absent from source lands as explicit null in the
        // canonical body, so it indexes as a null row.
        assert_eq!(missing.indexes.len(), 2);
        assert!(missing.indexes[1].value.is_null());
    }

    #[test]
    fn test_resolve_id_generates_missing_guid() {
        let schema = derive_schema(&TypeDescriptor::new("G", IdType::Guid, vec![])).unwrap();
        let id = resolve_id(&schema, &json!({})).unwrap().unwrap();
        assert!(matches!(id, StructureId::Guid(u) if !u.is_nil()));
    }

    #[test]
    fn test_resolve_id_requires_string_id() {
        let schema =
            derive_schema(&TypeDescriptor::new("S", IdType::StringValue, vec![])).unwrap();
        assert!(resolve_id(&schema, &json!({})).is_err());
        let id = resolve_id(&schema, &json!({"StructureId": "abc"}))
            .unwrap()
            .unwrap();
        assert_eq!(id, StructureId::String("abc".to_string()));
    }

    #[test]
    fn test_resolve_id_identity_is_server_assigned() {
        let schema = item_schema();
        assert!(resolve_id(&schema, &json!({})).unwrap().is_none());
        assert!(resolve_id(&schema, &json!({"StructureId": 0})).unwrap().is_none());
        assert_eq!(
            resolve_id(&schema, &json!({"StructureId": 5})).unwrap(),
            Some(StructureId::Identity(5))
        );
        assert!(resolve_id(&schema, &json!({"StructureId": 5_000_000_000i64})).is_err());
    }
}
