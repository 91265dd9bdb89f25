//! Document serializer collaborator
//!
//! Thin wrapper over serde_json exposing the serialize / deserialize-many
//! pair the session depends on.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

pub fn serialize<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

/// Deserialize a sequence of document texts into typed values, failing on
/// the first malformed document
pub fn deserialize_many<T: DeserializeOwned>(texts: impl IntoIterator<Item = String>) -> Result<Vec<T>> {
    texts
        .into_iter()
        .map(|text| Ok(serde_json::from_str(&text)?))
        .collect()
}
