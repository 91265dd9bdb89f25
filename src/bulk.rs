//! Bulk insertion pipeline
//!
//! Writes a batch of structures to the three physical tables as one logical
//! unit: structure rows first, then all index rows, then unique rows. Each
//! stream is produced row by row from the batch rather than pre-buffered.
//! The caller supplies the transaction scope; a failure in any step aborts
//! the whole batch with nothing partially visible.

use rusqlite::types::Value;

use crate::schema::StructureSchema;
use crate::storage::sqlite::{index_value_to_sql, structure_id_to_sql, BulkLoadError};
use crate::storage::DbClient;
use crate::structure::Structure;
use crate::{is_unique_violation, Error, Result};

const STRUCTURE_COLUMNS: [&str; 2] = ["StructureId", "Json"];
const DERIVED_COLUMNS: [&str; 3] = ["StructureId", "MemberPath", "MemberValue"];

/// Streams batches of structures into the three correlated tables
pub struct BulkInserter;

impl BulkInserter {
    /// Insert a batch inside the caller's transaction scope
    pub fn insert(
        schema: &StructureSchema,
        structures: &[Structure],
        client: &DbClient,
    ) -> Result<()> {
        if structures.is_empty() {
            return Ok(());
        }

        Self::insert_structures(schema, structures, client)?;
        Self::insert_indexes(schema, structures, client)?;

        // Skipped entirely when the batch declares no uniques; absence of
        // unique rows is equivalent to no constraint check.
        if structures.iter().any(|s| !s.uniques.is_empty()) {
            Self::insert_uniques(schema, structures, client)?;
        }

        tracing::debug!(
            "bulk inserted {} structure(s) into '{}'",
            structures.len(),
            schema.name
        );
        Ok(())
    }

    fn insert_structures(
        schema: &StructureSchema,
        structures: &[Structure],
        client: &DbClient,
    ) -> Result<()> {
        let rows = structures
            .iter()
            .map(|s| vec![structure_id_to_sql(&s.id), Value::Text(s.body.clone())]);
        client
            .bulk_load(&schema.structure_table(), &STRUCTURE_COLUMNS, rows)
            .map_err(|e| Error::BackingStore(e.source))?;
        Ok(())
    }

    pub(crate) fn insert_indexes(
        schema: &StructureSchema,
        structures: &[Structure],
        client: &DbClient,
    ) -> Result<()> {
        let rows = structures.iter().flat_map(|s| {
            s.indexes.iter().map(|row| {
                vec![
                    structure_id_to_sql(&s.id),
                    Value::Text(row.path.clone()),
                    index_value_to_sql(&row.value),
                ]
            })
        });
        client
            .bulk_load(&schema.indexes_table(), &DERIVED_COLUMNS, rows)
            .map_err(|e| Error::BackingStore(e.source))?;
        Ok(())
    }

    pub(crate) fn insert_uniques(
        schema: &StructureSchema,
        structures: &[Structure],
        client: &DbClient,
    ) -> Result<()> {
        // Row production stays lazy; the flat list of borrows exists only to
        // name the offending member when the backing store rejects a row.
        let uniques: Vec<_> = structures.iter().flat_map(|s| s.uniques.iter()).collect();
        let rows = uniques.iter().map(|u| {
            vec![
                structure_id_to_sql(&u.structure_id),
                Value::Text(u.path.clone()),
                index_value_to_sql(&u.value),
            ]
        });
        client
            .bulk_load(&schema.uniques_table(), &DERIVED_COLUMNS, rows)
            .map_err(|e| Self::map_unique_error(e, &uniques))?;
        Ok(())
    }

    fn map_unique_error(e: BulkLoadError, uniques: &[&crate::structure::UniqueItem]) -> Error {
        if is_unique_violation(&e.source) {
            if let Some(item) = uniques.get(e.row) {
                return Error::ConstraintViolation {
                    path: item.path.clone(),
                    value: item.value.to_string(),
                };
            }
        }
        Error::BackingStore(e.source)
    }
}
