//! SQLite storage implementation
//!
//! One `DbClient` wraps one connection and is owned by exactly one session
//! at a time; transaction scoping uses explicit BEGIN/COMMIT/ROLLBACK
//! statements. All data values are bound as parameters; the only injected
//! text is table names from the schema vocabulary.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::path::Path;

use super::templates;
use crate::schema::StructureSchema;
use crate::structure::{IndexValue, StructureId};
use crate::{Error, Result};

/// Convert an index value into a SQLite binding
pub fn index_value_to_sql(value: &IndexValue) -> Value {
    match value {
        IndexValue::String(s) => Value::Text(s.clone()),
        IndexValue::Int(i) => Value::Integer(*i),
        IndexValue::Fractal(f) => Value::Real(*f),
        IndexValue::Bool(b) => Value::Integer(i64::from(*b)),
        IndexValue::Null => Value::Null,
    }
}

/// Convert a structure id into a SQLite binding
pub fn structure_id_to_sql(id: &StructureId) -> Value {
    match id {
        StructureId::Identity(v) => Value::Integer(i64::from(*v)),
        StructureId::BigIdentity(v) => Value::Integer(*v),
        StructureId::Guid(v) => Value::Text(v.to_string()),
        StructureId::String(v) => Value::Text(v.clone()),
    }
}

/// Convert a fetched SQLite value into JSON for projected views
pub fn sql_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(i),
        Value::Real(f) => serde_json::Value::from(f),
        Value::Text(s) => serde_json::Value::from(s),
        Value::Blob(_) => serde_json::Value::Null,
    }
}

/// Error from a bulk load carrying the index of the offending row
pub(crate) struct BulkLoadError {
    pub row: usize,
    pub source: rusqlite::Error,
}

/// SQLite-backed db client for one session
pub struct DbClient {
    conn: Connection,
}

impl DbClient {
    /// Open a database file (creates if it doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// Open by SQLite URI, e.g. a shared-cache in-memory database
    pub fn open_uri(uri: &str) -> Result<Self> {
        let conn = Connection::open(uri)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    // ========== Transaction Scoping ==========

    /// IMMEDIATE takes the write lock up front, so two sessions racing on
    /// first use serialize at BEGIN instead of failing mid-transaction on a
    /// lock upgrade.
    pub fn begin_transaction(&mut self) -> Result<()> {
        self.conn.execute("BEGIN IMMEDIATE TRANSACTION", [])?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.conn.execute("COMMIT", [])?;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.conn.execute("ROLLBACK", [])?;
        Ok(())
    }

    // ========== Schema Upsert ==========

    /// Check physical existence of a structure type's tables and create
    /// them when absent. Idempotent and safe to invoke on every operation;
    /// the IF NOT EXISTS templates make the concurrent first-use race
    /// benign (the loser's create is a no-op, not an error).
    pub fn upsert_schema(&self, schema: &StructureSchema) -> Result<()> {
        let structure_table = schema.structure_table();
        if self.table_exists(&structure_table)? {
            self.ensure_compatible(&structure_table)?;
            return Ok(());
        }

        tracing::debug!("creating physical schema for structure '{}'", schema.name);

        let uniques_template = if matches!(schema.id_type, crate::schema::IdType::Guid) {
            "CreateUniquesGuid"
        } else {
            "CreateUniquesIdentity"
        };

        let statements = [
            ("CreateStructure", structure_table.clone()),
            ("CreateIndexes", schema.indexes_table()),
            ("CreateIndexesIxPath", schema.indexes_table()),
            ("CreateIndexesIxSid", schema.indexes_table()),
            (uniques_template, schema.uniques_table()),
        ];
        for (name, table) in statements {
            let template = templates::get_sql(name).ok_or_else(|| {
                Error::Configuration(format!("missing SQL template '{}'", name))
            })?;
            self.conn.execute(&templates::inject(template, &table), [])?;
        }
        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let count: i64 =
            self.conn
                .query_row(templates::TABLE_EXISTS, [name], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// An existing table must expose the expected structure columns;
    /// anything else is an incompatible physical shape.
    fn ensure_compatible(&self, table: &str) -> Result<()> {
        let sql = format!("PRAGMA table_info([{}])", table);
        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();

        if columns.iter().any(|c| c == "StructureId") && columns.iter().any(|c| c == "Json") {
            Ok(())
        } else {
            Err(Error::SchemaMismatch(format!(
                "existing table '{}' has an incompatible shape (columns: {})",
                table,
                columns.join(", ")
            )))
        }
    }

    // ========== Generic Execution ==========

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let affected = self
            .conn
            .execute(sql, params_from_iter(params.iter().cloned()))?;
        Ok(affected)
    }

    /// Fetch rows of a single JSON text column
    pub fn query_json(&self, sql: &str, params: &[Value]) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter().cloned()), |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Stream rows of a single JSON text column to a consumer, one row at a
    /// time. Forward-only and single-pass; a second pass re-issues the
    /// query.
    pub fn for_each_json(
        &self,
        sql: &str,
        params: &[Value],
        mut consumer: impl FnMut(String) -> Result<()>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter().cloned()))?;
        while let Some(row) = rows.next()? {
            consumer(row.get::<_, String>(0)?)?;
        }
        Ok(())
    }

    /// Fetch rows of arbitrary columns as JSON values (projected views)
    pub fn query_value_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Vec<serde_json::Value>>> {
        let mut stmt = self.conn.prepare(sql)?;
        let column_count = stmt.column_count();
        let rows = stmt
            .query_map(params_from_iter(params.iter().cloned()), |row| {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    values.push(sql_to_json(row.get::<_, Value>(i)?));
                }
                Ok(values)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ========== Structure Reads ==========

    pub fn exists(&self, schema: &StructureSchema, id: &StructureId) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM [{}] WHERE StructureId = ?1)",
            schema.structure_table()
        );
        let found: i64 = self
            .conn
            .query_row(&sql, [structure_id_to_sql(id)], |row| row.get(0))?;
        Ok(found > 0)
    }

    pub fn any(&self, schema: &StructureSchema) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM [{}])",
            schema.structure_table()
        );
        let found: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(found > 0)
    }

    /// Existence by compiled id query, wrapped in EXISTS so the backing
    /// store can stop at the first match
    pub fn any_by_query(&self, ids_sql: &str, params: &[Value]) -> Result<bool> {
        let sql = format!("SELECT EXISTS({})", ids_sql);
        let found: i64 =
            self.conn
                .query_row(&sql, params_from_iter(params.iter().cloned()), |row| {
                    row.get(0)
                })?;
        Ok(found > 0)
    }

    pub fn row_count(&self, schema: &StructureSchema) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM [{}]", schema.structure_table());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn row_count_by_query(&self, count_sql: &str, params: &[Value]) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row(count_sql, params_from_iter(params.iter().cloned()), |row| {
                    row.get(0)
                })?;
        Ok(count as u64)
    }

    pub fn get_json_by_id(
        &self,
        schema: &StructureSchema,
        id: &StructureId,
    ) -> Result<Option<String>> {
        let sql = format!(
            "SELECT Json FROM [{}] WHERE StructureId = ?1",
            schema.structure_table()
        );
        let body = self
            .conn
            .query_row(&sql, [structure_id_to_sql(id)], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(body)
    }

    /// Matching subset for a set of ids, in storage id order. Ids that
    /// match nothing (including zero / empty sentinels) are simply absent.
    pub fn get_json_by_ids(
        &self,
        schema: &StructureSchema,
        ids: &[StructureId],
    ) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT Json FROM [{}] WHERE StructureId IN ({}) ORDER BY StructureId",
            schema.structure_table(),
            placeholders.join(", ")
        );
        let params: Vec<Value> = ids.iter().map(structure_id_to_sql).collect();
        self.query_json(&sql, &params)
    }

    pub fn get_json_ordered_by_id(&self, schema: &StructureSchema) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT Json FROM [{}] ORDER BY StructureId",
            schema.structure_table()
        );
        self.query_json(&sql, &[])
    }

    /// Streaming counterpart of `get_json_ordered_by_id`
    pub fn for_each_json_ordered_by_id(
        &self,
        schema: &StructureSchema,
        consumer: impl FnMut(String) -> Result<()>,
    ) -> Result<()> {
        let sql = format!(
            "SELECT Json FROM [{}] ORDER BY StructureId",
            schema.structure_table()
        );
        self.for_each_json(&sql, &[], consumer)
    }

    /// Current highest identity id, zero for an empty set
    pub fn max_identity(&self, schema: &StructureSchema) -> Result<i64> {
        let sql = format!(
            "SELECT COALESCE(MAX(StructureId), 0) FROM [{}]",
            schema.structure_table()
        );
        let max: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(max)
    }

    // ========== Writes ==========

    /// Stream rows into a table through one prepared insert, one row at a
    /// time. Rows are produced lazily by the iterator; nothing is buffered
    /// beyond the row being written.
    pub(crate) fn bulk_load<I>(
        &self,
        table: &str,
        columns: &[&str],
        rows: I,
    ) -> std::result::Result<usize, BulkLoadError>
    where
        I: Iterator<Item = Vec<Value>>,
    {
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO [{}] ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| BulkLoadError { row: 0, source: e })?;

        let mut written = 0usize;
        for (row_index, row) in rows.enumerate() {
            stmt.execute(params_from_iter(row.into_iter()))
                .map_err(|e| BulkLoadError {
                    row: row_index,
                    source: e,
                })?;
            written += 1;
        }
        Ok(written)
    }

    pub fn update_structure_body(
        &self,
        schema: &StructureSchema,
        id: &StructureId,
        body: &str,
    ) -> Result<usize> {
        let sql = format!(
            "UPDATE [{}] SET Json = ?1 WHERE StructureId = ?2",
            schema.structure_table()
        );
        self.execute(
            &sql,
            &[Value::Text(body.to_string()), structure_id_to_sql(id)],
        )
    }

    /// Remove a structure's rows from the index and unique tables; used
    /// before rewriting them whole on update.
    pub fn delete_derived_rows(&self, schema: &StructureSchema, id: &StructureId) -> Result<()> {
        for table in [schema.indexes_table(), schema.uniques_table()] {
            let sql = format!("DELETE FROM [{}] WHERE StructureId = ?1", table);
            self.execute(&sql, &[structure_id_to_sql(id)])?;
        }
        Ok(())
    }

    /// Remove a structure and its derived rows from all three tables
    pub fn delete_structure(&self, schema: &StructureSchema, id: &StructureId) -> Result<()> {
        self.delete_derived_rows(schema, id)?;
        let sql = format!(
            "DELETE FROM [{}] WHERE StructureId = ?1",
            schema.structure_table()
        );
        self.execute(&sql, &[structure_id_to_sql(id)])?;
        Ok(())
    }
}
