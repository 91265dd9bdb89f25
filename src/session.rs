//! Unit of work session
//!
//! The outward-facing orchestrator: every public operation ensures the
//! structure's physical schema is upserted, dispatches to the generator,
//! cache and bulk pipeline, and classifies any underlying failure into the
//! crate error taxonomy before it surfaces.
//!
//! State machine: Open (reads and writes) -> Committed (reads only) ->
//! Disposed (nothing). A write failure aborts the enclosing transaction and
//! disposes the session so partial writes are never observable. A session
//! owns one connection and is not safe for concurrent use by multiple
//! threads; independent sessions may run concurrently.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::bulk::BulkInserter;
use crate::database::Database;
use crate::query::{LambdaNode, QueryCommand, SqlQueryGenerator};
use crate::schema::{StructureSchema, ID_MEMBER};
use crate::serialization;
use crate::storage::sqlite::index_value_to_sql;
use crate::structure::{build_structure, resolve_id, StructureId};
use crate::{is_unique_violation, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Committed,
    Disposed,
}

/// A transactional session scoping a sequence of reads and writes
pub struct Session<'a> {
    db: &'a Database,
    client: crate::storage::DbClient,
    state: SessionState,
    upserted: HashSet<String>,
    /// Ids whose existence was probed into the cache inside the open
    /// transaction. Those facts may reflect uncommitted writes, so a
    /// rollback must evict them.
    probed: Vec<(StructureSchema, StructureId)>,
}

impl<'a> Session<'a> {
    pub(crate) fn begin(db: &'a Database) -> Result<Self> {
        let mut client = db.open_client()?;
        client.begin_transaction()?;
        tracing::debug!(
            "session opened on database '{}'",
            db.connection_info().name
        );
        Ok(Self {
            db,
            client,
            state: SessionState::Open,
            upserted: HashSet::new(),
            probed: Vec::new(),
        })
    }

    // ========== Lifecycle ==========

    /// Flush the transaction. The session stays usable for reads but
    /// rejects further writes.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open("commit")?;
        if let Err(e) = self.client.commit() {
            self.abort();
            return Err(classify(e));
        }
        // Facts probed inside the transaction are now durable truth.
        self.probed.clear();
        self.state = SessionState::Committed;
        tracing::debug!(
            "session committed on database '{}'",
            self.db.connection_info().name
        );
        Ok(())
    }

    /// Release the session. An uncommitted transaction is rolled back.
    pub fn dispose(&mut self) {
        if self.state == SessionState::Open {
            self.abort();
        } else {
            self.state = SessionState::Disposed;
        }
    }

    /// Roll the transaction back, drop cache facts recorded inside it, and
    /// dispose the session.
    fn abort(&mut self) {
        let _ = self.client.rollback();
        self.evict_probed();
        self.state = SessionState::Disposed;
    }

    fn evict_probed(&mut self) {
        let cache = Arc::clone(self.db.cache_provider());
        for (schema, id) in self.probed.drain(..) {
            cache.evict(&schema, &id);
        }
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Committed => Err(Error::SessionClosed(format!(
                "cannot {}: session has been committed",
                op
            ))),
            SessionState::Disposed => Err(Error::SessionClosed(format!(
                "cannot {}: session has been disposed",
                op
            ))),
        }
    }

    fn ensure_readable(&self, op: &str) -> Result<()> {
        if self.state == SessionState::Disposed {
            return Err(Error::SessionClosed(format!(
                "cannot {}: session has been disposed",
                op
            )));
        }
        Ok(())
    }

    /// Wrapper around every public write: state check up front, and on any
    /// failure the enclosing transaction is aborted so nothing is partially
    /// visible.
    fn try_write<T>(&mut self, op: &str, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.ensure_open(op)?;
        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.abort();
                tracing::debug!("session aborted by failed {}", op);
                Err(classify(e))
            }
        }
    }

    fn try_read<T>(&mut self, op: &str, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.ensure_readable(op)?;
        f(self).map_err(classify)
    }

    /// Resolve the schema and lazily upsert its physical tables, once per
    /// session per type. The upsert itself is idempotent, so re-running it
    /// on every operation would also be safe, just wasteful.
    fn upsert_schema_for(&mut self, type_name: &str) -> Result<StructureSchema> {
        let schema = self.db.schemas().get_schema(type_name)?;
        if !self.upserted.contains(type_name) {
            self.client.upsert_schema(&schema)?;
            self.upserted.insert(type_name.to_string());
        }
        Ok(schema)
    }

    // ========== Writes ==========

    pub fn insert<T: Serialize>(&mut self, type_name: &str, item: &T) -> Result<StructureId> {
        let mut ids = self.insert_many(type_name, std::slice::from_ref(item))?;
        Ok(ids.remove(0))
    }

    /// Insert a batch through the bulk pipeline as one logical unit
    pub fn insert_many<T: Serialize>(
        &mut self,
        type_name: &str,
        items: &[T],
    ) -> Result<Vec<StructureId>> {
        self.try_write("insert", |s| {
            let schema = s.upsert_schema_for(type_name)?;

            let mut next_identity = if schema.id_type.is_identity() {
                Some(s.client.max_identity(&schema)? + 1)
            } else {
                None
            };

            let mut structures = Vec::with_capacity(items.len());
            for item in items {
                let source = serialization::to_value(item)?;
                let id = match (resolve_id(&schema, &source)?, next_identity.as_mut()) {
                    (Some(id), _) => id,
                    (None, Some(counter)) => {
                        let id = match schema.id_type {
                            crate::schema::IdType::Identity => {
                                let next = i32::try_from(*counter).map_err(|_| {
                                    Error::Configuration(format!(
                                        "identity ids for '{}' exceed the 32-bit range; \
                                         use BigIdentity",
                                        schema.name
                                    ))
                                })?;
                                StructureId::Identity(next)
                            }
                            _ => StructureId::BigIdentity(*counter),
                        };
                        *counter += 1;
                        id
                    }
                    (None, None) => {
                        return Err(Error::SchemaMismatch(format!(
                            "'{}' requires an assigned {}",
                            schema.name, ID_MEMBER
                        )))
                    }
                };
                structures.push(build_structure(&schema, id, &source)?);
            }

            BulkInserter::insert(&schema, &structures, &s.client)?;

            let cache = Arc::clone(s.db.cache_provider());
            for structure in &structures {
                cache.evict(&schema, &structure.id);
            }
            Ok(structures.into_iter().map(|s| s.id).collect())
        })
    }

    /// Rewrite one structure: the body is replaced and the derived index
    /// and unique rows are recomputed whole, never patched. Returns false
    /// when no structure with the document's id exists.
    pub fn update<T: Serialize>(&mut self, type_name: &str, item: &T) -> Result<bool> {
        self.try_write("update", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            let source = serialization::to_value(item)?;
            let id = resolve_id(&schema, &source)?.ok_or_else(|| {
                Error::SchemaMismatch(format!(
                    "update on '{}' requires an assigned {}",
                    schema.name, ID_MEMBER
                ))
            })?;
            let structure = build_structure(&schema, id, &source)?;

            if s.client.update_structure_body(&schema, &structure.id, &structure.body)? == 0 {
                return Ok(false);
            }
            s.client.delete_derived_rows(&schema, &structure.id)?;
            let batch = std::slice::from_ref(&structure);
            BulkInserter::insert_indexes(&schema, batch, &s.client)?;
            if !structure.uniques.is_empty() {
                BulkInserter::insert_uniques(&schema, batch, &s.client)?;
            }

            self_evict(s, &schema, &structure.id);
            Ok(true)
        })
    }

    /// Remove a structure and its derived rows from all three tables
    pub fn delete_by_id(&mut self, type_name: &str, id: &StructureId) -> Result<()> {
        self.try_write("delete", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            s.client.delete_structure(&schema, id)?;
            self_evict(s, &schema, id);
            Ok(())
        })
    }

    // ========== Reads ==========

    pub fn get_by_id<T: DeserializeOwned>(
        &mut self,
        type_name: &str,
        id: &StructureId,
    ) -> Result<Option<T>> {
        let body = self.get_by_id_as_json(type_name, id)?;
        match body {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub fn get_by_id_as_json(
        &mut self,
        type_name: &str,
        id: &StructureId,
    ) -> Result<Option<String>> {
        self.try_read("get by id", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            s.client.get_json_by_id(&schema, id)
        })
    }

    /// Matching subset for the requested ids, in storage id order.
    /// Non-matching ids (including zero / empty sentinels) are skipped.
    pub fn get_by_ids<T: DeserializeOwned>(
        &mut self,
        type_name: &str,
        ids: &[StructureId],
    ) -> Result<Vec<T>> {
        let texts = self.get_by_ids_as_json(type_name, ids)?;
        serialization::deserialize_many(texts)
    }

    pub fn get_by_ids_as_json(
        &mut self,
        type_name: &str,
        ids: &[StructureId],
    ) -> Result<Vec<String>> {
        self.try_read("get by ids", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            s.client.get_json_by_ids(&schema, ids)
        })
    }

    pub fn get_all<T: DeserializeOwned>(&mut self, type_name: &str) -> Result<Vec<T>> {
        serialization::deserialize_many(self.get_all_as_json(type_name)?)
    }

    pub fn get_all_as_json(&mut self, type_name: &str) -> Result<Vec<String>> {
        self.try_read("get all", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            s.client.get_json_ordered_by_id(&schema)
        })
    }

    /// Query structures as typed values. The empty query short-circuits to
    /// the unfiltered full-table read ordered by structure id.
    pub fn query<T: DeserializeOwned>(
        &mut self,
        type_name: &str,
        command: &QueryCommand,
    ) -> Result<Vec<T>> {
        serialization::deserialize_many(self.query_as_json(type_name, command)?)
    }

    pub fn query_as_json(&mut self, type_name: &str, command: &QueryCommand) -> Result<Vec<String>> {
        self.try_read("query", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            if command.is_empty() {
                return s.client.get_json_ordered_by_id(&schema);
            }
            if command.has_select() {
                return Err(Error::SchemaMismatch(
                    "select queries return projected views; use query_projected".to_string(),
                ));
            }
            let info = SqlQueryGenerator::generate(command, &schema)?;
            let params: Vec<_> = info.params.iter().map(index_value_to_sql).collect();
            s.client.query_json(&info.sql, &params)
        })
    }

    /// Stream query results one row at a time to a consumer: a lazy,
    /// single-pass, forward-only sequence. Calling again re-issues the
    /// query rather than replaying buffered rows.
    pub fn query_each(
        &mut self,
        type_name: &str,
        command: &QueryCommand,
        consumer: impl FnMut(String) -> Result<()>,
    ) -> Result<()> {
        self.try_read("query", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            if command.is_empty() {
                return s.client.for_each_json_ordered_by_id(&schema, consumer);
            }
            let info = SqlQueryGenerator::generate(command, &schema)?;
            let params: Vec<_> = info.params.iter().map(index_value_to_sql).collect();
            s.client.for_each_json(&info.sql, &params, consumer)
        })
    }

    /// Query a projected view: one JSON object per matching structure with
    /// the structure id plus the selected members
    pub fn query_projected(
        &mut self,
        type_name: &str,
        command: &QueryCommand,
    ) -> Result<Vec<serde_json::Value>> {
        self.try_read("query projected", |s| {
            if !command.has_select() {
                return Err(Error::SchemaMismatch(
                    "projected query requires selected members".to_string(),
                ));
            }
            let schema = s.upsert_schema_for(type_name)?;
            let info = SqlQueryGenerator::generate(command, &schema)?;
            let params: Vec<_> = info.params.iter().map(index_value_to_sql).collect();
            let rows = s.client.query_value_rows(&info.sql, &params)?;

            let mut names = vec![ID_MEMBER.to_string()];
            names.extend(member_paths(&command.select.nodes));
            for include in &command.includes {
                names.extend(member_paths(&include.nodes));
            }

            Ok(rows
                .into_iter()
                .map(|row| {
                    let mut object = serde_json::Map::new();
                    for (name, value) in names.iter().zip(row) {
                        object.insert(name.clone(), value);
                    }
                    serde_json::Value::Object(object)
                })
                .collect())
        })
    }

    /// Query full structures with include members fetched alongside for
    /// denormalized hydration
    pub fn query_with_includes<T: DeserializeOwned>(
        &mut self,
        type_name: &str,
        command: &QueryCommand,
    ) -> Result<Vec<(T, serde_json::Map<String, serde_json::Value>)>> {
        self.try_read("query with includes", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            let info = SqlQueryGenerator::generate(command, &schema)?;
            let params: Vec<_> = info.params.iter().map(index_value_to_sql).collect();
            let rows = s.client.query_value_rows(&info.sql, &params)?;

            let mut names = Vec::new();
            for include in &command.includes {
                names.extend(member_paths(&include.nodes));
            }

            rows.into_iter()
                .map(|mut row| {
                    let body = row.remove(0);
                    let serde_json::Value::String(text) = body else {
                        return Err(Error::SchemaMismatch(
                            "include queries must not project away the body".to_string(),
                        ));
                    };
                    let typed: T = serde_json::from_str(&text)?;
                    let mut extras = serde_json::Map::new();
                    for (name, value) in names.iter().zip(row) {
                        extras.insert(name.clone(), value);
                    }
                    Ok((typed, extras))
                })
                .collect()
        })
    }

    pub fn count(&mut self, type_name: &str) -> Result<u64> {
        self.try_read("count", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            s.client.row_count(&schema)
        })
    }

    /// Count matching structures. Shares the where-compilation phase with
    /// full queries so both shapes match the same rows.
    pub fn count_where(&mut self, type_name: &str, command: &QueryCommand) -> Result<u64> {
        self.try_read("count", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            if !command.has_where() {
                return s.client.row_count(&schema);
            }
            let info = SqlQueryGenerator::generate_where_count(command, &schema)?;
            let params: Vec<_> = info.params.iter().map(index_value_to_sql).collect();
            s.client.row_count_by_query(&info.sql, &params)
        })
    }

    pub fn any(&mut self, type_name: &str) -> Result<bool> {
        self.try_read("any", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            s.client.any(&schema)
        })
    }

    /// Existence of any match. Query-shaped, so it always bypasses the
    /// id-keyed structure cache and compiles through the where phase.
    pub fn any_where(&mut self, type_name: &str, command: &QueryCommand) -> Result<bool> {
        self.try_read("any", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            if !command.has_where() {
                return s.client.any(&schema);
            }
            let info = SqlQueryGenerator::generate_where_ids(command, &schema)?;
            let params: Vec<_> = info.params.iter().map(index_value_to_sql).collect();
            s.client.any_by_query(&info.sql, &params)
        })
    }

    /// Id-level existence check through the cache-aware read path. When
    /// caching is enabled for the schema the provider is consulted first
    /// and populated on miss; when disabled the backing store is probed
    /// directly every time.
    pub fn exists(&mut self, type_name: &str, id: &StructureId) -> Result<bool> {
        self.try_read("exists", |s| {
            let schema = s.upsert_schema_for(type_name)?;
            let cache = Arc::clone(s.db.cache_provider());
            if !cache.is_enabled_for(&schema) {
                return s.client.exists(&schema, id);
            }
            // A fact probed inside an open transaction may reflect an
            // uncommitted write; record it so rollback can evict it.
            if s.state == SessionState::Open {
                s.probed.push((schema.clone(), id.clone()));
            }
            let client = &s.client;
            let mut fallback = |sid: &StructureId| client.exists(&schema, sid);
            cache.exists(&schema, id, &mut fallback)
        })
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.state == SessionState::Open {
            self.abort();
            tracing::debug!("open session dropped; transaction rolled back");
        }
    }
}

/// Classify a raw failure into the error taxonomy. Unique-constraint
/// breaches that reach here without row context (e.g. from the structure
/// table's primary key) still surface as constraint violations.
fn classify(e: Error) -> Error {
    match e {
        Error::BackingStore(ref source) if is_unique_violation(source) => {
            Error::ConstraintViolation {
                path: ID_MEMBER.to_string(),
                value: String::new(),
            }
        }
        other => other,
    }
}

fn self_evict(session: &Session<'_>, schema: &StructureSchema, id: &StructureId) {
    session.db.cache_provider().evict(schema, id);
}

fn member_paths(nodes: &[LambdaNode]) -> Vec<String> {
    nodes
        .iter()
        .filter_map(|n| match n {
            LambdaNode::Member { path } => Some(path.clone()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheProvider, ExistsFallback, MemoryCacheProvider};
    use crate::config::ConnectionInfo;
    use crate::query::{Expr, QueryBuilder};
    use crate::schema::{IdType, MemberDescriptor, TypeDescriptor, ValueType};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct QueryItem {
        #[serde(rename = "StructureId", default)]
        structure_id: i32,
        #[serde(rename = "SortOrder")]
        sort_order: i32,
        #[serde(rename = "IntegerValue")]
        integer_value: i32,
        #[serde(rename = "StringValue")]
        string_value: String,
    }

    impl QueryItem {
        fn new(sort_order: i32, integer_value: i32, string_value: &str) -> Self {
            Self {
                structure_id: 0,
                sort_order,
                integer_value,
                string_value: string_value.to_string(),
            }
        }
    }

    fn query_item_descriptor() -> TypeDescriptor {
        TypeDescriptor::new(
            "QueryItem",
            IdType::Identity,
            vec![
                MemberDescriptor::new("SortOrder", ValueType::Int),
                MemberDescriptor::new("IntegerValue", ValueType::Int),
                MemberDescriptor::new("StringValue", ValueType::String),
            ],
        )
    }

    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn test_db() -> Database {
        init_test_logging();
        let db = Database::new(ConnectionInfo::in_memory("SessionTests")).unwrap();
        db.register_type(query_item_descriptor()).unwrap();
        db
    }

    /// Four items inserted unordered: SortOrder [2,2,1,1], StringValue
    /// [D,C,B,A], so assigned identity ids are D=1, C=2, B=3, A=4.
    fn four_unordered_items() -> Vec<QueryItem> {
        vec![
            QueryItem::new(2, 400, "D"),
            QueryItem::new(2, 300, "C"),
            QueryItem::new(1, 200, "B"),
            QueryItem::new(1, 100, "A"),
        ]
    }

    fn insert_four(db: &Database) {
        let mut session = db.begin_session().unwrap();
        session
            .insert_many("QueryItem", &four_unordered_items())
            .unwrap();
        session.commit().unwrap();
    }

    fn string_values(items: &[QueryItem]) -> Vec<&str> {
        items.iter().map(|i| i.string_value.as_str()).collect()
    }

    #[test]
    fn test_insert_many_then_empty_query_round_trips_in_id_order() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let fetched: Vec<QueryItem> = session
            .query("QueryItem", &QueryBuilder::new().build())
            .unwrap();

        assert_eq!(fetched.len(), 4);
        assert_eq!(string_values(&fetched), vec!["D", "C", "B", "A"]);
        assert_eq!(
            fetched.iter().map(|i| i.structure_id).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn test_canonical_json_bodies_use_declared_member_order() {
        let db = test_db();
        let mut session = db.begin_session().unwrap();
        session
            .insert("QueryItem", &QueryItem::new(1, 100, "A"))
            .unwrap();
        session.commit().unwrap();

        let bodies = session.get_all_as_json("QueryItem").unwrap();
        assert_eq!(
            bodies,
            vec![r#"{"StructureId":1,"SortOrder":1,"IntegerValue":100,"StringValue":"A"}"#]
        );
    }

    #[test]
    fn test_composite_sortings_apply_in_declaration_order() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let command = QueryBuilder::new()
            .sort_by("SortOrder")
            .sort_by("StringValue")
            .build();
        let fetched: Vec<QueryItem> = session.query("QueryItem", &command).unwrap();

        assert_eq!(fetched.len(), 4);
        assert_eq!(string_values(&fetched), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_equal_sort_keys_break_ties_by_id_ascending() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let command = QueryBuilder::new().sort_by("SortOrder").build();
        let fetched: Vec<QueryItem> = session.query("QueryItem", &command).unwrap();

        // Within each SortOrder group the assigned ids decide: B(3), A(4)
        // then D(1), C(2).
        assert_eq!(string_values(&fetched), vec!["B", "A", "D", "C"]);
    }

    #[test]
    fn test_only_sortings_returns_the_unfiltered_count() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let sorted: Vec<QueryItem> = session
            .query(
                "QueryItem",
                &QueryBuilder::new().sort_by_desc("IntegerValue").build(),
            )
            .unwrap();

        assert_eq!(sorted.len() as u64, session.count("QueryItem").unwrap());
        assert_eq!(string_values(&sorted), vec!["D", "C", "B", "A"]);
    }

    #[test]
    fn test_where_filters_and_count_match_the_same_rows() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let command = QueryBuilder::new()
            .where_expr(
                Expr::member("SortOrder")
                    .eq(2)
                    .and(Expr::member("IntegerValue").gte(300)),
            )
            .sort_by("StringValue")
            .build();

        let fetched: Vec<QueryItem> = session.query("QueryItem", &command).unwrap();
        assert_eq!(string_values(&fetched), vec!["C", "D"]);
        assert_eq!(session.count_where("QueryItem", &command).unwrap(), 2);
        assert!(session.any_where("QueryItem", &command).unwrap());

        let none = QueryBuilder::new()
            .where_expr(Expr::member("SortOrder").gt(9))
            .build();
        assert_eq!(session.count_where("QueryItem", &none).unwrap(), 0);
        assert!(!session.any_where("QueryItem", &none).unwrap());
    }

    #[test]
    fn test_string_match_operators() {
        let db = test_db();
        let mut session = db.begin_session().unwrap();
        session
            .insert_many(
                "QueryItem",
                &[
                    QueryItem::new(1, 1, "alpha"),
                    QueryItem::new(2, 2, "beta"),
                    QueryItem::new(3, 3, "alphabet"),
                ],
            )
            .unwrap();

        let starts: Vec<QueryItem> = session
            .query(
                "QueryItem",
                &QueryBuilder::new()
                    .where_expr(Expr::member("StringValue").starts_with("alpha"))
                    .sort_by("SortOrder")
                    .build(),
            )
            .unwrap();
        assert_eq!(string_values(&starts), vec!["alpha", "alphabet"]);

        let contains: Vec<QueryItem> = session
            .query(
                "QueryItem",
                &QueryBuilder::new()
                    .where_expr(Expr::member("StringValue").contains("et"))
                    .build(),
            )
            .unwrap();
        assert_eq!(string_values(&contains), vec!["beta", "alphabet"]);

        let ends: Vec<QueryItem> = session
            .query(
                "QueryItem",
                &QueryBuilder::new()
                    .where_expr(Expr::member("StringValue").ends_with("a"))
                    .sort_by("SortOrder")
                    .build(),
            )
            .unwrap();
        assert_eq!(string_values(&ends), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_take_limits_the_sorted_result() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let fetched: Vec<QueryItem> = session
            .query(
                "QueryItem",
                &QueryBuilder::new()
                    .sort_by("SortOrder")
                    .sort_by("StringValue")
                    .take(2)
                    .build(),
            )
            .unwrap();
        assert_eq!(string_values(&fetched), vec!["A", "B"]);
    }

    #[test]
    fn test_get_by_ids_returns_matching_subset_in_storage_order() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let fetched: Vec<QueryItem> = session
            .get_by_ids(
                "QueryItem",
                &[
                    StructureId::Identity(3),
                    StructureId::Identity(0),
                    StructureId::Identity(1),
                    StructureId::Identity(99),
                ],
            )
            .unwrap();

        assert_eq!(string_values(&fetched), vec!["D", "B"]);
    }

    #[test]
    fn test_get_by_ids_as_json_keeps_canonical_bodies() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let bodies = session
            .get_by_ids_as_json(
                "QueryItem",
                &[StructureId::Identity(1), StructureId::Identity(3)],
            )
            .unwrap();
        assert_eq!(
            bodies,
            vec![
                r#"{"StructureId":1,"SortOrder":2,"IntegerValue":400,"StringValue":"D"}"#,
                r#"{"StructureId":3,"SortOrder":1,"IntegerValue":200,"StringValue":"B"}"#,
            ]
        );
    }

    #[test]
    fn test_guid_ids_are_generated_and_round_trip() {
        let db = Database::new(ConnectionInfo::in_memory("GuidTests")).unwrap();
        db.register_type(TypeDescriptor::new(
            "GuidItem",
            IdType::Guid,
            vec![MemberDescriptor::new("StringValue", ValueType::String)],
        ))
        .unwrap();

        let mut session = db.begin_session().unwrap();
        let id = session
            .insert("GuidItem", &serde_json::json!({"StringValue": "A"}))
            .unwrap();
        assert!(matches!(id, StructureId::Guid(_)));

        let body = session
            .get_by_id_as_json("GuidItem", &id)
            .unwrap()
            .unwrap();
        assert!(body.starts_with(r#"{"StructureId":""#));
        assert!(body.ends_with(r#""StringValue":"A"}"#));
    }

    #[test]
    fn test_unique_violation_rolls_back_the_whole_batch() {
        let db = Database::new(ConnectionInfo::in_memory("UniqueTests")).unwrap();
        db.register_type(TypeDescriptor::new(
            "Account",
            IdType::Identity,
            vec![
                MemberDescriptor::new("Name", ValueType::String),
                MemberDescriptor::new("Email", ValueType::String).unique(),
            ],
        ))
        .unwrap();

        let mut session = db.begin_session().unwrap();
        let err = session
            .insert_many(
                "Account",
                &[
                    serde_json::json!({"Name": "a", "Email": "same@x.se"}),
                    serde_json::json!({"Name": "b", "Email": "same@x.se"}),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { .. }));

        // The failed write disposed the session and aborted its
        // transaction; a fresh session must see no trace of the batch.
        assert!(matches!(
            session.count("Account").unwrap_err(),
            Error::SessionClosed(_)
        ));
        drop(session);

        let mut session = db.begin_session().unwrap();
        assert_eq!(session.count("Account").unwrap(), 0);
        assert!(!session.any("Account").unwrap());
        assert!(session
            .query_as_json("Account", &QueryBuilder::new().build())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_update_recomputes_indexes() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let mut item: QueryItem = session
            .get_by_id("QueryItem", &StructureId::Identity(4))
            .unwrap()
            .unwrap();
        assert_eq!(item.string_value, "A");

        item.string_value = "Z".to_string();
        assert!(session.update("QueryItem", &item).unwrap());
        session.commit().unwrap();

        let by_new: Vec<QueryItem> = session
            .query(
                "QueryItem",
                &QueryBuilder::new()
                    .where_expr(Expr::member("StringValue").eq("Z"))
                    .build(),
            )
            .unwrap();
        assert_eq!(by_new.len(), 1);
        assert_eq!(by_new[0].structure_id, 4);

        let by_old: Vec<QueryItem> = session
            .query(
                "QueryItem",
                &QueryBuilder::new()
                    .where_expr(Expr::member("StringValue").eq("A"))
                    .build(),
            )
            .unwrap();
        assert!(by_old.is_empty());
    }

    #[test]
    fn test_update_of_missing_structure_reports_false() {
        let db = test_db();
        let mut session = db.begin_session().unwrap();

        let mut item = QueryItem::new(1, 100, "A");
        item.structure_id = 42;
        assert!(!session.update("QueryItem", &item).unwrap());
    }

    #[test]
    fn test_delete_by_id_removes_structure_and_derived_rows() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        session
            .delete_by_id("QueryItem", &StructureId::Identity(1))
            .unwrap();
        session.commit().unwrap();

        assert_eq!(session.count("QueryItem").unwrap(), 3);
        assert!(session
            .get_by_id_as_json("QueryItem", &StructureId::Identity(1))
            .unwrap()
            .is_none());
        let matching_d: Vec<QueryItem> = session
            .query(
                "QueryItem",
                &QueryBuilder::new()
                    .where_expr(Expr::member("StringValue").eq("D"))
                    .build(),
            )
            .unwrap();
        assert!(matching_d.is_empty());
    }

    #[test]
    fn test_projection_returns_selected_members_only() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let views = session
            .query_projected(
                "QueryItem",
                &QueryBuilder::new()
                    .select(&["SortOrder", "StringValue"])
                    .sort_by("StringValue")
                    .build(),
            )
            .unwrap();

        assert_eq!(views.len(), 4);
        assert_eq!(views[0]["StructureId"], serde_json::json!(4));
        assert_eq!(views[0]["SortOrder"], serde_json::json!(1));
        assert_eq!(views[0]["StringValue"], serde_json::json!("A"));
        assert!(views[0].get("IntegerValue").is_none());
    }

    #[test]
    fn test_includes_hydrate_alongside_the_body() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let rows: Vec<(QueryItem, _)> = session
            .query_with_includes(
                "QueryItem",
                &QueryBuilder::new()
                    .where_expr(Expr::member("StringValue").eq("C"))
                    .include("IntegerValue")
                    .build(),
            )
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.string_value, "C");
        assert_eq!(rows[0].1["IntegerValue"], serde_json::json!(300));
    }

    #[test]
    fn test_identity_ids_never_overflow_silently() {
        let db = test_db();
        let mut session = db.begin_session().unwrap();

        let mut seed = QueryItem::new(1, 100, "A");
        seed.structure_id = i32::MAX;
        session.insert("QueryItem", &seed).unwrap();

        let err = session
            .insert("QueryItem", &QueryItem::new(2, 200, "B"))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_query_each_empty_command_streams_in_id_order() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let mut seen = Vec::new();
        session
            .query_each("QueryItem", &QueryBuilder::new().build(), |row| {
                seen.push(row);
                Ok(())
            })
            .unwrap();

        // The empty command streams the same rows, in the same id order,
        // that the collecting path returns.
        assert_eq!(seen, session.get_all_as_json("QueryItem").unwrap());
        assert!(seen[0].contains(r#""StringValue":"D""#));
    }

    #[test]
    fn test_query_each_streams_rows() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let mut seen = Vec::new();
        session
            .query_each(
                "QueryItem",
                &QueryBuilder::new().sort_by("StringValue").build(),
                |row| {
                    seen.push(row);
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen[0].contains(r#""StringValue":"A""#));
    }

    #[test]
    fn test_committed_session_allows_reads_but_rejects_writes() {
        let db = test_db();
        let mut session = db.begin_session().unwrap();
        session
            .insert("QueryItem", &QueryItem::new(1, 100, "A"))
            .unwrap();
        session.commit().unwrap();

        // Reads after commit stay legal.
        assert_eq!(session.count("QueryItem").unwrap(), 1);
        let fetched: Vec<QueryItem> = session.get_all("QueryItem").unwrap();
        assert_eq!(fetched.len(), 1);

        let write_err = session
            .insert("QueryItem", &QueryItem::new(2, 200, "B"))
            .unwrap_err();
        assert!(matches!(write_err, Error::SessionClosed(_)));
        assert!(matches!(session.commit().unwrap_err(), Error::SessionClosed(_)));
    }

    #[test]
    fn test_disposed_session_rejects_everything() {
        let db = test_db();
        let mut session = db.begin_session().unwrap();
        session
            .insert("QueryItem", &QueryItem::new(1, 100, "A"))
            .unwrap();
        session.dispose();

        assert!(matches!(
            session.count("QueryItem").unwrap_err(),
            Error::SessionClosed(_)
        ));

        // The uncommitted insert was rolled back on disposal.
        let mut fresh = db.begin_session().unwrap();
        assert_eq!(fresh.count("QueryItem").unwrap(), 0);
    }

    #[test]
    fn test_dropped_open_session_rolls_back() {
        let db = test_db();
        {
            let mut session = db.begin_session().unwrap();
            session
                .insert("QueryItem", &QueryItem::new(1, 100, "A"))
                .unwrap();
            // No commit.
        }
        let mut session = db.begin_session().unwrap();
        assert_eq!(session.count("QueryItem").unwrap(), 0);
    }

    #[test]
    fn test_schema_upsert_is_idempotent_across_sessions() {
        let db = test_db();
        insert_four(&db);
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        assert_eq!(session.count("QueryItem").unwrap(), 8);
        // Identity assignment continued from the stored maximum.
        let all: Vec<QueryItem> = session.get_all("QueryItem").unwrap();
        assert_eq!(all.last().unwrap().structure_id, 8);
    }

    struct CountingCache {
        inner: MemoryCacheProvider,
        probes: AtomicUsize,
    }

    impl CountingCache {
        fn enabled_for(names: &[&str]) -> Self {
            Self {
                inner: MemoryCacheProvider::enabled_for(names),
                probes: AtomicUsize::new(0),
            }
        }
    }

    impl CacheProvider for CountingCache {
        fn is_enabled_for(&self, schema: &StructureSchema) -> bool {
            self.inner.is_enabled_for(schema)
        }

        fn exists(
            &self,
            schema: &StructureSchema,
            id: &StructureId,
            fallback: ExistsFallback<'_>,
        ) -> Result<bool> {
            let mut counted = |sid: &StructureId| {
                self.probes.fetch_add(1, Ordering::SeqCst);
                fallback(sid)
            };
            self.inner.exists(schema, id, &mut counted)
        }

        fn evict(&self, schema: &StructureSchema, id: &StructureId) {
            self.inner.evict(schema, id);
        }
    }

    #[test]
    fn test_enabled_cache_probes_backing_store_at_most_once() {
        let cache = Arc::new(CountingCache::enabled_for(&["QueryItem"]));
        let db = Database::with_cache_provider(
            ConnectionInfo::in_memory("CacheTests"),
            Arc::clone(&cache) as Arc<dyn CacheProvider>,
        )
        .unwrap();
        db.register_type(query_item_descriptor()).unwrap();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let id = StructureId::Identity(1);
        assert!(session.exists("QueryItem", &id).unwrap());
        assert!(session.exists("QueryItem", &id).unwrap());
        assert_eq!(cache.probes.load(Ordering::SeqCst), 1);

        // Misses are cached as well.
        let missing = StructureId::Identity(99);
        assert!(!session.exists("QueryItem", &missing).unwrap());
        assert!(!session.exists("QueryItem", &missing).unwrap());
        assert_eq!(cache.probes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disabled_cache_is_never_consulted() {
        let cache = Arc::new(CountingCache::enabled_for(&["SomeOtherType"]));
        let db = Database::with_cache_provider(
            ConnectionInfo::in_memory("CacheTests"),
            Arc::clone(&cache) as Arc<dyn CacheProvider>,
        )
        .unwrap();
        db.register_type(query_item_descriptor()).unwrap();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let id = StructureId::Identity(1);
        assert!(session.exists("QueryItem", &id).unwrap());
        assert!(session.exists("QueryItem", &id).unwrap());
        assert_eq!(cache.probes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rollback_evicts_existence_facts_cached_in_the_transaction() {
        let cache = Arc::new(CountingCache::enabled_for(&["QueryItem"]));
        let db = Database::with_cache_provider(
            ConnectionInfo::in_memory("CacheTests"),
            Arc::clone(&cache) as Arc<dyn CacheProvider>,
        )
        .unwrap();
        db.register_type(query_item_descriptor()).unwrap();

        let mut session = db.begin_session().unwrap();
        let ids = session
            .insert_many("QueryItem", &four_unordered_items())
            .unwrap();
        // Probing inside the open transaction caches the uncommitted
        // outcome.
        assert!(session.exists("QueryItem", &ids[0]).unwrap());
        session.dispose();

        // The rollback discarded the insert, so the cached fact must be
        // gone with it.
        let mut session = db.begin_session().unwrap();
        assert_eq!(session.count("QueryItem").unwrap(), 0);
        assert!(!session.exists("QueryItem", &ids[0]).unwrap());
    }

    #[test]
    fn test_failed_write_evicts_existence_facts_cached_before_it() {
        let cache = Arc::new(CountingCache::enabled_for(&["Account"]));
        let db = Database::with_cache_provider(
            ConnectionInfo::in_memory("CacheTests"),
            Arc::clone(&cache) as Arc<dyn CacheProvider>,
        )
        .unwrap();
        db.register_type(TypeDescriptor::new(
            "Account",
            IdType::Identity,
            vec![MemberDescriptor::new("Email", ValueType::String).unique()],
        ))
        .unwrap();

        let mut session = db.begin_session().unwrap();
        let id = session
            .insert("Account", &serde_json::json!({"Email": "a@x.se"}))
            .unwrap();
        assert!(session.exists("Account", &id).unwrap());

        let err = session
            .insert("Account", &serde_json::json!({"Email": "a@x.se"}))
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { .. }));

        let mut session = db.begin_session().unwrap();
        assert!(!session.exists("Account", &id).unwrap());
    }

    #[test]
    fn test_writes_evict_cached_existence_facts() {
        let cache = Arc::new(CountingCache::enabled_for(&["QueryItem"]));
        let db = Database::with_cache_provider(
            ConnectionInfo::in_memory("CacheTests"),
            Arc::clone(&cache) as Arc<dyn CacheProvider>,
        )
        .unwrap();
        db.register_type(query_item_descriptor()).unwrap();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let id = StructureId::Identity(1);
        assert!(session.exists("QueryItem", &id).unwrap());

        session.delete_by_id("QueryItem", &id).unwrap();
        session.commit().unwrap();
        assert!(!session.exists("QueryItem", &id).unwrap());
    }

    #[test]
    fn test_unknown_member_in_query_is_schema_mismatch() {
        let db = test_db();
        insert_four(&db);

        let mut session = db.begin_session().unwrap();
        let err = session
            .query_as_json(
                "QueryItem",
                &QueryBuilder::new()
                    .where_expr(Expr::member("NoSuchMember").eq(1))
                    .build(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }

    #[test]
    fn test_unregistered_type_is_schema_mismatch() {
        let db = test_db();
        let mut session = db.begin_session().unwrap();
        let err = session.count("Unregistered").unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }

    #[test]
    fn test_file_backed_sessions_share_storage() {
        let dir = tempfile::tempdir().unwrap();
        let info = ConnectionInfo::parse(&format!(
            "data source={};name=FileTests",
            dir.path().display()
        ))
        .unwrap();

        let db = Database::new(info.clone()).unwrap();
        db.register_type(query_item_descriptor()).unwrap();
        insert_four(&db);
        drop(db);

        // A separate database handle over the same file sees the data and
        // tolerates the already-created physical schema.
        let db = Database::new(info).unwrap();
        db.register_type(query_item_descriptor()).unwrap();
        let mut session = db.begin_session().unwrap();
        assert_eq!(session.count("QueryItem").unwrap(), 4);
    }
}
