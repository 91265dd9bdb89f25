//! SQL query generator
//!
//! Compiles a `QueryCommand` into one parameterized SQL command against the
//! three-table layout. Indexable values live in the narrow index table, not
//! as columns on the structure table, so every member reference compiles to
//! a correlated EXISTS sub-query (predicates) or scalar sub-query (sort
//! keys, projections) keyed by structure id.
//!
//! Literal values are always bound as parameters. The only text injected
//! into SQL is table names and member-path aliases, both drawn from the
//! closed schema vocabulary after validation against the index accessors.

use crate::query::{LambdaNode, NodeId, ParsedLambda, QueryCommand, StringMatchKind};
use crate::schema::StructureSchema;
use crate::structure::IndexValue;
use crate::{Error, Result};

/// Immutable compiled SQL command: text plus positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SqlCommandInfo {
    pub sql: String,
    pub params: Vec<IndexValue>,
}

/// Compiles query commands for one target schema
pub struct SqlQueryGenerator;

struct ParamSink {
    params: Vec<IndexValue>,
}

impl ParamSink {
    fn new() -> Self {
        Self { params: Vec::new() }
    }

    /// Bind a value, returning its indexed placeholder. Indexed `?N`
    /// placeholders keep binding order independent of textual order.
    fn bind(&mut self, value: IndexValue) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }
}

impl SqlQueryGenerator {
    /// Compile a command into the full-materialization query.
    ///
    /// Without a select the serialized body is returned; with one, the id
    /// plus one scalar column per selected member. Include paths add
    /// unfiltered scalar columns after the primary columns.
    pub fn generate(command: &QueryCommand, schema: &StructureSchema) -> Result<SqlCommandInfo> {
        let mut sink = ParamSink::new();
        let indexes_table = schema.indexes_table();

        let mut columns: Vec<String> = if command.has_select() {
            let mut cols = vec!["s.StructureId".to_string()];
            for node in &command.select.nodes {
                let LambdaNode::Member { path } = node else {
                    return Err(Error::SchemaMismatch(
                        "select lambda may only contain member nodes".to_string(),
                    ));
                };
                cols.push(member_column(schema, &indexes_table, path, &mut sink)?);
            }
            cols
        } else {
            vec!["s.Json".to_string()]
        };

        if command.has_includes() {
            for include in &command.includes {
                for node in &include.nodes {
                    let LambdaNode::Member { path } = node else {
                        return Err(Error::SchemaMismatch(
                            "include lambda may only contain member nodes".to_string(),
                        ));
                    };
                    columns.push(member_column(schema, &indexes_table, path, &mut sink)?);
                }
            }
        }

        let mut sql = format!(
            "SELECT {} FROM [{}] s",
            columns.join(", "),
            schema.structure_table()
        );

        if command.has_where() {
            let predicate = compile_where(&command.where_, schema, &indexes_table, &mut sink)?;
            sql.push_str(" WHERE ");
            sql.push_str(&predicate);
        }

        if command.has_sortings() {
            let order = compile_sortings(&command.sortings, schema, &indexes_table, &mut sink)?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }

        if let Some(take) = command.take.filter(|n| *n > 0) {
            let placeholder = sink.bind(IndexValue::Int(take as i64));
            sql.push_str(" LIMIT ");
            sql.push_str(&placeholder);
        }

        Ok(SqlCommandInfo {
            sql,
            params: sink.params,
        })
    }

    /// Narrow variant returning only matching structure ids.
    ///
    /// Shares the where-compilation phase with `generate` so query shape and
    /// id shape stay semantically identical.
    pub fn generate_where_ids(
        command: &QueryCommand,
        schema: &StructureSchema,
    ) -> Result<SqlCommandInfo> {
        Self::generate_narrow("s.StructureId", command, schema)
    }

    /// Narrow variant returning the count of matching structure ids
    pub fn generate_where_count(
        command: &QueryCommand,
        schema: &StructureSchema,
    ) -> Result<SqlCommandInfo> {
        Self::generate_narrow("COUNT(s.StructureId)", command, schema)
    }

    fn generate_narrow(
        projection: &str,
        command: &QueryCommand,
        schema: &StructureSchema,
    ) -> Result<SqlCommandInfo> {
        let mut sink = ParamSink::new();
        let indexes_table = schema.indexes_table();

        let mut sql = format!("SELECT {} FROM [{}] s", projection, schema.structure_table());
        if command.has_where() {
            let predicate = compile_where(&command.where_, schema, &indexes_table, &mut sink)?;
            sql.push_str(" WHERE ");
            sql.push_str(&predicate);
        }

        Ok(SqlCommandInfo {
            sql,
            params: sink.params,
        })
    }
}

/// Scalar sub-query column for one member path, aliased by the path itself
fn member_column(
    schema: &StructureSchema,
    indexes_table: &str,
    path: &str,
    sink: &mut ParamSink,
) -> Result<String> {
    schema.accessor(path)?;
    let path_param = sink.bind(IndexValue::String(path.to_string()));
    Ok(format!(
        "(SELECT MIN(ix.MemberValue) FROM [{indexes_table}] ix \
         WHERE ix.StructureId = s.StructureId AND ix.MemberPath = {path_param}) AS [{path}]"
    ))
}

/// Depth-first where-clause compilation from the lambda's root
fn compile_where(
    lambda: &ParsedLambda,
    schema: &StructureSchema,
    indexes_table: &str,
    sink: &mut ParamSink,
) -> Result<String> {
    let root = lambda.root.ok_or_else(|| {
        Error::SchemaMismatch("where lambda has nodes but no root".to_string())
    })?;
    compile_node(lambda, root, schema, indexes_table, sink)
}

fn compile_node(
    lambda: &ParsedLambda,
    id: NodeId,
    schema: &StructureSchema,
    indexes_table: &str,
    sink: &mut ParamSink,
) -> Result<String> {
    match node_at(lambda, id)? {
        // Every composite sub-expression is parenthesized explicitly; the
        // generator never leans on the dialect's precedence defaults.
        LambdaNode::Logical { op, left, right } => {
            let left = compile_node(lambda, *left, schema, indexes_table, sink)?;
            let right = compile_node(lambda, *right, schema, indexes_table, sink)?;
            Ok(format!("({} {} {})", left, op.as_sql(), right))
        }
        LambdaNode::Compare { op, member, value } => {
            let path = member_path(lambda, *member)?;
            schema.accessor(path)?;
            let constant = constant_at(lambda, *value)?;
            let path_param = sink.bind(IndexValue::String(path.to_string()));
            let value_param = sink.bind(constant.clone());
            Ok(format!(
                "EXISTS (SELECT 1 FROM [{indexes_table}] ix \
                 WHERE ix.StructureId = s.StructureId AND ix.MemberPath = {path_param} \
                 AND ix.MemberValue {} {value_param})",
                op.as_sql()
            ))
        }
        LambdaNode::NullCheck { member, is_null } => {
            let path = member_path(lambda, *member)?;
            schema.accessor(path)?;
            let path_param = sink.bind(IndexValue::String(path.to_string()));
            let exists = format!(
                "EXISTS (SELECT 1 FROM [{indexes_table}] ix \
                 WHERE ix.StructureId = s.StructureId AND ix.MemberPath = {path_param} \
                 AND ix.MemberValue IS NOT NULL)"
            );
            if *is_null {
                Ok(format!("NOT {}", exists))
            } else {
                Ok(exists)
            }
        }
        LambdaNode::StringMatch { kind, member, value } => {
            let path = member_path(lambda, *member)?;
            schema.accessor(path)?;
            let IndexValue::String(literal) = constant_at(lambda, *value)? else {
                return Err(Error::SchemaMismatch(format!(
                    "string match on '{}' requires a string literal",
                    path
                )));
            };
            let escaped = escape_like(literal);
            let pattern = match kind {
                StringMatchKind::Contains => format!("%{}%", escaped),
                StringMatchKind::StartsWith => format!("{}%", escaped),
                StringMatchKind::EndsWith => format!("%{}", escaped),
            };
            let path_param = sink.bind(IndexValue::String(path.to_string()));
            let value_param = sink.bind(IndexValue::String(pattern));
            Ok(format!(
                "EXISTS (SELECT 1 FROM [{indexes_table}] ix \
                 WHERE ix.StructureId = s.StructureId AND ix.MemberPath = {path_param} \
                 AND ix.MemberValue LIKE {value_param} ESCAPE '\\')"
            ))
        }
        other => Err(Error::SchemaMismatch(format!(
            "node {:?} is not a boolean expression",
            other
        ))),
    }
}

/// Compile sort keys in declaration order, one correlated scalar sub-query
/// per key, with structure id ascending as the implicit final tie-break.
fn compile_sortings(
    lambda: &ParsedLambda,
    schema: &StructureSchema,
    indexes_table: &str,
    sink: &mut ParamSink,
) -> Result<String> {
    let mut keys = Vec::new();
    for node in &lambda.nodes {
        if let LambdaNode::Sort { member, direction } = node {
            let path = member_path(lambda, *member)?;
            schema.accessor(path)?;
            let path_param = sink.bind(IndexValue::String(path.to_string()));
            keys.push(format!(
                "(SELECT MIN(ix.MemberValue) FROM [{indexes_table}] ix \
                 WHERE ix.StructureId = s.StructureId AND ix.MemberPath = {path_param}) {}",
                direction.as_sql()
            ));
        }
    }
    keys.push("s.StructureId ASC".to_string());
    Ok(keys.join(", "))
}

fn node_at(lambda: &ParsedLambda, id: NodeId) -> Result<&LambdaNode> {
    lambda.nodes.get(id).ok_or_else(|| {
        Error::SchemaMismatch(format!("lambda child reference {} is out of bounds", id))
    })
}

fn member_path(lambda: &ParsedLambda, id: NodeId) -> Result<&str> {
    match node_at(lambda, id)? {
        LambdaNode::Member { path } => Ok(path),
        other => Err(Error::SchemaMismatch(format!(
            "expected a member node, found {:?}",
            other
        ))),
    }
}

fn constant_at(lambda: &ParsedLambda, id: NodeId) -> Result<&IndexValue> {
    match node_at(lambda, id)? {
        LambdaNode::Constant { value } => Ok(value),
        other => Err(Error::SchemaMismatch(format!(
            "expected a constant node, found {:?}",
            other
        ))),
    }
}

/// Escape LIKE wildcard characters in a literal before it becomes part of a
/// bound pattern
fn escape_like(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if c == '\\' || c == '%' || c == '_' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
