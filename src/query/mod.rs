//! Query intermediate representation
//!
//! A serializable tree of typed nodes produced by the fluent builder and
//! consumed by the SQL generator. Nodes live in an arena (`ParsedLambda`)
//! and reference their children by explicit index, so the whole IR can be
//! serialized and inspected without pointer chasing.

pub mod generator;

use serde::{Deserialize, Serialize};

use crate::structure::IndexValue;

pub use generator::{SqlCommandInfo, SqlQueryGenerator};

/// Index of a node within its owning `ParsedLambda`
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// String pattern-match operators, compiled to LIKE with escaped literals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringMatchKind {
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// One typed node of a parsed lambda
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LambdaNode {
    /// Member access by dot-notation path
    Member { path: String },
    /// Literal constant, always bound as a parameter
    Constant { value: IndexValue },
    /// Comparison of a member against a constant
    Compare {
        op: CompareOp,
        member: NodeId,
        value: NodeId,
    },
    /// Boolean combination of two sub-expressions
    Logical {
        op: LogicalOp,
        left: NodeId,
        right: NodeId,
    },
    /// Null test on a member
    NullCheck { member: NodeId, is_null: bool },
    /// String pattern match of a member against a constant
    StringMatch {
        kind: StringMatchKind,
        member: NodeId,
        value: NodeId,
    },
    /// Sort key with direction
    Sort {
        member: NodeId,
        direction: SortDirection,
    },
}

/// An ordered sequence of typed nodes forming a tree via explicit child
/// references
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedLambda {
    pub nodes: Vec<LambdaNode>,
    /// Root of the expression tree, where one exists (sortings and member
    /// lists are flat sequences and carry no root)
    pub root: Option<NodeId>,
}

impl ParsedLambda {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, node: LambdaNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

/// Query IR root: four independently optional sub-trees plus a row limit
///
/// Presence of a sub-tree is determined by a non-empty node sequence, never
/// by nullability alone. A command with none of them is the empty query and
/// short-circuits to an unfiltered, unordered full-table read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryCommand {
    pub select: ParsedLambda,
    pub where_: ParsedLambda,
    pub sortings: ParsedLambda,
    pub includes: Vec<ParsedLambda>,
    pub take: Option<u64>,
}

impl QueryCommand {
    pub fn has_select(&self) -> bool {
        !self.select.is_empty()
    }

    pub fn has_where(&self) -> bool {
        !self.where_.is_empty()
    }

    pub fn has_sortings(&self) -> bool {
        !self.sortings.is_empty()
    }

    pub fn has_includes(&self) -> bool {
        !self.includes.is_empty() && self.includes.iter().any(|i| !i.is_empty())
    }

    pub fn has_take(&self) -> bool {
        self.take.is_some_and(|n| n > 0)
    }

    pub fn is_empty(&self) -> bool {
        !self.has_select()
            && !self.has_where()
            && !self.has_sortings()
            && !self.has_includes()
            && !self.has_take()
    }
}

/// Owned predicate expression built by the caller and flattened into the
/// arena on `build`
#[derive(Debug, Clone)]
pub enum Expr {
    Compare {
        path: String,
        op: CompareOp,
        value: IndexValue,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    NullCheck {
        path: String,
        is_null: bool,
    },
    StringMatch {
        path: String,
        kind: StringMatchKind,
        value: String,
    },
}

impl Expr {
    pub fn member(path: &str) -> MemberRef {
        MemberRef {
            path: path.to_string(),
        }
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::Logical {
            op: LogicalOp::And,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::Logical {
            op: LogicalOp::Or,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    fn flatten(&self, lambda: &mut ParsedLambda) -> NodeId {
        match self {
            Expr::Compare { path, op, value } => {
                let member = lambda.push(LambdaNode::Member { path: path.clone() });
                let value = lambda.push(LambdaNode::Constant {
                    value: value.clone(),
                });
                lambda.push(LambdaNode::Compare {
                    op: *op,
                    member,
                    value,
                })
            }
            Expr::Logical { op, left, right } => {
                let left = left.flatten(lambda);
                let right = right.flatten(lambda);
                lambda.push(LambdaNode::Logical {
                    op: *op,
                    left,
                    right,
                })
            }
            Expr::NullCheck { path, is_null } => {
                let member = lambda.push(LambdaNode::Member { path: path.clone() });
                lambda.push(LambdaNode::NullCheck {
                    member,
                    is_null: *is_null,
                })
            }
            Expr::StringMatch { path, kind, value } => {
                let member = lambda.push(LambdaNode::Member { path: path.clone() });
                let value = lambda.push(LambdaNode::Constant {
                    value: IndexValue::String(value.clone()),
                });
                lambda.push(LambdaNode::StringMatch {
                    kind: *kind,
                    member,
                    value,
                })
            }
        }
    }

    /// Flatten into a standalone parsed lambda
    pub fn into_lambda(self) -> ParsedLambda {
        let mut lambda = ParsedLambda::default();
        let root = self.flatten(&mut lambda);
        lambda.root = Some(root);
        lambda
    }
}

/// Builder handle for predicates on one member path
#[derive(Debug, Clone)]
pub struct MemberRef {
    path: String,
}

impl MemberRef {
    fn compare(self, op: CompareOp, value: impl Into<IndexValue>) -> Expr {
        Expr::Compare {
            path: self.path,
            op,
            value: value.into(),
        }
    }

    pub fn eq(self, value: impl Into<IndexValue>) -> Expr {
        self.compare(CompareOp::Eq, value)
    }

    pub fn ne(self, value: impl Into<IndexValue>) -> Expr {
        self.compare(CompareOp::Ne, value)
    }

    pub fn gt(self, value: impl Into<IndexValue>) -> Expr {
        self.compare(CompareOp::Gt, value)
    }

    pub fn gte(self, value: impl Into<IndexValue>) -> Expr {
        self.compare(CompareOp::Gte, value)
    }

    pub fn lt(self, value: impl Into<IndexValue>) -> Expr {
        self.compare(CompareOp::Lt, value)
    }

    pub fn lte(self, value: impl Into<IndexValue>) -> Expr {
        self.compare(CompareOp::Lte, value)
    }

    pub fn is_null(self) -> Expr {
        Expr::NullCheck {
            path: self.path,
            is_null: true,
        }
    }

    pub fn is_not_null(self) -> Expr {
        Expr::NullCheck {
            path: self.path,
            is_null: false,
        }
    }

    pub fn contains(self, value: &str) -> Expr {
        Expr::StringMatch {
            path: self.path,
            kind: StringMatchKind::Contains,
            value: value.to_string(),
        }
    }

    pub fn starts_with(self, value: &str) -> Expr {
        Expr::StringMatch {
            path: self.path,
            kind: StringMatchKind::StartsWith,
            value: value.to_string(),
        }
    }

    pub fn ends_with(self, value: &str) -> Expr {
        Expr::StringMatch {
            path: self.path,
            kind: StringMatchKind::EndsWith,
            value: value.to_string(),
        }
    }
}

/// Fluent builder for query commands
///
/// Chained `sort_by` calls append subordinate sort keys in declaration
/// order; they never replace the existing sort. The structure id is always
/// the final implicit tie-break key.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    command: QueryCommand,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_expr(mut self, expr: Expr) -> Self {
        self.command.where_ = expr.into_lambda();
        self
    }

    fn push_sort(&mut self, path: &str, direction: SortDirection) {
        let member = self.command.sortings.push(LambdaNode::Member {
            path: path.to_string(),
        });
        self.command
            .sortings
            .push(LambdaNode::Sort { member, direction });
    }

    pub fn sort_by(mut self, path: &str) -> Self {
        self.push_sort(path, SortDirection::Asc);
        self
    }

    pub fn sort_by_desc(mut self, path: &str) -> Self {
        self.push_sort(path, SortDirection::Desc);
        self
    }

    /// Narrow the result to the listed members (projected view)
    pub fn select(mut self, paths: &[&str]) -> Self {
        for path in paths {
            self.command.select.push(LambdaNode::Member {
                path: (*path).to_string(),
            });
        }
        self
    }

    /// Fetch the member at `path` alongside the primary row for
    /// denormalized hydration
    pub fn include(mut self, path: &str) -> Self {
        let mut lambda = ParsedLambda::default();
        lambda.push(LambdaNode::Member {
            path: path.to_string(),
        });
        self.command.includes.push(lambda);
        self
    }

    pub fn take(mut self, n: u64) -> Self {
        self.command.take = Some(n);
        self
    }

    pub fn build(self) -> QueryCommand {
        self.command
    }
}
