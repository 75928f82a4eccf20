//! Subscription filters.
//!
//! A subscription filters the document stream by collection, optionally
//! narrowed by field predicates over the document projection. The full
//! query language lives outside this engine; the textual form stored in
//! the cluster uses the `from <Collection> [where <field> <op> <value>
//! [and ...]]` subset, which this module parses and evaluates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SubscriptionError};

/// Comparison operator of a field predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Strictly greater.
    Gt,
    /// Greater or equal.
    Gte,
    /// Strictly less.
    Lt,
    /// Less or equal.
    Lte,
}

impl CompareOp {
    fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "=" | "==" => Some(CompareOp::Eq),
            "!=" => Some(CompareOp::Ne),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Gte),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Lte),
            _ => None,
        }
    }
}

/// One predicate over a top-level document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldPredicate {
    /// The field name.
    pub field: String,
    /// The comparison.
    pub op: CompareOp,
    /// The literal to compare against.
    pub value: Value,
}

impl FieldPredicate {
    fn matches(&self, data: &Value) -> bool {
        let Some(actual) = data.get(&self.field) else {
            return false;
        };
        match self.op {
            CompareOp::Eq => actual == &self.value,
            CompareOp::Ne => actual != &self.value,
            _ => {
                let (Some(a), Some(b)) = (actual.as_f64(), self.value.as_f64()) else {
                    return false;
                };
                match self.op {
                    CompareOp::Gt => a > b,
                    CompareOp::Gte => a >= b,
                    CompareOp::Lt => a < b,
                    CompareOp::Lte => a <= b,
                    CompareOp::Eq | CompareOp::Ne => unreachable!(),
                }
            }
        }
    }
}

/// A parsed subscription filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionCriteria {
    /// Collection the subscription reads.
    pub collection: String,
    /// Conjunctive field predicates; empty means the whole collection.
    pub predicates: Vec<FieldPredicate>,
}

impl SubscriptionCriteria {
    /// Whole-collection criteria.
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            predicates: Vec::new(),
        }
    }

    /// Add a predicate.
    pub fn and_where(mut self, field: impl Into<String>, op: CompareOp, value: Value) -> Self {
        self.predicates.push(FieldPredicate {
            field: field.into(),
            op,
            value,
        });
        self
    }

    /// True when a document belongs to this subscription.
    pub fn matches(&self, collection: &str, data: &Value) -> bool {
        collection == self.collection && self.predicates.iter().all(|p| p.matches(data))
    }

    /// The textual form stored in the cluster.
    pub fn to_query(&self) -> String {
        let mut out = format!("from {}", self.collection);
        for (i, p) in self.predicates.iter().enumerate() {
            out.push_str(if i == 0 { " where " } else { " and " });
            out.push_str(&format!("{} {} {}", p.field, p.op.as_str(), p.value));
        }
        out
    }

    /// Parse the stored textual form back.
    pub fn parse(query: &str) -> Result<Self> {
        let malformed = || SubscriptionError::Protocol {
            msg: format!("unparseable subscription query: {query}"),
        };
        let rest = query.trim().strip_prefix("from ").ok_or_else(malformed)?;
        let (collection, clauses) = match rest.split_once(" where ") {
            Some((c, w)) => (c.trim(), Some(w)),
            None => (rest.trim(), None),
        };
        if collection.is_empty() || collection.contains(' ') {
            return Err(malformed());
        }
        let mut criteria = SubscriptionCriteria::collection(collection);
        if let Some(clauses) = clauses {
            for clause in clauses.split(" and ") {
                let mut parts = clause.trim().splitn(3, ' ');
                let field = parts.next().ok_or_else(malformed)?;
                let op = parts
                    .next()
                    .and_then(CompareOp::parse)
                    .ok_or_else(malformed)?;
                let raw = parts.next().ok_or_else(malformed)?;
                let value: Value = serde_json::from_str(raw).map_err(|_| malformed())?;
                criteria.predicates.push(FieldPredicate {
                    field: field.to_string(),
                    op,
                    value,
                });
            }
        }
        Ok(criteria)
    }
}
