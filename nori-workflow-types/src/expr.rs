use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Predicate AST handed to the store filter compiler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// null, bool, number, string or array.
    Literal(Value),
    Regex(String),
    Field(String),
    /// A filter expression used as a value, e.g. the body of a nested filter literal.
    Filter(Box<Expr>),
    FreeText(String),

    /// Marks its operand as a bare field reference, otherwise a no-op.
    Quote(Box<Expr>),
    Not(Box<Expr>),

    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),

    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Lte(Box<Expr>, Box<Expr>),
    Gte(Box<Expr>, Box<Expr>),
    Match(Box<Expr>, Box<Expr>),    // field =~ glob or regex
    NotMatch(Box<Expr>, Box<Expr>), // field !~ glob or regex
    In(Box<Expr>, Box<Expr>),       // field in [..]
}

impl Expr {
    /// The field name when this node is a bare field reference, looking through quotes.
    pub fn as_field(&self) -> Option<&str> {
        match self {
            Expr::Field(name) => Some(name),
            Expr::Quote(inner) => inner.as_field(),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(val) => write!(f, "{val}"),
            Expr::Regex(re) => write!(f, "/{re}/"),
            Expr::Field(field) => write!(f, "{field}"),
            Expr::Filter(inner) => write!(f, "filter({inner})"),
            Expr::FreeText(text) => write!(f, "{text:?}"),

            Expr::Quote(inner) => write!(f, "#{inner}"),
            Expr::Not(inner) => write!(f, "not({inner})"),

            Expr::And(lhs, rhs) => write!(f, "({lhs} and {rhs})"),
            Expr::Or(lhs, rhs) => write!(f, "({lhs} or {rhs})"),

            Expr::Eq(lhs, rhs) => write!(f, "({lhs} == {rhs})"),
            Expr::Ne(lhs, rhs) => write!(f, "({lhs} != {rhs})"),
            Expr::Lt(lhs, rhs) => write!(f, "({lhs} < {rhs})"),
            Expr::Gt(lhs, rhs) => write!(f, "({lhs} > {rhs})"),
            Expr::Lte(lhs, rhs) => write!(f, "({lhs} <= {rhs})"),
            Expr::Gte(lhs, rhs) => write!(f, "({lhs} >= {rhs})"),
            Expr::Match(lhs, rhs) => write!(f, "({lhs} =~ {rhs})"),
            Expr::NotMatch(lhs, rhs) => write!(f, "({lhs} !~ {rhs})"),
            Expr::In(lhs, rhs) => write!(f, "({lhs} in {rhs})"),
        }
    }
}
