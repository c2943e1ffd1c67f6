use nori_workflow_types::{expr::Expr, json};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("invalid operator: {0}")]
    InvalidOperator(String),
}

fn invalid(expr: &Expr) -> CompileError {
    CompileError::InvalidOperator(expr.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Lt,
    Gt,
    Lte,
    Gte,
}

impl Comparison {
    /// `value < field` is `field > value`.
    fn flip(self) -> Self {
        match self {
            Comparison::Lt => Comparison::Gt,
            Comparison::Gt => Comparison::Lt,
            Comparison::Lte => Comparison::Gte,
            Comparison::Gte => Comparison::Lte,
        }
    }

    fn as_range_key(self) -> &'static str {
        match self {
            Comparison::Lt => "lt",
            Comparison::Gt => "gt",
            Comparison::Lte => "lte",
            Comparison::Gte => "gte",
        }
    }
}

/// Compiles predicate ASTs into the store's filter clauses.
#[derive(Debug, Clone, Default)]
pub struct FilterCompiler {
    /// Comparisons on this field compile to match-all, as something else already applies them.
    skip_field: Option<String>,
}

pub fn compile_filter(expr: &Expr) -> Result<Value, CompileError> {
    FilterCompiler::default().compile(expr)
}

impl FilterCompiler {
    pub fn with_skip_field(field: impl Into<String>) -> Self {
        Self {
            skip_field: Some(field.into()),
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Value, CompileError> {
        Ok(match expr {
            Expr::Literal(Value::Bool(true)) => json!({"match_all": {}}),
            Expr::Literal(Value::Bool(false)) => json!({"match_none": {}}),
            Expr::FreeText(text) => json!({
                "multi_match": {
                    "query": text,
                    "type": "phrase",
                    "fields": ["*"],
                    "lenient": true,
                }
            }),
            Expr::Filter(inner) | Expr::Quote(inner) => self.compile(inner)?,
            Expr::Not(inner) => json!({
                "bool": {
                    "must_not": self.compile(inner)?,
                }
            }),
            Expr::And(lhs, rhs) => json!({
                "bool": {
                    "must": [self.compile(lhs)?, self.compile(rhs)?],
                }
            }),
            Expr::Or(lhs, rhs) => json!({
                "bool": {
                    "should": [self.compile(lhs)?, self.compile(rhs)?],
                    "minimum_should_match": 1,
                }
            }),
            Expr::Eq(lhs, rhs) => self.compile_equality(expr, lhs, rhs, false)?,
            Expr::Ne(lhs, rhs) => self.compile_equality(expr, lhs, rhs, true)?,
            Expr::Lt(lhs, rhs) => self.compile_comparison(expr, lhs, rhs, Comparison::Lt)?,
            Expr::Gt(lhs, rhs) => self.compile_comparison(expr, lhs, rhs, Comparison::Gt)?,
            Expr::Lte(lhs, rhs) => self.compile_comparison(expr, lhs, rhs, Comparison::Lte)?,
            Expr::Gte(lhs, rhs) => self.compile_comparison(expr, lhs, rhs, Comparison::Gte)?,
            Expr::Match(lhs, rhs) => self.compile_match(expr, lhs, rhs, false)?,
            Expr::NotMatch(lhs, rhs) => self.compile_match(expr, lhs, rhs, true)?,
            Expr::In(lhs, rhs) => self.compile_in(expr, lhs, rhs)?,
            Expr::Literal(..) | Expr::Regex(..) | Expr::Field(..) => return Err(invalid(expr)),
        })
    }

    fn skips(&self, field: &str) -> bool {
        self.skip_field.as_deref() == Some(field)
    }

    fn compile_equality(
        &self,
        expr: &Expr,
        lhs: &Expr,
        rhs: &Expr,
        negate: bool,
    ) -> Result<Value, CompileError> {
        let (field, value, _) = field_and_value(lhs, rhs).ok_or_else(|| invalid(expr))?;
        if self.skips(field) {
            return Ok(match_all());
        }

        let value = literal(value).ok_or_else(|| invalid(expr))?;
        let clause = match &value {
            Value::Null => json!({"exists": {"field": field}}),
            // A list literal matches any of its values.
            Value::Array(..) => json!({"terms": {field: value}}),
            _ => json!({"term": {field: value}}),
        };

        // `== null` is "does not exist", `!= null` is "exists".
        Ok(if negate == value.is_null() {
            clause
        } else {
            json!({"bool": {"must_not": clause}})
        })
    }

    fn compile_comparison(
        &self,
        expr: &Expr,
        lhs: &Expr,
        rhs: &Expr,
        comparison: Comparison,
    ) -> Result<Value, CompileError> {
        let (field, value, flipped) = field_and_value(lhs, rhs).ok_or_else(|| invalid(expr))?;
        if self.skips(field) {
            return Ok(match_all());
        }

        let value = literal(value)
            .filter(|v| !v.is_null() && !v.is_array())
            .ok_or_else(|| invalid(expr))?;
        let comparison = if flipped {
            comparison.flip()
        } else {
            comparison
        };

        Ok(json!({
            "range": {
                field: {
                    comparison.as_range_key(): value,
                }
            }
        }))
    }

    fn compile_match(
        &self,
        expr: &Expr,
        lhs: &Expr,
        rhs: &Expr,
        negate: bool,
    ) -> Result<Value, CompileError> {
        let field = lhs.as_field().ok_or_else(|| invalid(expr))?;
        if self.skips(field) {
            return Ok(match_all());
        }

        let clause = match rhs {
            Expr::Literal(Value::String(pattern)) => json!({
                "wildcard": {
                    field: {
                        "value": pattern,
                    }
                }
            }),
            Expr::Regex(pattern) => json!({
                "regexp": {
                    field: {
                        "value": pattern,
                    }
                }
            }),
            _ => return Err(invalid(expr)),
        };

        Ok(if negate {
            json!({"bool": {"must_not": clause}})
        } else {
            clause
        })
    }

    fn compile_in(&self, expr: &Expr, lhs: &Expr, rhs: &Expr) -> Result<Value, CompileError> {
        let (field, value, flipped) = field_and_value(lhs, rhs).ok_or_else(|| invalid(expr))?;
        if flipped {
            return Err(invalid(expr));
        }
        if self.skips(field) {
            return Ok(match_all());
        }

        let Some(Value::Array(values)) = literal(value) else {
            return Err(invalid(expr));
        };

        Ok(json!({
            "terms": {
                field: values,
            }
        }))
    }
}

fn match_all() -> Value {
    json!({"match_all": {}})
}

/// Splits a binary operation into its field side and value side. Exactly one side must be
/// a bare field reference; the flag is set when the field is on the right.
fn field_and_value<'a>(lhs: &'a Expr, rhs: &'a Expr) -> Option<(&'a str, &'a Expr, bool)> {
    match (lhs.as_field(), rhs.as_field()) {
        (Some(field), None) => Some((field, rhs, false)),
        (None, Some(field)) => Some((field, lhs, true)),
        _ => None,
    }
}

fn literal(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Literal(value) => Some(value.clone()),
        _ => None,
    }
}
