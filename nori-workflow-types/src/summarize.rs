use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    expr::Expr,
    interval::{Interval, ReduceOn},
};

/// Reducers that have a store-native aggregation.
#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    Avg,
    Count,
    CountUnique,
    Max,
    Min,
    Sum,
}

impl Reducer {
    /// Value a reducer produces over zero points.
    pub fn identity(&self) -> Value {
        match self {
            Reducer::Count | Reducer::CountUnique | Reducer::Sum => Value::from(0),
            Reducer::Avg | Reducer::Max | Reducer::Min => Value::Null,
        }
    }
}

impl FromStr for Reducer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "avg" => Reducer::Avg,
            "count" => Reducer::Count,
            "count_unique" => Reducer::CountUnique,
            "max" => Reducer::Max,
            "min" => Reducer::Min,
            "sum" => Reducer::Sum,
            _ => return Err(format!("reducer '{s}' has no store equivalent")),
        })
    }
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reducer::Avg => write!(f, "avg"),
            Reducer::Count => write!(f, "count"),
            Reducer::CountUnique => write!(f, "count_unique"),
            Reducer::Max => write!(f, "max"),
            Reducer::Min => write!(f, "min"),
            Reducer::Sum => write!(f, "sum"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReducerSpec {
    pub target_field: String,
    pub reducer: Reducer,
    pub arg_field: Option<String>,
}

/// One `target = reducer(args..)` assignment of a reduce step, as written in the pipeline.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReduceExpr {
    pub target: Expr,
    pub reducer: String,
    #[serde(default)]
    pub args: Vec<Expr>,
}

impl ReduceExpr {
    /// The expression as a `ReducerSpec`, when it has the shape `field = reducer(field?)`.
    pub fn to_spec(&self) -> Option<ReducerSpec> {
        let target_field = self.target.as_field()?.to_string();
        let reducer = self.reducer.parse().ok()?;
        let arg_field = match self.args.as_slice() {
            [] => None,
            [arg] => Some(arg.as_field()?.to_string()),
            _ => return None,
        };
        Some(ReducerSpec {
            target_field,
            reducer,
            arg_field,
        })
    }
}

impl fmt::Display for ReduceExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}(", self.target, self.reducer)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Reduce {
    pub exprs: Vec<ReduceExpr>,
    #[serde(default)]
    pub groupby: Vec<String>,
    #[serde(default)]
    pub every: Option<Interval>,
    #[serde(default)]
    pub on: Option<ReduceOn>,
    /// `None` when the pipeline left the default (forget) in place.
    #[serde(default)]
    pub forget: Option<bool>,
}

impl fmt::Display for Reduce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reduce")?;
        if let Some(every) = &self.every {
            write!(f, " -every {every}")?;
        }
        if let Some(forget) = self.forget {
            write!(f, " -forget {forget}")?;
        }
        for (i, expr) in self.exprs.iter().enumerate() {
            write!(f, "{}{expr}", if i > 0 { ", " } else { " " })?;
        }
        if !self.groupby.is_empty() {
            write!(f, " by {}", self.groupby.join(", "))?;
        }
        Ok(())
    }
}
