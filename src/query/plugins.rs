//! # Aggregates and Predicate Plugins
//!
//! Built-in aggregate functions (COUNT, SUM, AVERAGE, MIN, MAX) and the
//! registry of caller-supplied predicate plugins used in `WHERE` clauses.
//!
//! SUM/AVERAGE/MIN/MAX require a numeric input: a numeric key type when
//! aggregating `$key`, or 4/8-byte little-endian records when aggregating
//! `$record`. Aggregating binary keys reports the parser-error status,
//! matching the query surface's contract that the statement as a whole is
//! not executable against that database.

use eyre::Result;
use hashbrown::HashMap;

use crate::encoding::keys::KeyType;
use crate::error::DbError;
use crate::query::parser::Field;

/// Result value of an aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    U64(u64),
    F64(f64),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            Value::F64(_) => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Value::U64(v) => *v as f64,
            Value::F64(v) => *v,
        }
    }
}

/// One finished aggregation row.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Uppercased aggregate name ("SUM", "COUNT", ...).
    pub name: String,
    pub value: Value,
}

/// Supertrait over the predicate closure signature, purely so the trait
/// object can implement `Debug` (required by tests that `unwrap_err()` a
/// `Result<&PredicateFn, _>`); `Box<dyn Fn(&[u8]) -> bool>` itself can't
/// gain a `Debug` impl because neither `Box`, `dyn Fn`, nor `Debug` is
/// local to this crate.
pub trait Predicate: Fn(&[u8]) -> bool {}

impl<F: Fn(&[u8]) -> bool> Predicate for F {}

impl std::fmt::Debug for dyn Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<predicate fn>")
    }
}

pub type PredicateFn = Box<dyn Predicate>;

/// Named predicate plugins, looked up case-insensitively.
#[derive(Default)]
pub struct PluginRegistry {
    predicates: HashMap<String, PredicateFn>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, predicate: PredicateFn) {
        self.predicates.insert(name.to_ascii_lowercase(), predicate);
    }

    pub fn get(&self, name: &str) -> Result<&PredicateFn> {
        self.predicates
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| eyre::Report::new(DbError::PluginNotFound(name.to_string())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggKind {
    Count,
    Sum,
    Average,
    Min,
    Max,
}

/// Streaming aggregator over one field of the merged row stream.
#[derive(Debug)]
pub struct Aggregator {
    kind: AggKind,
    name: String,
    field: Field,
    key_type: KeyType,
    rows: u64,
    sum_u: u64,
    sum_f: f64,
    all_integral: bool,
    min: Option<f64>,
    max: Option<f64>,
}

impl Aggregator {
    /// Builds an aggregator for the parsed function name, validating the
    /// name and its applicability to the field's type up front.
    pub fn new(function: &str, field: Field, key_type: KeyType) -> Result<Self> {
        let kind = match function {
            "COUNT" => AggKind::Count,
            "SUM" => AggKind::Sum,
            "AVERAGE" | "AVG" => AggKind::Average,
            "MIN" => AggKind::Min,
            "MAX" => AggKind::Max,
            other => {
                return Err(eyre::Report::new(DbError::ParserError(format!(
                    "unknown aggregate {}",
                    other
                ))))
            }
        };

        if kind != AggKind::Count && field == Field::Key && !key_type.is_numeric() {
            return Err(eyre::Report::new(DbError::ParserError(format!(
                "{} requires a numeric key type",
                function
            ))));
        }

        Ok(Self {
            kind,
            name: match kind {
                AggKind::Count => "COUNT",
                AggKind::Sum => "SUM",
                AggKind::Average => "AVERAGE",
                AggKind::Min => "MIN",
                AggKind::Max => "MAX",
            }
            .to_string(),
            field,
            key_type,
            rows: 0,
            sum_u: 0,
            sum_f: 0.0,
            all_integral: true,
            min: None,
            max: None,
        })
    }

    fn numeric_of(&self, key: &[u8], record: &[u8]) -> Result<(f64, Option<u64>)> {
        let bytes = match self.field {
            Field::Key => key,
            Field::Record => record,
        };
        match self.field {
            Field::Key => {
                let float = self.key_type.decode_f64(bytes).ok_or_else(|| {
                    eyre::Report::new(DbError::ParserError(
                        "aggregate over non-numeric key".to_string(),
                    ))
                })?;
                Ok((float, self.key_type.decode_u64(bytes)))
            }
            Field::Record => match bytes.len() {
                4 => {
                    let v = u32::from_le_bytes(bytes.try_into().unwrap()); // INVARIANT: length matched
                    Ok((v as f64, Some(v as u64)))
                }
                8 => {
                    let v = u64::from_le_bytes(bytes.try_into().unwrap()); // INVARIANT: length matched
                    Ok((v as f64, Some(v)))
                }
                other => Err(eyre::Report::new(DbError::ParserError(format!(
                    "aggregate over {}-byte record",
                    other
                )))),
            },
        }
    }

    pub fn feed(&mut self, key: &[u8], record: &[u8]) -> Result<()> {
        self.rows += 1;
        if self.kind == AggKind::Count {
            return Ok(());
        }

        let (float, integral) = self.numeric_of(key, record)?;
        match integral {
            Some(v) => self.sum_u = self.sum_u.wrapping_add(v),
            None => self.all_integral = false,
        }
        self.sum_f += float;
        self.min = Some(self.min.map_or(float, |m| m.min(float)));
        self.max = Some(self.max.map_or(float, |m| m.max(float)));
        Ok(())
    }

    pub fn finish(self) -> QueryResult {
        let value = match self.kind {
            AggKind::Count => Value::U64(self.rows),
            AggKind::Sum => {
                if self.all_integral {
                    Value::U64(self.sum_u)
                } else {
                    Value::F64(self.sum_f)
                }
            }
            AggKind::Average => {
                if self.rows == 0 {
                    Value::F64(0.0)
                } else {
                    Value::F64(self.sum_f / self.rows as f64)
                }
            }
            AggKind::Min => Value::F64(self.min.unwrap_or(0.0)),
            AggKind::Max => Value::F64(self.max.unwrap_or(0.0)),
        };
        QueryResult {
            name: self.name,
            value,
        }
    }
}
