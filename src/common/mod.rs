// Shared identifiers and the scalar value model used by every layer:
// storage encodes `Value`s onto pages, the resolver infers `DataType`s,
// and the execution engine evaluates expressions over rows of `Value`s.

use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

pub type PageId = u32;
pub type SlotId = u16;
pub type TransactionId = u64;
pub type SessionId = u64;

/// Sentinel page id; used for "no page" in chain links and free lists.
pub const INVALID_PAGE_ID: PageId = u32::MAX;

/// Record identifier: (page id, slot id).
///
/// Stable across in-place updates. Relocating updates leave a forward
/// pointer behind so the original pair keeps naming the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: SlotId,
}

impl RecordId {
    pub fn new(page_id: PageId, slot: SlotId) -> Self {
        Self { page_id, slot }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}

/// Declared column types. `NULL` is a value, not a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Real)
    }

    /// Whether a value of type `source` can be stored in a column of this
    /// type. `None` is the type of a bare NULL, assignable anywhere.
    pub fn assignable_from(&self, source: Option<DataType>) -> bool {
        match source {
            None => true,
            Some(src) => {
                src == *self || (*self == DataType::Real && src == DataType::Integer)
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Integer => write!(f, "INTEGER"),
            DataType::Real => write!(f, "REAL"),
            DataType::Text => write!(f, "TEXT"),
            DataType::Blob => write!(f, "BLOB"),
            DataType::Boolean => write!(f, "BOOLEAN"),
        }
    }
}

/// A tagged scalar. The closed set of runtime values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Text(String),
    Blob(Vec<u8>),
}

/// A row is an ordered tuple of values matching some column list.
pub type Row = Vec<Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Runtime type; `None` for NULL.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Integer(_) => Some(DataType::Integer),
            Value::Real(_) => Some(DataType::Real),
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Text(_) => Some(DataType::Text),
            Value::Blob(_) => Some(DataType::Blob),
        }
    }

    /// SQL comparison between two non-null values.
    ///
    /// Same-type values compare directly; Integer and Real compare
    /// numerically. Anything else is a type mismatch. Callers implement
    /// three-valued logic by handling NULL before calling this.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        let incomparable = || {
            DbError::TypeMismatch(format!(
                "cannot compare {} with {}",
                type_name(self),
                type_name(other)
            ))
        };
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Ok(a.cmp(b)),
            (Value::Real(a), Value::Real(b)) => Ok(total_f64(*a, *b)),
            (Value::Integer(a), Value::Real(b)) => Ok(total_f64(*a as f64, *b)),
            (Value::Real(a), Value::Integer(b)) => Ok(total_f64(*a, *b as f64)),
            (Value::Boolean(a), Value::Boolean(b)) => Ok(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
            (Value::Blob(a), Value::Blob(b)) => Ok(a.cmp(b)),
            _ => Err(incomparable()),
        }
    }

    /// Total ordering for sorting. NULLs sort first; values of different
    /// incomparable types order by type tag so the ordering stays total.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        match self.compare(other) {
            Ok(ord) => ord,
            Err(_) => type_rank(self).cmp(&type_rank(other)),
        }
    }

    /// Coerce into a column of the given declared type.
    ///
    /// The only implicit widening is Integer into Real; everything else
    /// must already match.
    pub fn coerce_to(self, target: DataType) -> Result<Value> {
        match (&self, target) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::Integer(i), DataType::Real) => Ok(Value::Real(*i as f64)),
            _ => {
                if self.data_type() == Some(target) {
                    Ok(self)
                } else {
                    Err(DbError::TypeMismatch(format!(
                        "cannot store {} in {} column",
                        type_name(&self),
                        target
                    )))
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Text(s) => write!(f, "{}", s),
            Value::Blob(b) => write!(f, "x'{}'", hex(b)),
        }
    }
}

fn total_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "NULL",
        Value::Integer(_) => "INTEGER",
        Value::Real(_) => "REAL",
        Value::Boolean(_) => "BOOLEAN",
        Value::Text(_) => "TEXT",
        Value::Blob(_) => "BLOB",
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Boolean(_) => 1,
        Value::Integer(_) => 2,
        Value::Real(_) => 2,
        Value::Text(_) => 3,
        Value::Blob(_) => 4,
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
