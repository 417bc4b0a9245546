use std::cmp::Ordering;

use bytes::Bytes;
use uuid::Uuid;

use crate::statement::SortColumn;

/// A single SQL value travelling between the map side and the reducer.
///
/// The wire representation is owned by the messaging layer; the reducer only
/// needs enough structure to buffer rows and to order them during a sorted
/// merge. Binary payloads stay opaque (`keep_binary` queries never deserialize
/// them on the reducer).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
    Bytes(Bytes),
    Uuid(Uuid),
}

impl Value {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Int(_) | Self::BigInt(_) | Self::Double(_) => 1,
            Self::Text(_) => 2,
            Self::Bytes(_) => 3,
            Self::Uuid(_) => 4,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::BigInt(i) => Some(*i as f64),
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Total order used by the sorted merge. Numeric kinds compare with each
    /// other, everything else only within its own kind; mismatched kinds fall
    /// back to a fixed kind rank so the order stays total.
    pub fn sql_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::BigInt(a), Value::BigInt(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.kind_rank().cmp(&other.kind_rank()),
            },
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::BigInt(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Text(v)
    }
}

/// One row of a result page. `None` columns are SQL NULLs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub columns: Vec<Option<Value>>,
}

impl Row {
    pub fn new(columns: Vec<Option<Value>>) -> Row {
        Row { columns }
    }

    /// Convenience for rows without NULLs.
    pub fn of(values: impl IntoIterator<Item = Value>) -> Row {
        Row {
            columns: values.into_iter().map(Some).collect(),
        }
    }

    pub fn column(&self, idx: usize) -> Option<&Value> {
        self.columns.get(idx).and_then(|c| c.as_ref())
    }
}

/// Compares two rows over the declared sort columns. NULLs order first on an
/// ascending column and last on a descending one (the engine default).
pub fn cmp_rows(a: &Row, b: &Row, sort: &[SortColumn]) -> Ordering {
    for col in sort {
        let va = a.columns.get(col.column).and_then(|c| c.as_ref());
        let vb = b.columns.get(col.column).and_then(|c| c.as_ref());

        let ord = match (va, vb) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.sql_cmp(b),
        };

        let ord = if col.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    Ordering::Equal
}

/// Column type as declared by the map query metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Int,
    BigInt,
    Double,
    Text,
    Bytes,
    Uuid,
}

/// Metadata for one output column of a map query; the merge table exposes
/// these to the local SQL engine.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, data_type: DataType) -> ColumnMeta {
        ColumnMeta {
            name: name.into(),
            data_type,
        }
    }

    /// The single column of an EXPLAIN merge table.
    pub fn plan() -> ColumnMeta {
        ColumnMeta::new("PLAN", DataType::Text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sort_on(column: usize, descending: bool) -> Vec<SortColumn> {
        vec![SortColumn { column, descending }]
    }

    #[test]
    fn numeric_kinds_compare_with_each_other() {
        assert_eq!(
            Value::Int(3).sql_cmp(&Value::BigInt(4)),
            Ordering::Less
        );
        assert_eq!(
            Value::Double(2.5).sql_cmp(&Value::Int(2)),
            Ordering::Greater
        );
    }

    #[test]
    fn nulls_order_first_ascending_last_descending() {
        let null_row = Row::new(vec![None]);
        let one = Row::of([Value::Int(1)]);

        assert_eq!(cmp_rows(&null_row, &one, &sort_on(0, false)), Ordering::Less);
        assert_eq!(
            cmp_rows(&null_row, &one, &sort_on(0, true)),
            Ordering::Greater
        );
    }

    #[test]
    fn later_sort_columns_break_ties() {
        let sort = vec![
            SortColumn {
                column: 0,
                descending: false,
            },
            SortColumn {
                column: 1,
                descending: true,
            },
        ];

        let a = Row::of([Value::Int(1), Value::Text("a".into())]);
        let b = Row::of([Value::Int(1), Value::Text("b".into())]);

        assert_eq!(cmp_rows(&a, &b, &sort), Ordering::Greater);
    }
}
