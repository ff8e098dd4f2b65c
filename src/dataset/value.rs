// src/dataset/value.rs

use serde::{Serialize, Serializer};
use std::{
    fmt,
    hash::{Hash, Hasher},
};

/// A single cell of a tabular row.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

/// The homogeneous type of a column, ordered by how far it has been widened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Null,
    Int,
    Float,
    Text,
}

impl ColumnKind {
    /// Smallest kind able to hold values of both `self` and `other`.
    pub fn widen(self, other: ColumnKind) -> ColumnKind {
        self.max(other)
    }

    /// Infer the kind of a raw text column.
    /// Empty fields are ignored; a column with no content at all stays `Null`.
    ///
    /// A mix of integers and decimals is `Float` unless some integer has no
    /// exact `f64` form, in which case the column is `Text`.
    pub fn infer<'a>(fields: impl IntoIterator<Item = &'a str>) -> ColumnKind {
        let mut kind = ColumnKind::Null;
        let mut inexact_int = false;
        for field in fields {
            if field.is_empty() {
                continue;
            }
            let field_kind = match field.trim().parse::<i64>() {
                Ok(i) => {
                    inexact_int |= !int_fits_f64(i);
                    ColumnKind::Int
                }
                Err(_) if parse_finite(field.trim()).is_some() => ColumnKind::Float,
                Err(_) => ColumnKind::Text,
            };
            kind = kind.widen(field_kind);
            if kind == ColumnKind::Text {
                break;
            }
        }
        if kind == ColumnKind::Float && inexact_int {
            ColumnKind::Text
        } else {
            kind
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Null => "null",
            ColumnKind::Int => "int",
            ColumnKind::Float => "float",
            ColumnKind::Text => "text",
        }
    }
}

/// Largest magnitude below which every integer converts to `f64` exactly.
const F64_EXACT_INT: u64 = 1 << 53;

/// True when `i as f64` loses nothing.
pub fn int_fits_f64(i: i64) -> bool {
    i.unsigned_abs() <= F64_EXACT_INT
}

fn parse_finite(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|f| f.is_finite())
}

impl Value {
    pub fn kind(&self) -> ColumnKind {
        match self {
            Value::Null => ColumnKind::Null,
            Value::Int(_) => ColumnKind::Int,
            Value::Float(_) => ColumnKind::Float,
            Value::Text(_) => ColumnKind::Text,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Parse a raw field as a value of `kind`, the kind having been
    /// inferred over the whole column with [`ColumnKind::infer`].
    pub fn parse_as(raw: &str, kind: ColumnKind) -> Value {
        if raw.is_empty() {
            return Value::Null;
        }
        match kind {
            ColumnKind::Null => Value::Null,
            ColumnKind::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(raw.to_string())),
            ColumnKind::Float => parse_finite(raw.trim())
                .map(Value::Float)
                .unwrap_or_else(|| Value::Text(raw.to_string())),
            ColumnKind::Text => Value::Text(raw.to_string()),
        }
    }

    /// Convert into a value of the (wider or equal) `kind`. Nulls stay null.
    /// Callers pick `Text` over `Float` for integers outside [`int_fits_f64`].
    pub fn coerce(self, kind: ColumnKind) -> Value {
        match (self, kind) {
            (Value::Null, _) => Value::Null,
            (Value::Int(i), ColumnKind::Float) => Value::Float(i as f64),
            (Value::Int(i), ColumnKind::Text) => Value::Text(i.to_string()),
            (Value::Float(f), ColumnKind::Text) => Value::Text(f.to_string()),
            (v, _) => v,
        }
    }
}

// Floats compare by bit pattern so equality stays reflexive and agrees with Hash.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.pad(""),
            Value::Int(i) => f.pad(&i.to_string()),
            Value::Float(x) => f.pad(&x.to_string()),
            Value::Text(s) => f.pad(s),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_infer_column_kinds() {
        assert_eq!(ColumnKind::infer(["1", "2", ""]), ColumnKind::Int);
        assert_eq!(ColumnKind::infer(["1", "2.5"]), ColumnKind::Float);
        assert_eq!(ColumnKind::infer(["1", "EQ"]), ColumnKind::Text);
        assert_eq!(ColumnKind::infer(["", ""]), ColumnKind::Null);
        // "nan" and "inf" parse as f64 but are kept as text
        assert_eq!(ColumnKind::infer(["nan"]), ColumnKind::Text);
        assert_eq!(ColumnKind::infer(["inf", "1"]), ColumnKind::Text);
    }

    #[test]
    fn test_large_ints_mixed_with_decimals_stay_text() {
        assert!(int_fits_f64(9_007_199_254_740_992));
        assert!(!int_fits_f64(9_007_199_254_740_993));
        assert!(!int_fits_f64(i64::MIN));
        assert_eq!(
            ColumnKind::infer(["9007199254740993", "9007199254740992"]),
            ColumnKind::Int
        );
        assert_eq!(
            ColumnKind::infer(["9007199254740993", "1.5"]),
            ColumnKind::Text
        );
        assert_eq!(ColumnKind::infer(["9007199254740992", "1.5"]), ColumnKind::Float);
    }

    #[test]
    fn test_display_honours_width() {
        assert_eq!(format!("{:<6}|", Value::from("a.csv")), "a.csv |");
        assert_eq!(format!("{:>4}", Value::Int(7)), "   7");
        assert_eq!(format!("{:>3}", Value::Null), "   ");
    }

    #[test]
    fn test_text_columns_keep_raw_fields() {
        let kind = ColumnKind::infer(["007", "ABC"]);
        assert_eq!(Value::parse_as("007", kind), Value::Text("007".into()));
        assert_eq!(Value::parse_as("", kind), Value::Null);
    }

    #[test]
    fn test_widen_and_coerce() {
        assert_eq!(ColumnKind::Int.widen(ColumnKind::Float), ColumnKind::Float);
        assert_eq!(ColumnKind::Null.widen(ColumnKind::Int), ColumnKind::Int);
        assert_eq!(ColumnKind::Float.widen(ColumnKind::Text), ColumnKind::Text);

        assert_eq!(Value::Int(3).coerce(ColumnKind::Float), Value::Float(3.0));
        assert_eq!(Value::Float(2.5).coerce(ColumnKind::Text), Value::from("2.5"));
        assert_eq!(Value::Null.coerce(ColumnKind::Text), Value::Null);
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        let mut set = HashSet::new();
        assert!(set.insert(Value::Float(1.5)));
        assert!(!set.insert(Value::Float(1.5)));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }
}
