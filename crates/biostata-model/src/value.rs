use serde::{Deserialize, Serialize};
use std::fmt;

/// A single scalar as stored in (or read back from) a staging table.
///
/// Serialized as a bare JSON scalar so filter descriptors stay readable:
/// `null`, `3`, `2.5`, `"text"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value. Text is parsed after trimming; anything
    /// non-numeric yields `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(*i as f64),
            Value::Real(r) => Some(*r),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Integer coercion used for key columns and `INT` casts.
    ///
    /// Reals are accepted only when they carry no fractional part; text must
    /// parse as an integer (or as an integral real).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(*i),
            Value::Real(r) => integral(*r),
            Value::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(integral))
            }
        }
    }

    /// Text rendering used when a value is compared against dictionary entries
    /// (mirrors SQLite's `CAST(x AS TEXT)`).
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Integer(i) => Some(i.to_string()),
            Value::Real(r) => Some(format_real(*r)),
            Value::Text(s) => Some(s.clone()),
        }
    }

    /// Render as an SQL literal.
    pub fn sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Real(r) if r.is_finite() => format_real(*r),
            Value::Real(_) => "NULL".to_string(),
            Value::Text(s) => quote_literal(s),
        }
    }
}

fn integral(r: f64) -> Option<i64> {
    if r.is_finite() && r.fract() == 0.0 && r >= i64::MIN as f64 && r <= i64::MAX as f64 {
        Some(r as i64)
    } else {
        None
    }
}

fn format_real(r: f64) -> String {
    // `{:?}` keeps a trailing `.0` for integral reals so the literal stays REAL.
    format!("{r:?}")
}

/// Quote a string as an SQL text literal.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str(""),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_keep_their_sql_type() {
        assert_eq!(Value::Real(2.0).sql_literal(), "2.0");
        assert_eq!(Value::Integer(-3).sql_literal(), "-3");
        assert_eq!(Value::from("it's").sql_literal(), "'it''s'");
        assert_eq!(Value::Null.sql_literal(), "NULL");
    }

    #[test]
    fn integer_coercion_rejects_fractions_and_garbage() {
        assert_eq!(Value::from(" 12 ").as_i64(), Some(12));
        assert_eq!(Value::from("3.0").as_i64(), Some(3));
        assert_eq!(Value::Real(1.5).as_i64(), None);
        assert_eq!(Value::from("abc").as_i64(), None);
    }

    #[test]
    fn json_form_is_a_bare_scalar() {
        let values = vec![Value::Null, Value::Integer(1), Value::Real(0.5), Value::from("x")];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[null,1,0.5,"x"]"#);
        let back: Vec<Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }
}
