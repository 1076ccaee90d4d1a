//! Custom SQL functions registered on every project connection.
use biostata_model::{FunctionId, Value};
use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;

pub const CATEGORY_GROUP: &str = "category_group";
pub const SAFE_INT: &str = "bs_safe_int";

pub(crate) fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(r) => Value::Real(r),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        // Blobs never come out of staging tables; treat stray ones as missing.
        ValueRef::Blob(_) => Value::Null,
    }
}

pub(crate) fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(r) if r.is_finite() => SqlValue::Real(*r),
        Value::Real(_) => SqlValue::Null,
        Value::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn args(ctx: &Context<'_>) -> Vec<Value> {
    (0..ctx.len()).map(|i| from_value_ref(ctx.get_raw(i))).collect()
}

/// Running state of `category_group`.
#[derive(Debug, Clone, PartialEq)]
enum Agreement {
    Empty,
    Agreed(Value),
    Conflict,
}

/// Aggregate returning the common value of a group, or NULL when members disagree.
struct CategoryGroup;

impl Aggregate<Agreement, SqlValue> for CategoryGroup {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<Agreement> {
        Ok(Agreement::Empty)
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut Agreement) -> rusqlite::Result<()> {
        let value = from_value_ref(ctx.get_raw(0));
        *acc = match std::mem::replace(acc, Agreement::Conflict) {
            Agreement::Empty => Agreement::Agreed(value),
            Agreement::Agreed(current) if current == value => Agreement::Agreed(current),
            _ => Agreement::Conflict,
        };
        Ok(())
    }

    fn finalize(&self, _ctx: &mut Context<'_>, acc: Option<Agreement>) -> rusqlite::Result<SqlValue> {
        Ok(match acc {
            Some(Agreement::Agreed(value)) => to_sql_value(&value),
            _ => SqlValue::Null,
        })
    }
}

/// Integer cast that yields NULL for anything non-numeric instead of `0`.
fn safe_int(value: &Value) -> Value {
    match value {
        Value::Integer(i) => Value::Integer(*i),
        Value::Real(r) if r.is_finite() => Value::Integer(r.round() as i64),
        Value::Text(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Value::Integer(i)
            } else {
                match s.parse::<f64>() {
                    Ok(r) if r.is_finite() => Value::Integer(r.round() as i64),
                    _ => Value::Null,
                }
            }
        }
        _ => Value::Null,
    }
}

/// Register `category_group`, `bs_safe_int` and every computed-column function
/// on `conn`.
pub fn register(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_aggregate_function(CATEGORY_GROUP, 1, flags, CategoryGroup)?;
    conn.create_scalar_function(SAFE_INT, 1, flags, |ctx| {
        Ok(to_sql_value(&safe_int(&from_value_ref(ctx.get_raw(0)))))
    })?;

    for function in FunctionId::ALL {
        conn.create_scalar_function(&function.sql_name(), -1, flags, move |ctx| {
            Ok(to_sql_value(&function.evaluate(&args(ctx))))
        })?;
    }
    log::debug!("registered {} custom SQL functions", FunctionId::ALL.len() + 2);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        register(&conn).unwrap();
        conn
    }

    fn scalar(conn: &Connection, sql: &str) -> Value {
        conn.query_row(sql, [], |r| Ok(from_value_ref(r.get_ref(0)?)))
            .unwrap()
    }

    #[test]
    fn category_group_returns_common_value_or_null() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE t (g INTEGER, v INTEGER);
             INSERT INTO t VALUES (1, 5), (1, 5), (2, 5), (2, 6), (3, NULL), (3, 7);",
        )
        .unwrap();
        let mut stmt = conn
            .prepare("SELECT category_group(v) FROM t GROUP BY g ORDER BY g")
            .unwrap();
        let got: Vec<Value> = stmt
            .query_map([], |r| Ok(from_value_ref(r.get_ref(0)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(got, vec![Value::Integer(5), Value::Null, Value::Null]);
    }

    #[test]
    fn safe_int_maps_garbage_to_null() {
        let conn = conn();
        assert_eq!(scalar(&conn, "SELECT bs_safe_int('12')"), Value::Integer(12));
        assert_eq!(scalar(&conn, "SELECT bs_safe_int(' 2.6 ')"), Value::Integer(3));
        assert_eq!(scalar(&conn, "SELECT bs_safe_int('abc')"), Value::Null);
        assert_eq!(scalar(&conn, "SELECT bs_safe_int(NULL)"), Value::Null);
    }

    #[test]
    fn registry_functions_are_callable() {
        let conn = conn();
        assert_eq!(scalar(&conn, "SELECT bs_add(1, 2.5)"), Value::Real(3.5));
        assert_eq!(scalar(&conn, "SELECT bs_divide(1, 0)"), Value::Null);
        assert_eq!(scalar(&conn, "SELECT bs_concat('a', 'b', '-')"), Value::Text("a-b".into()));
    }
}
