//! SQL types, dialects and backend capabilities.

use crate::error::{Error, Result, TypeError};
use crate::identifiers::{quote_ident, quote_ident_mysql};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// SQL dialect spoken by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Dialect {
    /// PostgreSQL (`$1` placeholders)
    #[default]
    Postgres,
    /// SQLite (`?1` placeholders)
    Sqlite,
    /// MySQL (`?` placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    pub fn quote_ident(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => quote_ident(name),
            Dialect::Mysql => quote_ident_mysql(name),
        }
    }

    /// Does `UPDATE t SET .. FROM other WHERE ..` work on this dialect?
    pub const fn supports_update_from(self) -> bool {
        // SQLite gained UPDATE .. FROM in 3.33, which the bundled library exceeds.
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }

    /// Can `INSERT .. RETURNING` report columns on this dialect?
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }
}

/// Optional features a connection reports to the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendFeatures {
    /// A single-row INSERT can report its generated key.
    pub can_return_columns_from_insert: bool,
    /// A multi-row INSERT can report every generated key, in row order.
    pub can_return_rows_from_bulk_insert: bool,
}

impl BackendFeatures {
    /// Features implied by a dialect alone.
    pub const fn for_dialect(dialect: Dialect) -> Self {
        let returning = dialect.supports_returning();
        Self {
            can_return_columns_from_insert: true,
            can_return_rows_from_bulk_insert: returning,
        }
    }
}

/// SQL data types supported by model fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    Integer,
    BigInt,
    Boolean,
    Double,
    VarChar(u32),
    Text,
    Blob,
    Timestamp,
    Json,
}

impl SqlType {
    /// Get the column type name used in DDL for `dialect`.
    pub fn sql_name(&self, dialect: Dialect) -> String {
        match (self, dialect) {
            (SqlType::Integer, _) => "INTEGER".to_string(),
            (SqlType::BigInt, _) => "BIGINT".to_string(),
            (SqlType::Boolean, Dialect::Mysql) => "TINYINT(1)".to_string(),
            (SqlType::Boolean, _) => "BOOLEAN".to_string(),
            (SqlType::Double, Dialect::Sqlite) => "REAL".to_string(),
            (SqlType::Double, _) => "DOUBLE PRECISION".to_string(),
            (SqlType::VarChar(len), _) => format!("VARCHAR({})", len),
            (SqlType::Text, _) => "TEXT".to_string(),
            (SqlType::Blob, Dialect::Postgres) => "BYTEA".to_string(),
            (SqlType::Blob, _) => "BLOB".to_string(),
            (SqlType::Timestamp, Dialect::Sqlite) => "INTEGER".to_string(),
            (SqlType::Timestamp, _) => "TIMESTAMP".to_string(),
            (SqlType::Json, Dialect::Postgres) => "JSONB".to_string(),
            (SqlType::Json, _) => "TEXT".to_string(),
        }
    }

    /// Is this an integer type usable as an auto-increment key?
    pub const fn is_integer(&self) -> bool {
        matches!(self, SqlType::Integer | SqlType::BigInt)
    }

    /// Normalize a value read from the database into this type's canonical form.
    ///
    /// Backends with loose typing hand back booleans and timestamps as plain
    /// integers and JSON as text; this puts them back.
    pub fn from_db(&self, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let converted = match (self, value) {
            (SqlType::Integer | SqlType::BigInt, Value::Int(v)) => Value::BigInt(i64::from(v)),
            (SqlType::Integer | SqlType::BigInt, v @ Value::BigInt(_)) => v,
            (SqlType::Boolean, v) => match v.as_bool() {
                Some(b) => Value::Bool(b),
                None => return Err(mismatch("BOOLEAN", &v)),
            },
            (SqlType::Double, v) => match v.as_f64() {
                Some(f) => Value::Double(f),
                None => return Err(mismatch("DOUBLE", &v)),
            },
            (SqlType::VarChar(_) | SqlType::Text, v @ Value::Text(_)) => v,
            (SqlType::Blob, v @ Value::Bytes(_)) => v,
            (SqlType::Timestamp, Value::BigInt(v) | Value::Timestamp(v)) => Value::Timestamp(v),
            (SqlType::Timestamp, Value::Int(v)) => Value::Timestamp(i64::from(v)),
            (SqlType::Json, v @ Value::Json(_)) => v,
            (SqlType::Json, Value::Text(s)) => {
                Value::Json(serde_json::from_str(&s).map_err(|e| Error::Serde(e.to_string()))?)
            }
            (_, v) => return Err(mismatch(self.type_label(), &v)),
        };
        Ok(converted)
    }

    /// Prepare a value for binding as a statement parameter.
    pub fn to_db(&self, value: &Value) -> Value {
        match (self, value) {
            (SqlType::Json, Value::Json(j)) => Value::Text(j.to_string()),
            (_, v) => v.clone(),
        }
    }

    const fn type_label(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Double => "DOUBLE",
            SqlType::VarChar(_) => "VARCHAR",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Json => "JSON",
        }
    }
}

fn mismatch(expected: &'static str, value: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: value.type_name().to_string(),
        column: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_per_dialect() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?2");
        assert_eq!(Dialect::Mysql.placeholder(2), "?");
    }

    #[test]
    fn quoting_per_dialect() {
        assert_eq!(Dialect::Sqlite.quote_ident("t"), "\"t\"");
        assert_eq!(Dialect::Mysql.quote_ident("t"), "`t`");
        assert!(!Dialect::Mysql.supports_update_from());
    }

    #[test]
    fn from_db_restores_booleans_and_json() {
        assert_eq!(SqlType::Boolean.from_db(Value::BigInt(1)).unwrap(), Value::Bool(true));
        assert_eq!(SqlType::Integer.from_db(Value::Int(4)).unwrap(), Value::BigInt(4));
        assert_eq!(
            SqlType::Json.from_db(Value::Text("{\"a\":1}".into())).unwrap(),
            Value::Json(serde_json::json!({"a": 1}))
        );
        assert_eq!(SqlType::Text.from_db(Value::Null).unwrap(), Value::Null);
        assert!(SqlType::Integer.from_db(Value::Text("x".into())).is_err());
    }

    #[test]
    fn ddl_names() {
        assert_eq!(SqlType::VarChar(10).sql_name(Dialect::Sqlite), "VARCHAR(10)");
        assert_eq!(SqlType::Blob.sql_name(Dialect::Postgres), "BYTEA");
        assert_eq!(SqlType::Boolean.sql_name(Dialect::Mysql), "TINYINT(1)");
    }
}
