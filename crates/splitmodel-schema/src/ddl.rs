//! DDL generation for registered models.
//!
//! Only concrete fields produce columns. A shared relation reads an
//! attribute the model already stores, so it adds neither a column nor a
//! constraint.

use splitmodel_core::{Dialect, Error, FieldInfo, Registry, RelationRef, Result, SchemaErrorKind, Value};

/// Render a value as an SQL literal for a `DEFAULT` clause.
pub fn sql_literal(value: &Value, dialect: Dialect) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => match dialect {
            Dialect::Postgres => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Dialect::Sqlite | Dialect::Mysql => if *b { "1" } else { "0" }.to_string(),
        },
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) | Value::Timestamp(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Json(j) => format!("'{}'", j.to_string().replace('\'', "''")),
        Value::Bytes(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            format!("X'{}'", hex)
        }
    }
}

fn column_def(field: &FieldInfo, dialect: Dialect) -> String {
    let name = dialect.quote_ident(field.column_name());
    if field.primary_key && field.auto_increment {
        return match dialect {
            Dialect::Sqlite => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", name),
            Dialect::Postgres if field.sql_type == splitmodel_core::SqlType::BigInt => {
                format!("{} BIGSERIAL PRIMARY KEY", name)
            }
            Dialect::Postgres => format!("{} SERIAL PRIMARY KEY", name),
            Dialect::Mysql => format!(
                "{} {} NOT NULL AUTO_INCREMENT PRIMARY KEY",
                name,
                field.sql_type.sql_name(dialect)
            ),
        };
    }
    let mut def = format!("{} {}", name, field.sql_type.sql_name(dialect));
    if field.primary_key {
        def.push_str(" NOT NULL PRIMARY KEY");
        return def;
    }
    if !field.nullable {
        def.push_str(" NOT NULL");
    }
    if field.unique {
        def.push_str(" UNIQUE");
    }
    if let Some(default) = field.default.as_ref().filter(|v| !v.is_null()) {
        def.push_str(" DEFAULT ");
        def.push_str(&sql_literal(default, dialect));
    }
    def
}

/// `CREATE TABLE` for `model`, followed by its `CREATE INDEX` statements.
pub fn create_model_sql(registry: &Registry, model: &str, dialect: Dialect) -> Result<Vec<String>> {
    let meta = registry.model(model).ok_or_else(|| {
        Error::schema(SchemaErrorKind::ModelNotFound, format!("model '{}' is not registered", model))
    })?;
    let table = dialect.quote_ident(meta.table());
    let mut parts: Vec<String> = meta
        .local_fields()
        .iter()
        .map(|f| column_def(f, dialect))
        .collect();

    for fk in meta.foreign_keys().iter().filter(|fk| fk.db_constraint) {
        let Some(target) = registry.model(&fk.target) else {
            continue;
        };
        let Some(target_field) = registry.target_field(RelationRef::Column(fk)) else {
            continue;
        };
        let Some(column) = meta.local_field(&fk.attname()) else {
            continue;
        };
        parts.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            dialect.quote_ident(column.column_name()),
            dialect.quote_ident(target.table()),
            dialect.quote_ident(target_field.column_name())
        ));
    }

    let mut statements = vec![format!("CREATE TABLE {} ({})", table, parts.join(", "))];
    for field in meta
        .local_fields()
        .iter()
        .filter(|f| f.db_index && !f.unique && !f.primary_key)
    {
        statements.push(format!(
            "CREATE INDEX {} ON {} ({})",
            dialect.quote_ident(&format!("{}_{}_idx", meta.table(), field.column_name())),
            table,
            dialect.quote_ident(field.column_name())
        ));
    }
    Ok(statements)
}

/// `DROP TABLE` for `model`.
pub fn delete_model_sql(registry: &Registry, model: &str, dialect: Dialect) -> Result<String> {
    let meta = registry.model(model).ok_or_else(|| {
        Error::schema(SchemaErrorKind::ModelNotFound, format!("model '{}' is not registered", model))
    })?;
    Ok(format!("DROP TABLE {}", dialect.quote_ident(meta.table())))
}
