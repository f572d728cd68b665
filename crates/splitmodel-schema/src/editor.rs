//! The schema editor and the executor seam migrations run through.

use asupersync::{Cx, Outcome};
use splitmodel_core::{Connection, Dialect, Error, Registry, Result, Row, Value};
use std::future::Future;
use std::pin::Pin;

use crate::ddl;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe access to a database for the migration runner.
///
/// Every [`Connection`] is an executor.
pub trait SqlExecutor: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn run<'a>(&'a self, cx: &'a Cx, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Outcome<u64, Error>>;

    fn fetch<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>>;
}

impl<C: Connection> SqlExecutor for C {
    fn dialect(&self) -> Dialect {
        Connection::dialect(self)
    }

    fn run<'a>(&'a self, cx: &'a Cx, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Outcome<u64, Error>> {
        Box::pin(self.execute(cx, sql, params))
    }

    fn fetch<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        Box::pin(self.query(cx, sql, params))
    }
}

/// Decides which database alias a model's migrations run on.
pub trait Router: Send + Sync {
    fn allow_migrate(&self, alias: &str, model: &str) -> bool;
}

/// Migrates every model everywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Router for AllowAll {
    fn allow_migrate(&self, _alias: &str, _model: &str) -> bool {
        true
    }
}

/// Builds the statements of one migration operation.
///
/// Statements are recorded in order; the migration runner executes them,
/// or hands them back untouched in collect-only mode.
pub struct SchemaEditor<'r> {
    dialect: Dialect,
    alias: String,
    router: &'r dyn Router,
    statements: Vec<String>,
}

impl std::fmt::Debug for SchemaEditor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaEditor")
            .field("dialect", &self.dialect)
            .field("alias", &self.alias)
            .field("statements", &self.statements)
            .finish_non_exhaustive()
    }
}

impl<'r> SchemaEditor<'r> {
    pub fn new(dialect: Dialect, alias: impl Into<String>, router: &'r dyn Router) -> Self {
        Self {
            dialect,
            alias: alias.into(),
            router,
            statements: Vec::new(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// The database alias this editor migrates.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn quote_name(&self, name: &str) -> String {
        self.dialect.quote_ident(name)
    }

    /// Does the router let `model` migrate on this editor's alias?
    pub fn allow_migrate_model(&self, model: &str) -> bool {
        self.router.allow_migrate(&self.alias, model)
    }

    pub fn execute(&mut self, sql: impl Into<String>) {
        let sql = sql.into();
        tracing::debug!(alias = %self.alias, sql = %sql, "schema statement");
        self.statements.push(sql);
    }

    pub fn create_model(&mut self, registry: &Registry, model: &str) -> Result<()> {
        for sql in ddl::create_model_sql(registry, model, self.dialect)? {
            self.execute(sql);
        }
        Ok(())
    }

    pub fn delete_model(&mut self, registry: &Registry, model: &str) -> Result<()> {
        let sql = ddl::delete_model_sql(registry, model, self.dialect)?;
        self.execute(sql);
        Ok(())
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn take_statements(&mut self) -> Vec<String> {
        std::mem::take(&mut self.statements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OnlyDefault;

    impl Router for OnlyDefault {
        fn allow_migrate(&self, alias: &str, _model: &str) -> bool {
            alias == "default"
        }
    }

    #[test]
    fn editor_consults_router_for_its_alias() {
        let router = OnlyDefault;
        assert!(SchemaEditor::new(Dialect::Sqlite, "default", &router).allow_migrate_model("Partial"));
        assert!(!SchemaEditor::new(Dialect::Sqlite, "other", &router).allow_migrate_model("Partial"));
        assert!(SchemaEditor::new(Dialect::Sqlite, "other", &AllowAll).allow_migrate_model("Partial"));
    }

    #[test]
    fn statements_are_recorded_in_order() {
        let mut editor = SchemaEditor::new(Dialect::Mysql, "default", &AllowAll);
        editor.execute(format!("DROP TABLE {}", editor.quote_name("a")));
        editor.execute("DROP TABLE b");
        assert_eq!(editor.statements(), ["DROP TABLE `a`", "DROP TABLE b"]);
        assert_eq!(editor.take_statements().len(), 2);
        assert!(editor.statements().is_empty());
    }
}
