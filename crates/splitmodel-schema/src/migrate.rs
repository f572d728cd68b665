//! Migrations and the runner that applies them.

use crate::editor::{AllowAll, Router, SchemaEditor, SqlExecutor};
use crate::operations::{Operation, OperationDef, load_operation};
use crate::state::ProjectState;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use splitmodel_core::{Dialect, Error, Result, SchemaErrorKind, Value, try_outcome, try_result};
use std::collections::HashMap;

/// A named, ordered list of operations.
#[derive(Debug)]
pub struct Migration {
    name: String,
    dependencies: Vec<String>,
    operations: Vec<Box<dyn Operation>>,
}

impl Migration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            operations: Vec::new(),
        }
    }

    /// Require `name` to be applied before this migration.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    #[must_use]
    pub fn operation(mut self, operation: impl Operation + 'static) -> Self {
        self.operations.push(Box::new(operation));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn operations(&self) -> &[Box<dyn Operation>] {
        &self.operations
    }

    /// Operations that survive squashing.
    pub fn squashed_operations(&self) -> impl Iterator<Item = &dyn Operation> {
        self.operations
            .iter()
            .map(|op| &**op)
            .filter(|op| !op.elidable())
    }

    /// Merge `migrations` into one, dropping elidable operations.
    pub fn squash<'m>(
        name: impl Into<String>,
        migrations: impl IntoIterator<Item = &'m Migration>,
    ) -> Result<Self> {
        let mut squashed = Self::new(name);
        let migrations: Vec<&Migration> = migrations.into_iter().collect();
        let names: Vec<&str> = migrations.iter().map(|m| m.name()).collect();
        for migration in &migrations {
            for dep in &migration.dependencies {
                if !names.contains(&dep.as_str()) && !squashed.dependencies.contains(dep) {
                    squashed.dependencies.push(dep.clone());
                }
            }
            for op in migration.squashed_operations() {
                squashed.operations.push(load_operation(op.deconstruct())?);
            }
        }
        Ok(squashed)
    }

    fn to_file(&self) -> MigrationFile {
        MigrationFile {
            name: self.name.clone(),
            dependencies: self.dependencies.clone(),
            operations: self.operations.iter().map(|op| op.deconstruct()).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MigrationFile {
    name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<String>,
    operations: Vec<OperationDef>,
}

/// Reads and writes migrations as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct MigrationWriter;

impl MigrationWriter {
    pub fn to_json(migration: &Migration) -> Result<String> {
        Ok(serde_json::to_string_pretty(&migration.to_file())?)
    }

    pub fn from_json(json: &str) -> Result<Migration> {
        let file: MigrationFile = serde_json::from_str(json)?;
        let operations = file
            .operations
            .into_iter()
            .map(load_operation)
            .collect::<Result<Vec<_>>>()?;
        Ok(Migration {
            name: file.name,
            dependencies: file.dependencies,
            operations,
        })
    }
}

/// Status of a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Migration has not been applied
    Pending,
    /// Migration has been applied
    Applied { at: i64 },
}

fn migration_error(message: impl Into<String>) -> Error {
    Error::schema(SchemaErrorKind::Migration, message)
}

fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// The statements of one operation and whether they need a transaction.
struct Step {
    atomic: bool,
    statements: Vec<String>,
}

/// Applies and unapplies an ordered migration history.
///
/// The runner replays operations against a [`ProjectState`] to know the
/// models before and after every operation, so operations never look at
/// the live schema.
pub struct MigrationRunner<'r> {
    migrations: Vec<Migration>,
    table_name: String,
    alias: String,
    router: &'r dyn Router,
}

impl std::fmt::Debug for MigrationRunner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("migrations", &self.migrations)
            .field("table_name", &self.table_name)
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}

impl MigrationRunner<'static> {
    /// Create a runner; every dependency must name an earlier migration.
    pub fn new(migrations: Vec<Migration>) -> Result<Self> {
        for (index, migration) in migrations.iter().enumerate() {
            if migrations[..index].iter().any(|m| m.name == migration.name) {
                return Err(migration_error(format!(
                    "duplicate migration name '{}'",
                    migration.name
                )));
            }
            for dep in &migration.dependencies {
                if !migrations[..index].iter().any(|m| &m.name == dep) {
                    return Err(migration_error(format!(
                        "migration '{}' depends on '{}', which does not precede it",
                        migration.name, dep
                    )));
                }
            }
        }
        Ok(Self {
            migrations,
            table_name: "_splitmodel_migrations".to_string(),
            alias: "default".to_string(),
            router: &AllowAll,
        })
    }
}

impl<'r> MigrationRunner<'r> {
    /// Set a custom migrations tracking table name.
    #[must_use]
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    /// Route operations for the database alias `alias`.
    pub fn with_router<'n>(self, alias: impl Into<String>, router: &'n dyn Router) -> MigrationRunner<'n> {
        MigrationRunner {
            migrations: self.migrations,
            table_name: self.table_name,
            alias: alias.into(),
            router,
        }
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.migrations
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| migration_error(format!("unknown migration '{}'", name)))
    }

    /// The migration state after applying every migration before `index`.
    pub fn state_before(&self, index: usize) -> Result<ProjectState> {
        let mut state = ProjectState::new();
        for migration in self.migrations.iter().take(index) {
            for op in &migration.operations {
                op.state_forwards(&mut state)?;
            }
        }
        Ok(state)
    }

    /// The migration state after applying `name` and everything before it.
    pub fn state_after(&self, name: &str) -> Result<ProjectState> {
        self.state_before(self.index_of(name)? + 1)
    }

    fn forward_steps(&self, index: usize, dialect: Dialect) -> Result<Vec<Step>> {
        let mut state = self.state_before(index)?;
        let mut steps = Vec::new();
        for op in &self.migrations[index].operations {
            let from = state.clone();
            op.state_forwards(&mut state)?;
            let mut editor = SchemaEditor::new(dialect, self.alias.clone(), self.router);
            op.database_forwards(&mut editor, &from, &state)?;
            steps.push(Step {
                atomic: op.atomic(),
                statements: editor.take_statements(),
            });
        }
        Ok(steps)
    }

    fn backward_steps(&self, index: usize, dialect: Dialect) -> Result<Vec<Step>> {
        let migration = &self.migrations[index];
        let mut states = vec![self.state_before(index)?];
        for op in &migration.operations {
            let mut next = states[states.len() - 1].clone();
            op.state_forwards(&mut next)?;
            states.push(next);
        }
        let mut steps = Vec::new();
        for (i, op) in migration.operations.iter().enumerate().rev() {
            if !op.reversible() {
                return Err(migration_error(format!(
                    "operation '{}' in migration '{}' is not reversible",
                    op.describe(),
                    migration.name
                )));
            }
            let mut editor = SchemaEditor::new(dialect, self.alias.clone(), self.router);
            op.database_backwards(&mut editor, &states[i + 1], &states[i])?;
            steps.push(Step {
                atomic: op.atomic(),
                statements: editor.take_statements(),
            });
        }
        Ok(steps)
    }

    /// The statements that apply `name`, without running them.
    pub fn sql_forwards(&self, name: &str, dialect: Dialect) -> Result<Vec<String>> {
        let steps = self.forward_steps(self.index_of(name)?, dialect)?;
        Ok(steps.into_iter().flat_map(|s| s.statements).collect())
    }

    /// The statements that unapply `name`, without running them.
    pub fn sql_backwards(&self, name: &str, dialect: Dialect) -> Result<Vec<String>> {
        let steps = self.backward_steps(self.index_of(name)?, dialect)?;
        Ok(steps.into_iter().flat_map(|s| s.statements).collect())
    }

    /// Ensure the migrations tracking table exists.
    pub async fn init(&self, cx: &Cx, db: &dyn SqlExecutor) -> Outcome<(), Error> {
        let dialect = db.dialect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} VARCHAR(255) NOT NULL PRIMARY KEY, {} BIGINT NOT NULL)",
            dialect.quote_ident(&self.table_name),
            dialect.quote_ident("name"),
            dialect.quote_ident("applied_at")
        );
        db.run(cx, &sql, &[]).await.map(|_| ())
    }

    /// Get the status of all migrations, in order.
    pub async fn status(
        &self,
        cx: &Cx,
        db: &dyn SqlExecutor,
    ) -> Outcome<Vec<(String, MigrationStatus)>, Error> {
        try_outcome!(self.init(cx, db).await);
        let dialect = db.dialect();
        let sql = format!(
            "SELECT {}, {} FROM {}",
            dialect.quote_ident("name"),
            dialect.quote_ident("applied_at"),
            dialect.quote_ident(&self.table_name)
        );
        let rows = try_outcome!(db.fetch(cx, &sql, &[]).await);
        let mut applied: HashMap<String, i64> = HashMap::new();
        for row in rows {
            let name = try_result!(row.get_named::<String>("name"));
            let at = try_result!(row.get_named::<i64>("applied_at"));
            applied.insert(name, at);
        }
        let status = self
            .migrations
            .iter()
            .map(|m| {
                let status = match applied.get(&m.name) {
                    Some(&at) => MigrationStatus::Applied { at },
                    None => MigrationStatus::Pending,
                };
                (m.name.clone(), status)
            })
            .collect();
        Outcome::Ok(status)
    }

    /// Names of the applied migrations, in migration order.
    pub async fn applied(&self, cx: &Cx, db: &dyn SqlExecutor) -> Outcome<Vec<String>, Error> {
        let status = try_outcome!(self.status(cx, db).await);
        Outcome::Ok(
            status
                .into_iter()
                .filter(|(_, s)| matches!(s, MigrationStatus::Applied { .. }))
                .map(|(name, _)| name)
                .collect(),
        )
    }

    /// Apply all pending migrations.
    pub async fn migrate(&self, cx: &Cx, db: &dyn SqlExecutor) -> Outcome<Vec<String>, Error> {
        let last = match self.migrations.last() {
            Some(m) => m.name.clone(),
            None => return Outcome::Ok(Vec::new()),
        };
        self.migrate_to(cx, db, &last).await
    }

    /// Bring the database to the state right after `target`.
    ///
    /// Pending migrations up to `target` are applied in order; applied
    /// migrations after it are unapplied in reverse order. Returns the
    /// names of the migrations that were applied or unapplied.
    pub async fn migrate_to(
        &self,
        cx: &Cx,
        db: &dyn SqlExecutor,
        target: &str,
    ) -> Outcome<Vec<String>, Error> {
        let target = try_result!(self.index_of(target));
        let status = try_outcome!(self.status(cx, db).await);
        let mut changed = Vec::new();

        for (index, (name, s)) in status.iter().enumerate().rev() {
            if index > target && matches!(s, MigrationStatus::Applied { .. }) {
                try_outcome!(self.unapply(cx, db, index).await);
                changed.push(name.clone());
            }
        }
        for (index, (name, s)) in status.iter().enumerate() {
            if index <= target && *s == MigrationStatus::Pending {
                try_outcome!(self.apply(cx, db, index).await);
                changed.push(name.clone());
            }
        }
        Outcome::Ok(changed)
    }

    /// Unapply the last applied migration.
    pub async fn rollback(&self, cx: &Cx, db: &dyn SqlExecutor) -> Outcome<Option<String>, Error> {
        let status = try_outcome!(self.status(cx, db).await);
        let Some(index) = status
            .iter()
            .rposition(|(_, s)| matches!(s, MigrationStatus::Applied { .. }))
        else {
            return Outcome::Ok(None);
        };
        try_outcome!(self.unapply(cx, db, index).await);
        Outcome::Ok(Some(status[index].0.clone()))
    }

    async fn apply(&self, cx: &Cx, db: &dyn SqlExecutor, index: usize) -> Outcome<(), Error> {
        let migration = &self.migrations[index];
        tracing::info!(migration = %migration.name, alias = %self.alias, "applying migration");
        let steps = try_result!(self.forward_steps(index, db.dialect()));
        for step in &steps {
            try_outcome!(run_step(cx, db, step).await);
        }
        let dialect = db.dialect();
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES ({}, {})",
            dialect.quote_ident(&self.table_name),
            dialect.quote_ident("name"),
            dialect.quote_ident("applied_at"),
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        let params = [Value::Text(migration.name.clone()), Value::BigInt(now_micros())];
        db.run(cx, &sql, &params).await.map(|_| ())
    }

    async fn unapply(&self, cx: &Cx, db: &dyn SqlExecutor, index: usize) -> Outcome<(), Error> {
        let migration = &self.migrations[index];
        tracing::info!(migration = %migration.name, alias = %self.alias, "unapplying migration");
        let steps = try_result!(self.backward_steps(index, db.dialect()));
        for step in &steps {
            try_outcome!(run_step(cx, db, step).await);
        }
        let dialect = db.dialect();
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            dialect.quote_ident(&self.table_name),
            dialect.quote_ident("name"),
            dialect.placeholder(1)
        );
        db.run(cx, &sql, &[Value::Text(migration.name.clone())])
            .await
            .map(|_| ())
    }
}

async fn run_statements(cx: &Cx, db: &dyn SqlExecutor, statements: &[String]) -> Outcome<(), Error> {
    for sql in statements {
        try_outcome!(db.run(cx, sql, &[]).await);
    }
    Outcome::Ok(())
}

async fn run_step(cx: &Cx, db: &dyn SqlExecutor, step: &Step) -> Outcome<(), Error> {
    if step.statements.is_empty() {
        return Outcome::Ok(());
    }
    if !step.atomic {
        return run_statements(cx, db, &step.statements).await;
    }
    try_outcome!(db.run(cx, "BEGIN", &[]).await);
    let outcome = run_statements(cx, db, &step.statements).await;
    if matches!(outcome, Outcome::Ok(())) {
        try_outcome!(db.run(cx, "COMMIT", &[]).await);
    } else if let Outcome::Err(e) = db.run(cx, "ROLLBACK", &[]).await {
        tracing::warn!(error = %e, "rollback failed");
    }
    outcome
}
