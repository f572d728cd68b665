//! Migration operations.
//!
//! - [`CreateModel`] adds a model and its table
//! - [`AddSharedRelation`] records a shared relation in the migration state;
//!   it has no database effect
//! - [`CopyDataToPartial`] copies the columns of a partial model out of the
//!   wide table it was split from, and back again when unapplied

use crate::editor::SchemaEditor;
use crate::state::{ModelDef, ProjectState};
use serde::{Deserialize, Serialize};
use splitmodel_core::{Error, ModelMeta, Registry, RelationDef, Result, SchemaErrorKind, SharedRelation};
use std::fmt;

/// One step of a migration.
pub trait Operation: fmt::Debug + Send + Sync {
    /// Human-readable summary.
    fn describe(&self) -> String;

    /// The serializable form of this operation.
    fn deconstruct(&self) -> OperationDef;

    /// Apply this operation to the migration state.
    fn state_forwards(&self, state: &mut ProjectState) -> Result<()>;

    /// Record the statements that apply this operation. `from` is the state
    /// before the operation and `to` the state after it.
    fn database_forwards(&self, editor: &mut SchemaEditor<'_>, from: &ProjectState, to: &ProjectState) -> Result<()>;

    /// Record the statements that undo this operation. `from` is the state
    /// after the operation and `to` the state before it.
    fn database_backwards(&self, editor: &mut SchemaEditor<'_>, from: &ProjectState, to: &ProjectState) -> Result<()>;

    /// Run in a transaction of its own.
    fn atomic(&self) -> bool {
        true
    }

    /// May be dropped when migrations are squashed.
    fn elidable(&self) -> bool {
        false
    }

    fn reversible(&self) -> bool {
        true
    }
}

fn is_true(value: &bool) -> bool {
    *value
}

fn default_true() -> bool {
    true
}

/// Serializable form of every operation, as stored in migration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OperationDef {
    CreateModel {
        model: ModelDef,
    },
    AddSharedRelation {
        model_name: String,
        name: String,
        relation: RelationDef,
    },
    CopyDataToPartial {
        full_model_name: String,
        part_model_name: String,
        #[serde(default = "default_true", skip_serializing_if = "is_true")]
        elidable: bool,
    },
}

/// Rebuild an operation from its serialized form.
pub fn load_operation(def: OperationDef) -> Result<Box<dyn Operation>> {
    Ok(match def {
        OperationDef::CreateModel { model } => Box::new(CreateModel::new(model.into_options()?)),
        OperationDef::AddSharedRelation {
            model_name,
            name,
            relation,
        } => {
            let relation = relation.into_relation(name)?;
            Box::new(AddSharedRelation::new(model_name, relation)?)
        }
        OperationDef::CopyDataToPartial {
            full_model_name,
            part_model_name,
            elidable,
        } => Box::new(CopyDataToPartial::new(full_model_name, part_model_name).with_elidable(elidable)),
    })
}

fn state_model<'a>(registry: &'a Registry, name: &str) -> Result<&'a ModelMeta> {
    registry.model(name).ok_or_else(|| {
        Error::schema(
            SchemaErrorKind::ModelNotFound,
            format!("model '{}' is not in the migration state", name),
        )
    })
}

/// Create a model and its table.
#[derive(Debug, Clone)]
pub struct CreateModel {
    options: splitmodel_core::ModelOptions,
}

impl CreateModel {
    pub fn new(options: splitmodel_core::ModelOptions) -> Self {
        Self { options }
    }
}

impl Operation for CreateModel {
    fn describe(&self) -> String {
        format!("Create model {}", self.options.name)
    }

    fn deconstruct(&self) -> OperationDef {
        OperationDef::CreateModel {
            model: ModelDef::from_options(&self.options),
        }
    }

    fn state_forwards(&self, state: &mut ProjectState) -> Result<()> {
        state.add_model(self.options.clone())
    }

    fn database_forwards(&self, editor: &mut SchemaEditor<'_>, _from: &ProjectState, to: &ProjectState) -> Result<()> {
        if self.options.proxy_for.is_some() || !editor.allow_migrate_model(&self.options.name) {
            return Ok(());
        }
        editor.create_model(&to.registry()?, &self.options.name)
    }

    fn database_backwards(&self, editor: &mut SchemaEditor<'_>, from: &ProjectState, _to: &ProjectState) -> Result<()> {
        if self.options.proxy_for.is_some() || !editor.allow_migrate_model(&self.options.name) {
            return Ok(());
        }
        editor.delete_model(&from.registry()?, &self.options.name)
    }
}

/// Add a shared relation to a model's migration state.
///
/// A shared relation stores nothing of its own, so the database is left
/// alone in both directions.
#[derive(Debug, Clone)]
pub struct AddSharedRelation {
    model_name: String,
    relation: SharedRelation,
}

impl AddSharedRelation {
    /// Fails when the relation asks for a database constraint, which cannot
    /// be expressed without a column of its own.
    pub fn new(model_name: impl Into<String>, relation: SharedRelation) -> Result<Self> {
        if relation.db_constraint() {
            return Err(Error::schema(
                SchemaErrorKind::Unsupported,
                format!(
                    "Constraints for shared relations are not implemented yet ('{}' requests db_constraint)",
                    relation.name()
                ),
            ));
        }
        Ok(Self {
            model_name: model_name.into(),
            relation,
        })
    }
}

impl Operation for AddSharedRelation {
    fn describe(&self) -> String {
        format!("Add shared relation {} to {}", self.relation.name(), self.model_name)
    }

    fn deconstruct(&self) -> OperationDef {
        OperationDef::AddSharedRelation {
            model_name: self.model_name.clone(),
            name: self.relation.name().to_string(),
            relation: self.relation.deconstruct(None, None),
        }
    }

    fn state_forwards(&self, state: &mut ProjectState) -> Result<()> {
        let model = state.model_mut(&self.model_name)?;
        if model.shared_relation(self.relation.name()).is_some() {
            return Err(Error::schema(
                SchemaErrorKind::Migration,
                format!("{} already has a relation named '{}'", self.model_name, self.relation.name()),
            ));
        }
        model.shared.push(self.relation.clone());
        Ok(())
    }

    fn database_forwards(&self, _editor: &mut SchemaEditor<'_>, _from: &ProjectState, _to: &ProjectState) -> Result<()> {
        Ok(())
    }

    fn database_backwards(&self, _editor: &mut SchemaEditor<'_>, _from: &ProjectState, _to: &ProjectState) -> Result<()> {
        Ok(())
    }
}

/// Copy the columns of a partial model from the wide table it was split
/// from.
///
/// Forwards, every wide row inserts one partial row keyed by the wide row's
/// key. Backwards, the wide rows are updated from the partial rows. Both
/// models must be in the migration state; the state itself is unchanged.
#[derive(Debug, Clone)]
pub struct CopyDataToPartial {
    full_model_name: String,
    part_model_name: String,
    elidable: bool,
}

impl CopyDataToPartial {
    pub fn new(full_model_name: impl Into<String>, part_model_name: impl Into<String>) -> Self {
        Self {
            full_model_name: full_model_name.into(),
            part_model_name: part_model_name.into(),
            elidable: true,
        }
    }

    #[must_use]
    pub fn with_elidable(mut self, elidable: bool) -> Self {
        self.elidable = elidable;
        self
    }

    /// Quoted non-key columns of the partial model.
    fn part_columns(editor: &SchemaEditor<'_>, part: &ModelMeta) -> Vec<String> {
        part.local_fields()
            .iter()
            .filter(|f| !f.primary_key)
            .map(|f| editor.quote_name(f.column_name()))
            .collect()
    }

    pub(crate) fn forward_sql(editor: &SchemaEditor<'_>, full: &ModelMeta, part: &ModelMeta) -> String {
        let mut targets = vec![editor.quote_name(part.pk().column_name())];
        let mut sources = vec![editor.quote_name(full.pk().column_name())];
        let columns = Self::part_columns(editor, part);
        targets.extend(columns.iter().cloned());
        sources.extend(columns);
        format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            editor.quote_name(part.table()),
            targets.join(", "),
            sources.join(", "),
            editor.quote_name(full.table())
        )
    }

    /// `None` when the partial model has nothing but its key.
    pub(crate) fn backward_sql(
        editor: &SchemaEditor<'_>,
        full: &ModelMeta,
        part: &ModelMeta,
    ) -> Result<Option<String>> {
        if !editor.dialect().supports_update_from() {
            return Err(Error::schema(
                SchemaErrorKind::Unsupported,
                format!("copying data back from a partial table is not supported on {:?}", editor.dialect()),
            ));
        }
        let columns = Self::part_columns(editor, part);
        if columns.is_empty() {
            return Ok(None);
        }
        let trg = editor.quote_name("trg");
        let src = editor.quote_name("src");
        let assignments: Vec<String> = columns
            .iter()
            .map(|column| format!("{column} = {src}.{column}"))
            .collect();
        Ok(Some(format!(
            "UPDATE {} AS {trg} SET {} FROM {} AS {src} WHERE {trg}.{} = {src}.{}",
            editor.quote_name(full.table()),
            assignments.join(", "),
            editor.quote_name(part.table()),
            editor.quote_name(full.pk().column_name()),
            editor.quote_name(part.pk().column_name())
        )))
    }
}

impl Operation for CopyDataToPartial {
    fn describe(&self) -> String {
        format!("Copy data from {} to {}", self.full_model_name, self.part_model_name)
    }

    fn deconstruct(&self) -> OperationDef {
        OperationDef::CopyDataToPartial {
            full_model_name: self.full_model_name.clone(),
            part_model_name: self.part_model_name.clone(),
            elidable: self.elidable,
        }
    }

    fn state_forwards(&self, _state: &mut ProjectState) -> Result<()> {
        Ok(())
    }

    fn database_forwards(&self, editor: &mut SchemaEditor<'_>, from: &ProjectState, _to: &ProjectState) -> Result<()> {
        let registry = from.registry()?;
        let full = state_model(&registry, &self.full_model_name)?;
        let part = state_model(&registry, &self.part_model_name)?;
        if editor.allow_migrate_model(part.name()) {
            let sql = Self::forward_sql(editor, full, part);
            editor.execute(sql);
        }
        Ok(())
    }

    fn database_backwards(&self, editor: &mut SchemaEditor<'_>, from: &ProjectState, _to: &ProjectState) -> Result<()> {
        let registry = from.registry()?;
        let full = state_model(&registry, &self.full_model_name)?;
        let part = state_model(&registry, &self.part_model_name)?;
        if editor.allow_migrate_model(full.name()) {
            if let Some(sql) = Self::backward_sql(editor, full, part)? {
                editor.execute(sql);
            }
        }
        Ok(())
    }

    fn elidable(&self) -> bool {
        self.elidable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::{AllowAll, Router};
    use splitmodel_core::{Dialect, FieldInfo, ModelOptions, OnDelete, SqlType};

    fn big_model() -> ModelOptions {
        ModelOptions::new("BigModel")
            .table("testmigs_bigmodel")
            .field(FieldInfo::auto("id"))
            .field(FieldInfo::new("a", SqlType::Boolean).default(true))
            .field(FieldInfo::new("b", SqlType::Boolean).nullable(true))
            .field(FieldInfo::new("c", SqlType::Integer).default(3))
            .field(FieldInfo::new("d", SqlType::VarChar(10)).default("hi"))
    }

    fn partial() -> ModelOptions {
        ModelOptions::new("Partial")
            .table("testmigs_partial")
            .field(FieldInfo::new("partial_id", SqlType::Integer).primary_key(true))
            .field(FieldInfo::new("c", SqlType::Integer).default(3))
            .field(FieldInfo::new("d", SqlType::VarChar(10)).default("hi"))
    }

    fn state() -> ProjectState {
        let mut state = ProjectState::new();
        state.add_model(big_model()).unwrap();
        state.add_model(partial()).unwrap();
        state
    }

    struct NoPartial;

    impl Router for NoPartial {
        fn allow_migrate(&self, _alias: &str, model: &str) -> bool {
            model != "Partial"
        }
    }

    #[test]
    fn copy_forwards_inserts_partial_rows() {
        let state = state();
        let op = CopyDataToPartial::new("BigModel", "Partial");
        let mut editor = SchemaEditor::new(Dialect::Sqlite, "default", &AllowAll);
        op.database_forwards(&mut editor, &state, &state).unwrap();
        assert_eq!(
            editor.statements(),
            ["INSERT INTO \"testmigs_partial\" (\"partial_id\", \"c\", \"d\") \
              SELECT \"id\", \"c\", \"d\" FROM \"testmigs_bigmodel\""]
        );
    }

    #[test]
    fn copy_backwards_updates_the_wide_table() {
        let state = state();
        let op = CopyDataToPartial::new("BigModel", "Partial");
        let mut editor = SchemaEditor::new(Dialect::Postgres, "default", &AllowAll);
        op.database_backwards(&mut editor, &state, &state).unwrap();
        assert_eq!(
            editor.statements(),
            ["UPDATE \"testmigs_bigmodel\" AS \"trg\" SET \"c\" = \"src\".\"c\", \"d\" = \"src\".\"d\" \
              FROM \"testmigs_partial\" AS \"src\" WHERE \"trg\".\"id\" = \"src\".\"partial_id\""]
        );
    }

    #[test]
    fn copy_backwards_is_unsupported_on_mysql() {
        let state = state();
        let op = CopyDataToPartial::new("BigModel", "Partial");
        let mut editor = SchemaEditor::new(Dialect::Mysql, "default", &AllowAll);
        assert!(matches!(
            op.database_backwards(&mut editor, &state, &state),
            Err(Error::Schema(e)) if e.kind == SchemaErrorKind::Unsupported
        ));
    }

    #[test]
    fn copy_respects_the_router_per_direction() {
        let state = state();
        let op = CopyDataToPartial::new("BigModel", "Partial");
        let mut editor = SchemaEditor::new(Dialect::Sqlite, "default", &NoPartial);
        op.database_forwards(&mut editor, &state, &state).unwrap();
        assert!(editor.statements().is_empty());
        op.database_backwards(&mut editor, &state, &state).unwrap();
        assert_eq!(editor.statements().len(), 1);
    }

    #[test]
    fn copy_needs_both_models() {
        let mut state = ProjectState::new();
        state.add_model(big_model()).unwrap();
        let op = CopyDataToPartial::new("BigModel", "Partial");
        let mut editor = SchemaEditor::new(Dialect::Sqlite, "default", &AllowAll);
        assert!(op.database_forwards(&mut editor, &state, &state).is_err());
    }

    #[test]
    fn copy_of_a_key_only_partial_inserts_keys_and_restores_nothing() {
        let mut state = ProjectState::new();
        state.add_model(big_model()).unwrap();
        state
            .add_model(
                ModelOptions::new("Bare")
                    .table("testmigs_bare")
                    .field(FieldInfo::new("bare_id", SqlType::Integer).primary_key(true)),
            )
            .unwrap();
        let op = CopyDataToPartial::new("BigModel", "Bare");

        let mut editor = SchemaEditor::new(Dialect::Postgres, "default", &AllowAll);
        op.database_forwards(&mut editor, &state, &state).unwrap();
        assert_eq!(
            editor.statements(),
            ["INSERT INTO \"testmigs_bare\" (\"bare_id\") SELECT \"id\" FROM \"testmigs_bigmodel\""]
        );

        let mut editor = SchemaEditor::new(Dialect::Postgres, "default", &AllowAll);
        op.database_backwards(&mut editor, &state, &state).unwrap();
        assert!(editor.statements().is_empty());
    }

    #[test]
    fn copy_deconstructs_without_default_elidable() {
        let op = CopyDataToPartial::new("BigModel", "Partial");
        assert!(op.elidable() && op.atomic());
        let json = serde_json::to_value(op.deconstruct()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "operation": "copy_data_to_partial",
                "full_model_name": "BigModel",
                "part_model_name": "Partial",
            })
        );
        let kept = CopyDataToPartial::new("BigModel", "Partial").with_elidable(false);
        let json = serde_json::to_value(kept.deconstruct()).unwrap();
        assert_eq!(json["elidable"], serde_json::json!(false));
        let loaded = load_operation(serde_json::from_value(json).unwrap()).unwrap();
        assert!(!loaded.elidable());
    }

    #[test]
    fn shared_relation_is_state_only() {
        let mut before = ProjectState::new();
        before.add_model(big_model()).unwrap();
        before.add_model(partial()).unwrap();
        let relation = SharedRelation::one_to_one("partial", "Partial", "id", OnDelete::Protect)
            .build()
            .unwrap();
        let op = AddSharedRelation::new("BigModel", relation).unwrap();

        let mut after = before.clone();
        op.state_forwards(&mut after).unwrap();
        assert!(after.model("BigModel").unwrap().shared_relation("partial").is_some());
        assert!(op.state_forwards(&mut after).is_err());

        let mut editor = SchemaEditor::new(Dialect::Sqlite, "default", &AllowAll);
        op.database_forwards(&mut editor, &before, &after).unwrap();
        op.database_backwards(&mut editor, &after, &before).unwrap();
        assert!(editor.statements().is_empty());
        assert_eq!(after.registry().unwrap().model("BigModel").unwrap().local_fields().len(), 5);
    }

    #[test]
    fn shared_relation_constraints_are_unsupported() {
        let relation = SharedRelation::one_to_one("partial", "Partial", "id", OnDelete::Protect)
            .db_constraint(true)
            .build()
            .unwrap();
        assert!(matches!(
            AddSharedRelation::new("BigModel", relation),
            Err(Error::Schema(e)) if e.kind == SchemaErrorKind::Unsupported
        ));
    }

    #[test]
    fn create_model_round_trips_through_its_definition() {
        let op = CreateModel::new(partial());
        let mut state = ProjectState::new();
        op.state_forwards(&mut state).unwrap();
        let mut editor = SchemaEditor::new(Dialect::Sqlite, "default", &AllowAll);
        op.database_forwards(&mut editor, &ProjectState::new(), &state).unwrap();
        assert_eq!(
            editor.statements(),
            ["CREATE TABLE \"testmigs_partial\" (\"partial_id\" INTEGER NOT NULL PRIMARY KEY, \
              \"c\" INTEGER NOT NULL DEFAULT 3, \"d\" VARCHAR(10) NOT NULL DEFAULT 'hi')"]
        );
        let loaded = load_operation(op.deconstruct()).unwrap();
        assert_eq!(loaded.deconstruct(), op.deconstruct());
    }
}
