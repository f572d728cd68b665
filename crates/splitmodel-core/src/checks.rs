//! Structural checks over registered models.
//!
//! [`Registry::check`] runs without a database and returns every finding
//! at once. Findings never stop anything by themselves; callers decide
//! whether errors should fail a build.

use crate::registry::{ModelMeta, Registry, RelationRef};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Warning,
    Error,
}

/// The model or field a diagnostic is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckedObject {
    Model(String),
    Field { model: String, field: String },
}

impl fmt::Display for CheckedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckedObject::Model(model) => write!(f, "{}", model),
            CheckedObject::Field { model, field } => write!(f, "{}.{}", model, field),
        }
    }
}

/// One finding of the check pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: Level,
    /// Stable code, e.g. `splitmodel.E002`
    pub id: &'static str,
    pub msg: String,
    pub hint: Option<String>,
    pub obj: CheckedObject,
}

impl Diagnostic {
    fn error(id: &'static str, obj: CheckedObject, msg: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            id,
            msg: msg.into(),
            hint: None,
            obj,
        }
    }

    fn warning(id: &'static str, obj: CheckedObject, msg: impl Into<String>) -> Self {
        Self {
            level: Level::Warning,
            ..Self::error(id, obj, msg)
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == Level::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ({}) {}", self.obj, self.id, self.msg)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n\tHINT: {}", hint)?;
        }
        Ok(())
    }
}

fn field_obj(model: &ModelMeta, field: &str) -> CheckedObject {
    CheckedObject::Field {
        model: model.name().to_string(),
        field: field.to_string(),
    }
}

impl Registry {
    /// Run every structural check over every registered model.
    pub fn check(&self) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        for model in self.models() {
            self.check_relations(model, &mut out);
            if model.is_split() {
                self.check_parent_links(model, &mut out);
            }
            self.check_field_name_clashes(model, &mut out);
            check_column_name_clashes(model, &mut out);
        }
        tracing::debug!(findings = out.len(), "model checks finished");
        out
    }

    fn check_relations(&self, model: &ModelMeta, out: &mut Vec<Diagnostic>) {
        for relation in model.relations() {
            if self.model(relation.target_model()).is_none() {
                out.push(Diagnostic::error(
                    "fields.E300",
                    field_obj(model, relation.name()),
                    format!(
                        "Field defines a relation with model '{}', which is either not installed, or is abstract.",
                        relation.target_model()
                    ),
                ));
            }
        }

        for shared in model.shared() {
            let obj = field_obj(model, shared.name());
            if self.field_owner(model.name(), shared.attname()).is_none() {
                out.push(Diagnostic::error(
                    "splitmodel.E001",
                    obj.clone(),
                    format!(
                        "The shared relation from_field references the nonexistent field '{}'.",
                        shared.attname()
                    ),
                ));
            }
            if shared.on_delete().mutates_referencing_value() {
                out.push(
                    Diagnostic::error(
                        "splitmodel.E002",
                        obj.clone(),
                        "A shared reference field specifies an on_delete rule which would make it change automatically.",
                    )
                    .hint("Change the on_delete rule to preserve the value or delete the referencing object"),
                );
            }
            if shared.unique_requested() {
                out.push(
                    Diagnostic::warning(
                        "fields.W342",
                        obj,
                        "Setting unique=True on a to-one relation has the same effect as using a one-to-one relation.",
                    )
                    .hint("A unique to-one relation is usually better declared as one-to-one."),
                );
            }
        }
    }

    fn check_parent_links(&self, model: &ModelMeta, out: &mut Vec<Diagnostic>) {
        for link in self.parents(model.name()) {
            if let RelationRef::Column(fk) = link.link {
                out.push(
                    Diagnostic::error(
                        "splitmodel.E003",
                        field_obj(model, &fk.name),
                        format!(
                            "Field '{}' is a link to a parent model (using multi-table inheritance) but is not a shared relation. This is not supported in split models.",
                            fk.name
                        ),
                    )
                    .hint("Define a shared parent link for the parent"),
                );
            }
        }
    }

    /// Same-named fields across parents (E005), and local fields hiding
    /// inherited ones (E006).
    ///
    /// A shared relation only claims its own name: its attribute belongs to
    /// the concrete field it shares.
    fn check_field_name_clashes(&self, model: &ModelMeta, out: &mut Vec<Diagnostic>) {
        let mut used: HashMap<String, (String, String)> = HashMap::new();
        for parent in self.parent_list(model.name()) {
            for (name, field) in claimed_names(parent) {
                if let Some((clash_field, clash_model)) = used.get(&name) {
                    if clash_model != parent.name() {
                        out.push(Diagnostic::error(
                            "models.E005",
                            CheckedObject::Model(model.name().to_string()),
                            format!(
                                "The field '{}' from parent model '{}' clashes with the field '{}' from parent model '{}'.",
                                field,
                                parent.name(),
                                clash_field,
                                clash_model
                            ),
                        ));
                        continue;
                    }
                }
                used.insert(name, (field, parent.name().to_string()));
            }
        }

        for (name, field) in claimed_names(model) {
            if let Some((clash_field, clash_model)) = used.get(&name) {
                out.push(Diagnostic::error(
                    "models.E006",
                    field_obj(model, &field),
                    format!(
                        "The field '{}' clashes with the field '{}' from model '{}'.",
                        field, clash_field, clash_model
                    ),
                ));
            }
        }
    }
}

/// Names a model's own fields occupy, paired with the declaring field's name.
fn claimed_names(model: &ModelMeta) -> Vec<(String, String)> {
    let mut names: Vec<(String, String)> = Vec::new();
    for field in &model.options().fields {
        names.push((field.name.clone(), field.name.clone()));
    }
    for fk in model.foreign_keys() {
        names.push((fk.name.clone(), fk.name.clone()));
        names.push((fk.attname(), fk.name.clone()));
    }
    for shared in model.shared() {
        names.push((shared.name().to_string(), shared.name().to_string()));
    }
    names
}

fn check_column_name_clashes(model: &ModelMeta, out: &mut Vec<Diagnostic>) {
    let mut used: HashMap<&str, &str> = HashMap::new();
    for field in model.local_fields() {
        let column = field.column_name();
        if used.contains_key(column) {
            out.push(
                Diagnostic::error(
                    "models.E007",
                    CheckedObject::Model(model.name().to_string()),
                    format!(
                        "Field '{}' has column name '{}' that is used by another field.",
                        field.name, column
                    ),
                )
                .hint("Specify a 'db_column' for the field."),
            );
        } else {
            used.insert(column, &field.name);
        }
    }
}
