//! Migration state: the models as they exist at one point of a migration
//! history.

use serde::{Deserialize, Serialize};
use splitmodel_core::{
    Error, FieldInfo, ForeignKey, ModelOptions, Registry, RelationDef, Result, SchemaErrorKind,
};

/// Ordered model declarations at one point of a migration history.
#[derive(Debug, Clone, Default)]
pub struct ProjectState {
    models: Vec<ModelOptions>,
}

impl ProjectState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn models(&self) -> &[ModelOptions] {
        &self.models
    }

    pub fn model(&self, name: &str) -> Option<&ModelOptions> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn model_mut(&mut self, name: &str) -> Result<&mut ModelOptions> {
        self.models
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| model_not_found(name))
    }

    pub fn add_model(&mut self, options: ModelOptions) -> Result<()> {
        if self.model(&options.name).is_some() {
            return Err(Error::schema(
                SchemaErrorKind::Migration,
                format!("model '{}' already exists in the migration state", options.name),
            ));
        }
        self.models.push(options);
        Ok(())
    }

    pub fn remove_model(&mut self, name: &str) -> Result<ModelOptions> {
        let index = self
            .models
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| model_not_found(name))?;
        Ok(self.models.remove(index))
    }

    /// Resolve the state's declarations into a registry.
    pub fn registry(&self) -> Result<Registry> {
        Registry::builder().models(self.models.iter().cloned()).build()
    }
}

fn model_not_found(name: &str) -> Error {
    Error::schema(
        SchemaErrorKind::ModelNotFound,
        format!("model '{}' is not in the migration state", name),
    )
}

/// A named shared relation in a [`ModelDef`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedDef {
    pub name: String,
    #[serde(flatten)]
    pub relation: RelationDef,
}

/// The serialized form of a model declaration, as written into migration
/// files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    pub name: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared: Vec<SharedDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_for: Option<String>,
    #[serde(default)]
    pub split: bool,
}

impl ModelDef {
    pub fn from_options(options: &ModelOptions) -> Self {
        let owner_pk = options.pk().map(|f| f.name.as_str());
        Self {
            name: options.name.clone(),
            table: options.table.clone(),
            fields: options.fields.clone(),
            // registration adds these; writing them would duplicate them on load
            foreign_keys: options
                .foreign_keys
                .iter()
                .filter(|fk| !fk.auto_created)
                .cloned()
                .collect(),
            shared: options
                .shared
                .iter()
                .map(|r| SharedDef {
                    name: r.name().to_string(),
                    relation: r.deconstruct(owner_pk, None),
                })
                .collect(),
            parents: options.parents.clone(),
            proxy_for: options.proxy_for.clone(),
            split: options.split,
        }
    }

    pub fn into_options(self) -> Result<ModelOptions> {
        let mut options = match (self.proxy_for, self.split) {
            (Some(concrete), _) => ModelOptions::proxy(self.name, concrete),
            (None, true) => ModelOptions::split(self.name),
            (None, false) => ModelOptions::new(self.name),
        }
        .table(self.table);
        for parent in self.parents {
            options = options.parent(parent);
        }
        for field in self.fields {
            options = options.field(field);
        }
        for fk in self.foreign_keys {
            options = options.foreign_key(fk);
        }
        for shared in self.shared {
            options = options.shared(shared.relation.into_relation(shared.name)?);
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitmodel_core::{OnDelete, SharedRelation, SqlType};

    fn partial() -> ModelOptions {
        ModelOptions::new("Partial")
            .table("testmigs_partial")
            .field(FieldInfo::new("partial_id", SqlType::Integer).primary_key(true))
            .field(FieldInfo::new("c", SqlType::Integer).default(3))
    }

    #[test]
    fn models_are_added_once() {
        let mut state = ProjectState::new();
        state.add_model(partial()).unwrap();
        assert!(state.add_model(partial()).is_err());
        assert!(state.registry().unwrap().model("Partial").is_some());
        state.remove_model("Partial").unwrap();
        assert!(matches!(
            state.model_mut("Partial"),
            Err(Error::Schema(e)) if e.kind == SchemaErrorKind::ModelNotFound
        ));
    }

    #[test]
    fn model_definitions_survive_json() {
        let options = ModelOptions::split("BigModel")
            .table("testmigs_bigmodel")
            .parent("Partial")
            .field(FieldInfo::auto("id"))
            .shared(
                SharedRelation::parent_link("partial_ptr", "Partial", OnDelete::Protect)
                    .build()
                    .unwrap(),
            )
            .field(FieldInfo::new("a", SqlType::Boolean).default(true));
        let def = ModelDef::from_options(&options);
        let json = serde_json::to_string(&def).unwrap();
        let back: ModelDef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);

        let rebuilt = back.into_options().unwrap();
        assert_eq!(rebuilt.parents, vec!["Partial".to_string()]);
        assert!(rebuilt.split);
        let link = rebuilt.shared_relation("partial_ptr").unwrap();
        assert!(link.is_parent_link());
        assert_eq!(link.on_delete(), OnDelete::Protect);
    }
}
