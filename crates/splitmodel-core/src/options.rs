//! Per-model schema descriptions.
//!
//! A [`ModelOptions`] value is what a model declaration produces: its table,
//! concrete fields, column-backed foreign keys, shared relations and the
//! ordered list of models it inherits from. The [`Registry`](crate::Registry)
//! resolves these declarations against each other.

use crate::field::{FieldInfo, ForeignKey};
use crate::relation::SharedRelation;

/// Declaration of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOptions {
    pub name: String,
    pub table: String,
    pub fields: Vec<FieldInfo>,
    pub foreign_keys: Vec<ForeignKey>,
    pub shared: Vec<SharedRelation>,
    /// Inherited models, in declaration order.
    pub parents: Vec<String>,
    /// Set for proxy models: the model whose tables this one reads and writes.
    pub proxy_for: Option<String>,
    /// Split model: loads linked units lazily and writes its own row first.
    pub split: bool,
}

impl ModelOptions {
    /// Declare a model; the table defaults to the lowercased name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.to_lowercase(),
            name,
            fields: Vec::new(),
            foreign_keys: Vec::new(),
            shared: Vec::new(),
            parents: Vec::new(),
            proxy_for: None,
            split: false,
        }
    }

    /// Declare a split model.
    pub fn split(name: impl Into<String>) -> Self {
        let mut options = Self::new(name);
        options.split = true;
        options
    }

    /// Declare a proxy for `concrete`.
    pub fn proxy(name: impl Into<String>, concrete: impl Into<String>) -> Self {
        let mut options = Self::new(name);
        options.proxy_for = Some(concrete.into());
        options
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn shared(mut self, relation: SharedRelation) -> Self {
        self.shared.push(relation);
        self
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parents.push(parent.into());
        self
    }

    /// The declared primary key field, if any.
    pub fn pk(&self) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.primary_key)
    }

    /// Look up a locally declared concrete field by attribute name.
    pub fn local_field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a locally declared shared relation by name.
    pub fn shared_relation(&self, name: &str) -> Option<&SharedRelation> {
        self.shared.iter().find(|r| r.name() == name)
    }

    /// Look up a locally declared foreign key by relation name.
    pub fn foreign_key_named(&self, name: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.name == name)
    }
}
