//! Shared-attribute relations.
//!
//! A [`SharedRelation`] is a to-one link whose value lives in an attribute
//! the owning model already has. It adds no column. Several relations may
//! read the same attribute, which is how a split record reuses its primary
//! key as the key of every linked unit.
//!
//! One concrete type covers every variant. What differs between "foreign
//! key", "one-to-one" and "parent link" is carried in
//! [`RelationCapabilities`].

use crate::error::{Error, Result};
use crate::field::OnDelete;
use crate::identifiers::{is_valid_model_reference, model_name_of};
use crate::options::ModelOptions;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Marker for a relation pointing back at its own model.
pub const RECURSIVE_TARGET: &str = "self";

/// How many target rows one owner row relates to, seen from the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Many owners may point at one target (reverse side is a collection).
    ToOne,
    /// At most one owner per target (reverse side is a single record).
    OneToOne,
}

/// How writes through the relation's accessor are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Only idempotent assignments are accepted; see [`SharedRelation::guard_write`].
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationCapabilities {
    pub cardinality: Cardinality,
    pub parent_link: bool,
    pub on_delete: OnDelete,
    pub write_policy: WritePolicy,
}

/// A relation target as given at declaration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    /// A model reference string, possibly `self`, resolved at registration.
    Name(String),
    /// A declared model, whose primary key becomes the default `to_field`.
    Model { name: String, pk: Option<String> },
}

impl From<&str> for TargetRef {
    fn from(name: &str) -> Self {
        TargetRef::Name(name.to_string())
    }
}

impl From<String> for TargetRef {
    fn from(name: String) -> Self {
        TargetRef::Name(name)
    }
}

impl From<&ModelOptions> for TargetRef {
    fn from(model: &ModelOptions) -> Self {
        TargetRef::Model {
            name: model.name.clone(),
            pk: model.pk().map(|f| f.name.clone()),
        }
    }
}

/// A to-one relation stored in an existing attribute of its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedRelation {
    name: String,
    target: String,
    from_field: Option<String>,
    to_field: Option<String>,
    caps: RelationCapabilities,
    related_name: Option<String>,
    related_query_name: Option<String>,
    nullable: bool,
    unique_requested: bool,
    db_constraint: bool,
    shorthand: bool,
}

impl SharedRelation {
    /// Start declaring a many-to-one shared relation.
    pub fn builder(
        name: impl Into<String>,
        to: impl Into<TargetRef>,
        from_field: impl Into<String>,
        on_delete: OnDelete,
    ) -> SharedRelationBuilder {
        SharedRelationBuilder::new(name.into(), to.into(), Some(from_field.into()), on_delete)
    }

    /// Start declaring a one-to-one shared relation.
    pub fn one_to_one(
        name: impl Into<String>,
        to: impl Into<TargetRef>,
        from_field: impl Into<String>,
        on_delete: OnDelete,
    ) -> SharedRelationBuilder {
        let mut builder = Self::builder(name, to, from_field, on_delete);
        builder.cardinality = Cardinality::OneToOne;
        builder
    }

    /// Start declaring a parent link that shares the owner's primary key.
    ///
    /// The shared attribute defaults to the owner's primary key and is filled
    /// in when the owner is registered.
    pub fn parent_link(
        name: impl Into<String>,
        to: impl Into<TargetRef>,
        on_delete: OnDelete,
    ) -> SharedRelationBuilder {
        let mut builder = SharedRelationBuilder::new(name.into(), to.into(), None, on_delete);
        builder.cardinality = Cardinality::OneToOne;
        builder.parent_link = true;
        builder.shorthand = true;
        builder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target model reference as declared (or resolved, for `self`).
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Target model name without an app label.
    pub fn target_model(&self) -> &str {
        model_name_of(&self.target)
    }

    /// Name of the owner attribute that holds the shared value.
    ///
    /// Empty only for a parent-link shorthand that has not been registered yet.
    pub fn attname(&self) -> &str {
        self.from_field.as_deref().unwrap_or("")
    }

    /// Explicit target attribute, if not the target's primary key.
    pub fn to_field(&self) -> Option<&str> {
        self.to_field.as_deref()
    }

    pub fn capabilities(&self) -> RelationCapabilities {
        self.caps
    }

    pub fn on_delete(&self) -> OnDelete {
        self.caps.on_delete
    }

    pub fn is_parent_link(&self) -> bool {
        self.caps.parent_link
    }

    pub fn is_one_to_one(&self) -> bool {
        self.caps.cardinality == Cardinality::OneToOne
    }

    /// Uniqueness is a consequence of cardinality, or an explicit request.
    pub fn unique(&self) -> bool {
        self.is_one_to_one() || self.unique_requested
    }

    /// `unique` was asked for on a to-one relation.
    pub fn unique_requested(&self) -> bool {
        self.unique_requested && !self.is_one_to_one()
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn related_name(&self) -> Option<&str> {
        self.related_name.as_deref()
    }

    pub fn related_query_name(&self) -> Option<&str> {
        self.related_query_name.as_deref()
    }

    pub fn db_constraint(&self) -> bool {
        self.db_constraint
    }

    /// Fill in what registration knows: the owner for `self` targets and the
    /// owner's primary key for the parent-link shorthand.
    pub fn resolve(&mut self, owner: &str, owner_pk: &str) {
        if self.target == RECURSIVE_TARGET {
            self.target = owner.to_string();
        }
        if self.from_field.is_none() {
            self.from_field = Some(owner_pk.to_string());
        }
    }

    /// Decide whether assigning `assigned` through this relation is allowed.
    ///
    /// `current` is the shared attribute's value on the record; `assigned`
    /// is the target's identifying value, or `None` when clearing. Only
    /// idempotent writes pass: clearing an already-unset attribute, or
    /// assigning a target whose identity already equals the shared value.
    pub fn guard_write(
        &self,
        owner: &str,
        current: Option<&Value>,
        assigned: Option<&Value>,
        assigned_repr: &str,
    ) -> Result<()> {
        let current = current.filter(|v| !v.is_null());
        let accepted = match (current, assigned.filter(|v| !v.is_null())) {
            (None, None) => true,
            (Some(cur), Some(new)) => cur.same_key(new),
            _ => false,
        };
        match (accepted, self.caps.write_policy) {
            (true, WritePolicy::ReadOnly) => Ok(()),
            (false, WritePolicy::ReadOnly) => Err(Error::usage(
                format!("{}.{}", owner, self.name),
                format!(
                    "Cannot assign \"{}\": \"{}.{}\" is a shared, read-only relation",
                    assigned_repr, owner, self.name
                ),
            )),
        }
    }

    /// Produce the minimal declaration needed to rebuild this relation.
    ///
    /// `owner_pk` and `target_pk` let defaults be omitted: the shared
    /// attribute of a parent link when it is the owner's key, and `to_field`
    /// when it names the target's key.
    pub fn deconstruct(&self, owner_pk: Option<&str>, target_pk: Option<&str>) -> RelationDef {
        let kind = if self.shorthand {
            RelationKind::ParentLink
        } else if self.is_one_to_one() {
            RelationKind::OneToOne
        } else {
            RelationKind::ForeignKey
        };
        let from_field = match kind {
            RelationKind::ParentLink if self.from_field.as_deref() == owner_pk => None,
            _ => self.from_field.clone(),
        };
        let to_field = match (&self.to_field, target_pk) {
            (Some(to), Some(pk)) if to == pk => None,
            (to, _) => to.clone(),
        };
        RelationDef {
            kind,
            to: self.target.clone(),
            from_field,
            on_delete: self.caps.on_delete,
            parent_link: self.caps.parent_link && kind != RelationKind::ParentLink,
            to_field,
            related_name: self.related_name.clone(),
            related_query_name: self.related_query_name.clone(),
            nullable: self.nullable,
            unique: self.unique_requested(),
            db_constraint: self.db_constraint,
        }
    }
}

/// Builder returned by the [`SharedRelation`] constructors.
#[derive(Debug, Clone)]
pub struct SharedRelationBuilder {
    name: String,
    to: TargetRef,
    from_field: Option<String>,
    on_delete: OnDelete,
    cardinality: Cardinality,
    parent_link: bool,
    shorthand: bool,
    to_field: Option<String>,
    related_name: Option<String>,
    related_query_name: Option<String>,
    nullable: bool,
    unique: bool,
    editable: Option<bool>,
    db_index: Option<bool>,
    db_constraint: Option<bool>,
    default: Option<Value>,
}

impl SharedRelationBuilder {
    fn new(name: String, to: TargetRef, from_field: Option<String>, on_delete: OnDelete) -> Self {
        Self {
            name,
            to,
            from_field,
            on_delete,
            cardinality: Cardinality::ToOne,
            parent_link: false,
            shorthand: false,
            to_field: None,
            related_name: None,
            related_query_name: None,
            nullable: false,
            unique: false,
            editable: None,
            db_index: None,
            db_constraint: None,
            default: None,
        }
    }

    pub fn to_field(mut self, name: impl Into<String>) -> Self {
        self.to_field = Some(name.into());
        self
    }

    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        self.related_name = Some(name.into());
        self
    }

    pub fn related_query_name(mut self, name: impl Into<String>) -> Self {
        self.related_query_name = Some(name.into());
        self
    }

    /// Mark this relation as the inheritance identity link to its target.
    pub fn parent_link(mut self, value: bool) -> Self {
        self.parent_link = value;
        self
    }

    /// The linked row may be absent.
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    pub fn editable(mut self, value: bool) -> Self {
        self.editable = Some(value);
        self
    }

    pub fn db_index(mut self, value: bool) -> Self {
        self.db_index = Some(value);
        self
    }

    pub fn db_constraint(mut self, value: bool) -> Self {
        self.db_constraint = Some(value);
        self
    }

    /// Shared relations take their value from the shared attribute, so
    /// `build` rejects any default given here.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Validate the declaration and produce the relation.
    pub fn build(self) -> Result<SharedRelation> {
        let subject = self.name.clone();
        if self.default.is_some() {
            return Err(Error::usage(subject, "Shared relation cannot have a default"));
        }
        let (target, model_pk) = match self.to {
            TargetRef::Name(name) => {
                if !is_valid_model_reference(&name) {
                    return Err(Error::usage(
                        subject,
                        format!(
                            "SharedRelation({:?}) is invalid. First parameter must be either a model, a model name, or the string '{}'",
                            name, RECURSIVE_TARGET
                        ),
                    ));
                }
                (name, None)
            }
            TargetRef::Model { name, pk } => (name, pk),
        };
        match self.editable {
            Some(true) => {
                return Err(Error::usage(subject, "Shared relation cannot be editable"));
            }
            Some(false) => {
                tracing::warn!(relation = %subject, "editable(false) is redundant on a shared relation");
            }
            None => {}
        }
        match self.db_index {
            Some(true) => {
                let column = self.from_field.as_deref().unwrap_or("id");
                return Err(Error::usage(
                    subject,
                    format!(
                        "Shared relation cannot create an index; add indexing on the concrete field ({}) instead",
                        column
                    ),
                ));
            }
            Some(false) => {
                tracing::warn!(relation = %subject, "db_index(false) is redundant on a shared relation");
            }
            None => {}
        }
        if self.db_constraint == Some(true) {
            tracing::warn!(relation = %subject, "constraints on shared relations are not implemented yet");
        }
        Ok(SharedRelation {
            name: self.name,
            target,
            from_field: self.from_field,
            to_field: self.to_field.or(model_pk),
            caps: RelationCapabilities {
                cardinality: self.cardinality,
                parent_link: self.parent_link,
                on_delete: self.on_delete,
                write_policy: WritePolicy::ReadOnly,
            },
            related_name: self.related_name,
            related_query_name: self.related_query_name,
            nullable: self.nullable,
            unique_requested: self.unique,
            db_constraint: self.db_constraint.unwrap_or(false),
            shorthand: self.shorthand,
        })
    }
}

/// Declaration kind recorded in a [`RelationDef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    ForeignKey,
    OneToOne,
    ParentLink,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The serialized, minimal form of a [`SharedRelation`], as written into
/// migration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub kind: RelationKind,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_field: Option<String>,
    pub on_delete: OnDelete,
    #[serde(default, skip_serializing_if = "is_false")]
    pub parent_link: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_query_name: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub db_constraint: bool,
}

impl RelationDef {
    /// Rebuild the relation this definition was produced from.
    pub fn into_relation(self, name: impl Into<String>) -> Result<SharedRelation> {
        let name = name.into();
        let mut builder = match (self.kind, self.from_field) {
            (RelationKind::ParentLink, from_field) => {
                let mut b = SharedRelation::parent_link(name, self.to, self.on_delete);
                b.from_field = from_field;
                b
            }
            (RelationKind::OneToOne, Some(from)) => {
                SharedRelation::one_to_one(name, self.to, from, self.on_delete)
            }
            (RelationKind::ForeignKey, Some(from)) => {
                SharedRelation::builder(name, self.to, from, self.on_delete)
            }
            (_, None) => {
                return Err(Error::usage(name, "relation definition is missing from_field"));
            }
        };
        let parent_link = builder.parent_link || self.parent_link;
        builder = builder
            .parent_link(parent_link)
            .nullable(self.nullable)
            .unique(self.unique);
        builder.to_field = self.to_field;
        builder.related_name = self.related_name;
        builder.related_query_name = self.related_query_name;
        if self.db_constraint {
            builder.db_constraint = Some(true);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldInfo;

    fn parent_a() -> ModelOptions {
        ModelOptions::new("ParentA").field(FieldInfo::auto("aid"))
    }

    fn usage_message(result: Result<SharedRelation>) -> String {
        match result {
            Err(Error::Usage(e)) => e.message,
            other => panic!("expected usage error, got {other:?}"),
        }
    }

    #[test]
    fn default_is_rejected() {
        let msg = usage_message(
            SharedRelation::builder("b", "ParentB", "id", OnDelete::DoNothing)
                .default(1_i64)
                .build(),
        );
        assert!(msg.contains("cannot have a default"));
    }

    #[test]
    fn invalid_target_is_rejected() {
        let msg = usage_message(
            SharedRelation::builder("b", "not a model", "id", OnDelete::DoNothing).build(),
        );
        assert!(msg.contains("is invalid"));
        assert!(msg.contains("'self'"));
    }

    #[test]
    fn editable_and_index_are_rejected() {
        let msg = usage_message(
            SharedRelation::builder("b", "ParentB", "id", OnDelete::DoNothing)
                .editable(true)
                .build(),
        );
        assert!(msg.contains("cannot be editable"));

        let msg = usage_message(
            SharedRelation::builder("b", "ParentB", "id", OnDelete::DoNothing)
                .db_index(true)
                .build(),
        );
        assert!(msg.contains("add indexing on the concrete field (id)"));
    }

    #[test]
    fn redundant_options_are_accepted() {
        let rel = SharedRelation::builder("b", "ParentB", "id", OnDelete::DoNothing)
            .editable(false)
            .db_index(false)
            .db_constraint(true)
            .build()
            .unwrap();
        assert!(rel.db_constraint());
    }

    #[test]
    fn model_target_presets_to_field() {
        let rel = SharedRelation::builder("a", &parent_a(), "id", OnDelete::Protect)
            .build()
            .unwrap();
        assert_eq!(rel.to_field(), Some("aid"));
        assert_eq!(rel.target_model(), "ParentA");
    }

    #[test]
    fn uniqueness_follows_cardinality() {
        let fk = SharedRelation::builder("a", "ParentA", "id", OnDelete::Protect)
            .build()
            .unwrap();
        assert!(!fk.unique());
        let one = SharedRelation::one_to_one("a", "ParentA", "id", OnDelete::Protect)
            .build()
            .unwrap();
        assert!(one.unique());
        assert!(!one.unique_requested());
    }

    #[test]
    fn parent_link_shorthand_resolves_owner_pk() {
        let mut rel = SharedRelation::parent_link("parenta_ptr", "ParentA", OnDelete::DoNothing)
            .build()
            .unwrap();
        assert!(rel.is_parent_link());
        assert!(rel.is_one_to_one());
        assert_eq!(rel.attname(), "");
        rel.resolve("Child", "id");
        assert_eq!(rel.attname(), "id");

        let mut recursive = SharedRelation::builder("me", "self", "id", OnDelete::DoNothing)
            .build()
            .unwrap();
        recursive.resolve("Child", "id");
        assert_eq!(recursive.target(), "Child");
    }

    #[test]
    fn guard_accepts_only_idempotent_writes() {
        let rel = SharedRelation::one_to_one("b", "ParentB", "id", OnDelete::DoNothing)
            .build()
            .unwrap();
        assert!(rel.guard_write("Child", None, None, "None").is_ok());
        assert!(rel.guard_write("Child", Some(&Value::Null), None, "None").is_ok());
        assert!(
            rel.guard_write("Child", Some(&Value::BigInt(3)), Some(&Value::Int(3)), "<ParentB 3>")
                .is_ok()
        );

        let err = rel
            .guard_write("Child", Some(&Value::BigInt(3)), Some(&Value::BigInt(4)), "<ParentB 4>")
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("<ParentB 4>"));
        assert!(text.contains("Child.b"));

        assert!(rel.guard_write("Child", Some(&Value::BigInt(3)), None, "None").is_err());
        assert!(rel.guard_write("Child", None, Some(&Value::BigInt(3)), "<ParentB 3>").is_err());
    }

    #[test]
    fn deconstruct_omits_defaults() {
        let mut rel = SharedRelation::parent_link("parenta_ptr", "ParentA", OnDelete::DoNothing)
            .build()
            .unwrap();
        rel.resolve("Child", "id");
        let def = rel.deconstruct(Some("id"), Some("aid"));
        assert_eq!(def.kind, RelationKind::ParentLink);
        assert_eq!(def.from_field, None);
        assert!(!def.parent_link);
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "parent_link", "to": "ParentA", "on_delete": "DO_NOTHING"})
        );

        let explicit = SharedRelation::one_to_one("b", "ParentB", "id", OnDelete::Protect)
            .to_field("bid")
            .parent_link(true)
            .build()
            .unwrap();
        let def = explicit.deconstruct(Some("id"), Some("bid"));
        assert_eq!(def.kind, RelationKind::OneToOne);
        assert_eq!(def.from_field.as_deref(), Some("id"));
        assert_eq!(def.to_field, None);
        assert!(def.parent_link);
        assert!(!def.unique);
    }

    #[test]
    fn round_trip_preserves_configuration() {
        let original = SharedRelation::builder("partial_ptr", "Partial", "id", OnDelete::Protect)
            .to_field("code")
            .related_name("bigs")
            .nullable(true)
            .build()
            .unwrap();
        let json = serde_json::to_string(&original.deconstruct(Some("id"), Some("partial_id"))).unwrap();
        let def: RelationDef = serde_json::from_str(&json).unwrap();
        let rebuilt = def.into_relation("partial_ptr").unwrap();
        assert_eq!(rebuilt, original);
    }
}
