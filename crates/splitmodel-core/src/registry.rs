//! The model registry.
//!
//! Registration turns a set of [`ModelOptions`] into resolved metadata:
//! `self` targets are bound, parent-link shorthands learn their owner's key,
//! parents without a declared link get a column-backed one, and every model
//! gets exactly one primary key. All lookups return `Option`; a missing
//! model or field is an ordinary answer, not a failure.

use crate::error::{Error, Result};
use crate::field::{FieldInfo, ForeignKey, OnDelete};
use crate::identifiers::model_name_of;
use crate::options::ModelOptions;
use crate::relation::{RECURSIVE_TARGET, RelationDef, SharedRelation};
use std::collections::{HashMap, HashSet};

/// Resolved metadata for one concrete model.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    options: ModelOptions,
    local_fields: Vec<FieldInfo>,
    pk_index: usize,
}

impl ModelMeta {
    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn table(&self) -> &str {
        &self.options.table
    }

    pub fn is_split(&self) -> bool {
        self.options.split
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    /// Concrete fields stored in this model's own table, foreign key columns included.
    pub fn local_fields(&self) -> &[FieldInfo] {
        &self.local_fields
    }

    pub fn local_field(&self, attname: &str) -> Option<&FieldInfo> {
        self.local_fields.iter().find(|f| f.name == attname)
    }

    pub fn pk(&self) -> &FieldInfo {
        &self.local_fields[self.pk_index]
    }

    pub fn shared(&self) -> &[SharedRelation] {
        &self.options.shared
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.options.foreign_keys
    }

    /// Every relation declared on this model, shared and column-backed.
    pub fn relations(&self) -> impl Iterator<Item = RelationRef<'_>> {
        self.options
            .foreign_keys
            .iter()
            .map(RelationRef::Column)
            .chain(self.options.shared.iter().map(RelationRef::Shared))
    }
}

/// A relation declared on some model, of either storage kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelationRef<'a> {
    Shared(&'a SharedRelation),
    Column(&'a ForeignKey),
}

impl<'a> RelationRef<'a> {
    pub fn name(self) -> &'a str {
        match self {
            RelationRef::Shared(r) => r.name(),
            RelationRef::Column(fk) => &fk.name,
        }
    }

    pub fn target_model(self) -> &'a str {
        match self {
            RelationRef::Shared(r) => r.target_model(),
            RelationRef::Column(fk) => model_name_of(&fk.target),
        }
    }

    /// Owner attribute holding the referenced value.
    pub fn local_attname(self) -> String {
        match self {
            RelationRef::Shared(r) => r.attname().to_string(),
            RelationRef::Column(fk) => fk.attname(),
        }
    }

    pub fn to_field(self) -> Option<&'a str> {
        match self {
            RelationRef::Shared(r) => r.to_field(),
            RelationRef::Column(fk) => fk.to_field.as_deref(),
        }
    }

    pub fn on_delete(self) -> OnDelete {
        match self {
            RelationRef::Shared(r) => r.on_delete(),
            RelationRef::Column(fk) => fk.on_delete,
        }
    }

    pub fn nullable(self) -> bool {
        match self {
            RelationRef::Shared(r) => r.nullable(),
            RelationRef::Column(fk) => fk.nullable,
        }
    }

    pub fn is_parent_link(self) -> bool {
        match self {
            RelationRef::Shared(r) => r.is_parent_link(),
            RelationRef::Column(fk) => fk.parent_link,
        }
    }

    pub fn is_one_to_one(self) -> bool {
        match self {
            RelationRef::Shared(r) => r.is_one_to_one(),
            RelationRef::Column(fk) => fk.one_to_one,
        }
    }

    pub fn is_shared(self) -> bool {
        matches!(self, RelationRef::Shared(_))
    }
}

/// A direct parent of a model and the relation linking to it.
#[derive(Debug, Clone, Copy)]
pub struct ParentLink<'a> {
    pub parent: &'a ModelMeta,
    pub link: RelationRef<'a>,
}

/// What a field name resolves to on a model.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind<'a> {
    Concrete(&'a FieldInfo),
    Relation(RelationRef<'a>),
}

/// Result of [`Registry::get_field`].
#[derive(Debug, Clone, Copy)]
pub struct FieldRef<'a> {
    /// The model (the queried one or an ancestor) declaring the field.
    pub owner: &'a ModelMeta,
    pub kind: FieldKind<'a>,
}

/// Collects model declarations before resolving them together.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    models: Vec<ModelOptions>,
}

impl RegistryBuilder {
    pub fn model(mut self, options: ModelOptions) -> Self {
        self.models.push(options);
        self
    }

    pub fn models(mut self, options: impl IntoIterator<Item = ModelOptions>) -> Self {
        self.models.extend(options);
        self
    }

    /// Resolve every declaration.
    pub fn build(self) -> Result<Registry> {
        let mut seen = HashSet::new();
        for options in &self.models {
            if !seen.insert(options.name.clone()) {
                return Err(Error::usage(&options.name, "model is registered twice"));
            }
        }

        let (proxies, concrete): (Vec<_>, Vec<_>) = self
            .models
            .into_iter()
            .partition(|m| m.proxy_for.is_some());
        let concrete_names: HashSet<String> = concrete.iter().map(|m| m.name.clone()).collect();

        let mut proxy_map = HashMap::new();
        for proxy in &proxies {
            let mut target = proxy.proxy_for.clone().unwrap_or_default();
            let mut hops = 0;
            while let Some(next) = proxies
                .iter()
                .find(|p| p.name == target)
                .and_then(|p| p.proxy_for.clone())
            {
                target = next;
                hops += 1;
                if hops > proxies.len() {
                    return Err(Error::usage(&proxy.name, "proxy chain is cyclic"));
                }
            }
            if !concrete_names.contains(&target) {
                return Err(Error::usage(
                    &proxy.name,
                    format!("proxy model refers to unknown model '{}'", target),
                ));
            }
            if !proxy.fields.is_empty() || !proxy.foreign_keys.is_empty() {
                return Err(Error::usage(&proxy.name, "proxy model cannot declare fields"));
            }
            proxy_map.insert(proxy.name.clone(), target);
        }

        let mut metas = Vec::with_capacity(concrete.len());
        for options in concrete {
            metas.push(resolve_model(options, &concrete_names)?);
        }
        let index = metas
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name().to_string(), i))
            .collect();

        tracing::debug!(models = metas.len(), proxies = proxy_map.len(), "registry built");
        Ok(Registry {
            models: metas,
            index,
            proxies: proxy_map,
        })
    }
}

fn resolve_model(mut options: ModelOptions, known: &HashSet<String>) -> Result<ModelMeta> {
    let name = options.name.clone();
    for parent in &options.parents {
        if !known.contains(parent) {
            return Err(Error::usage(&name, format!("unknown parent model '{}'", parent)));
        }
    }
    let declared_pks = options.fields.iter().filter(|f| f.primary_key).count()
        + options.foreign_keys.iter().filter(|fk| fk.primary_key).count();
    if declared_pks > 1 {
        return Err(Error::usage(&name, "model declares more than one primary key"));
    }

    for fk in &mut options.foreign_keys {
        if fk.target == RECURSIVE_TARGET {
            fk.target.clone_from(&name);
        }
    }

    let parents = options.parents.clone();
    let mut promote_ptr = declared_pks == 0 && !parents.is_empty() && !options.split;
    for parent in &parents {
        let linked = options
            .shared
            .iter()
            .any(|r| r.is_parent_link() && r.target_model() == parent)
            || options
                .foreign_keys
                .iter()
                .any(|fk| fk.parent_link && model_name_of(&fk.target) == parent);
        if linked {
            continue;
        }
        let mut ptr = ForeignKey::one_to_one(
            format!("{}_ptr", parent.to_lowercase()),
            parent.clone(),
            OnDelete::Cascade,
        )
        .parent_link(true);
        ptr.auto_created = true;
        ptr.primary_key = promote_ptr;
        promote_ptr = false;
        options.foreign_keys.push(ptr);
    }

    let has_pk = options.fields.iter().any(|f| f.primary_key)
        || options.foreign_keys.iter().any(|fk| fk.primary_key);
    if !has_pk {
        if options.local_field("id").is_some() {
            return Err(Error::usage(
                &name,
                "field 'id' is not a primary key but no primary key is declared",
            ));
        }
        options.fields.insert(0, FieldInfo::big_auto("id"));
    }

    let mut local_fields = options.fields.clone();
    local_fields.extend(options.foreign_keys.iter().map(ForeignKey::backing_field));
    let pk_index = local_fields
        .iter()
        .position(|f| f.primary_key)
        .ok_or_else(|| Error::usage(&name, "model has no primary key"))?;
    let pk_name = local_fields[pk_index].name.clone();

    for relation in &mut options.shared {
        relation.resolve(&name, &pk_name);
    }

    Ok(ModelMeta {
        options,
        local_fields,
        pk_index,
    })
}

/// Resolved metadata for every registered model.
#[derive(Debug, Clone)]
pub struct Registry {
    models: Vec<ModelMeta>,
    index: HashMap<String, usize>,
    proxies: HashMap<String, String>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up a model; proxies resolve to the model they stand for.
    pub fn model(&self, name: &str) -> Option<&ModelMeta> {
        let name = model_name_of(name);
        let concrete = self.proxies.get(name).map_or(name, String::as_str);
        self.index.get(concrete).map(|&i| &self.models[i])
    }

    pub fn is_proxy(&self, name: &str) -> bool {
        self.proxies.contains_key(model_name_of(name))
    }

    /// Every concrete model, in registration order.
    pub fn models(&self) -> impl Iterator<Item = &ModelMeta> {
        self.models.iter()
    }

    pub fn pk(&self, model: &str) -> Option<&FieldInfo> {
        self.model(model).map(ModelMeta::pk)
    }

    /// Direct parents in declaration order, each with its link.
    pub fn parents(&self, model: &str) -> Vec<ParentLink<'_>> {
        let Some(meta) = self.model(model) else {
            return Vec::new();
        };
        meta.options
            .parents
            .iter()
            .filter_map(|parent_name| {
                let parent = self.model(parent_name)?;
                let link = meta
                    .relations()
                    .find(|r| r.is_parent_link() && r.target_model() == parent.name())?;
                Some(ParentLink { parent, link })
            })
            .collect()
    }

    /// All ancestors, nearest first, each listed once.
    pub fn parent_list(&self, model: &str) -> Vec<&ModelMeta> {
        let mut out: Vec<&ModelMeta> = Vec::new();
        let mut stack: Vec<&ModelMeta> = self
            .parents(model)
            .into_iter()
            .rev()
            .map(|p| p.parent)
            .collect();
        while let Some(next) = stack.pop() {
            if out.iter().any(|m| m.name() == next.name()) {
                continue;
            }
            out.push(next);
            stack.extend(self.parents(next.name()).into_iter().rev().map(|p| p.parent));
        }
        out
    }

    /// The model itself followed by all its ancestors.
    pub fn units(&self, model: &str) -> Vec<&ModelMeta> {
        let mut units: Vec<&ModelMeta> = self.model(model).into_iter().collect();
        units.extend(self.parent_list(model));
        units
    }

    /// Every concrete field of a model across all of its units, with its owner.
    pub fn concrete_fields(&self, model: &str) -> Vec<(&ModelMeta, &FieldInfo)> {
        self.units(model)
            .into_iter()
            .flat_map(|unit| unit.local_fields.iter().map(move |f| (unit, f)))
            .collect()
    }

    /// The unit storing attribute `attname` of `model`.
    pub fn field_owner(&self, model: &str, attname: &str) -> Option<&ModelMeta> {
        self.units(model)
            .into_iter()
            .find(|unit| unit.local_field(attname).is_some())
    }

    /// Resolve a field name on a model or any of its ancestors.
    ///
    /// Concrete fields match by attribute name (a foreign key's `_id`
    /// column included) and relations by name. `pk` names the primary key.
    /// A shared relation is never found through its shared attribute's name:
    /// that name belongs to the concrete field.
    pub fn get_field(&self, model: &str, name: &str) -> Option<FieldRef<'_>> {
        let meta = self.model(model)?;
        if name == "pk" {
            return Some(FieldRef {
                owner: meta,
                kind: FieldKind::Concrete(meta.pk()),
            });
        }
        self.units(model).into_iter().find_map(|owner| {
            if let Some(field) = owner.local_field(name) {
                return Some(FieldRef {
                    owner,
                    kind: FieldKind::Concrete(field),
                });
            }
            owner
                .relations()
                .find(|r| r.name() == name)
                .map(|r| FieldRef {
                    owner,
                    kind: FieldKind::Relation(r),
                })
        })
    }

    /// Resolve a relation name on a model or its ancestors.
    pub fn relation(&self, model: &str, name: &str) -> Option<(&ModelMeta, RelationRef<'_>)> {
        match self.get_field(model, name)? {
            FieldRef {
                owner,
                kind: FieldKind::Relation(r),
            } => Some((owner, r)),
            FieldRef { .. } => None,
        }
    }

    /// The target attribute a relation's value is compared with.
    pub fn target_field(&self, relation: RelationRef<'_>) -> Option<&FieldInfo> {
        let target = self.model(relation.target_model())?;
        match relation.to_field() {
            Some(name) => self
                .concrete_fields(target.name())
                .into_iter()
                .find(|(_, f)| f.name == name)
                .map(|(_, f)| f),
            None => Some(target.pk()),
        }
    }

    /// Relations on any model that point at `target`.
    pub fn reverse_relations(&self, target: &str) -> Vec<(&ModelMeta, RelationRef<'_>)> {
        let Some(target) = self.model(target) else {
            return Vec::new();
        };
        self.models
            .iter()
            .flat_map(|owner| owner.relations().map(move |r| (owner, r)))
            .filter(|(_, r)| r.target_model() == target.name())
            .collect()
    }

    /// Deconstruct a shared relation of `model` for a migration file.
    pub fn deconstruct(&self, model: &str, relation: &str) -> Option<RelationDef> {
        let meta = self.model(model)?;
        let shared = meta.options.shared_relation(relation)?;
        let target_pk = self
            .model(shared.target_model())
            .map(|t| t.pk().name.as_str());
        Some(shared.deconstruct(Some(meta.pk().name.as_str()), target_pk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SqlType;

    fn parent(name: &str, pk: &str) -> ModelOptions {
        ModelOptions::new(name)
            .field(FieldInfo::auto(pk))
            .field(FieldInfo::new(format!("{}_name", name.to_lowercase()), SqlType::VarChar(10)))
    }

    fn registry() -> Registry {
        Registry::builder()
            .model(parent("ParentA", "aid"))
            .model(parent("ParentB", "bid"))
            .model(ModelOptions::new("User").field(FieldInfo::new("username", SqlType::Text)))
            .model(
                ModelOptions::split("Child")
                    .parent("ParentA")
                    .parent("ParentB")
                    .field(FieldInfo::auto("id"))
                    .field(FieldInfo::new("child_name", SqlType::VarChar(10)))
                    .foreign_key(ForeignKey::new("user", "User", OnDelete::Cascade).nullable(true))
                    .shared(
                        SharedRelation::parent_link("parenta_ptr", "ParentA", OnDelete::DoNothing)
                            .build()
                            .unwrap(),
                    )
                    .shared(
                        SharedRelation::parent_link("parentb_ptr", "ParentB", OnDelete::DoNothing)
                            .build()
                            .unwrap(),
                    ),
            )
            .model(ModelOptions::proxy("ChildProxy", "Child"))
            .build()
            .unwrap()
    }

    #[test]
    fn parents_resolve_with_shared_links() {
        let reg = registry();
        let parents = reg.parents("Child");
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[0].parent.name(), "ParentA");
        assert!(parents[0].link.is_shared());
        assert_eq!(parents[0].link.local_attname(), "id");
        assert_eq!(reg.parents("ChildProxy").len(), 2);
    }

    #[test]
    fn field_lookup_walks_units() {
        let reg = registry();
        let field = reg.get_field("Child", "parenta_name").unwrap();
        assert_eq!(field.owner.name(), "ParentA");
        assert!(matches!(reg.get_field("Child", "user").unwrap().kind, FieldKind::Relation(_)));
        assert!(matches!(reg.get_field("Child", "user_id").unwrap().kind, FieldKind::Concrete(_)));
        match reg.get_field("Child", "id").unwrap().kind {
            FieldKind::Concrete(f) => assert!(f.primary_key),
            FieldKind::Relation(_) => panic!("id must resolve to the concrete key"),
        }
        assert!(reg.get_field("Child", "nope").is_none());
        assert_eq!(reg.field_owner("Child", "bid").unwrap().name(), "ParentB");
    }

    #[test]
    fn missing_pk_is_added() {
        let reg = registry();
        assert_eq!(reg.pk("User").unwrap().name, "id");
        assert!(reg.pk("User").unwrap().auto_increment);
    }

    #[test]
    fn undeclared_parent_link_is_auto_created() {
        let reg = Registry::builder()
            .model(parent("ParentA", "aid"))
            .model(ModelOptions::new("Plain").parent("ParentA"))
            .build()
            .unwrap();
        let links = reg.parents("Plain");
        assert_eq!(links[0].link.name(), "parenta_ptr");
        assert!(!links[0].link.is_shared());
        assert_eq!(reg.pk("Plain").unwrap().name, "parenta_ptr_id");
    }

    #[test]
    fn registration_errors() {
        let dup = Registry::builder()
            .model(parent("ParentA", "aid"))
            .model(parent("ParentA", "aid"))
            .build();
        assert!(matches!(dup, Err(Error::Usage(_))));

        let unknown_parent = Registry::builder()
            .model(ModelOptions::new("Orphan").parent("Missing"))
            .build();
        assert!(matches!(unknown_parent, Err(Error::Usage(_))));

        let bad_proxy = Registry::builder()
            .model(ModelOptions::proxy("P", "Missing"))
            .build();
        assert!(matches!(bad_proxy, Err(Error::Usage(_))));
    }

    #[test]
    fn reverse_relations_and_target_fields() {
        let reg = registry();
        let reverse = reg.reverse_relations("ParentA");
        assert_eq!(reverse.len(), 1);
        assert_eq!(reverse[0].0.name(), "Child");
        let (_, user) = reg.relation("Child", "user").unwrap();
        assert_eq!(reg.target_field(user).unwrap().name, "id");
    }

    #[test]
    fn deconstruct_through_registry() {
        let reg = registry();
        let def = reg.deconstruct("Child", "parenta_ptr").unwrap();
        assert_eq!(def.from_field, None);
        assert_eq!(def.to, "ParentA");
    }
}
