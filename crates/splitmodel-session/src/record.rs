//! Records: the loaded state of one model instance.
//!
//! A record stores attributes by attribute name across all of its model's
//! units. A record built with [`Record::new`] holds every attribute; a record
//! loaded by a query holds only what the query projected, and the rest are
//! *deferred* until read through [`Record::get`] or reloaded with
//! [`Record::refresh_from_db`].

use crate::query::QuerySet;
use crate::session::Session;
use asupersync::{Cx, Outcome};
use splitmodel_core::{
    Connection, Error, FieldKind, LookupErrorKind, ModelMeta, Registry, RelationRef, Result,
    Value, try_outcome, try_result,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Persistence bookkeeping for a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordState {
    /// Not yet written to the database.
    pub adding: bool,
    /// Alias of the connection the record was loaded from or saved to.
    pub db: Option<String>,
}

impl Default for RecordState {
    fn default() -> Self {
        Self {
            adding: true,
            db: None,
        }
    }
}

/// One instance of a registered model.
#[derive(Clone)]
pub struct Record {
    model: String,
    registry: Arc<Registry>,
    values: BTreeMap<String, Value>,
    related: HashMap<String, Option<Record>>,
    pub(crate) state: RecordState,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("model", &self.model)
            .field("values", &self.values)
            .field("related", &self.related.keys().collect::<Vec<_>>())
            .field("state", &self.state)
            .finish()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pk() {
            Some(Value::Text(s)) => write!(f, "{} object ({})", self.model, s),
            Some(pk) => write!(f, "{} object ({})", self.model, pk),
            None => write!(f, "{} object (None)", self.model),
        }
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.model == other.model && self.values == other.values
    }
}

fn unknown_field(model: &str, name: &str) -> Error {
    Error::usage(model, format!("{} has no field named '{}'", model, name))
}

impl Record {
    /// A new, unsaved record with every attribute of every unit at its default.
    pub fn new(registry: &Arc<Registry>, model: &str) -> Result<Self> {
        if registry.model(model).is_none() {
            return Err(Error::usage(model, format!("Model '{}' is not registered", model)));
        }
        let values = registry
            .concrete_fields(model)
            .into_iter()
            .map(|(_, field)| (field.name.clone(), field.initial_value()))
            .collect();
        Ok(Self {
            model: model.to_string(),
            registry: Arc::clone(registry),
            values,
            related: HashMap::new(),
            state: RecordState::default(),
        })
    }

    pub(crate) fn from_db(
        registry: &Arc<Registry>,
        model: &str,
        values: BTreeMap<String, Value>,
        alias: &str,
    ) -> Self {
        Self {
            model: model.to_string(),
            registry: Arc::clone(registry),
            values,
            related: HashMap::new(),
            state: RecordState {
                adding: false,
                db: Some(alias.to_string()),
            },
        }
    }

    /// The model this record was created as; a proxy keeps its own name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The concrete model whose tables hold this record.
    pub fn meta(&self) -> Result<&ModelMeta> {
        self.registry
            .model(&self.model)
            .ok_or_else(|| Error::usage(&self.model, "model is no longer registered"))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn state(&self) -> &RecordState {
        &self.state
    }

    pub fn is_adding(&self) -> bool {
        self.state.adding
    }

    /// The primary key, if loaded.
    pub fn pk(&self) -> Option<&Value> {
        let meta = self.registry.model(&self.model)?;
        self.values.get(&meta.pk().name)
    }

    pub(crate) fn pk_is_set(&self) -> bool {
        self.pk().is_some_and(|v| !v.is_null())
    }

    /// Map a field name, relation name or `pk` to the attribute storing it.
    pub fn attname(&self, name: &str) -> Result<String> {
        let field = self
            .registry
            .get_field(&self.model, name)
            .ok_or_else(|| unknown_field(&self.model, name))?;
        Ok(match field.kind {
            FieldKind::Concrete(f) => f.name.clone(),
            FieldKind::Relation(r) => r.local_attname(),
        })
    }

    /// A loaded attribute; `None` when deferred.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.values.get(name) {
            Some(v) => Some(v),
            None => self.values.get(&self.attname(name).ok()?),
        }
    }

    pub fn is_loaded(&self, attname: &str) -> bool {
        self.values.contains_key(attname)
    }

    /// Loaded attributes by attribute name.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Attributes of any unit that this record has not loaded.
    pub fn deferred_fields(&self) -> BTreeSet<String> {
        self.registry
            .concrete_fields(&self.model)
            .into_iter()
            .map(|(_, f)| f.name.clone())
            .filter(|name| !self.values.contains_key(name))
            .collect()
    }

    /// Set a concrete attribute.
    ///
    /// Relations are assigned with [`Record::set_related`]; assigning a
    /// relation's attribute directly drops any related record cached for it.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let field = self
            .registry
            .get_field(&self.model, name)
            .ok_or_else(|| unknown_field(&self.model, name))?;
        match field.kind {
            FieldKind::Concrete(f) => {
                let attname = f.name.clone();
                self.set_raw(&attname, value.into());
                Ok(())
            }
            FieldKind::Relation(r) => Err(Error::usage(
                format!("{}.{}", self.model, r.name()),
                format!(
                    "'{}' is a relation; assign it with set_related() or set '{}'",
                    r.name(),
                    r.local_attname()
                ),
            )),
        }
    }

    /// Builder form of [`Record::set`].
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    pub(crate) fn set_raw(&mut self, attname: &str, value: Value) {
        let changed = self.values.get(attname) != Some(&value);
        self.values.insert(attname.to_string(), value);
        if changed {
            self.invalidate_related_using(attname);
        }
    }

    /// A shared relation's value, typed as its target's identifying field.
    pub fn relation_value(&self, name: &str) -> Result<Option<Value>> {
        let (_, relation) = self
            .registry
            .relation(&self.model, name)
            .ok_or_else(|| unknown_field(&self.model, name))?;
        let Some(value) = self.values.get(&relation.local_attname()) else {
            return Ok(None);
        };
        match self.registry.target_field(relation) {
            Some(target) => target.sql_type.from_db(value.clone()).map(Some),
            None => Ok(Some(value.clone())),
        }
    }

    /// Assign through a relation.
    ///
    /// A shared relation never changes the attribute it shares: only
    /// clearing an unset value or assigning the target the value already
    /// identifies are accepted. An ordinary foreign key copies the target's
    /// identifying value into its own attribute.
    pub fn set_related(&mut self, name: &str, target: Option<&Record>) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let (_, relation) = registry
            .relation(&self.model, name)
            .ok_or_else(|| unknown_field(&self.model, name))?;
        if let Some(target) = target {
            let expected = relation.target_model();
            let is_instance = registry
                .units(target.model())
                .iter()
                .any(|unit| unit.name() == expected);
            if !is_instance {
                return Err(Error::usage(
                    format!("{}.{}", self.model, name),
                    format!(
                        "Cannot assign \"{}\": \"{}.{}\" must be a \"{}\" instance.",
                        target, self.model, name, expected
                    ),
                ));
            }
        }
        let to_attname = registry
            .target_field(relation)
            .map_or_else(|| "pk".to_string(), |f| f.name.clone());
        let assigned = target.map(|t| t.value(&to_attname).cloned().unwrap_or(Value::Null));
        let attname = relation.local_attname();

        match relation {
            RelationRef::Shared(shared) => {
                let repr = target.map_or_else(|| "None".to_string(), ToString::to_string);
                shared.guard_write(&self.model, self.values.get(&attname), assigned.as_ref(), &repr)?;
            }
            RelationRef::Column(fk) => {
                if target.is_none() && !fk.nullable {
                    return Err(Error::usage(
                        format!("{}.{}", self.model, name),
                        format!(
                            "Cannot assign None: \"{}.{}\" does not allow null values.",
                            self.model, name
                        ),
                    ));
                }
                self.set_raw(&attname, assigned.unwrap_or(Value::Null));
            }
        }
        self.related.insert(name.to_string(), target.cloned());
        Ok(())
    }

    /// The cached target of a relation: `None` when nothing is cached,
    /// `Some(None)` when the relation is cached as empty.
    pub fn cached_related(&self, name: &str) -> Option<Option<&Record>> {
        self.related.get(name).map(Option::as_ref)
    }

    pub(crate) fn cache_related(&mut self, name: &str, target: Option<Record>) {
        self.related.insert(name.to_string(), target);
    }

    pub(crate) fn forget_related(&mut self, name: &str) {
        self.related.remove(name);
    }

    pub(crate) fn related_entries(&self) -> impl Iterator<Item = (&String, &Option<Record>)> {
        self.related.iter()
    }

    fn invalidate_related_using(&mut self, attname: &str) {
        if self.related.is_empty() {
            return;
        }
        let registry = Arc::clone(&self.registry);
        self.related.retain(|name, _| {
            registry
                .relation(&self.model, name)
                .is_none_or(|(_, r)| r.local_attname() != attname)
        });
    }

    /// Read an attribute, loading it first when deferred.
    #[tracing::instrument(level = "debug", skip(self, cx, session), fields(model = %self.model))]
    pub async fn get<C: Connection>(
        &mut self,
        cx: &Cx,
        session: &Session<C>,
        name: &str,
    ) -> Outcome<Value, Error> {
        let attname = try_result!(self.attname(name));
        if !self.values.contains_key(&attname) {
            tracing::debug!(field = %attname, "loading deferred field");
            try_outcome!(self.refresh_from_db(cx, session, Some(&[attname.as_str()])).await);
        }
        Outcome::Ok(self.values.get(&attname).cloned().unwrap_or(Value::Null))
    }

    /// Reload attributes from the database in one query.
    ///
    /// `None` reloads what is currently loaded. For split models every
    /// requested attribute brings its whole unit with it.
    #[tracing::instrument(level = "debug", skip(self, cx, session), fields(model = %self.model))]
    pub async fn refresh_from_db<C: Connection>(
        &mut self,
        cx: &Cx,
        session: &Session<C>,
        fields: Option<&[&str]>,
    ) -> Outcome<(), Error> {
        let Some(pk) = self.pk().filter(|v| !v.is_null()).cloned() else {
            return Outcome::Err(Error::lookup(
                LookupErrorKind::DoesNotExist,
                &self.model,
                format!("{} has no primary key to refresh from", self.model),
            ));
        };
        let meta = try_result!(self.meta());
        let mut attnames: BTreeSet<String> = match fields {
            Some(names) => {
                let mut out = BTreeSet::new();
                for name in names {
                    out.insert(try_result!(self.attname(name)));
                }
                out
            }
            None => self.values.keys().cloned().collect(),
        };
        if meta.is_split() {
            attnames = attnames
                .iter()
                .filter_map(|attname| self.registry.field_owner(&self.model, attname))
                .flat_map(|unit| unit.local_fields().iter().map(|f| f.name.clone()))
                .collect();
        }

        let qs = try_result!(QuerySet::new(session, &self.model))
            .only(attnames.iter().map(String::as_str))
            .filter("pk", pk);
        let mut rows = try_outcome!(qs.fetch(cx).await);
        let Some(fresh) = rows.pop() else {
            return Outcome::Err(Error::lookup(
                LookupErrorKind::DoesNotExist,
                &self.model,
                format!("{} matching query does not exist.", self.model),
            ));
        };
        for (attname, value) in fresh.values {
            self.set_raw(&attname, value);
        }
        self.state.db = Some(session.alias().to_string());
        Outcome::Ok(())
    }

    /// The target of a relation, fetched on first access and cached.
    pub async fn related<C: Connection>(
        &mut self,
        cx: &Cx,
        session: &Session<C>,
        name: &str,
    ) -> Outcome<Option<&Record>, Error> {
        try_outcome!(self.load_related(cx, session, name).await);
        Outcome::Ok(self.related.get(name).and_then(Option::as_ref))
    }

    /// Mutable access to a relation's target, fetched on first access.
    pub async fn related_mut<C: Connection>(
        &mut self,
        cx: &Cx,
        session: &Session<C>,
        name: &str,
    ) -> Outcome<Option<&mut Record>, Error> {
        try_outcome!(self.load_related(cx, session, name).await);
        Outcome::Ok(self.related.get_mut(name).and_then(Option::as_mut))
    }

    async fn load_related<C: Connection>(
        &mut self,
        cx: &Cx,
        session: &Session<C>,
        name: &str,
    ) -> Outcome<(), Error> {
        if self.related.contains_key(name) {
            return Outcome::Ok(());
        }
        let registry = Arc::clone(&self.registry);
        let Some((_, relation)) = registry.relation(&self.model, name) else {
            return Outcome::Err(unknown_field(&self.model, name));
        };
        let attname = relation.local_attname();
        let value = try_outcome!(self.get(cx, session, &attname).await);
        let target = if value.is_null() {
            None
        } else {
            let to_field = registry
                .target_field(relation)
                .map_or_else(|| "pk".to_string(), |f| f.name.clone());
            let qs = try_result!(session.objects(relation.target_model())).filter(&to_field, value);
            Some(try_outcome!(qs.get(cx).await))
        };
        self.related.insert(name.to_string(), target);
        Outcome::Ok(())
    }
}
