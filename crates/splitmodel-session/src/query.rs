//! Partial-load query sets.
//!
//! A [`QuerySet`] is a copy-on-write builder: every method returns a new
//! query set and leaves the receiver untouched, so query sets can be shared
//! and branched freely.
//!
//! Query sets of split models track a *fetch state*: which linked units
//! (`with_parents`) and which shared non-parent relations (`with_shared`) the
//! projection currently includes. The manager starts from the minimal fetch,
//! the model's own table only; `select_related` widens it.

use crate::compiler::{
    Compiled, Compiler, Filter, Lookup, OrderBy, QueryState, SelectRelated, Shape,
};
use crate::record::Record;
use crate::session::Session;
use asupersync::{Cx, Outcome};
use splitmodel_core::{
    Connection, Error, FieldKind, LookupErrorKind, ModelMeta, ParentLink, Registry, Result,
    Value, try_outcome, try_result,
};
use std::collections::BTreeSet;

/// `get()` reads at most this many rows to report how many matched.
const MAX_GET_RESULTS: usize = 21;

/// A lazily evaluated query over one model.
pub struct QuerySet<'s, C: Connection> {
    session: &'s Session<C>,
    origin: String,
    pub(crate) state: QueryState,
    with_parents: BTreeSet<String>,
    with_shared: BTreeSet<String>,
    unknown: Vec<String>,
}

impl<C: Connection> Clone for QuerySet<'_, C> {
    fn clone(&self) -> Self {
        Self {
            session: self.session,
            origin: self.origin.clone(),
            state: self.state.clone(),
            with_parents: self.with_parents.clone(),
            with_shared: self.with_shared.clone(),
            unknown: self.unknown.clone(),
        }
    }
}

impl<C: Connection> std::fmt::Debug for QuerySet<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &self.origin)
            .field("state", &self.state)
            .field("with_parents", &self.with_parents)
            .field("with_shared", &self.with_shared)
            .finish_non_exhaustive()
    }
}

/// Every ancestor on the way from `from` up to `to`, `to` included.
fn units_on_path<'r>(registry: &'r Registry, from: &str, to: &str) -> Vec<&'r str> {
    fn walk<'r>(registry: &'r Registry, from: &str, to: &str, out: &mut Vec<&'r str>) -> bool {
        let links: Vec<ParentLink<'r>> = registry.parents(from);
        for link in links {
            let name = link.parent.name();
            if name == to || walk(registry, name, to, out) {
                out.push(name);
                return true;
            }
        }
        false
    }
    let mut out = Vec::new();
    walk(registry, from, to, &mut out);
    out
}

impl<'s, C: Connection> QuerySet<'s, C> {
    /// A query set projecting every unit of `model`, with no fetch state.
    pub(crate) fn new(session: &'s Session<C>, model: &str) -> Result<Self> {
        let meta = session.meta(model)?;
        Ok(Self {
            session,
            origin: model.to_string(),
            state: QueryState::new(meta.name()),
            with_parents: BTreeSet::new(),
            with_shared: BTreeSet::new(),
            unknown: Vec::new(),
        })
    }

    /// The model the query set was created for; a proxy keeps its own name.
    pub fn model(&self) -> &str {
        &self.origin
    }

    pub(crate) fn session(&self) -> &'s Session<C> {
        self.session
    }

    pub(crate) fn meta(&self) -> Result<&'s ModelMeta> {
        self.session.meta(&self.state.model)
    }

    fn registry(&self) -> &'s Registry {
        self.session.registry()
    }

    /// Linked units whose attributes the projection includes.
    pub fn fetched_parents(&self) -> &BTreeSet<String> {
        &self.with_parents
    }

    /// Shared non-parent relations whose attribute the projection includes.
    pub fn fetched_shared(&self) -> &BTreeSet<String> {
        &self.with_shared
    }

    fn attname(&self, name: &str) -> Option<String> {
        let field = self.registry().get_field(&self.state.model, name)?;
        Some(match field.kind {
            FieldKind::Concrete(f) => f.name.clone(),
            FieldKind::Relation(r) => r.local_attname(),
        })
    }

    fn with_filter(&self, path: &str, lookup: Lookup) -> Self {
        let mut qs = self.clone();
        qs.state.filters.push(Filter {
            path: path.to_string(),
            lookup,
        });
        qs
    }

    /// Keep rows where `path` equals `value`. `path` may cross relations
    /// with `__`; `pk` names the primary key.
    pub fn filter(&self, path: &str, value: impl Into<Value>) -> Self {
        self.with_filter(path, Lookup::Exact(value.into()))
    }

    pub fn filter_in<V: Into<Value>>(&self, path: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.with_filter(path, Lookup::In(values.into_iter().map(Into::into).collect()))
    }

    pub fn filter_null(&self, path: &str) -> Self {
        self.with_filter(path, Lookup::IsNull(true))
    }

    pub fn exclude_null(&self, path: &str) -> Self {
        self.with_filter(path, Lookup::IsNull(false))
    }

    /// Order by the given paths; a leading `-` sorts descending.
    pub fn order_by(&self, specs: &[&str]) -> Self {
        let mut qs = self.clone();
        qs.state.ordering = specs.iter().map(|s| OrderBy::parse(s)).collect();
        qs
    }

    pub fn limit(&self, limit: usize) -> Self {
        let mut qs = self.clone();
        qs.state.limit = Some(limit);
        qs
    }

    /// Project only the named attributes (the primary key is always read).
    /// Everything else is deferred.
    pub fn only<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut qs = self.clone();
        let mut set = BTreeSet::new();
        for name in names {
            match self.attname(name) {
                Some(attname) => {
                    set.insert(attname);
                }
                None => qs.unknown.push(name.to_string()),
            }
        }
        qs.state.only = Some(set);
        qs
    }

    /// Project every attribute of every unit.
    pub fn defer_none(&self) -> Self {
        let mut qs = self.clone();
        qs.state.only = None;
        qs
    }

    /// Set which linked units the projection includes.
    ///
    /// The projection becomes the model's own attributes, all attributes of
    /// each listed unit, and the attribute of each included shared relation.
    /// Without `force`, asking for the current set changes nothing.
    pub fn update_fetched_parents<I, S>(&self, parents: I, force: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parents: BTreeSet<String> = parents.into_iter().map(|p| p.as_ref().to_string()).collect();
        if !force && parents == self.with_parents {
            return self.clone();
        }
        let registry = self.registry();
        let mut fields: BTreeSet<String> = registry
            .model(&self.state.model)
            .map(|meta| meta.local_fields().iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default();
        for parent in &parents {
            if let Some(unit) = registry.model(parent) {
                fields.extend(unit.local_fields().iter().map(|f| f.name.clone()));
            }
        }
        for name in &self.with_shared {
            if let Some((_, relation)) = registry.relation(&self.state.model, name) {
                fields.insert(relation.local_attname());
            }
        }
        let mut qs = self.clone();
        qs.state.only = Some(fields);
        qs.with_parents = parents;
        qs
    }

    /// Eagerly load relations and, for split models, linked units.
    ///
    /// A name that is a parent link, or whose first `__` segment belongs to
    /// a linked unit, adds that unit (and every unit between) to the
    /// projection. A shared non-parent relation adds its attribute. All
    /// names are also joined as related records; parent links never are.
    /// With no names this is [`QuerySet::select_related_with_all_parents`].
    pub fn select_related(&self, names: &[&str]) -> Self {
        if names.is_empty() {
            return self.select_related_with_all_parents();
        }
        let registry = self.registry();
        let model = self.state.model.as_str();
        let split = registry.model(model).is_some_and(ModelMeta::is_split);

        let mut qs = self.clone();
        if split {
            let mut parents = self.with_parents.clone();
            for name in names {
                let head = name.split("__").next().unwrap_or_default();
                let Some(field) = registry.get_field(model, head) else {
                    continue;
                };
                if field.owner.name() != model {
                    parents.extend(units_on_path(registry, model, field.owner.name()).into_iter().map(String::from));
                }
                if let FieldKind::Relation(relation) = field.kind {
                    if relation.is_parent_link() {
                        parents.extend(
                            units_on_path(registry, model, relation.target_model())
                                .into_iter()
                                .map(String::from),
                        );
                    } else if relation.is_shared() {
                        qs.with_shared.insert(head.to_string());
                    }
                }
            }
            qs = qs.update_fetched_parents(&parents, true);
        }

        let mut named = match &self.state.select_related {
            SelectRelated::Named(existing) => existing.clone(),
            SelectRelated::None | SelectRelated::All => Vec::new(),
        };
        for name in names {
            if !named.iter().any(|n| n == name) {
                named.push((*name).to_string());
            }
        }
        qs.state.select_related = SelectRelated::Named(named);
        qs
    }

    /// Load every unit and follow every non-nullable relation in one query.
    pub fn select_related_with_all_parents(&self) -> Self {
        let mut qs = self.with_all_units();
        qs.state.select_related = SelectRelated::All;
        qs
    }

    /// Project every unit without joining related records.
    pub(crate) fn with_all_units(&self) -> Self {
        let mut qs = self.defer_none();
        qs.with_parents = self
            .registry()
            .parent_list(&self.state.model)
            .into_iter()
            .map(|m| m.name().to_string())
            .collect();
        qs
    }

    fn compile(&self, shape: Shape) -> Result<Compiled> {
        if let Some(name) = self.unknown.first() {
            return Err(Error::usage(
                &self.origin,
                format!("{} has no field named '{}'", self.origin, name),
            ));
        }
        Compiler::new(
            self.registry(),
            self.session.dialect(),
            &self.state.model,
            self.session.config().max_select_related_depth,
        )?
        .compile(&self.state, shape)
    }

    /// Run the query and build one record per row.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(model = %self.origin))]
    pub async fn fetch(&self, cx: &Cx) -> Outcome<Vec<Record>, Error> {
        let compiled = try_result!(self.compile(Shape::Select));
        let rows = try_outcome!(self.session.query(cx, &compiled.sql, &compiled.params).await);
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(try_result!(compiled.hydrate(
                row,
                self.session.registry(),
                &self.origin,
                self.session.alias()
            )));
        }
        tracing::debug!(count = records.len(), "fetched");
        Outcome::Ok(records)
    }

    /// The single matching record.
    pub async fn get(&self, cx: &Cx) -> Outcome<Record, Error> {
        let limit = self.state.limit.map_or(MAX_GET_RESULTS, |l| l.min(MAX_GET_RESULTS));
        let mut records = try_outcome!(self.limit(limit).fetch(cx).await);
        match records.len() {
            0 => Outcome::Err(Error::lookup(
                LookupErrorKind::DoesNotExist,
                &self.origin,
                format!("{} matching query does not exist.", self.origin),
            )),
            1 => match records.pop() {
                Some(record) => Outcome::Ok(record),
                None => Outcome::Err(Error::Custom("record vanished".to_string())),
            },
            n => {
                let count = if n >= MAX_GET_RESULTS {
                    format!("more than {}", MAX_GET_RESULTS - 1)
                } else {
                    n.to_string()
                };
                Outcome::Err(Error::lookup(
                    LookupErrorKind::MultipleObjectsReturned,
                    &self.origin,
                    format!("get() returned more than one {} -- it returned {}!", self.origin, count),
                ))
            }
        }
    }

    /// The first record, by primary key unless ordered otherwise.
    pub async fn first(&self, cx: &Cx) -> Outcome<Option<Record>, Error> {
        let mut qs = self.limit(1);
        if qs.state.ordering.is_empty() {
            qs.state.ordering.push(OrderBy::parse("pk"));
        }
        let records = try_outcome!(qs.fetch(cx).await);
        Outcome::Ok(records.into_iter().next())
    }

    pub async fn count(&self, cx: &Cx) -> Outcome<u64, Error> {
        let compiled = try_result!(self.compile(Shape::Count));
        let rows = try_outcome!(self.session.query(cx, &compiled.sql, &compiled.params).await);
        let count = rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(Value::as_i64)
            .map_or(0, |n| n.max(0) as u64);
        Outcome::Ok(match self.state.limit {
            Some(limit) => count.min(limit as u64),
            None => count,
        })
    }

    pub async fn exists(&self, cx: &Cx) -> Outcome<bool, Error> {
        let compiled = try_result!(self.compile(Shape::Exists));
        let rows = try_outcome!(self.session.query(cx, &compiled.sql, &compiled.params).await);
        Outcome::Ok(!rows.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnection, registry, unwrap_outcome};
    use asupersync::runtime::RuntimeBuilder;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    #[test]
    fn manager_starts_from_minimal_fetch() {
        let session = Session::new(MockConnection::new(), registry());
        let qs = session.objects("Child").unwrap();
        assert!(qs.fetched_parents().is_empty());
        assert_eq!(qs.state.only, Some(set(&["child_name", "id", "user_id"])));

        // non-split models read everything
        let plain = session.objects("ParentA").unwrap();
        assert_eq!(plain.state.only, None);
    }

    #[test]
    fn select_related_adds_units_by_link_or_field() {
        let session = Session::new(MockConnection::new(), registry());
        let qs = session.objects("Child").unwrap();

        let by_link = qs.select_related(&["parenta_ptr"]);
        assert_eq!(by_link.fetched_parents(), &set(&["ParentA"]));
        assert!(by_link.state.only.as_ref().unwrap().contains("para_name"));
        assert!(!by_link.state.only.as_ref().unwrap().contains("parb_name"));

        let by_field = by_link.select_related(&["parb_name"]);
        assert_eq!(by_field.fetched_parents(), &set(&["ParentA", "ParentB"]));

        // the receiver is unchanged
        assert!(qs.fetched_parents().is_empty());
    }

    #[test]
    fn select_related_through_unit_relation() {
        let session = Session::new(MockConnection::new(), registry());
        let qs = session.objects("Nephew").unwrap().select_related(&["parfk_user"]);
        assert_eq!(qs.fetched_parents(), &set(&["ParentWithFK"]));
        assert!(qs.state.only.as_ref().unwrap().contains("parfk_user_id"));
        assert_eq!(qs.state.select_related, SelectRelated::Named(vec!["parfk_user".into()]));
    }

    #[test]
    fn shared_non_parent_relation_is_tracked() {
        let session = Session::new(MockConnection::new(), registry());
        let qs = session
            .objects("ChildWithVirtualNonParent")
            .unwrap()
            .select_related(&["b"]);
        assert!(qs.fetched_parents().is_empty());
        assert_eq!(qs.fetched_shared(), &set(&["b"]));
    }

    #[test]
    fn empty_select_related_fetches_everything() {
        let session = Session::new(MockConnection::new(), registry());
        let qs = session.objects("Child").unwrap().select_related(&[]);
        assert_eq!(qs.fetched_parents(), &set(&["ParentA", "ParentB", "ParentC"]));
        assert_eq!(qs.state.only, None);
        assert_eq!(qs.state.select_related, SelectRelated::All);
    }

    #[test]
    fn update_fetched_parents_without_force_is_idempotent() {
        let session = Session::new(MockConnection::new(), registry());
        let qs = session.objects("Child").unwrap().only(["child_name"]);
        let same = qs.update_fetched_parents(std::iter::empty::<&str>(), false);
        assert_eq!(same.state.only, Some(set(&["child_name"])));
        let forced = qs.update_fetched_parents(std::iter::empty::<&str>(), true);
        assert_eq!(forced.state.only, Some(set(&["child_name", "id", "user_id"])));
    }

    #[test]
    fn get_reports_missing_and_multiple() {
        let rt = RuntimeBuilder::current_thread().build().unwrap();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.push_rows(&["aid"], vec![]);
        conn.push_rows(&["aid"], vec![vec![Value::BigInt(1)], vec![Value::BigInt(2)]]);
        let session = Session::new(conn, registry());

        rt.block_on(async {
            let qs = session.objects("ParentA").unwrap().only(["aid"]);
            match qs.get(&cx).await {
                Outcome::Err(e) => {
                    assert!(e.is_does_not_exist());
                    assert_eq!(e.to_string(), "ParentA matching query does not exist.");
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
            match qs.get(&cx).await {
                Outcome::Err(e) => assert_eq!(
                    e.to_string(),
                    "get() returned more than one ParentA -- it returned 2!"
                ),
                other => panic!("unexpected outcome: {other:?}"),
            }
        });
    }

    #[test]
    fn only_with_unknown_field_fails_on_fetch() {
        let rt = RuntimeBuilder::current_thread().build().unwrap();
        let cx = Cx::for_testing();
        let session = Session::new(MockConnection::new(), registry());
        rt.block_on(async {
            let qs = session.objects("ParentA").unwrap().only(["nope"]);
            assert!(matches!(qs.fetch(&cx).await, Outcome::Err(Error::Usage(_))));
            let fine = session.objects("ParentA").unwrap();
            assert!(unwrap_outcome(fine.fetch(&cx).await).is_empty());
        });
    }
}
