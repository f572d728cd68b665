//! SELECT compilation for query sets.
//!
//! The root table is aliased `T0`; every join gets the next `Tn`. Units of
//! the root model are joined through their parent links, relation targets
//! through the relation's attribute. Joins are shared: asking twice for the
//! same hop from the same alias reuses the first join.

use crate::record::Record;
use splitmodel_core::{
    Dialect, Error, FieldInfo, FieldKind, ModelMeta, ParentLink, Registry, RelationRef, Result,
    Row, SqlType, Value,
};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub(crate) const ROOT_ALIAS: &str = "T0";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Lookup {
    Exact(Value),
    In(Vec<Value>),
    IsNull(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Filter {
    pub(crate) path: String,
    pub(crate) lookup: Lookup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OrderBy {
    pub(crate) path: String,
    pub(crate) descending: bool,
}

impl OrderBy {
    pub(crate) fn parse(spec: &str) -> Self {
        match spec.strip_prefix('-') {
            Some(path) => Self {
                path: path.to_string(),
                descending: true,
            },
            None => Self {
                path: spec.to_string(),
                descending: false,
            },
        }
    }
}

/// Which relations a query eagerly joins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum SelectRelated {
    #[default]
    None,
    /// Every non-nullable relation, up to the configured depth.
    All,
    /// The named `__` paths.
    Named(Vec<String>),
}

/// Everything a query set knows that affects its SQL.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueryState {
    /// Concrete model name.
    pub(crate) model: String,
    pub(crate) filters: Vec<Filter>,
    pub(crate) ordering: Vec<OrderBy>,
    pub(crate) limit: Option<usize>,
    /// Projected attributes; `None` projects every unit.
    pub(crate) only: Option<BTreeSet<String>>,
    pub(crate) select_related: SelectRelated,
}

impl QueryState {
    pub(crate) fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            filters: Vec::new(),
            ordering: Vec::new(),
            limit: None,
            only: None,
            select_related: SelectRelated::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Select,
    Count,
    Exists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinKind {
    Inner,
    LeftOuter,
}

#[derive(Debug, Clone)]
struct Join {
    alias: String,
    table: String,
    kind: JoinKind,
    left_alias: String,
    left_column: String,
    right_column: String,
    key: (String, String),
}

/// One selected column and where its value goes.
#[derive(Debug, Clone)]
pub(crate) struct Column {
    alias: String,
    column: String,
    attname: String,
    sql_type: SqlType,
    /// Index into [`Compiled::targets`]; `None` for the root record.
    target: Option<usize>,
}

/// A related record filled from the selected columns.
#[derive(Debug, Clone)]
pub(crate) struct RelatedTarget {
    path: Vec<String>,
    model: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Compiled {
    pub(crate) sql: String,
    pub(crate) params: Vec<Value>,
    columns: Vec<Column>,
    targets: Vec<RelatedTarget>,
}

fn no_field(model: &str, name: &str) -> Error {
    Error::usage(
        model,
        format!("Cannot resolve keyword '{}' into field of {}", name, model),
    )
}

/// The parent links leading from `from` up to its ancestor `to`.
fn parent_path<'r>(registry: &'r Registry, from: &str, to: &str) -> Option<Vec<ParentLink<'r>>> {
    for link in registry.parents(from) {
        if link.parent.name() == to {
            return Some(vec![link]);
        }
        if let Some(rest) = parent_path(registry, link.parent.name(), to) {
            let mut path = vec![link];
            path.extend(rest);
            return Some(path);
        }
    }
    None
}

pub(crate) struct Compiler<'r> {
    registry: &'r Registry,
    dialect: Dialect,
    root: &'r ModelMeta,
    max_depth: usize,
    joins: Vec<Join>,
    columns: Vec<Column>,
    targets: Vec<RelatedTarget>,
    params: Vec<Value>,
}

impl<'r> Compiler<'r> {
    pub(crate) fn new(
        registry: &'r Registry,
        dialect: Dialect,
        model: &str,
        max_depth: usize,
    ) -> Result<Self> {
        let root = registry
            .model(model)
            .ok_or_else(|| Error::usage(model, format!("Model '{}' is not registered", model)))?;
        Ok(Self {
            registry,
            dialect,
            root,
            max_depth,
            joins: Vec::new(),
            columns: Vec::new(),
            targets: Vec::new(),
            params: Vec::new(),
        })
    }

    pub(crate) fn compile(mut self, state: &QueryState, shape: Shape) -> Result<Compiled> {
        let where_sql = self.where_clause(&state.filters)?;
        let select_list = match shape {
            Shape::Select => {
                self.project_root(state.only.as_ref())?;
                self.select_related(&state.select_related)?;
                self.columns
                    .iter()
                    .map(|c| format!("{}.{}", self.q(&c.alias), self.q(&c.column)))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
            Shape::Count => "COUNT(*)".to_string(),
            Shape::Exists => "1".to_string(),
        };
        let order_sql = match shape {
            Shape::Select => self.order_clause(&state.ordering)?,
            Shape::Count | Shape::Exists => String::new(),
        };

        let mut sql = format!(
            "SELECT {} FROM {} AS {}",
            select_list,
            self.q(self.root.table()),
            self.q(ROOT_ALIAS)
        );
        for join in &self.joins {
            let keyword = match join.kind {
                JoinKind::Inner => "INNER JOIN",
                JoinKind::LeftOuter => "LEFT OUTER JOIN",
            };
            sql.push_str(&format!(
                " {} {} AS {} ON ({}.{} = {}.{})",
                keyword,
                self.q(&join.table),
                self.q(&join.alias),
                self.q(&join.left_alias),
                self.q(&join.left_column),
                self.q(&join.alias),
                self.q(&join.right_column),
            ));
        }
        sql.push_str(&where_sql);
        sql.push_str(&order_sql);
        match (shape, state.limit) {
            (Shape::Exists, _) => sql.push_str(" LIMIT 1"),
            (Shape::Select, Some(limit)) => sql.push_str(&format!(" LIMIT {}", limit)),
            _ => {}
        }
        Ok(Compiled {
            sql,
            params: self.params,
            columns: self.columns,
            targets: self.targets,
        })
    }

    fn q(&self, name: &str) -> String {
        self.dialect.quote_ident(name)
    }

    fn is_outer(&self, alias: &str) -> bool {
        self.joins
            .iter()
            .any(|j| j.alias == alias && j.kind == JoinKind::LeftOuter)
    }

    fn join(
        &mut self,
        left_alias: String,
        left_column: String,
        table: &str,
        right_column: String,
        nullable: bool,
        key: (String, String),
    ) -> String {
        if let Some(existing) = self.joins.iter().find(|j| j.key == key) {
            return existing.alias.clone();
        }
        let kind = if nullable || self.is_outer(&left_alias) {
            JoinKind::LeftOuter
        } else {
            JoinKind::Inner
        };
        let alias = format!("T{}", self.joins.len() + 1);
        self.joins.push(Join {
            alias: alias.clone(),
            table: table.to_string(),
            kind,
            left_alias,
            left_column,
            right_column,
            key,
        });
        alias
    }

    /// Alias and field storing `attname` of a `model` row reachable at `alias`.
    fn column(
        &mut self,
        alias: &str,
        model: &'r ModelMeta,
        attname: &str,
    ) -> Result<(String, &'r FieldInfo)> {
        let owner = self
            .registry
            .field_owner(model.name(), attname)
            .ok_or_else(|| no_field(model.name(), attname))?;
        let field = owner
            .local_field(attname)
            .ok_or_else(|| no_field(model.name(), attname))?;
        if owner.name() == model.name() {
            return Ok((alias.to_string(), field));
        }
        let owner_alias = self.parent_alias(alias, model, owner)?;
        Ok((owner_alias, field))
    }

    /// Join the ancestor unit `ancestor` of a `model` row reachable at `alias`.
    fn parent_alias(
        &mut self,
        alias: &str,
        model: &'r ModelMeta,
        ancestor: &'r ModelMeta,
    ) -> Result<String> {
        let path = parent_path(self.registry, model.name(), ancestor.name())
            .ok_or_else(|| no_field(model.name(), ancestor.name()))?;
        let mut current_alias = alias.to_string();
        let mut current = model;
        for hop in path {
            let (left_alias, left_field) =
                self.column(&current_alias, current, &hop.link.local_attname())?;
            let right_column = self
                .registry
                .target_field(hop.link)
                .and_then(|f| hop.parent.local_field(&f.name))
                .unwrap_or_else(|| hop.parent.pk())
                .column_name()
                .to_string();
            let key = (current_alias.clone(), hop.link.name().to_string());
            current_alias = self.join(
                left_alias,
                left_field.column_name().to_string(),
                hop.parent.table(),
                right_column,
                hop.link.nullable(),
                key,
            );
            current = hop.parent;
        }
        Ok(current_alias)
    }

    /// Join the target of relation `name` of a `model` row reachable at `alias`.
    fn relation_alias(
        &mut self,
        alias: &str,
        model: &'r ModelMeta,
        name: &str,
    ) -> Result<(String, &'r ModelMeta, RelationRef<'r>)> {
        let (_, relation) = self
            .registry
            .relation(model.name(), name)
            .ok_or_else(|| no_field(model.name(), name))?;
        let target = self.registry.model(relation.target_model()).ok_or_else(|| {
            Error::usage(
                format!("{}.{}", model.name(), name),
                format!("target model '{}' is not registered", relation.target_model()),
            )
        })?;
        let to_field = self.registry.target_field(relation).unwrap_or_else(|| target.pk());
        let right = target.local_field(&to_field.name).ok_or_else(|| {
            Error::usage(
                format!("{}.{}", model.name(), name),
                format!(
                    "cannot join on '{}': it is not stored in {}'s own table",
                    to_field.name,
                    target.name()
                ),
            )
        })?;
        let (left_alias, left_field) = self.column(alias, model, &relation.local_attname())?;
        let joined = self.join(
            left_alias,
            left_field.column_name().to_string(),
            target.table(),
            right.column_name().to_string(),
            relation.nullable(),
            (alias.to_string(), name.to_string()),
        );
        Ok((joined, target, relation))
    }

    /// Resolve a `__` path to the column it compares.
    fn resolve_path(&mut self, path: &str) -> Result<(String, &'r FieldInfo)> {
        let segments: Vec<&str> = path.split("__").collect();
        let Some((last, hops)) = segments.split_last() else {
            return Err(no_field(self.root.name(), path));
        };
        let mut alias = ROOT_ALIAS.to_string();
        let mut model = self.root;
        for hop in hops {
            let (joined, target, _) = self.relation_alias(&alias, model, hop)?;
            alias = joined;
            model = target;
        }
        let attname = match self.registry.get_field(model.name(), last) {
            Some(field) => match field.kind {
                FieldKind::Concrete(f) => f.name.clone(),
                FieldKind::Relation(r) => r.local_attname(),
            },
            None => return Err(no_field(model.name(), last)),
        };
        self.column(&alias, model, &attname)
    }

    fn bind(&mut self, field: &FieldInfo, value: &Value) -> String {
        self.params.push(field.sql_type.to_db(value));
        self.dialect.placeholder(self.params.len())
    }

    fn where_clause(&mut self, filters: &[Filter]) -> Result<String> {
        let mut parts = Vec::with_capacity(filters.len());
        for filter in filters {
            let (alias, field) = self.resolve_path(&filter.path)?;
            let column = format!("{}.{}", self.q(&alias), self.q(field.column_name()));
            let part = match &filter.lookup {
                Lookup::Exact(value) if value.is_null() => format!("{} IS NULL", column),
                Lookup::Exact(value) => format!("{} = {}", column, self.bind(field, value)),
                Lookup::In(values) if values.is_empty() => "0 = 1".to_string(),
                Lookup::In(values) => {
                    let placeholders: Vec<String> =
                        values.iter().map(|v| self.bind(field, v)).collect();
                    format!("{} IN ({})", column, placeholders.join(", "))
                }
                Lookup::IsNull(true) => format!("{} IS NULL", column),
                Lookup::IsNull(false) => format!("{} IS NOT NULL", column),
            };
            parts.push(part);
        }
        if parts.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!(" WHERE {}", parts.join(" AND ")))
        }
    }

    fn order_clause(&mut self, ordering: &[OrderBy]) -> Result<String> {
        let mut parts = Vec::with_capacity(ordering.len());
        for order in ordering {
            let (alias, field) = self.resolve_path(&order.path)?;
            parts.push(format!(
                "{}.{} {}",
                self.q(&alias),
                self.q(field.column_name()),
                if order.descending { "DESC" } else { "ASC" }
            ));
        }
        if parts.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!(" ORDER BY {}", parts.join(", ")))
        }
    }

    fn project_root(&mut self, only: Option<&BTreeSet<String>>) -> Result<()> {
        let pk = self.root.pk().name.clone();
        let fields: Vec<&'r FieldInfo> = self
            .registry
            .concrete_fields(self.root.name())
            .into_iter()
            .map(|(_, f)| f)
            .filter(|f| only.is_none_or(|set| set.contains(&f.name) || f.name == pk))
            .collect();
        for field in fields {
            let (alias, field) = self.column(ROOT_ALIAS, self.root, &field.name)?;
            self.push_column(alias, field, None);
        }
        Ok(())
    }

    fn push_column(&mut self, alias: String, field: &FieldInfo, target: Option<usize>) {
        self.columns.push(Column {
            alias,
            column: field.column_name().to_string(),
            attname: field.name.clone(),
            sql_type: field.sql_type.clone(),
            target,
        });
    }

    /// Project a related target's columns and remember where they go.
    fn project_target(&mut self, alias: &str, target: &'r ModelMeta, path: Vec<String>) -> Result<()> {
        if self.targets.iter().any(|t| t.path == path) {
            return Ok(());
        }
        let index = self.targets.len();
        self.targets.push(RelatedTarget {
            path,
            model: target.name().to_string(),
        });
        if target.is_split() {
            for field in target.local_fields() {
                self.push_column(alias.to_string(), field, Some(index));
            }
        } else {
            for (_, field) in self.registry.concrete_fields(target.name()) {
                let (field_alias, field) = self.column(alias, target, &field.name)?;
                self.push_column(field_alias, field, Some(index));
            }
        }
        Ok(())
    }

    fn select_related(&mut self, request: &SelectRelated) -> Result<()> {
        match request {
            SelectRelated::None => Ok(()),
            SelectRelated::All => self.select_all(ROOT_ALIAS.to_string(), self.root, Vec::new()),
            SelectRelated::Named(paths) => {
                for path in paths {
                    self.select_named(path)?;
                }
                Ok(())
            }
        }
    }

    fn select_named(&mut self, path: &str) -> Result<()> {
        let mut alias = ROOT_ALIAS.to_string();
        let mut model = self.root;
        let mut prefix: Vec<String> = Vec::new();
        for segment in path.split("__") {
            let relation = match self.registry.get_field(model.name(), segment) {
                Some(field) => match field.kind {
                    FieldKind::Relation(r) => r,
                    FieldKind::Concrete(_) => {
                        return Err(Error::usage(
                            model.name(),
                            format!("Non-relational field given in select_related: '{}'", segment),
                        ));
                    }
                },
                None => {
                    let choices: Vec<&str> = self
                        .registry
                        .units(model.name())
                        .into_iter()
                        .flat_map(ModelMeta::relations)
                        .filter(|r| !r.is_parent_link())
                        .map(RelationRef::name)
                        .collect();
                    let choices = if choices.is_empty() {
                        "(none)".to_string()
                    } else {
                        choices.join(", ")
                    };
                    return Err(Error::usage(
                        model.name(),
                        format!(
                            "Invalid field name(s) given in select_related: '{}'. Choices are: {}",
                            segment, choices
                        ),
                    ));
                }
            };
            // Parent links are fetched through the unit projection, never as related records.
            if relation.is_parent_link() {
                return Ok(());
            }
            let (joined, target, _) = self.relation_alias(&alias, model, segment)?;
            prefix.push(segment.to_string());
            self.project_target(&joined, target, prefix.clone())?;
            alias = joined;
            model = target;
        }
        Ok(())
    }

    fn select_all(&mut self, alias: String, model: &'r ModelMeta, prefix: Vec<String>) -> Result<()> {
        if prefix.len() >= self.max_depth {
            return Ok(());
        }
        let units = if model.is_split() && !prefix.is_empty() {
            vec![model]
        } else {
            self.registry.units(model.name())
        };
        let names: Vec<&'r str> = units
            .into_iter()
            .flat_map(ModelMeta::relations)
            .filter(|r| !r.is_parent_link() && !r.nullable())
            .map(RelationRef::name)
            .collect();
        for name in names {
            let (joined, target, _) = self.relation_alias(&alias, model, name)?;
            let mut path = prefix.clone();
            path.push(name.to_string());
            self.project_target(&joined, target, path.clone())?;
            self.select_all(joined, target, path)?;
        }
        Ok(())
    }
}

impl Compiled {
    /// Build the record for one result row, related records cached on it.
    pub(crate) fn hydrate(
        &self,
        row: &Row,
        registry: &Arc<Registry>,
        origin: &str,
        alias: &str,
    ) -> Result<Record> {
        let mut root = BTreeMap::new();
        let mut related: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new(); self.targets.len()];
        let mut present = vec![false; self.targets.len()];
        for (index, column) in self.columns.iter().enumerate() {
            let raw = row.get(index).cloned().unwrap_or(Value::Null);
            let value = column.sql_type.from_db(raw).map_err(|e| match e {
                Error::Type(mut t) => {
                    t.column = Some(column.attname.clone());
                    Error::Type(t)
                }
                other => other,
            })?;
            match column.target {
                None => {
                    root.insert(column.attname.clone(), value);
                }
                Some(t) => {
                    present[t] |= !value.is_null();
                    related[t].insert(column.attname.clone(), value);
                }
            }
        }

        let mut record = Record::from_db(registry, origin, root, alias);
        let mut built: Vec<Option<Option<Record>>> = related
            .into_iter()
            .enumerate()
            .map(|(i, values)| {
                Some(present[i].then(|| Record::from_db(registry, &self.targets[i].model, values, alias)))
            })
            .collect();
        let mut order: Vec<usize> = (0..self.targets.len()).collect();
        order.sort_by_key(|&i| Reverse(self.targets[i].path.len()));
        for i in order {
            let Some(entry) = built[i].take() else {
                continue;
            };
            let path = &self.targets[i].path;
            let Some((name, parent_path)) = path.split_last() else {
                continue;
            };
            if parent_path.is_empty() {
                record.cache_related(name, entry);
            } else if let Some(parent) = self.targets.iter().position(|t| t.path == parent_path) {
                if let Some(Some(parent)) = built[parent].as_mut() {
                    parent.cache_related(name, entry);
                }
            }
        }
        Ok(record)
    }
}
