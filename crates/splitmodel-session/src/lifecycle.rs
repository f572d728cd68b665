//! Saving records.
//!
//! Two write paths exist. Inserting a split record takes the *reversed*
//! path: the record's own row is written first, which mints the identity,
//! and the linked units are written after it with that identity copied in.
//! Everything else takes the *base* path, which writes ancestors first and
//! the record's own table last, updating each row and inserting it when no
//! row was updated.

use crate::query::QuerySet;
use crate::record::Record;
use crate::session::Session;
use crate::signals::ModelSignal;
use asupersync::{Cx, Outcome};
use splitmodel_core::{
    CapabilityError, Connection, Dialect, Error, FieldInfo, IntegrityErrorKind, ModelMeta,
    ParentLink, Registry, Result, Value, try_outcome, try_result,
};
use std::collections::{BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

/// Options for [`Session::save`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Always INSERT, never try an UPDATE first.
    pub force_insert: bool,
    /// Always UPDATE; fail when no row was updated.
    pub force_update: bool,
    /// Write only these attributes (names or attribute names).
    pub update_fields: Option<Vec<String>>,
    /// Write the record as loaded: no timestamps, no linked units.
    pub raw: bool,
}

impl SaveOptions {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn force_insert(mut self) -> Self {
        self.force_insert = true;
        self
    }

    #[must_use]
    pub fn force_update(mut self) -> Self {
        self.force_update = true;
        self
    }

    #[must_use]
    pub fn update_fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_fields = Some(names.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}

/// Apply `auto_now` / `auto_now_add` to `field`. `auto_now` always moves forward.
fn stamp(record: &mut Record, field: &FieldInfo, adding: bool) {
    if !(field.auto_now || field.auto_now_add && adding) {
        return;
    }
    let now = now_micros();
    let value = match record.value(&field.name) {
        Some(Value::Timestamp(previous)) if field.auto_now && *previous >= now => previous + 1,
        _ => now,
    };
    record.set_raw(&field.name, Value::Timestamp(value));
}

fn bound_value(record: &Record, field: &FieldInfo) -> Value {
    let value = record
        .value(&field.name)
        .cloned()
        .unwrap_or_else(|| field.initial_value());
    field.sql_type.to_db(&value)
}

/// `INSERT INTO t (cols) VALUES (..), (..) [RETURNING pk]`.
pub(crate) fn insert_sql(
    dialect: Dialect,
    table: &str,
    columns: &[&FieldInfo],
    rows: usize,
    returning: Option<&FieldInfo>,
) -> String {
    let mut sql = format!("INSERT INTO {}", dialect.quote_ident(table));
    if columns.is_empty() {
        sql.push_str(" DEFAULT VALUES");
    } else {
        let names: Vec<String> = columns
            .iter()
            .map(|f| dialect.quote_ident(f.column_name()))
            .collect();
        let mut index = 0;
        let tuples: Vec<String> = (0..rows)
            .map(|_| {
                let placeholders: Vec<String> = columns
                    .iter()
                    .map(|_| {
                        index += 1;
                        dialect.placeholder(index)
                    })
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();
        sql.push_str(&format!(" ({}) VALUES {}", names.join(", "), tuples.join(", ")));
    }
    if let Some(pk) = returning {
        sql.push_str(&format!(" RETURNING {}", dialect.quote_ident(pk.column_name())));
    }
    sql
}

/// One step of writing a record's linked units.
#[derive(Clone, Copy)]
enum ParentStep<'r> {
    /// Copy the link value into the parent's key when the key is unset.
    Sync(ParentLink<'r>),
    /// Write the parent row, then copy its key back into the link.
    Save(&'r ModelMeta, ParentLink<'r>),
}

/// Depth-first plan over every ancestor: each parent's own parents are
/// handled between its sync and its save.
fn parent_plan<'r>(registry: &'r Registry, model: &'r ModelMeta, out: &mut Vec<ParentStep<'r>>) {
    for link in registry.parents(model.name()) {
        out.push(ParentStep::Sync(link));
        parent_plan(registry, link.parent, out);
        out.push(ParentStep::Save(model, link));
    }
}

/// Every linked unit of `model` in declaration order, each with the unit
/// that links to it.
pub(crate) fn linked_units<'r>(registry: &'r Registry, model: &str) -> Vec<(&'r ModelMeta, ParentLink<'r>)> {
    let mut out: Vec<(&'r ModelMeta, ParentLink<'r>)> = Vec::new();
    let mut stack: Vec<&'r ModelMeta> = registry.model(model).into_iter().collect();
    while let Some(child) = stack.pop() {
        let links = registry.parents(child.name());
        for link in &links {
            if out.iter().all(|(_, l)| l.parent.name() != link.parent.name()) {
                out.push((child, *link));
            }
        }
        stack.extend(links.iter().rev().map(|l| l.parent));
    }
    out
}

impl<C: Connection> Session<C> {
    /// Save a record.
    ///
    /// A split record without a primary key, or saved with `force_insert`,
    /// is written own-row-first inside one transaction. A loaded record
    /// with deferred attributes only writes what it loaded.
    #[tracing::instrument(level = "debug", skip(self, cx, record, options), fields(model = %record.model()))]
    pub async fn save(&self, cx: &Cx, record: &mut Record, options: SaveOptions) -> Outcome<(), Error> {
        let SaveOptions {
            force_insert,
            force_update,
            update_fields,
            raw,
        } = options;
        let model = record.model().to_string();
        if force_insert && (force_update || update_fields.is_some()) {
            return Outcome::Err(Error::usage(
                &model,
                "Cannot force both insert and updating in model saving.",
            ));
        }
        let registry = std::sync::Arc::clone(self.registry());
        let meta = try_result!(self.meta(&model));

        let update_fields: Option<BTreeSet<String>> = match update_fields {
            Some(names) if names.is_empty() => {
                tracing::debug!("empty update_fields, nothing to save");
                return Outcome::Ok(());
            }
            Some(names) => {
                let mut attnames = BTreeSet::new();
                let mut unknown = Vec::new();
                for name in &names {
                    match record.attname(name) {
                        Ok(attname) if registry.field_owner(&model, &attname).is_some() => {
                            attnames.insert(attname);
                        }
                        _ => unknown.push(name.clone()),
                    }
                }
                if !unknown.is_empty() {
                    return Outcome::Err(Error::usage(
                        &model,
                        format!(
                            "The following fields do not exist in this model or are not concrete: {}",
                            unknown.join(", ")
                        ),
                    ));
                }
                Some(attnames)
            }
            None if !force_insert && !record.is_adding() && !record.deferred_fields().is_empty() => {
                let loaded: BTreeSet<String> = registry
                    .concrete_fields(&model)
                    .into_iter()
                    .filter(|(_, f)| !f.primary_key && record.is_loaded(&f.name))
                    .map(|(_, f)| f.name.clone())
                    .collect();
                tracing::debug!(fields = ?loaded, "saving loaded fields of a deferred record");
                Some(loaded)
            }
            None => None,
        };

        try_result!(prepare_related_for_save(record));

        let update_list: Option<Vec<String>> =
            update_fields.as_ref().map(|set| set.iter().cloned().collect());
        try_result!(self.signals().send(&ModelSignal::PreSave {
            model: &model,
            record: &*record,
            raw,
            update_fields: update_list.as_deref(),
        }));

        let reversed = meta.is_split() && (force_insert || !record.pk_is_set());
        let has_parents = !registry.parents(meta.name()).is_empty();

        if reversed && has_parents && !raw && !record.pk_is_set() && !self.features().can_return_columns_from_insert {
            return Outcome::Err(Error::Capability(CapabilityError {
                feature: "can_return_columns_from_insert",
                message: format!(
                    "{} needs the generated key of its own row before writing its linked units",
                    model
                ),
            }));
        }

        let atomic = if has_parents {
            Some(try_outcome!(self.atomic_begin(cx, false).await))
        } else {
            None
        };
        let written = if reversed {
            self.save_reversed(cx, record, meta, force_insert, raw).await
        } else {
            self.save_base(cx, record, meta, force_insert, force_update, update_fields.as_ref(), raw)
                .await
        };
        let written = match atomic {
            Some(atomic) => self.finish_atomic(cx, atomic, written).await,
            None => written,
        };
        let updated = try_outcome!(written);

        record.state.adding = false;
        record.state.db = Some(self.alias().to_string());
        try_result!(self.signals().send(&ModelSignal::PostSave {
            model: &model,
            record: &*record,
            created: !updated,
            raw,
            update_fields: update_list.as_deref(),
        }));
        Outcome::Ok(())
    }

    /// Insert a record, failing rather than updating an existing row.
    pub async fn create(&self, cx: &Cx, record: &mut Record) -> Outcome<(), Error> {
        self.save(cx, record, SaveOptions::new().force_insert()).await
    }

    async fn save_reversed(
        &self,
        cx: &Cx,
        record: &mut Record,
        meta: &ModelMeta,
        force_insert: bool,
        raw: bool,
    ) -> Outcome<bool, Error> {
        let minted = !record.pk_is_set();
        let updated = try_outcome!(self.save_table(cx, record, meta, force_insert, false, None, raw).await);
        if !raw {
            // Parents of a row that was just given its identity cannot exist yet.
            try_outcome!(self.save_parents(cx, record, meta, None, force_insert || minted).await);
        }
        Outcome::Ok(updated)
    }

    #[allow(clippy::too_many_arguments)]
    async fn save_base(
        &self,
        cx: &Cx,
        record: &mut Record,
        meta: &ModelMeta,
        force_insert: bool,
        force_update: bool,
        update_fields: Option<&BTreeSet<String>>,
        raw: bool,
    ) -> Outcome<bool, Error> {
        let parent_inserted = if raw {
            false
        } else {
            try_outcome!(self.save_parents(cx, record, meta, update_fields, force_insert).await)
        };
        self.save_table(
            cx,
            record,
            meta,
            force_insert || parent_inserted,
            force_update,
            update_fields,
            raw,
        )
        .await
    }

    /// Write every ancestor unit of `meta`. Returns whether any direct
    /// parent was inserted rather than updated.
    async fn save_parents(
        &self,
        cx: &Cx,
        record: &mut Record,
        meta: &ModelMeta,
        update_fields: Option<&BTreeSet<String>>,
        force_insert: bool,
    ) -> Outcome<bool, Error> {
        let registry = std::sync::Arc::clone(self.registry());
        let mut plan = Vec::new();
        parent_plan(&registry, meta, &mut plan);

        let mut saved: HashMap<String, bool> = HashMap::new();
        let mut inserted: HashMap<String, bool> = HashMap::new();
        for step in plan {
            match step {
                ParentStep::Sync(link) => {
                    let parent_pk = &link.parent.pk().name;
                    let key_unset = record.value(parent_pk).is_none_or(Value::is_null);
                    let link_value = record
                        .value(&link.link.local_attname())
                        .filter(|v| key_unset && !v.is_null())
                        .cloned();
                    if let Some(value) = link_value {
                        record.set_raw(parent_pk, value);
                    }
                }
                ParentStep::Save(child, link) => {
                    let parent = link.parent;
                    let updated = match saved.get(parent.name()) {
                        Some(updated) => *updated,
                        None => {
                            let force = force_insert || inserted.get(parent.name()).copied().unwrap_or(false);
                            let updated = try_outcome!(
                                self.save_table(cx, record, parent, force, false, update_fields, false)
                                    .await
                            );
                            saved.insert(parent.name().to_string(), updated);
                            updated
                        }
                    };
                    if !updated {
                        inserted.insert(child.name().to_string(), true);
                    }
                    let attname = link.link.local_attname();
                    let key = record.value(&parent.pk().name).cloned().unwrap_or(Value::Null);
                    if !record.value(&attname).is_some_and(|v| v.same_key(&key)) {
                        record.set_raw(&attname, key);
                    }
                    record.forget_related(link.link.name());
                }
            }
        }
        Outcome::Ok(inserted.get(meta.name()).copied().unwrap_or(false))
    }

    /// Write one unit's row. Returns `true` when an existing row was updated.
    #[allow(clippy::too_many_arguments)]
    async fn save_table(
        &self,
        cx: &Cx,
        record: &mut Record,
        unit: &ModelMeta,
        force_insert: bool,
        force_update: bool,
        update_fields: Option<&BTreeSet<String>>,
        raw: bool,
    ) -> Outcome<bool, Error> {
        let dialect = self.dialect();
        let pk = unit.pk();
        let pk_value = record.value(&pk.name).cloned().unwrap_or(Value::Null);
        let pk_set = !pk_value.is_null();
        if !pk_set && (force_update || update_fields.is_some()) {
            return Outcome::Err(Error::usage(
                record.model(),
                "Cannot force an update in save() with no primary key.",
            ));
        }

        let mut updated = false;
        if pk_set && !force_insert {
            let non_pks: Vec<&FieldInfo> = unit
                .local_fields()
                .iter()
                .filter(|f| !f.primary_key)
                .filter(|f| update_fields.is_none_or(|set| set.contains(&f.name)))
                .collect();
            if !raw {
                for field in &non_pks {
                    stamp(record, field, false);
                }
            }
            let pk_param = pk.sql_type.to_db(&pk_value);
            updated = if non_pks.is_empty() {
                if update_fields.is_some() {
                    true
                } else {
                    let sql = format!(
                        "SELECT 1 FROM {} WHERE {} = {} LIMIT 1",
                        dialect.quote_ident(unit.table()),
                        dialect.quote_ident(pk.column_name()),
                        dialect.placeholder(1)
                    );
                    let rows = try_outcome!(self.query(cx, &sql, &[pk_param]).await);
                    !rows.is_empty()
                }
            } else {
                let mut params: Vec<Value> = non_pks.iter().map(|f| bound_value(record, f)).collect();
                let assignments: Vec<String> = non_pks
                    .iter()
                    .enumerate()
                    .map(|(i, f)| {
                        format!("{} = {}", dialect.quote_ident(f.column_name()), dialect.placeholder(i + 1))
                    })
                    .collect();
                params.push(pk_param);
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = {}",
                    dialect.quote_ident(unit.table()),
                    assignments.join(", "),
                    dialect.quote_ident(pk.column_name()),
                    dialect.placeholder(params.len())
                );
                try_outcome!(self.execute(cx, &sql, &params).await) > 0
            };
            if force_update && !updated {
                return Outcome::Err(Error::integrity(
                    IntegrityErrorKind::NothingUpdated,
                    unit.name(),
                    "Forced update did not affect any rows.",
                ));
            }
            if update_fields.is_some() && !updated {
                return Outcome::Err(Error::integrity(
                    IntegrityErrorKind::NothingUpdated,
                    unit.name(),
                    "Save with update_fields did not affect any rows.",
                ));
            }
        }

        if !updated {
            let fields: Vec<&FieldInfo> = unit
                .local_fields()
                .iter()
                .filter(|f| pk_set || !(f.primary_key && f.auto_increment))
                .collect();
            if !raw {
                for field in &fields {
                    stamp(record, field, true);
                }
            }
            let params: Vec<Value> = fields.iter().map(|f| bound_value(record, f)).collect();
            let sql = insert_sql(dialect, unit.table(), &fields, 1, None);
            if pk_set {
                try_outcome!(self.execute(cx, &sql, &params).await);
            } else {
                let id = try_outcome!(self.insert(cx, &sql, &params).await);
                let key = try_result!(pk.sql_type.from_db(Value::BigInt(id)));
                record.set_raw(&pk.name, key);
            }
        }
        Outcome::Ok(updated)
    }
}

/// Check cached column relations before a save: an unsaved target is an
/// error, and an unset attribute takes the target's key.
fn prepare_related_for_save(record: &mut Record) -> Result<()> {
    let registry = std::sync::Arc::clone(record.registry());
    let mut copies = Vec::new();
    let mut stale = Vec::new();
    for (name, target) in record.related_entries() {
        let Some(target) = target else {
            continue;
        };
        let Some((_, relation)) = registry.relation(record.model(), name) else {
            continue;
        };
        if relation.is_shared() || relation.is_parent_link() {
            continue;
        }
        if !target.pk_is_set() {
            return Err(Error::usage(
                format!("{}.{}", record.model(), name),
                format!(
                    "save() prohibited to prevent data loss due to unsaved related object '{}'.",
                    name
                ),
            ));
        }
        let to_attname = registry
            .target_field(relation)
            .map_or_else(|| "pk".to_string(), |f| f.name.clone());
        let target_key = target.value(&to_attname).cloned().unwrap_or(Value::Null);
        let attname = relation.local_attname();
        match record.value(&attname) {
            None | Some(Value::Null) => copies.push((attname, target_key)),
            Some(current) if !current.same_key(&target_key) => stale.push(name.clone()),
            Some(_) => {}
        }
    }
    for (attname, key) in copies {
        record.set_raw(&attname, key);
    }
    for name in stale {
        record.forget_related(&name);
    }
    Ok(())
}

impl<C: Connection> QuerySet<'_, C> {
    /// Insert many records with multi-row INSERTs in one transaction.
    ///
    /// Records with a primary key are inserted as given; the rest get
    /// generated keys, which requires a backend that reports them for
    /// multi-row inserts when the model has linked units. Each linked unit
    /// row is written with the shared identity; a unit key that disagrees
    /// with it aborts the whole insert. No signals are sent.
    #[tracing::instrument(level = "debug", skip(self, cx, records), fields(model = %self.model(), count = records.len()))]
    pub async fn bulk_create(&self, cx: &Cx, records: &mut [Record]) -> Outcome<(), Error> {
        if records.is_empty() {
            return Outcome::Ok(());
        }
        let session = self.session();
        let registry = std::sync::Arc::clone(session.registry());
        let meta = try_result!(self.meta());
        for record in records.iter() {
            if registry.model(record.model()).map(ModelMeta::name) != Some(meta.name()) {
                return Outcome::Err(Error::usage(
                    self.model(),
                    format!("bulk_create() expects {} records, got {}", self.model(), record),
                ));
            }
        }
        let links = linked_units(&registry, meta.name());
        if !links.is_empty() && !meta.is_split() {
            return Outcome::Err(Error::usage(
                self.model(),
                "Can't bulk create a multi-table inherited model",
            ));
        }

        let (with_pk, without_pk): (Vec<usize>, Vec<usize>) =
            (0..records.len()).partition(|&i| records[i].pk_is_set());
        let returning = session.features().can_return_rows_from_bulk_insert;
        if !without_pk.is_empty() && !links.is_empty() && !returning {
            return Outcome::Err(Error::Capability(CapabilityError {
                feature: "can_return_rows_from_bulk_insert",
                message: format!(
                    "bulk_create() of {} needs generated keys to write its linked units",
                    self.model()
                ),
            }));
        }
        for &i in &with_pk {
            try_result!(check_shared_identity(&records[i], &links));
        }
        for record in records.iter_mut() {
            for (_, field) in registry.concrete_fields(meta.name()) {
                stamp(record, field, true);
            }
        }

        let atomic = try_outcome!(session.atomic_begin(cx, false).await);
        let written = self.bulk_insert_all(cx, records, &with_pk, &without_pk, &links).await;
        try_outcome!(session.finish_atomic(cx, atomic, written).await);

        for record in records.iter_mut() {
            record.state.adding = false;
            record.state.db = Some(session.alias().to_string());
        }
        Outcome::Ok(())
    }

    async fn bulk_insert_all(
        &self,
        cx: &Cx,
        records: &mut [Record],
        with_pk: &[usize],
        without_pk: &[usize],
        links: &[(&ModelMeta, ParentLink<'_>)],
    ) -> Outcome<(), Error> {
        let meta = try_result!(self.meta());
        try_outcome!(self.insert_rows(cx, meta, records, with_pk, true).await);
        try_outcome!(self.insert_rows(cx, meta, records, without_pk, false).await);

        let all: Vec<usize> = (0..records.len()).collect();
        for (child, link) in links {
            let attname = link.link.local_attname();
            let parent_pk = &link.parent.pk().name;
            for record in records.iter_mut() {
                let key = record.value(&attname).cloned().unwrap_or(Value::Null);
                if key.is_null() {
                    return Outcome::Err(Error::usage(
                        format!("{}.{}", child.name(), link.link.name()),
                        format!("{} has no value for the shared identity '{}'", record, attname),
                    ));
                }
                let conflicting = record
                    .value(parent_pk)
                    .filter(|v| !v.is_null() && !v.same_key(&key));
                if let Some(current) = conflicting {
                    return Outcome::Err(mismatch(child, link, current, &key));
                }
                record.set_raw(parent_pk, key);
            }
            try_outcome!(self.insert_rows(cx, link.parent, records, &all, true).await);
        }
        Outcome::Ok(())
    }

    /// Insert `unit` rows for the records at `indices`, in batches.
    async fn insert_rows(
        &self,
        cx: &Cx,
        unit: &ModelMeta,
        records: &mut [Record],
        indices: &[usize],
        with_pk: bool,
    ) -> Outcome<(), Error> {
        if indices.is_empty() {
            return Outcome::Ok(());
        }
        let session = self.session();
        let dialect = session.dialect();
        let pk = unit.pk();
        let columns: Vec<&FieldInfo> = unit
            .local_fields()
            .iter()
            .filter(|f| with_pk || !(f.primary_key && f.auto_increment))
            .collect();
        let returning = !with_pk && session.features().can_return_rows_from_bulk_insert;
        let batch_size = if columns.is_empty() { 1 } else { session.config().bulk_batch_size.max(1) };

        for batch in indices.chunks(batch_size) {
            let sql = insert_sql(
                dialect,
                unit.table(),
                &columns,
                batch.len(),
                returning.then_some(pk),
            );
            let params: Vec<Value> = batch
                .iter()
                .flat_map(|&i| columns.iter().map(move |f| (i, *f)))
                .map(|(i, f)| bound_value(&records[i], f))
                .collect();
            if returning {
                let rows = try_outcome!(session.query(cx, &sql, &params).await);
                if rows.len() != batch.len() {
                    return Outcome::Err(Error::Custom(format!(
                        "bulk insert into {} returned {} keys for {} rows",
                        unit.table(),
                        rows.len(),
                        batch.len()
                    )));
                }
                for (&i, row) in batch.iter().zip(&rows) {
                    let raw = row.get(0).cloned().unwrap_or(Value::Null);
                    let key = try_result!(pk.sql_type.from_db(raw));
                    records[i].set_raw(&pk.name, key);
                }
            } else {
                try_outcome!(session.execute(cx, &sql, &params).await);
            }
        }
        Outcome::Ok(())
    }
}

fn mismatch(child: &ModelMeta, link: &ParentLink<'_>, current: &Value, key: &Value) -> Error {
    Error::integrity(
        IntegrityErrorKind::SharedIdentityMismatch,
        child.name(),
        format!(
            "{}.{} is {} but the shared identity {}.{} is {}",
            link.parent.name(),
            link.parent.pk().name,
            current,
            child.name(),
            link.link.local_attname(),
            key
        ),
    )
}

fn check_shared_identity(record: &Record, links: &[(&ModelMeta, ParentLink<'_>)]) -> Result<()> {
    for (child, link) in links {
        let Some(key) = record.value(&link.link.local_attname()).filter(|v| !v.is_null()) else {
            continue;
        };
        let conflicting = record
            .value(&link.parent.pk().name)
            .filter(|v| !v.is_null() && !v.same_key(key));
        if let Some(current) = conflicting {
            return Err(mismatch(child, link, current, key));
        }
    }
    Ok(())
}
