//! Deleting records.
//!
//! A split record occupies one row in each of its units, so deleting it
//! removes every one of those rows. Records that reference any of the
//! units are handled according to their relation's deletion policy; the
//! links between a record's own units are not followed.

use crate::lifecycle::linked_units;
use crate::query::QuerySet;
use crate::record::Record;
use crate::session::Session;
use crate::signals::ModelSignal;
use asupersync::{Cx, Outcome};
use serde::Serialize;
use splitmodel_core::{
    Connection, Error, IntegrityErrorKind, LookupErrorKind, ModelMeta, OnDelete, Registry,
    RelationRef, Value, try_outcome, try_result,
};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

/// Rows removed by a delete, per unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteSummary {
    pub total: u64,
    pub per_model: BTreeMap<String, u64>,
}

/// Keys of one unit scheduled for deletion.
#[derive(Debug)]
struct UnitBatch {
    unit: String,
    table: String,
    pk_column: String,
    keys: Vec<Value>,
}

/// `UPDATE owner SET column = value WHERE column IN (keys)`.
#[derive(Debug)]
struct FieldUpdate {
    table: String,
    column: String,
    value: Value,
    keys: Vec<Value>,
}

/// Referencing rows that may only go away together with their target.
#[derive(Debug)]
struct Restriction {
    target: String,
    relation: String,
    owners: Vec<String>,
}

/// Collects everything a delete touches before anything is written.
struct Collector<'s, C: Connection> {
    session: &'s Session<C>,
    registry: Arc<Registry>,
    seen: HashSet<String>,
    /// Records that receive delete signals, in discovery order.
    records: Vec<Record>,
    /// One entry per discovered batch; each lists its own unit first.
    batches: Vec<Vec<UnitBatch>>,
    updates: Vec<FieldUpdate>,
    restrictions: Vec<Restriction>,
}

fn unit_key(unit: &str, key: &Value) -> String {
    format!("{unit}:{key}")
}

fn protected(target: &str, kind: &str, owner: &ModelMeta, relation: RelationRef<'_>) -> Error {
    Error::integrity(
        IntegrityErrorKind::ProtectedReference,
        target,
        format!(
            "Cannot delete some instances of model '{}' because they are referenced through {} foreign keys: '{}.{}'.",
            target,
            kind,
            owner.name(),
            relation.name()
        ),
    )
}

impl<'s, C: Connection> Collector<'s, C> {
    fn new(session: &'s Session<C>) -> Self {
        Self {
            session,
            registry: Arc::clone(session.registry()),
            seen: HashSet::new(),
            records: Vec::new(),
            batches: Vec::new(),
            updates: Vec::new(),
            restrictions: Vec::new(),
        }
    }

    /// Keys bound into one `IN (..)` list.
    fn batch_size(&self) -> usize {
        self.session.config().bulk_batch_size.max(1)
    }

    /// Attributes the collector reads from every record of `model`.
    fn needed_attnames(&self, model: &str) -> BTreeSet<String> {
        let mut needed = BTreeSet::new();
        for unit in self.registry.units(model) {
            needed.insert(unit.pk().name.clone());
            for (_, relation) in self.registry.reverse_relations(unit.name()) {
                if let Some(field) = self.registry.target_field(relation) {
                    needed.insert(field.name.clone());
                }
            }
        }
        for (_, link) in linked_units(&self.registry, model) {
            needed.insert(link.link.local_attname());
        }
        needed
    }

    /// Reload records missing attributes the collector needs.
    async fn ensure_loaded(&self, cx: &Cx, model: &str, records: Vec<Record>) -> Outcome<Vec<Record>, Error> {
        let needed = self.needed_attnames(model);
        let (ready, partial): (Vec<Record>, Vec<Record>) = records
            .into_iter()
            .partition(|r| needed.iter().all(|attname| r.is_loaded(attname)));
        if partial.is_empty() {
            return Outcome::Ok(ready);
        }
        tracing::debug!(model, count = partial.len(), "reloading partially loaded records for delete");
        let keys: Vec<Value> = partial.iter().filter_map(|r| r.pk().cloned()).collect();
        let qs = try_result!(self.session.objects(model)).with_all_units();
        let mut reloaded = Vec::with_capacity(keys.len() + ready.len());
        for chunk in keys.chunks(self.batch_size()) {
            reloaded.extend(try_outcome!(qs.filter_in("pk", chunk.to_vec()).fetch(cx).await));
        }
        reloaded.extend(ready);
        Outcome::Ok(reloaded)
    }

    /// Collect `records` of `model` and everything that cascades from them.
    async fn collect(&mut self, cx: &Cx, model: &str, records: Vec<Record>) -> Outcome<(), Error> {
        let mut queue: VecDeque<(String, Vec<Record>)> = VecDeque::new();
        queue.push_back((model.to_string(), records));
        while let Some((model, records)) = queue.pop_front() {
            let records = try_outcome!(self.ensure_loaded(cx, &model, records).await);
            let added = self.add(&model, records);
            if added.is_empty() {
                continue;
            }
            let cascaded = try_outcome!(self.follow_references(cx, &model, &added).await);
            queue.extend(cascaded);
        }
        for restriction in &self.restrictions {
            if let Some(owner) = restriction.owners.iter().find(|key| !self.seen.contains(*key)) {
                tracing::debug!(owner = %owner, "restricted reference survives the delete");
                return Outcome::Err(Error::integrity(
                    IntegrityErrorKind::ProtectedReference,
                    &restriction.target,
                    format!(
                        "Cannot delete some instances of model '{}' because they are referenced through restricted foreign keys: '{}'.",
                        restriction.target, restriction.relation
                    ),
                ));
            }
        }
        Outcome::Ok(())
    }

    /// Schedule every unit row of `records`. Returns the records not
    /// already scheduled.
    fn add(&mut self, model: &str, records: Vec<Record>) -> Vec<Record> {
        let registry = Arc::clone(&self.registry);
        let Some(meta) = registry.model(model) else {
            return Vec::new();
        };
        let links = linked_units(&registry, model);
        let mut units: Vec<UnitBatch> = registry
            .units(model)
            .into_iter()
            .map(|unit| UnitBatch {
                unit: unit.name().to_string(),
                table: unit.table().to_string(),
                pk_column: unit.pk().column_name().to_string(),
                keys: Vec::new(),
            })
            .collect();

        let mut added = Vec::new();
        for record in records {
            let Some(key) = record.value(&meta.pk().name).filter(|v| !v.is_null()).cloned() else {
                continue;
            };
            if !self.seen.insert(unit_key(meta.name(), &key)) {
                continue;
            }
            units[0].keys.push(key);
            for (_, link) in &links {
                let parent = link.parent;
                let parent_key = record
                    .value(&parent.pk().name)
                    .filter(|v| !v.is_null())
                    .or_else(|| record.value(&link.link.local_attname()))
                    .filter(|v| !v.is_null())
                    .cloned();
                let Some(parent_key) = parent_key else {
                    continue;
                };
                if !self.seen.insert(unit_key(parent.name(), &parent_key)) {
                    continue;
                }
                if let Some(batch) = units.iter_mut().find(|b| b.unit == parent.name()) {
                    batch.keys.push(parent_key);
                }
            }
            added.push(record);
        }
        self.batches.push(units);
        self.records.extend(added.iter().cloned());
        added
    }

    /// Apply deletion policies of relations that reference any unit of
    /// `records`. Returns cascaded records to collect next.
    async fn follow_references(
        &mut self,
        cx: &Cx,
        model: &str,
        records: &[Record],
    ) -> Outcome<Vec<(String, Vec<Record>)>, Error> {
        let registry = Arc::clone(&self.registry);
        let own_units: Vec<&str> = registry.units(model).into_iter().map(ModelMeta::name).collect();
        let batch = self.batch_size();
        let mut cascaded = Vec::new();

        for unit in registry.units(model) {
            for (owner, relation) in registry.reverse_relations(unit.name()) {
                if relation.is_parent_link() && own_units.contains(&owner.name()) {
                    continue;
                }
                let policy = relation.on_delete();
                if policy == OnDelete::DoNothing {
                    continue;
                }
                let Some(target_field) = registry.target_field(relation) else {
                    continue;
                };
                let keys: Vec<Value> = records
                    .iter()
                    .filter_map(|r| r.value(&target_field.name))
                    .filter(|v| !v.is_null())
                    .cloned()
                    .collect();
                if keys.is_empty() {
                    continue;
                }
                let attname = relation.local_attname();
                let mut found = Vec::new();
                if matches!(policy, OnDelete::Cascade | OnDelete::Protect | OnDelete::Restrict) {
                    for chunk in keys.chunks(batch) {
                        let owners =
                            try_result!(self.session.objects(owner.name())).filter_in(&attname, chunk.to_vec());
                        match policy {
                            OnDelete::Cascade => {
                                found.extend(try_outcome!(owners.with_all_units().fetch(cx).await));
                            }
                            OnDelete::Protect => {
                                if try_outcome!(owners.exists(cx).await) {
                                    return Outcome::Err(protected(unit.name(), "protected", owner, relation));
                                }
                            }
                            _ => {
                                let pk = owner.pk().name.as_str();
                                found.extend(try_outcome!(owners.only([pk]).fetch(cx).await));
                            }
                        }
                    }
                }

                match policy {
                    OnDelete::Cascade => {
                        if !found.is_empty() {
                            tracing::debug!(owner = owner.name(), relation = relation.name(), count = found.len(), "cascade");
                            cascaded.push((owner.name().to_string(), found));
                        }
                    }
                    OnDelete::Restrict => {
                        if !found.is_empty() {
                            self.restrictions.push(Restriction {
                                target: unit.name().to_string(),
                                relation: format!("{}.{}", owner.name(), relation.name()),
                                owners: found
                                    .iter()
                                    .filter_map(|r| r.pk())
                                    .map(|k| unit_key(owner.name(), k))
                                    .collect(),
                            });
                        }
                    }
                    OnDelete::SetNull | OnDelete::SetDefault if relation.is_shared() => {
                        tracing::warn!(
                            owner = owner.name(),
                            relation = relation.name(),
                            "cannot reset a shared relation on delete; leaving referencing rows unchanged"
                        );
                    }
                    OnDelete::SetNull | OnDelete::SetDefault => {
                        let Some(column) = owner.local_field(&attname) else {
                            continue;
                        };
                        let value = if policy == OnDelete::SetNull {
                            Value::Null
                        } else {
                            column.initial_value()
                        };
                        self.updates.push(FieldUpdate {
                            table: owner.table().to_string(),
                            column: column.column_name().to_string(),
                            value,
                            keys,
                        });
                    }
                    OnDelete::Protect | OnDelete::DoNothing => {}
                }
            }
        }
        Outcome::Ok(cascaded)
    }

    /// Run the collected updates and deletes inside one transaction.
    async fn delete(self, cx: &Cx) -> Outcome<DeleteSummary, Error> {
        let session = self.session;
        for record in &self.records {
            try_result!(session.signals().send(&ModelSignal::PreDelete {
                model: record.model(),
                record,
            }));
        }

        let atomic = try_outcome!(session.atomic_begin(cx, false).await);
        let written = self.write(cx).await;
        let summary = try_outcome!(session.finish_atomic(cx, atomic, written).await);

        for record in &self.records {
            try_result!(session.signals().send(&ModelSignal::PostDelete {
                model: record.model(),
                record,
            }));
        }
        tracing::info!(total = summary.total, "deleted");
        Outcome::Ok(summary)
    }

    async fn write(&self, cx: &Cx) -> Outcome<DeleteSummary, Error> {
        let dialect = self.session.dialect();
        let batch = self.batch_size();
        for update in &self.updates {
            let column = dialect.quote_ident(&update.column);
            for chunk in update.keys.chunks(batch) {
                let mut params = Vec::with_capacity(chunk.len() + 1);
                params.push(update.value.clone());
                params.extend(chunk.iter().cloned());
                let placeholders: Vec<String> = (2..=params.len()).map(|i| dialect.placeholder(i)).collect();
                let sql = format!(
                    "UPDATE {} SET {} = {} WHERE {} IN ({})",
                    dialect.quote_ident(&update.table),
                    column,
                    dialect.placeholder(1),
                    column,
                    placeholders.join(", ")
                );
                try_outcome!(self.session.execute(cx, &sql, &params).await);
            }
        }

        let mut summary = DeleteSummary::default();
        // Dependents were discovered after what they reference.
        for unit_batch in self.batches.iter().rev().flatten() {
            for chunk in unit_batch.keys.chunks(batch) {
                let placeholders: Vec<String> = (1..=chunk.len()).map(|i| dialect.placeholder(i)).collect();
                let sql = format!(
                    "DELETE FROM {} WHERE {} IN ({})",
                    dialect.quote_ident(&unit_batch.table),
                    dialect.quote_ident(&unit_batch.pk_column),
                    placeholders.join(", ")
                );
                let count = try_outcome!(self.session.execute(cx, &sql, chunk).await);
                summary.total += count;
                *summary.per_model.entry(unit_batch.unit.clone()).or_default() += count;
            }
        }
        Outcome::Ok(summary)
    }
}

impl<C: Connection> Session<C> {
    /// Delete a record together with every unit row it occupies.
    ///
    /// On success the record's key and the keys of all its units are unset.
    #[tracing::instrument(level = "debug", skip(self, cx, record), fields(model = %record.model()))]
    pub async fn delete(&self, cx: &Cx, record: &mut Record) -> Outcome<DeleteSummary, Error> {
        let meta = try_result!(self.meta(record.model()));
        if !record.pk_is_set() {
            return Outcome::Err(Error::usage(
                record.model(),
                format!(
                    "{} object can't be deleted because its {} attribute is set to None.",
                    record.model(),
                    meta.pk().name
                ),
            ));
        }
        let mut collector = Collector::new(self);
        try_outcome!(collector.collect(cx, record.model(), vec![record.clone()]).await);
        let summary = try_outcome!(collector.delete(cx).await);

        for unit in self.registry().units(meta.name()) {
            if record.values().contains_key(&unit.pk().name) {
                record.set_raw(&unit.pk().name, Value::Null);
            }
        }
        Outcome::Ok(summary)
    }

    /// Check that every relation value of `record` points at an existing row.
    pub async fn validate_relations(&self, cx: &Cx, record: &Record) -> Outcome<(), Error> {
        let registry = Arc::clone(self.registry());
        for unit in registry.units(record.model()) {
            for relation in unit.relations() {
                if relation.is_parent_link() {
                    continue;
                }
                let Some(value) = record.value(&relation.local_attname()).filter(|v| !v.is_null()) else {
                    continue;
                };
                let Some(target_field) = registry.target_field(relation) else {
                    continue;
                };
                let target = relation.target_model();
                let qs = try_result!(self.objects(target)).filter(&target_field.name, value.clone());
                if !try_outcome!(qs.exists(cx).await) {
                    return Outcome::Err(Error::lookup(
                        LookupErrorKind::InvalidReference,
                        target,
                        format!("{} instance with {} {} does not exist.", target, target_field.name, value),
                    ));
                }
            }
        }
        Outcome::Ok(())
    }
}

impl<C: Connection> QuerySet<'_, C> {
    /// Delete every matching record, all of its units, and whatever
    /// cascades from them.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(model = %self.model()))]
    pub async fn delete(&self, cx: &Cx) -> Outcome<DeleteSummary, Error> {
        if self.state.limit.is_some() {
            return Outcome::Err(Error::usage(
                self.model(),
                "Cannot use 'limit' with delete().",
            ));
        }
        let records = try_outcome!(self.with_all_units().fetch(cx).await);
        if records.is_empty() {
            return Outcome::Ok(DeleteSummary::default());
        }
        let mut collector = Collector::new(self.session());
        try_outcome!(collector.collect(cx, self.model(), records).await);
        collector.delete(cx).await
    }
}
