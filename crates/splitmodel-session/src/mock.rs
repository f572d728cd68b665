//! Scripted connection and model fixtures for unit tests.

#![allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures

use asupersync::{Cx, Outcome};
use splitmodel_core::{
    BackendFeatures, Connection, Dialect, Error, FieldInfo, ForeignKey, ModelOptions, OnDelete,
    Registry, Row, SharedRelation, SqlType, Value,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub(crate) fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

#[derive(Debug, Default)]
struct MockState {
    statements: Vec<(String, Vec<Value>)>,
    rows: VecDeque<Vec<Row>>,
    update_rows: VecDeque<u64>,
    next_id: i64,
    fail_on: Option<String>,
}

/// Read side of a [`MockConnection`]'s statement log.
#[derive(Debug, Clone)]
pub(crate) struct MockLog(Arc<Mutex<MockState>>);

impl MockLog {
    pub(crate) fn statements(&self) -> Vec<String> {
        let state = self.0.lock().unwrap();
        state.statements.iter().map(|(sql, _)| sql.clone()).collect()
    }

    pub(crate) fn params(&self, index: usize) -> Vec<Value> {
        self.0.lock().unwrap().statements[index].1.clone()
    }

    pub(crate) fn selects(&self) -> usize {
        self.statements()
            .iter()
            .filter(|sql| sql.starts_with("SELECT"))
            .count()
    }

    /// Statements that write rows, transaction control excluded.
    pub(crate) fn writes(&self) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|sql| {
                sql.starts_with("INSERT") || sql.starts_with("UPDATE") || sql.starts_with("DELETE")
            })
            .collect()
    }
}

/// Records every statement. Queries return scripted rows in order (or
/// nothing), inserts return increasing keys, updates report scripted row
/// counts (1 by default).
pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
    features: BackendFeatures,
}

impl MockConnection {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_id: 1,
                ..MockState::default()
            })),
            features: BackendFeatures::for_dialect(Dialect::Sqlite),
        }
    }

    pub(crate) fn without_returning(mut self) -> Self {
        self.features = BackendFeatures {
            can_return_columns_from_insert: false,
            can_return_rows_from_bulk_insert: false,
        };
        self
    }

    pub(crate) fn log(&self) -> MockLog {
        MockLog(Arc::clone(&self.state))
    }

    pub(crate) fn push_rows(&self, columns: &[&str], rows: Vec<Vec<Value>>) {
        let names: Vec<String> = columns.iter().map(|c| (*c).to_string()).collect();
        let rows = rows
            .into_iter()
            .map(|values| Row::new(names.clone(), values))
            .collect();
        self.state.lock().unwrap().rows.push_back(rows);
    }

    /// Make `execute` fail for statements starting with `prefix`.
    pub(crate) fn fail_on(&self, prefix: &str) {
        self.state.lock().unwrap().fail_on = Some(prefix.to_string());
    }

    pub(crate) fn push_update_rows(&self, count: u64) {
        self.state.lock().unwrap().update_rows.push_back(count);
    }

    fn record(&self, sql: &str, params: &[Value]) {
        self.state
            .lock()
            .unwrap()
            .statements
            .push((sql.to_string(), params.to_vec()));
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn features(&self) -> BackendFeatures {
        self.features
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.record(sql, params);
        let mut state = self.state.lock().unwrap();
        let rows = if sql.starts_with("INSERT") && sql.contains("RETURNING") {
            let count = sql.matches("), (").count() + 1;
            let start = state.next_id;
            state.next_id += count as i64;
            (start..start + count as i64)
                .map(|id| Row::new(vec!["id".to_string()], vec![Value::BigInt(id)]))
                .collect()
        } else {
            state.rows.pop_front().unwrap_or_default()
        };
        async move { Outcome::Ok(rows) }
    }

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let rows = self.query(cx, sql, params);
        async move {
            match rows.await {
                Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.record(sql, params);
        let mut state = self.state.lock().unwrap();
        let outcome = if state.fail_on.as_deref().is_some_and(|p| sql.starts_with(p)) {
            Outcome::Err(Error::Custom(format!("scripted failure: {sql}")))
        } else if sql.starts_with("UPDATE") || sql.starts_with("DELETE") {
            Outcome::Ok(state.update_rows.pop_front().unwrap_or(1))
        } else {
            Outcome::Ok(1)
        };
        async move { outcome }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        self.record(sql, params);
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        async move { Outcome::Ok(id) }
    }

    fn batch(
        &self,
        _cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        for (sql, params) in statements {
            self.record(sql, params);
        }
        let counts = vec![1; statements.len()];
        async move { Outcome::Ok(counts) }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn close(self, _cx: &Cx) -> impl Future<Output = splitmodel_core::Result<()>> + Send {
        async { Ok(()) }
    }
}

fn shared_parent(name: &str, parent: &str) -> SharedRelation {
    SharedRelation::one_to_one(name, parent, "id", OnDelete::DoNothing)
        .parent_link(true)
        .build()
        .unwrap()
}

fn parent(name: &str, prefix: &str, pk: &str) -> ModelOptions {
    ModelOptions::new(name)
        .table(format!("testapp_{}", name.to_lowercase()))
        .field(FieldInfo::auto(pk))
        .field(FieldInfo::new(format!("{prefix}_name"), SqlType::VarChar(10)))
        .field(FieldInfo::new(format!("{prefix}_zit"), SqlType::Boolean).default(true))
}

/// The split-model fixtures used across the session tests.
pub(crate) fn registry() -> Arc<Registry> {
    let registry = Registry::builder()
        .model(
            ModelOptions::new("User")
                .table("auth_user")
                .field(FieldInfo::auto("id"))
                .field(FieldInfo::new("username", SqlType::VarChar(150))),
        )
        .model(parent("ParentA", "para", "aid"))
        .model(parent("ParentB", "parb", "bid"))
        .model(parent("ParentC", "parc", "cid"))
        .model(
            ModelOptions::split("Child")
                .table("testapp_child")
                .parent("ParentA")
                .parent("ParentB")
                .parent("ParentC")
                .field(FieldInfo::auto("id"))
                .shared(shared_parent("parenta_ptr", "ParentA"))
                .shared(shared_parent("parentb_ptr", "ParentB"))
                .shared(shared_parent("parentc_ptr", "ParentC"))
                .field(FieldInfo::new("child_name", SqlType::VarChar(10)))
                .foreign_key(ForeignKey::new("user", "User", OnDelete::Cascade).nullable(true)),
        )
        .model(ModelOptions::proxy("ChildProxy", "Child"))
        .model(
            ModelOptions::new("ParentWithFK")
                .table("testapp_parentwithfk")
                .field(FieldInfo::auto("fkid"))
                .foreign_key(ForeignKey::new("parfk_user", "User", OnDelete::Cascade)),
        )
        .model(
            ModelOptions::split("Nephew")
                .table("testapp_nephew")
                .parent("ParentA")
                .parent("ParentWithFK")
                .field(FieldInfo::auto("id"))
                .shared(shared_parent("parenta_ptr", "ParentA"))
                .shared(shared_parent("parentwithfk_ptr", "ParentWithFK"))
                .field(FieldInfo::new("nephew_name", SqlType::VarChar(10))),
        )
        .model(
            ModelOptions::split("ChildWithVirtualNonParent")
                .table("testapp_childwithvirtualnonparent")
                .parent("ParentA")
                .field(FieldInfo::auto("id"))
                .shared(
                    SharedRelation::parent_link("parenta_ptr", "ParentA", OnDelete::DoNothing)
                        .build()
                        .unwrap(),
                )
                .shared(
                    SharedRelation::one_to_one("b", "ParentB", "id", OnDelete::DoNothing)
                        .build()
                        .unwrap(),
                )
                .field(FieldInfo::new("child_name", SqlType::VarChar(10))),
        )
        .build()
        .unwrap();
    Arc::new(registry)
}
