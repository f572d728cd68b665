#![allow(dead_code)]

use asupersync::{Cx, Outcome};
use splitmodel::{
    BackendFeatures, Connection, Dialect, Error, FieldInfo, ForeignKey, ModelOptions, OnDelete,
    Record, Registry, Row, Session, SessionConfig, SharedRelation, SqlType, SqliteConnection,
    Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// In-memory SQLite that counts `SELECT` round-trips and logs every
/// statement.
pub struct CountingConnection {
    inner: SqliteConnection,
    selects: AtomicUsize,
    log: Mutex<Vec<String>>,
    generated_keys: bool,
}

impl CountingConnection {
    pub fn open() -> Self {
        Self {
            inner: SqliteConnection::open_memory().expect("open sqlite memory db"),
            selects: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
            generated_keys: true,
        }
    }

    /// Pretend the backend cannot report generated keys.
    pub fn without_generated_keys(mut self) -> Self {
        self.generated_keys = false;
        self
    }

    pub fn inner(&self) -> &SqliteConnection {
        &self.inner
    }

    pub fn selects(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Forget everything counted and logged so far.
    pub fn reset(&self) {
        self.selects.store(0, Ordering::SeqCst);
        self.log.lock().unwrap().clear();
    }

    fn record(&self, sql: &str) {
        if sql.trim_start().starts_with("SELECT") {
            self.selects.fetch_add(1, Ordering::SeqCst);
        }
        self.log.lock().unwrap().push(sql.to_string());
    }

    /// Row count of `table`, read without being counted.
    pub fn count_rows(&self, table: &str) -> i64 {
        let rows = self
            .inner
            .query_sync(&format!("SELECT COUNT(*) FROM \"{table}\""), &[])
            .unwrap();
        rows[0].get(0).and_then(Value::as_i64).unwrap()
    }

    /// Single-column values of `sql`, read without being counted.
    pub fn column(&self, sql: &str) -> Vec<Value> {
        self.inner
            .query_sync(sql, &[])
            .unwrap()
            .into_iter()
            .map(|row| row.get(0).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

impl Connection for CountingConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn features(&self) -> BackendFeatures {
        if self.generated_keys {
            BackendFeatures::for_dialect(Dialect::Sqlite)
        } else {
            BackendFeatures {
                can_return_columns_from_insert: false,
                can_return_rows_from_bulk_insert: false,
            }
        }
    }

    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.record(sql);
        self.inner.query(cx, sql, params)
    }

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        self.record(sql);
        self.inner.query_one(cx, sql, params)
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.record(sql);
        self.inner.execute(cx, sql, params)
    }

    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        self.record(sql);
        self.inner.insert(cx, sql, params)
    }

    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        for (sql, _) in statements {
            self.record(sql);
        }
        self.inner.batch(cx, statements)
    }

    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.inner.ping(cx)
    }

    fn close(self, cx: &Cx) -> impl Future<Output = splitmodel::Result<()>> + Send {
        self.inner.close(cx)
    }
}

fn parent_link(name: &str, parent: &str) -> SharedRelation {
    SharedRelation::one_to_one(name, parent, "id", OnDelete::DoNothing)
        .parent_link(true)
        .build()
        .unwrap()
}

fn parent(name: &str, prefix: &str, pk: &str) -> ModelOptions {
    ModelOptions::new(name)
        .table(format!("testapp_{}", name.to_lowercase()))
        .field(FieldInfo::auto(pk))
        .field(FieldInfo::new(format!("{prefix}_name"), SqlType::VarChar(10)).default(""))
        .field(FieldInfo::new(format!("{prefix}_zit"), SqlType::Boolean).default(true))
}

/// A split `Child` with three linked units and an owning `User`.
pub fn registry() -> Arc<Registry> {
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
                .shared(parent_link("parenta_ptr", "ParentA"))
                .shared(parent_link("parentb_ptr", "ParentB"))
                .shared(parent_link("parentc_ptr", "ParentC"))
                .field(FieldInfo::new("child_name", SqlType::VarChar(10)).default(""))
                .foreign_key(ForeignKey::new("user", "User", OnDelete::Cascade).nullable(true)),
        )
        .model(ModelOptions::proxy("ChildProxy", "Child"))
        .build()
        .unwrap();
    Arc::new(registry)
}

/// A session over a fresh database holding every table of `registry`.
pub fn session(registry: Arc<Registry>, conn: CountingConnection) -> Session<CountingConnection> {
    session_with(registry, conn, SessionConfig::default())
}

pub fn session_with(
    registry: Arc<Registry>,
    conn: CountingConnection,
    config: SessionConfig,
) -> Session<CountingConnection> {
    for model in registry.models() {
        let statements =
            splitmodel::schema::ddl::create_model_sql(&registry, model.name(), Dialect::Sqlite)
                .unwrap();
        for sql in statements {
            conn.inner().execute_raw(&sql).unwrap();
        }
    }
    Session::with_config(conn, registry, config)
}

/// A new `Child` with every unit's name set.
pub fn new_child(session: &Session<CountingConnection>, name: &str) -> Record {
    let mut record = session.new_record("Child").unwrap();
    record.set("child_name", name).unwrap();
    record.set("para_name", format!("{name}-a")).unwrap();
    record.set("parb_name", format!("{name}-b")).unwrap();
    record.set("parc_name", format!("{name}-c")).unwrap();
    record
}

pub fn int(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i64).expect("integer value")
}
