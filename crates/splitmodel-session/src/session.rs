//! The session: a connection, the model registry and transaction state.

use crate::config::SessionConfig;
use crate::query::QuerySet;
use crate::record::Record;
use crate::signals::Signals;
use asupersync::{Cx, Outcome};
use splitmodel_core::{
    BackendFeatures, Connection, Dialect, Error, ModelMeta, Registry, Result, Row, Value,
    try_outcome,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How an [`Session::atomic_begin`] call entered its block.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "pass the token to finish_atomic"]
pub enum Atomic {
    /// Opened the outermost transaction.
    Begin,
    /// Opened a savepoint inside an enclosing transaction.
    Savepoint(String),
    /// Joined the enclosing transaction.
    Joined,
}

/// A connection bound to a model registry.
///
/// All database work for records goes through a session: query sets borrow
/// it, saves and deletes run on it, and signals are delivered from it.
pub struct Session<C: Connection> {
    conn: C,
    registry: Arc<Registry>,
    config: SessionConfig,
    signals: Signals,
    depth: AtomicUsize,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("dialect", &self.conn.dialect())
            .field("config", &self.config)
            .field("signals", &self.signals)
            .field("depth", &self.depth.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    pub fn new(conn: C, registry: Arc<Registry>) -> Self {
        Self::with_config(conn, registry, SessionConfig::default())
    }

    pub fn with_config(conn: C, registry: Arc<Registry>, config: SessionConfig) -> Self {
        Self {
            conn,
            registry,
            config,
            signals: Signals::new(),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn into_connection(self) -> C {
        self.conn
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn alias(&self) -> &str {
        &self.config.alias
    }

    pub fn dialect(&self) -> Dialect {
        self.conn.dialect()
    }

    pub fn features(&self) -> BackendFeatures {
        self.conn.features()
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    pub fn signals_mut(&mut self) -> &mut Signals {
        &mut self.signals
    }

    /// Is a transaction open on this session?
    pub fn in_transaction(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }

    /// The query set of `model`.
    ///
    /// Split models start from the minimal fetch: only the model's own
    /// table is read until linked units are asked for.
    pub fn objects(&self, model: &str) -> Result<QuerySet<'_, C>> {
        let qs = QuerySet::new(self, model)?;
        if qs.meta()?.is_split() {
            Ok(qs.update_fetched_parents(std::iter::empty::<&str>(), true))
        } else {
            Ok(qs)
        }
    }

    /// A fresh, unsaved record of `model` with every attribute at its default.
    pub fn new_record(&self, model: &str) -> Result<Record> {
        Record::new(&self.registry, model)
    }

    pub(crate) fn meta(&self, model: &str) -> Result<&ModelMeta> {
        self.registry
            .model(model)
            .ok_or_else(|| Error::usage(model, format!("Model '{}' is not registered", model)))
    }

    /// Enter an atomic block.
    ///
    /// Outside a transaction this issues `BEGIN`. Inside one it creates a
    /// savepoint when `savepoint` is set and otherwise joins the enclosing
    /// transaction.
    pub async fn atomic_begin(&self, cx: &Cx, savepoint: bool) -> Outcome<Atomic, Error> {
        let depth = self.depth.load(Ordering::SeqCst);
        let atomic = if depth == 0 {
            try_outcome!(self.execute(cx, "BEGIN", &[]).await);
            Atomic::Begin
        } else if savepoint {
            let name = format!("s{}", depth);
            let sql = format!("SAVEPOINT {}", self.dialect().quote_ident(&name));
            try_outcome!(self.execute(cx, &sql, &[]).await);
            Atomic::Savepoint(name)
        } else {
            Atomic::Joined
        };
        self.depth.fetch_add(1, Ordering::SeqCst);
        Outcome::Ok(atomic)
    }

    /// Leave an atomic block, committing when `outcome` is `Ok` and rolling
    /// back otherwise. Returns `outcome` unless the commit itself fails.
    pub async fn finish_atomic<T>(
        &self,
        cx: &Cx,
        atomic: Atomic,
        outcome: Outcome<T, Error>,
    ) -> Outcome<T, Error> {
        self.depth.fetch_sub(1, Ordering::SeqCst);
        let ok = matches!(outcome, Outcome::Ok(_));
        match (ok, atomic) {
            (_, Atomic::Joined) => {}
            (true, Atomic::Begin) => {
                let committed = self.execute(cx, "COMMIT", &[]).await;
                if !matches!(committed, Outcome::Ok(_)) {
                    if let Outcome::Err(e) = self.execute(cx, "ROLLBACK", &[]).await {
                        tracing::warn!(error = %e, "rollback after failed commit failed");
                    }
                    try_outcome!(committed);
                }
            }
            (true, Atomic::Savepoint(name)) => {
                let sql = format!("RELEASE SAVEPOINT {}", self.dialect().quote_ident(&name));
                try_outcome!(self.execute(cx, &sql, &[]).await);
            }
            (false, Atomic::Begin) => {
                if let Outcome::Err(e) = self.execute(cx, "ROLLBACK", &[]).await {
                    tracing::warn!(error = %e, "rollback failed");
                }
            }
            (false, Atomic::Savepoint(name)) => {
                let name = self.dialect().quote_ident(&name);
                let rollback = format!("ROLLBACK TO SAVEPOINT {}", name);
                let release = format!("RELEASE SAVEPOINT {}", name);
                for sql in [rollback, release] {
                    if let Outcome::Err(e) = self.execute(cx, &sql, &[]).await {
                        tracing::warn!(error = %e, sql = %sql, "savepoint rollback failed");
                    }
                }
            }
        }
        outcome
    }

    pub(crate) async fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Vec<Row>, Error> {
        tracing::debug!(sql = %sql, params = params.len(), "query");
        self.conn.query(cx, sql, params).await
    }

    pub(crate) async fn execute(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        tracing::debug!(sql = %sql, params = params.len(), "execute");
        self.conn.execute(cx, sql, params).await
    }

    pub(crate) async fn insert(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<i64, Error> {
        tracing::debug!(sql = %sql, params = params.len(), "insert");
        self.conn.insert(cx, sql, params).await
    }
}
