//! splitmodel: records split across tables that share one primary key.
//!
//! A *split model* keeps its attributes in its own table plus one or more
//! linked units, each a table joined 1:1 through the shared key. This crate
//! gathers the pieces:
//!
//! - Declarations: [`ModelOptions`], [`FieldInfo`], [`ForeignKey`] and
//!   [`SharedRelation`], a relation that reuses an existing attribute
//!   instead of adding a column
//! - [`Registry`], which resolves declarations and runs structural checks
//! - [`Session`], [`Record`] and [`QuerySet`]: partial loads, the reversed
//!   write lifecycle and deletion
//! - Migrations, including [`AddSharedRelation`] and [`CopyDataToPartial`]
//!
//! # Quick Start
//!
//! ```ignore
//! use splitmodel::prelude::*;
//! use splitmodel::{try_outcome, try_result};
//! use std::sync::Arc;
//!
//! async fn example(cx: &Cx) -> Outcome<(), Error> {
//!     let link = try_result!(SharedRelation::parent_link("parenta_ptr", "ParentA", OnDelete::DoNothing).build());
//!     let registry = try_result!(Registry::builder()
//!         .model(
//!             ModelOptions::new("ParentA")
//!                 .table("testapp_parenta")
//!                 .field(FieldInfo::auto("aid"))
//!                 .field(FieldInfo::new("para_name", SqlType::VarChar(10))),
//!         )
//!         .model(
//!             ModelOptions::split("Child")
//!                 .table("testapp_child")
//!                 .parent("ParentA")
//!                 .field(FieldInfo::auto("id"))
//!                 .shared(link)
//!                 .field(FieldInfo::new("child_name", SqlType::VarChar(10))),
//!         )
//!         .build());
//!     let conn = try_result!(SqliteConnection::open_memory());
//!     let session = Session::new(conn, Arc::new(registry));
//!
//!     // Writes the child row first, then the parent row with the same key.
//!     let mut child = try_result!(session.new_record("Child"));
//!     try_result!(child.set("child_name", "c"));
//!     try_result!(child.set("para_name", "a"));
//!     try_outcome!(session.save(cx, &mut child, SaveOptions::new()).await);
//!
//!     // One query for the child's own table, one more on first access to
//!     // a ParentA attribute.
//!     let mut loaded = try_outcome!(try_result!(session.objects("Child")).get(cx).await);
//!     let _name = try_outcome!(loaded.get(cx, &session, "para_name").await);
//!     Outcome::Ok(())
//! }
//! ```

pub use splitmodel_core::{
    BackendFeatures, Cardinality, CapabilityError, CheckedObject, Connection, Cx, Diagnostic,
    Dialect, Error, FieldInfo, ForeignKey, IntegrityErrorKind, Level, LookupErrorKind, ModelMeta,
    ModelOptions, OnDelete, Outcome, Registry, RelationDef, RelationKind, Result, Row,
    SchemaErrorKind, SharedRelation, SharedRelationBuilder, SqlType, Value, try_outcome,
    try_result,
};

pub use splitmodel_session::{
    Atomic, DeleteSummary, ModelSignal, QuerySet, Record, RecordState, SaveOptions, Session,
    SessionConfig, SignalKind, Signals,
};

pub use splitmodel_schema::{
    AddSharedRelation, AllowAll, CopyDataToPartial, CreateModel, Migration, MigrationRunner,
    MigrationStatus, MigrationWriter, Operation, OperationDef, ProjectState, Router,
    SchemaEditor, SqlExecutor, load_operation,
};

pub use splitmodel_sqlite::{SqliteConfig, SqliteConnection};

/// Migration state, DDL and the schema editor.
pub use splitmodel_schema as schema;

/// Everything needed to declare models and work with records.
pub mod prelude {
    pub use crate::{
        Connection, Cx, Error, FieldInfo, ForeignKey, Migration, MigrationRunner, ModelOptions,
        OnDelete, Outcome, QuerySet, Record, Registry, Result, SaveOptions, Session,
        SharedRelation, SqlType, SqliteConnection, Value,
    };
}
