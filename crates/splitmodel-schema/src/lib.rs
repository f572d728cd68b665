//! Migration support for splitmodel.
//!
//! - [`ProjectState`], the models at one point of a migration history
//! - DDL generation and the [`SchemaEditor`] operations record statements into
//! - Operations, among them [`AddSharedRelation`] and [`CopyDataToPartial`]
//!   for splitting a wide table into partial models
//! - [`MigrationRunner`], which applies and unapplies migrations

pub mod ddl;
pub mod editor;
pub mod migrate;
pub mod operations;
pub mod state;

pub use editor::{AllowAll, BoxFuture, Router, SchemaEditor, SqlExecutor};
pub use migrate::{Migration, MigrationRunner, MigrationStatus, MigrationWriter};
pub use operations::{
    AddSharedRelation, CopyDataToPartial, CreateModel, Operation, OperationDef, load_operation,
};
pub use state::{ModelDef, ProjectState, SharedDef};
