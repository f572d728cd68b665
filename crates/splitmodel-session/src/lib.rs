//! Session layer for splitmodel.
//!
//! This crate provides:
//! - [`Session`], which owns a connection, the model registry and the
//!   transaction depth
//! - [`Record`], a loaded or new instance of a model, possibly split across
//!   several tables that share one primary key
//! - [`QuerySet`], a copy-on-write query builder that loads only the units
//!   it is asked for
//! - The reversed write lifecycle ([`Session::save`], [`QuerySet::bulk_create`])
//! - Deletion of records together with all of their units
//! - Model [`Signals`]

pub mod config;
pub mod deletion;
pub mod lifecycle;
pub mod query;
pub mod record;
pub mod session;
pub mod signals;

mod compiler;
#[cfg(test)]
mod mock;

pub use config::SessionConfig;
pub use deletion::DeleteSummary;
pub use lifecycle::SaveOptions;
pub use query::QuerySet;
pub use record::{Record, RecordState};
pub use session::{Atomic, Session};
pub use signals::{ModelSignal, SignalKind, Signals};
