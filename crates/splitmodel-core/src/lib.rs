//! Core types for splitmodel.
//!
//! - [`Value`], [`Row`] and [`SqlType`] for data moving to and from the database
//! - [`Connection`], the async driver seam, with asupersync's `Cx` and `Outcome`
//! - Model declarations: [`FieldInfo`], [`ForeignKey`], [`SharedRelation`], [`ModelOptions`]
//! - [`Registry`], which resolves declarations, and its structural [`checks`]

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod checks;
pub mod connection;
pub mod error;
pub mod field;
pub mod identifiers;
pub mod options;
pub mod registry;
pub mod relation;
pub mod row;
pub mod types;
pub mod value;

pub use checks::{CheckedObject, Diagnostic, Level};
pub use connection::Connection;
pub use error::{
    CapabilityError, Error, IntegrityErrorKind, LookupErrorKind, Result, SchemaErrorKind,
};
pub use field::{FieldInfo, ForeignKey, OnDelete};
pub use identifiers::{quote_ident, quote_ident_mysql};
pub use options::ModelOptions;
pub use registry::{FieldKind, FieldRef, ModelMeta, ParentLink, Registry, RelationRef};
pub use relation::{
    Cardinality, RelationCapabilities, RelationDef, RelationKind, SharedRelation,
    SharedRelationBuilder, TargetRef, WritePolicy,
};
pub use row::{FromValue, Row};
pub use types::{BackendFeatures, Dialect, SqlType};
pub use value::Value;

/// Unwrap an [`Outcome`] inside an async fn returning `Outcome<_, Error>`,
/// returning early on error, cancellation or panic.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}

/// Unwrap a `Result` inside an async fn returning `Outcome<_, Error>`.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            ::core::result::Result::Ok(value) => value,
            ::core::result::Result::Err(err) => {
                return $crate::Outcome::Err(::core::convert::From::from(err));
            }
        }
    };
}
