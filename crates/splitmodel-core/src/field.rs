//! Concrete field and column-backed relation definitions.

use crate::types::SqlType;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// What happens to referencing records when the referenced record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnDelete {
    /// Delete the referencing records too.
    Cascade,
    /// Refuse the delete while references exist.
    Protect,
    /// Refuse the delete unless the referencing record is itself being deleted.
    Restrict,
    /// Set the referencing attribute to NULL.
    SetNull,
    /// Set the referencing attribute to its default.
    SetDefault,
    /// Leave referencing records alone.
    DoNothing,
}

impl OnDelete {
    /// Does this policy rewrite the referencing attribute?
    ///
    /// A shared relation must never use such a policy: the attribute it
    /// rewrites is also the value other relations read.
    pub const fn mutates_referencing_value(self) -> bool {
        matches!(self, OnDelete::SetNull | OnDelete::SetDefault)
    }

    /// Get the SQL spelling of this action.
    pub const fn as_sql(self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::Protect | OnDelete::Restrict => "RESTRICT",
            OnDelete::SetNull => "SET NULL",
            OnDelete::SetDefault => "SET DEFAULT",
            OnDelete::DoNothing => "NO ACTION",
        }
    }
}

/// Metadata about a concrete, column-backed attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Attribute name on the record
    pub name: String,
    /// Database column name, when it differs from `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub sql_type: SqlType,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub db_index: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Stamp the current time on every save.
    #[serde(default)]
    pub auto_now: bool,
    /// Stamp the current time when the record is first inserted.
    #[serde(default)]
    pub auto_now_add: bool,
}

impl FieldInfo {
    /// Create a plain, non-null field.
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            column: None,
            sql_type,
            primary_key: false,
            auto_increment: false,
            nullable: false,
            unique: false,
            db_index: false,
            default: None,
            auto_now: false,
            auto_now_add: false,
        }
    }

    /// An auto-incrementing integer primary key.
    pub fn auto(name: impl Into<String>) -> Self {
        Self::new(name, SqlType::Integer)
            .primary_key(true)
            .auto_increment(true)
    }

    /// An auto-incrementing 64-bit primary key.
    pub fn big_auto(name: impl Into<String>) -> Self {
        Self::new(name, SqlType::BigInt)
            .primary_key(true)
            .auto_increment(true)
    }

    /// Override the column name.
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.column = Some(name.into());
        self
    }

    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    pub fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    pub fn db_index(mut self, value: bool) -> Self {
        self.db_index = value;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn auto_now(mut self, value: bool) -> Self {
        self.auto_now = value;
        self
    }

    pub fn auto_now_add(mut self, value: bool) -> Self {
        self.auto_now_add = value;
        self
    }

    /// The database column name.
    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }

    /// The value a freshly constructed record starts with.
    pub fn initial_value(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }
}

/// An ordinary foreign key: a relation stored in a column of its own.
///
/// The column is named after `attname` (`<name>_id`) unless overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    /// Target model reference (`Model`, `app.Model` or `self`)
    pub target: String,
    /// Target attribute the column holds; the target's pk when `None`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_field: Option<String>,
    pub on_delete: OnDelete,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub one_to_one: bool,
    #[serde(default)]
    pub parent_link: bool,
    #[serde(default)]
    pub primary_key: bool,
    /// Created by registration rather than declared
    #[serde(default)]
    pub auto_created: bool,
    #[serde(default = "default_true")]
    pub db_constraint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub sql_type: SqlType,
}

fn default_true() -> bool {
    true
}

impl ForeignKey {
    /// Create a many-to-one foreign key to `target`.
    pub fn new(name: impl Into<String>, target: impl Into<String>, on_delete: OnDelete) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            to_field: None,
            on_delete,
            nullable: false,
            one_to_one: false,
            parent_link: false,
            primary_key: false,
            auto_created: false,
            db_constraint: true,
            column: None,
            sql_type: SqlType::BigInt,
        }
    }

    /// Create a one-to-one foreign key to `target`.
    pub fn one_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        on_delete: OnDelete,
    ) -> Self {
        let mut fk = Self::new(name, target, on_delete);
        fk.one_to_one = true;
        fk
    }

    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub fn to_field(mut self, name: impl Into<String>) -> Self {
        self.to_field = Some(name.into());
        self
    }

    pub fn parent_link(mut self, value: bool) -> Self {
        self.parent_link = value;
        self
    }

    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.column = Some(name.into());
        self
    }

    pub fn db_constraint(mut self, value: bool) -> Self {
        self.db_constraint = value;
        self
    }

    /// Attribute name holding the referenced value.
    pub fn attname(&self) -> String {
        format!("{}_id", self.name)
    }

    /// The concrete field this relation stores its value in.
    pub fn backing_field(&self) -> FieldInfo {
        let mut field = FieldInfo::new(self.attname(), self.sql_type.clone())
            .nullable(self.nullable)
            .unique(self.one_to_one)
            .primary_key(self.primary_key);
        field.column.clone_from(&self.column);
        field
    }
}
