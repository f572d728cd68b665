//! Error types for splitmodel operations.

use std::fmt;

/// The primary error type for all splitmodel operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (open, close)
    Connection(ConnectionError),
    /// Query execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Schema/migration errors
    Schema(SchemaError),
    /// Declaration-time usage errors and illegal writes through a shared relation
    Usage(UsageError),
    /// Object lookup failures
    Lookup(LookupError),
    /// Data integrity errors raised while writing or deleting
    Integrity(IntegrityError),
    /// The backend lacks a feature the operation requires
    Capability(CapabilityError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost or already closed
    Disconnected,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Database busy or locked
    Busy,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// COMMIT/RELEASE issued with no open transaction
    NotActive,
    /// Savepoint not found
    SavepointNotFound,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Model not present in the migration state
    ModelNotFound,
    /// Field not present in the migration state
    FieldNotFound,
    /// Invalid schema definition
    Invalid,
    /// Requested behavior is not implemented (for this dialect or at all)
    Unsupported,
    /// Migration bookkeeping error
    Migration,
}

/// A usage error names what was misused and how.
#[derive(Debug, Clone)]
pub struct UsageError {
    /// The model, relation or record the error is about, e.g. `Child.parenta_ptr`
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct LookupError {
    pub kind: LookupErrorKind,
    pub model: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupErrorKind {
    /// A query expected exactly one row and found none
    DoesNotExist,
    /// A query expected exactly one row and found several
    MultipleObjectsReturned,
    /// A relation value points at a target row that does not exist
    InvalidReference,
}

#[derive(Debug, Clone)]
pub struct IntegrityError {
    pub kind: IntegrityErrorKind,
    pub model: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityErrorKind {
    /// A linked unit's identity disagrees with the primary unit's identity
    SharedIdentityMismatch,
    /// A PROTECT or RESTRICT reference blocks a delete
    ProtectedReference,
    /// An update that had to touch a row touched none
    NothingUpdated,
}

#[derive(Debug, Clone)]
pub struct CapabilityError {
    /// Name of the missing backend feature
    pub feature: &'static str,
    pub message: String,
}

impl Error {
    /// Shorthand for a [`UsageError`].
    pub fn usage(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            subject: subject.into(),
            message: message.into(),
        })
    }

    /// Shorthand for a [`SchemaError`] without a source.
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for an [`IntegrityError`].
    pub fn integrity(
        kind: IntegrityErrorKind,
        model: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Integrity(IntegrityError {
            kind,
            model: model.into(),
            message: message.into(),
        })
    }

    /// Shorthand for a [`LookupError`].
    pub fn lookup(kind: LookupErrorKind, model: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Lookup(LookupError {
            kind,
            model: model.into(),
            message: message.into(),
        })
    }

    /// Is this a "query matched no rows" lookup error?
    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, Error::Lookup(l) if l.kind == LookupErrorKind::DoesNotExist)
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Usage(e) => write!(f, "{}", e),
            Error::Lookup(e) => write!(f, "{}", e.message),
            Error::Integrity(e) => write!(f, "Integrity error on {}: {}", e.model, e.message),
            Error::Capability(e) => write!(f, "Unsupported by backend ({}): {}", e.feature, e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Schema(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.message)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        Error::Usage(err)
    }
}

impl From<CapabilityError> for Error {
    fn from(err: CapabilityError) -> Self {
        Error::Capability(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for splitmodel operations.
pub type Result<T> = std::result::Result<T, Error>;
