//! SQLite driver for splitmodel.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! Implements the `Connection` trait from splitmodel-core over the bundled
//! libsqlite3. SQLite reports generated keys through `RETURNING` and
//! supports `UPDATE .. FROM`, so every session and migration feature works
//! on it.
//!
//! ```rust,ignore
//! use splitmodel_sqlite::SqliteConnection;
//!
//! let conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("CREATE TABLE \"testapp_parenta\" (\"aid\" INTEGER PRIMARY KEY, \"para_name\" TEXT)")?;
//! ```
//!
//! # Type Mapping
//!
//! | Value | SQLite storage |
//! |-------|----------------|
//! | `Bool` | INTEGER (0/1) |
//! | `Int`, `BigInt` | INTEGER |
//! | `Double` | REAL |
//! | `Text` | TEXT |
//! | `Bytes` | BLOB |
//! | `Timestamp` | INTEGER (µs since epoch) |
//! | `Json` | TEXT |

pub mod connection;
pub mod ffi;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteConnection};

/// The bundled SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version() {
        let version = sqlite_version();
        assert!(
            version.starts_with('3'),
            "Expected SQLite 3.x, got {}",
            version
        );
    }
}
