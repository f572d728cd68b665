//! SQL identifier quoting and model-name validation.

use regex::Regex;
use std::sync::OnceLock;

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` → `""`).
///
/// ```
/// use splitmodel_core::quote_ident;
///
/// assert_eq!(quote_ident("testapp_child"), "\"testapp_child\"");
/// assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL identifier using MySQL backtick quoting.
#[inline]
pub fn quote_ident_mysql(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn model_reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z_][A-Za-z0-9_]*\.)?[A-Za-z_][A-Za-z0-9_]*$")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

/// Is `name` usable as a relation target?
///
/// Accepts `Model`, `app_label.Model` and the recursive marker `self`.
pub fn is_valid_model_reference(name: &str) -> bool {
    model_reference_pattern().is_match(name)
}

/// Strip an `app_label.` prefix from a model reference.
pub fn model_name_of(reference: &str) -> &str {
    reference.rsplit('.').next().unwrap_or(reference)
}
