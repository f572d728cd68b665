//! Session configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Connection alias stamped on records this session saves or loads.
    pub alias: String,
    /// Rows per multi-row INSERT in `bulk_create`.
    pub bulk_batch_size: usize,
    /// How deep `select_related()` with no names follows relations.
    pub max_select_related_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            alias: "default".to_string(),
            bulk_batch_size: 500,
            max_select_related_depth: 5,
        }
    }
}

impl SessionConfig {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Set the bulk insert batch size. Zero is treated as one.
    #[must_use]
    pub fn bulk_batch_size(mut self, size: usize) -> Self {
        self.bulk_batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn max_select_related_depth(mut self, depth: usize) -> Self {
        self.max_select_related_depth = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.alias, "default");
        assert_eq!(config.bulk_batch_size, 500);
        assert_eq!(config.max_select_related_depth, 5);
    }

    #[test]
    fn builder_clamps_batch_size() {
        let config = SessionConfig::new().alias("replica").bulk_batch_size(0);
        assert_eq!(config.alias, "replica");
        assert_eq!(config.bulk_batch_size, 1);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"alias": "other"}"#).unwrap();
        assert_eq!(config.alias, "other");
        assert_eq!(config.bulk_batch_size, 500);
    }
}
