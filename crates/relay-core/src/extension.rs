//! Extension descriptors exchanged with the agent server.
//!
//! The core never interprets extension settings beyond the name; the rest
//! of the object is carried opaquely to `add_to_session`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Configuration of one extension (`{name, type, ...}` on the wire).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    pub name: String,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl ExtensionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: Map::new(),
        }
    }

    /// The `type` field (`builtin`, `stdio`, `sse`, ...), when present.
    pub fn kind(&self) -> Option<&str> {
        self.settings.get("type").and_then(Value::as_str)
    }
}

/// A configured extension and whether it is switched on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionEntry {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub config: ExtensionConfig,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_entry_flattens_config() {
        let entry: ExtensionEntry = serde_json::from_value(json!({
            "enabled": true,
            "name": "developer",
            "type": "builtin",
            "timeout": 300
        }))
        .unwrap();

        assert!(entry.enabled);
        assert_eq!(entry.config.name, "developer");
        assert_eq!(entry.config.kind(), Some("builtin"));

        let config = serde_json::to_value(&entry.config).unwrap();
        assert_eq!(config, json!({"name": "developer", "type": "builtin", "timeout": 300}));
    }
}
