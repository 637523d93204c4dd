//! Generic log patterns
//!
//! Fast-path cluster identification: a pattern names a cluster and lists
//! substrings that must all appear somewhere in a log file.
//!
//! ```yaml
//! generic_logs:
//!   - contains_strings: ["Aerospike Vector Search", "starting server"]
//!     apply_cluster_name: avs
//! ```

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Patterns {
    pub generic_logs: Vec<GenericLogPattern>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenericLogPattern {
    pub contains_strings: Vec<String>,
    pub apply_cluster_name: String,
}

impl Patterns {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| IngestError::Config(format!("invalid patterns document: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;
        Self::from_yaml(&text)
    }

    /// Patterns with no required strings can never complete and are dropped
    pub fn usable(&self) -> impl Iterator<Item = &GenericLogPattern> {
        self.generic_logs
            .iter()
            .filter(|p| !p.contains_strings.is_empty())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_patterns_document() {
        let patterns = Patterns::from_yaml(
            "generic_logs:\n  - contains_strings: [\"alpha\", \"beta\"]\n    apply_cluster_name: proxy\n  - contains_strings: []\n",
        )
        .unwrap();
        assert_eq!(patterns.generic_logs.len(), 2);
        assert_eq!(patterns.usable().count(), 1);
        assert_eq!(patterns.generic_logs[0].apply_cluster_name, "proxy");
    }

    #[test]
    fn test_empty_document_means_no_patterns() {
        let patterns = Patterns::from_yaml("{}").unwrap();
        assert!(patterns.generic_logs.is_empty());
    }
}
