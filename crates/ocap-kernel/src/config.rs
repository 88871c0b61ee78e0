//! Cluster and kernel configuration.

use std::collections::BTreeMap;
use std::path::Path;

use ocap_ipc::VatConfig;
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// A set of vats launched together, optionally introduced to each other by a
/// bootstrap vat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Name of the vat whose root receives `bootstrap(roots, services)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<String>,
    /// Wipe all kernel state before launching
    #[serde(default)]
    pub force_reset: bool,
    pub vats: BTreeMap<String, VatConfig>,
}

impl ClusterConfig {
    pub fn from_json(json: &str) -> Result<Self, KernelError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| KernelError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KernelError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| KernelError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// The bootstrap vat, if named, must be one of the cluster's vats.
    pub fn validate(&self) -> Result<(), KernelError> {
        if let Some(name) = &self.bootstrap {
            if !self.vats.contains_key(name) {
                return Err(KernelError::Config(format!(
                    "bootstrap vat {:?} is not in the cluster",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelOptions {
    /// Clear the store before starting
    pub reset_storage: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cluster() {
        let config = ClusterConfig::from_json(
            r#"{
                "bootstrap": "alice",
                "forceReset": true,
                "vats": {
                    "alice": { "bundleName": "alice" },
                    "bob": { "sourceSpec": "bob.js", "parameters": { "name": "Bob" } }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.bootstrap.as_deref(), Some("alice"));
        assert!(config.force_reset);
        assert_eq!(config.vats.len(), 2);
    }

    #[test]
    fn test_unknown_bootstrap_rejected() {
        let err = ClusterConfig::from_json(
            r#"{ "bootstrap": "carol", "vats": { "alice": { "bundleName": "a" } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }

    #[test]
    fn test_bad_vat_config_rejected() {
        let err = ClusterConfig::from_json(r#"{ "vats": { "alice": {} } }"#).unwrap_err();
        assert!(err.to_string().contains("names no source"));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ClusterConfig::from_file("/nonexistent/cluster.json"),
            Err(KernelError::Config(_))
        ));
    }
}
