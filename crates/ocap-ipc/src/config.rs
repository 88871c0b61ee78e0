//! Vat configuration records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// Where a vat's code comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VatSource {
    /// Path or URL of source to bundle at launch
    SourceSpec(String),
    /// Path or URL of a prebuilt bundle
    BundleSpec(String),
    /// Name of a bundle the worker already knows
    BundleName(String),
}

/// Configuration for one vat.
///
/// Exactly one source must be given. Serialized in the camelCase record form
/// (`{"bundleName": "...", "parameters": {...}}`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "VatConfigRecord", into = "VatConfigRecord")]
pub struct VatConfig {
    pub source: VatSource,
    pub creation_options: Option<Value>,
    pub parameters: Option<BTreeMap<String, Value>>,
}

impl VatConfig {
    pub fn new(source: VatSource) -> Self {
        Self {
            source,
            creation_options: None,
            parameters: None,
        }
    }

    pub fn bundle_name(name: impl Into<String>) -> Self {
        Self::new(VatSource::BundleName(name.into()))
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, Value>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_creation_options(mut self, options: Value) -> Self {
        self.creation_options = Some(options);
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VatConfigRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bundle_spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bundle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    creation_options: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parameters: Option<BTreeMap<String, Value>>,
}

impl TryFrom<VatConfigRecord> for VatConfig {
    type Error = ConfigError;

    fn try_from(record: VatConfigRecord) -> Result<Self, Self::Error> {
        let mut sources = Vec::new();
        if let Some(s) = record.source_spec {
            sources.push(VatSource::SourceSpec(s));
        }
        if let Some(s) = record.bundle_spec {
            sources.push(VatSource::BundleSpec(s));
        }
        if let Some(s) = record.bundle_name {
            sources.push(VatSource::BundleName(s));
        }
        if sources.len() > 1 {
            return Err(ConfigError::ConflictingSources(sources.len()));
        }
        let source = sources.pop().ok_or(ConfigError::MissingSource)?;
        Ok(Self {
            source,
            creation_options: record.creation_options,
            parameters: record.parameters,
        })
    }
}

impl From<VatConfig> for VatConfigRecord {
    fn from(config: VatConfig) -> Self {
        let mut record = VatConfigRecord {
            creation_options: config.creation_options,
            parameters: config.parameters,
            ..Default::default()
        };
        match config.source {
            VatSource::SourceSpec(s) => record.source_spec = Some(s),
            VatSource::BundleSpec(s) => record.bundle_spec = Some(s),
            VatSource::BundleName(s) => record.bundle_name = Some(s),
        }
        record
    }
}
