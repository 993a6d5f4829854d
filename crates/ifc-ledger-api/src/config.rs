//! YAML configuration for ledger sessions.

use std::path::{Path, PathBuf};

use ifc_ledger_core::ReactivationPolicy;
use ifc_ledger_model::{ExtractOptions, WriteBackOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Every field is optional in the file; missing ones take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// Ledger database path
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Element class tracked by ingestion
    #[serde(default = "default_element_type")]
    pub element_type: String,
    #[serde(default = "default_true")]
    pub include_subtypes: bool,
    /// Spatial class whose name becomes the container
    #[serde(default = "default_container_type")]
    pub container_type: String,
    #[serde(default = "default_max_container_depth")]
    pub max_container_depth: usize,
    #[serde(default)]
    pub reactivation: ReactivationPolicy,
    /// Property set stamped by approval write-back
    #[serde(default = "default_property_set")]
    pub property_set: String,
}

fn default_database() -> PathBuf {
    PathBuf::from("ifc_database.db")
}

fn default_element_type() -> String {
    "IfcBuildingElementProxy".to_string()
}

fn default_true() -> bool {
    true
}

fn default_container_type() -> String {
    "IfcBuildingStorey".to_string()
}

fn default_max_container_depth() -> usize {
    64
}

fn default_property_set() -> String {
    WriteBackOptions::default().property_set
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            element_type: default_element_type(),
            include_subtypes: default_true(),
            container_type: default_container_type(),
            max_container_depth: default_max_container_depth(),
            reactivation: ReactivationPolicy::default(),
            property_set: default_property_set(),
        }
    }
}

impl LedgerConfig {
    /// Load and validate a YAML config file.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or validated.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&content)
    }

    /// # Errors
    /// Returns [`ConfigError`] when the YAML is malformed or fails validation.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserialises to unit, not to an empty mapping.
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Validation`] for blank type names, zero depth,
    /// or a blank property set name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.as_os_str().is_empty() {
            return Err(ConfigError::Validation("database path cannot be empty".into()));
        }
        for (field, value) in [
            ("element_type", &self.element_type),
            ("container_type", &self.container_type),
            ("property_set", &self.property_set),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("{field} cannot be empty")));
            }
        }
        if self.max_container_depth == 0 {
            return Err(ConfigError::Validation("max_container_depth must be at least 1".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            element_type: self.element_type.clone(),
            include_subtypes: self.include_subtypes,
            container_type: self.container_type.clone(),
            max_depth: self.max_container_depth,
        }
    }

    #[must_use]
    pub fn write_back_options(&self) -> WriteBackOptions {
        WriteBackOptions { property_set: self.property_set.clone() }
    }
}
