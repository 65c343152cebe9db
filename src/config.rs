// SPDX-License-Identifier: Apache-2.0

//! Session and tracing configuration
//!
//! Values come from defaults, an optional JSON file and `OMOPFED_*`
//! environment overrides, in that order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use omopfed_core::{validate_column_name, MergeSuffixes, OmopError, OmopResult, Symbol};

const ENV_SUBJECT_TABLE: &str = "OMOPFED_SUBJECT_TABLE";
const ENV_CONCEPT_TABLE: &str = "OMOPFED_CONCEPT_TABLE";
const ENV_LINK_COLUMN: &str = "OMOPFED_LINK_COLUMN";
const ENV_SYMBOL_PREFIX: &str = "OMOPFED_SYMBOL_PREFIX";
const ENV_VERIFY_ROW_COUNTS: &str = "OMOPFED_VERIFY_ROW_COUNTS";
const ENV_LOG_DIR: &str = "OMOPFED_LOG_DIR";
const ENV_LOG_JSON: &str = "OMOPFED_LOG_JSON";

/// Behaviour of a session against the federation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Subject dictionary table the base table is seeded from
    pub subject_table: String,
    /// Concept dictionary table (reference data, never appended). A
    /// `LocalFederation` reads names from it once built with
    /// `with_session_config`.
    pub concept_table: String,
    /// Default link column on both sides of a merge
    pub link_column: String,
    /// Prefix of ephemeral symbols
    pub symbol_prefix: String,
    /// How many taken names the symbol manager skips before falling back
    /// to a UUID-suffixed name
    pub max_symbol_attempts: u32,
    pub merge_suffixes: MergeSuffixes,
    /// Compare base table row counts before and after every append
    pub verify_row_counts: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            subject_table: "person".to_string(),
            concept_table: "concept".to_string(),
            link_column: "person_id".to_string(),
            symbol_prefix: "omop_tmp".to_string(),
            max_symbol_attempts: 8,
            merge_suffixes: MergeSuffixes::default(),
            verify_row_counts: false,
        }
    }
}

impl SessionConfig {
    /// Defaults with environment overrides applied.
    pub fn load() -> OmopResult<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON file (missing keys take defaults), then applies
    /// environment overrides.
    pub fn from_json_file(path: &Path) -> OmopResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OmopError::configuration(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let mut config: Self = serde_json::from_str(&content).map_err(|e| {
            OmopError::configuration(format!("Failed to parse config {}: {e}", path.display()))
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(value) = env_string(ENV_SUBJECT_TABLE) {
            self.subject_table = value;
        }
        if let Some(value) = env_string(ENV_CONCEPT_TABLE) {
            self.concept_table = value;
        }
        if let Some(value) = env_string(ENV_LINK_COLUMN) {
            self.link_column = value;
        }
        if let Some(value) = env_string(ENV_SYMBOL_PREFIX) {
            self.symbol_prefix = value;
        }
        if let Some(value) = env_bool(ENV_VERIFY_ROW_COUNTS) {
            self.verify_row_counts = value;
        }
    }

    pub fn validate(&self) -> OmopResult<()> {
        validate_column_name(&self.link_column)?;
        Symbol::parse(self.symbol_prefix.as_str())?;
        for table in [&self.subject_table, &self.concept_table] {
            if table.trim().is_empty() {
                return Err(OmopError::configuration("Reference table names must not be empty"));
            }
        }
        if self.max_symbol_attempts == 0 {
            return Err(OmopError::configuration("max_symbol_attempts must be at least 1"));
        }
        if self.merge_suffixes.right.is_empty() {
            return Err(OmopError::configuration(
                "The right merge suffix must not be empty",
            ));
        }
        Ok(())
    }

    /// Normalized names of the reference tables bulk operations never append.
    pub fn reference_tables(&self) -> [String; 2] {
        [
            self.subject_table.trim().to_lowercase(),
            self.concept_table.trim().to_lowercase(),
        ]
    }
}

/// Where and how tracing output is written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub default_filter: String,
    /// Daily rolling log files go here; stderr when unset
    pub log_dir: Option<PathBuf>,
    pub json: bool,
    pub retention_days: u64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_filter: "omopfed=info".to_string(),
            log_dir: None,
            json: false,
            retention_days: 14,
        }
    }
}

impl TracingConfig {
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Some(dir) = env_string(ENV_LOG_DIR) {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(json) = env_bool(ENV_LOG_JSON) {
            config.json = json;
        }
        config
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|value| {
        matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
