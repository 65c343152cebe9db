// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for federated OMOP operations
//!
//! Gateway implementations map their transport- and server-specific failures
//! to these variants so the session layer can apply one propagation policy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stage of a remote round trip that produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStage {
    Fetch,
    Merge,
    Remove,
    Catalog,
    Verify,
}

impl fmt::Display for RemoteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Fetch => "fetch",
            Self::Merge => "merge",
            Self::Remove => "remove",
            Self::Catalog => "catalog",
            Self::Verify => "verify",
        };
        f.write_str(label)
    }
}

/// Unified error type for all federated OMOP operations
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum OmopError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filter on '{table}' excluded every row")]
    EmptyResult { table: String },

    #[error("Remote {stage} failed: {message}")]
    RemoteOperation { stage: RemoteStage, message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },
}

impl OmopError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration { message: msg.into() }
    }

    pub fn empty_result(table: impl Into<String>) -> Self {
        Self::EmptyResult { table: table.into() }
    }

    pub fn remote(stage: RemoteStage, msg: impl Into<String>) -> Self {
        Self::RemoteOperation {
            stage,
            message: msg.into(),
        }
    }

    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::remote(RemoteStage::Fetch, msg)
    }

    pub fn merge(msg: impl Into<String>) -> Self {
        Self::remote(RemoteStage::Merge, msg)
    }

    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::remote(RemoteStage::Catalog, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound { message: msg.into() }
    }

    /// Prefixes the message with the server that raised it.
    ///
    /// `EmptyResult` is federation-wide and is returned unchanged.
    pub fn on_server(self, server: &str) -> Self {
        match self {
            Self::Configuration { message } => Self::Configuration {
                message: format!("server '{server}': {message}"),
            },
            Self::RemoteOperation { stage, message } => Self::RemoteOperation {
                stage,
                message: format!("server '{server}': {message}"),
            },
            Self::NotFound { message } => Self::NotFound {
                message: format!("server '{server}': {message}"),
            },
            other @ Self::EmptyResult { .. } => other,
        }
    }

    /// Short machine-readable label, used in logs and outcome reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::EmptyResult { .. } => "empty_result",
            Self::RemoteOperation { .. } => "remote_operation",
            Self::NotFound { .. } => "not_found",
        }
    }
}

/// Result type alias for federated OMOP operations
pub type OmopResult<T> = Result<T, OmopError>;
