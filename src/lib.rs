// SPDX-License-Identifier: Apache-2.0

//! omopfed - federated OMOP CDM subject-table builder
//!
//! Builds one subject-level table per server by appending filtered CDM
//! tables through a [`FederationGateway`]. Row-level data never leaves the
//! server that holds it.

pub mod append;
pub mod bulk;
pub mod catalog;
pub mod config;
pub mod federation;
pub mod heuristics;
pub mod metrics;
pub mod observability;
pub mod session;
pub mod symbols;

pub use omopfed_core::*;

pub use append::{AppendRequest, AppendSummary};
pub use bulk::{BulkOptions, BulkReport, SkipReason, TableOutcome};
pub use config::{SessionConfig, TracingConfig};
pub use federation::{DuckDbServer, LocalFederation};
pub use session::{AppendOptions, GetOptions, OmopSession, SessionOptions, SessionState};
