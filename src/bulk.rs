// SPDX-License-Identifier: Apache-2.0

//! Bulk/auto orchestrator
//!
//! Appends many tables in one pass. Each table is attempted independently:
//! a failure is recorded in the report and the pass moves on, leaving the
//! tables already appended in place.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use omopfed_core::{ConceptId, FederationGateway, OmopError, OmopResult, ServerId};

use crate::append::{self, AppendRequest};
use crate::catalog;
use crate::heuristics::heuristic_columns;
use crate::metrics;
use crate::session::SessionState;

/// Inputs of a bulk pass
#[derive(Debug, Clone, Default)]
pub struct BulkOptions {
    /// Tables to append (None = every table in the catalog)
    pub tables: Option<Vec<String>>,
    /// Column filter, expanded per table by the column heuristics
    pub columns: Option<BTreeSet<String>>,
    pub concepts: Option<BTreeSet<ConceptId>>,
    /// Suppress advisories about omitted filters
    pub silent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Subject or concept dictionary table
    ReferenceTable,
    /// Already listed earlier in the same pass
    Duplicate,
    /// No server has the table
    TableNotFound,
    /// No server's copy of the table carries the link column
    MissingLinkColumn,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableOutcome {
    Appended {
        table: String,
        servers: Vec<ServerId>,
        /// Servers whose copy of the table lacks the link column
        skipped_servers: Vec<ServerId>,
    },
    Skipped {
        table: String,
        reason: SkipReason,
    },
    Failed {
        table: String,
        error: OmopError,
    },
}

impl TableOutcome {
    pub fn table(&self) -> &str {
        match self {
            Self::Appended { table, .. } | Self::Skipped { table, .. } | Self::Failed { table, .. } => {
                table
            }
        }
    }

    pub fn is_appended(&self) -> bool {
        matches!(self, Self::Appended { .. })
    }
}

/// One outcome per requested table, in request order
#[derive(Debug, Clone, Serialize)]
pub struct BulkReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<TableOutcome>,
    pub advisories: Vec<String>,
}

impl BulkReport {
    pub fn appended(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|o| o.is_appended())
            .map(TableOutcome::table)
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &OmopError)> {
        self.outcomes.iter().filter_map(|o| match o {
            TableOutcome::Failed { table, error } => Some((table.as_str(), error)),
            _ => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&str, SkipReason)> {
        self.outcomes.iter().filter_map(|o| match o {
            TableOutcome::Skipped { table, reason } => Some((table.as_str(), *reason)),
            _ => None,
        })
    }

    pub fn outcome(&self, table: &str) -> Option<&TableOutcome> {
        self.outcomes.iter().find(|o| o.table() == table)
    }
}

/// Runs a bulk pass over the session's base table.
///
/// Only table discovery can fail the pass as a whole; every per-table error
/// ends up in the report.
#[instrument(skip(gateway, state, options), fields(silent = options.silent))]
pub async fn run(
    gateway: &Arc<dyn FederationGateway>,
    state: &SessionState,
    options: &BulkOptions,
) -> OmopResult<BulkReport> {
    let started_at = Utc::now();
    let mut advisories = Vec::new();
    let mut advise = |message: &str| {
        if !options.silent {
            warn!("{message}");
            advisories.push(message.to_string());
        }
    };

    let requested: Vec<String> = match &options.tables {
        Some(tables) => tables.clone(),
        None => {
            advise("No tables given: appending every table in the catalog");
            catalog::resolve_tables(gateway.as_ref(), &state.resources, None).await?
        }
    };
    if options.columns.is_none() {
        advise("No column filter given: every column of each table will be appended");
    }
    if options.concepts.is_none() {
        advise("No concept filter given: every concept of each table will be pivoted");
    }

    let reference = state.config.reference_tables();
    let link = state.config.link_column.as_str();
    let mut seen = HashSet::new();
    let mut outcomes = Vec::with_capacity(requested.len());

    for raw in &requested {
        let table = raw.trim().to_lowercase();
        if table.is_empty() {
            continue;
        }
        let outcome = if !seen.insert(table.clone()) {
            TableOutcome::Skipped {
                table,
                reason: SkipReason::Duplicate,
            }
        } else if reference.contains(&table) {
            TableOutcome::Skipped {
                table,
                reason: SkipReason::ReferenceTable,
            }
        } else {
            append_table(gateway, state, options, table, link).await
        };

        match &outcome {
            TableOutcome::Skipped { table, reason } => {
                metrics::record_skip();
                info!(table = %table, reason = ?reason, "Skipped table");
            }
            TableOutcome::Failed { table, error } => {
                warn!(table = %table, kind = error.kind(), error = %error, "Table failed, continuing");
            }
            TableOutcome::Appended { .. } => {}
        }
        outcomes.push(outcome);
    }

    Ok(BulkReport {
        started_at,
        finished_at: Utc::now(),
        outcomes,
        advisories,
    })
}

async fn append_table(
    gateway: &Arc<dyn FederationGateway>,
    state: &SessionState,
    options: &BulkOptions,
    table: String,
    link: &str,
) -> TableOutcome {
    let available = match gateway.columns(&state.resources, &table).await {
        Ok(available) => available,
        Err(error) => return TableOutcome::Failed { table, error },
    };
    let present: Vec<(&ServerId, &BTreeSet<String>)> = state
        .servers
        .iter()
        .filter_map(|server| available.get(server).map(|columns| (server, columns)))
        .collect();
    if present.is_empty() {
        return TableOutcome::Skipped {
            table,
            reason: SkipReason::TableNotFound,
        };
    }

    let mut eligible = Vec::new();
    let mut skipped_servers = Vec::new();
    for (server, columns) in present {
        if columns.iter().any(|column| column.eq_ignore_ascii_case(link)) {
            eligible.push(server.clone());
        } else {
            skipped_servers.push(server.clone());
        }
    }
    if eligible.is_empty() {
        return TableOutcome::Skipped {
            table,
            reason: SkipReason::MissingLinkColumn,
        };
    }
    if !skipped_servers.is_empty() {
        warn!(table = %table, servers = ?skipped_servers, "Link column missing on some servers");
    }

    let request = AppendRequest {
        table: table.clone(),
        columns: heuristic_columns(&table, options.columns.as_ref()),
        concepts: options.concepts.clone(),
        link_left: None,
        link_right: None,
        servers: Some(eligible.clone()),
    };
    match append::append(gateway, state, &request).await {
        Ok(_) => TableOutcome::Appended {
            table,
            servers: eligible,
            skipped_servers,
        },
        Err(error) => TableOutcome::Failed { table, error },
    }
}
