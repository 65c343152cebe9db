// SPDX-License-Identifier: Apache-2.0

//! Join engine
//!
//! One append is one fetch into an ephemeral symbol followed by one left
//! join into the base table, on every target server. The ephemeral symbol is
//! released on every exit path before the outcome is returned.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, instrument, warn};

use omopfed_core::{
    ConceptId, FederationGateway, FetchRequest, LinkColumns, MergeRequest, OmopError,
    OmopResult, PersonFilter, RemoteStage, ServerId, ServerMap, Symbol, TableProfile,
};

use crate::metrics;
use crate::session::SessionState;

/// What to fetch and how to join it
#[derive(Debug, Clone, Default)]
pub struct AppendRequest {
    pub table: String,
    /// Columns to keep (None = all)
    pub columns: Option<BTreeSet<String>>,
    pub concepts: Option<BTreeSet<ConceptId>>,
    /// Base table side of the join key
    pub link_left: Option<String>,
    /// Fetched table side of the join key
    pub link_right: Option<String>,
    /// Restricts the append to these servers (None = every session server)
    pub servers: Option<Vec<ServerId>>,
}

impl AppendRequest {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }
}

/// Outcome of a successful append
#[derive(Debug, Clone, Serialize)]
pub struct AppendSummary {
    pub table: String,
    pub servers: Vec<ServerId>,
    /// Columns the base table gained per server, when row counts are verified
    pub columns_added: Option<ServerMap<usize>>,
    pub elapsed_ms: u64,
}

/// Fetches `request.table` and left-joins it into the session's base table.
///
/// The base table keeps every row; subjects without a match get nulls.
/// Errors from the fetch or merge stage are returned unchanged once the
/// ephemeral symbol is gone.
#[instrument(skip(gateway, state, request), fields(table = %request.table))]
pub async fn append(
    gateway: &Arc<dyn FederationGateway>,
    state: &SessionState,
    request: &AppendRequest,
) -> OmopResult<AppendSummary> {
    let link = LinkColumns::resolve(
        request.link_left.as_deref(),
        request.link_right.as_deref(),
        &state.config.link_column,
    )?;
    let servers = match &request.servers {
        Some(servers) => servers.clone(),
        None => state.servers.clone(),
    };
    if servers.is_empty() {
        return Err(OmopError::configuration(format!(
            "No servers to append '{}' on",
            request.table
        )));
    }

    let started = Instant::now();
    let before = if state.config.verify_row_counts {
        Some(gateway.profile(&state.base, &servers).await?)
    } else {
        None
    };

    let ephemeral = state.symbols.acquire(gateway, &servers).await;
    let outcome = fetch_and_merge(
        gateway.as_ref(),
        state,
        request,
        &link,
        ephemeral.symbol(),
        &servers,
    )
    .await;
    ephemeral.release().await;

    let columns_added = match (outcome, before) {
        (Err(err), _) => Err(err),
        (Ok(()), None) => Ok(None),
        (Ok(()), Some(before)) => verify(gateway.as_ref(), &state.base, &servers, &before)
            .await
            .map(Some),
    };

    let elapsed = started.elapsed();
    let elapsed_ms = elapsed.as_millis() as u64;
    metrics::record_append(elapsed.as_secs_f64() * 1000.0, columns_added.is_ok());

    match columns_added {
        Ok(columns_added) => {
            info!(elapsed_ms, servers = servers.len(), "Appended table");
            Ok(AppendSummary {
                table: request.table.clone(),
                servers,
                columns_added,
                elapsed_ms,
            })
        }
        Err(err) => {
            warn!(error = %err, "Append failed");
            Err(err)
        }
    }
}

async fn fetch_and_merge(
    gateway: &dyn FederationGateway,
    state: &SessionState,
    request: &AppendRequest,
    link: &LinkColumns,
    ephemeral: &Symbol,
    servers: &[ServerId],
) -> OmopResult<()> {
    gateway
        .get(&FetchRequest {
            resources: state.resources.clone(),
            table: request.table.clone(),
            symbol: ephemeral.clone(),
            columns: request.columns.clone(),
            concepts: request.concepts.clone(),
            person_filter: Some(PersonFilter {
                symbol: state.base.clone(),
                column: link.left.clone(),
            }),
            link_column: link.right.clone(),
            drop_empty_columns: true,
            servers: servers.to_vec(),
        })
        .await?;

    gateway
        .merge(&MergeRequest {
            base: state.base.clone(),
            other: ephemeral.clone(),
            link_left: link.left.clone(),
            link_right: link.right.clone(),
            keep_all_left: true,
            keep_all_right: false,
            suffixes: state.config.merge_suffixes.clone(),
            drop_duplicate_columns: true,
            result: state.base.clone(),
            servers: servers.to_vec(),
        })
        .await
}

/// Compares the base table before and after a merge. Returns the number of
/// columns gained per server.
async fn verify(
    gateway: &dyn FederationGateway,
    base: &Symbol,
    servers: &[ServerId],
    before: &ServerMap<TableProfile>,
) -> OmopResult<ServerMap<usize>> {
    let after = gateway.profile(base, servers).await.map_err(|err| match err {
        OmopError::NotFound { message } => OmopError::remote(
            RemoteStage::Verify,
            format!("Base table '{base}' missing after merge: {message}"),
        ),
        other => other,
    })?;
    let mut added = ServerMap::new();
    for (server, previous) in before {
        let Some(current) = after.get(server) else {
            return Err(OmopError::remote(
                RemoteStage::Verify,
                format!("Base table '{base}' missing after merge"),
            )
            .on_server(server.as_str()));
        };
        if current.rows != previous.rows {
            return Err(OmopError::remote(
                RemoteStage::Verify,
                format!(
                    "Base table '{base}' changed from {} to {} rows",
                    previous.rows, current.rows
                ),
            )
            .on_server(server.as_str()));
        }
        added.insert(
            server.clone(),
            current.columns.len().saturating_sub(previous.columns.len()),
        );
    }
    Ok(added)
}
