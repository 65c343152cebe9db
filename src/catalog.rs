// SPDX-License-Identifier: Apache-2.0

//! Catalog explorer and combiner
//!
//! Discovers tables, columns and concepts on every server and folds them
//! into per-server or federation-wide views. Only metadata is combined.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, instrument};

use omopfed_core::{
    ConceptDictionary, FederationGateway, OmopError, OmopResult, Resources, ServerMap,
};

/// Per-server `{table → {column}}`
pub type ColumnCatalog = ServerMap<BTreeMap<String, BTreeSet<String>>>;

/// Length of the ellipsis that marks a truncated concept name.
const ELLIPSIS: &str = "...";

/// Tables each server exposes.
pub async fn tables(
    gateway: &dyn FederationGateway,
    resources: &Resources,
) -> OmopResult<ServerMap<BTreeSet<String>>> {
    gateway.tables(resources).await
}

/// Resolves an optional table selection: normalized and deduplicated in the
/// given order, or every table of the federation when unset.
pub async fn resolve_tables(
    gateway: &dyn FederationGateway,
    resources: &Resources,
    selection: Option<&[String]>,
) -> OmopResult<Vec<String>> {
    match selection {
        Some(tables) => Ok(normalize_tables(tables)),
        None => Ok(combine_tables(&gateway.tables(resources).await?)
            .into_iter()
            .collect()),
    }
}

/// Lowercases, trims and deduplicates table names, keeping first-seen order.
pub fn normalize_tables(tables: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    tables
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

/// Columns of each selected table on each server.
///
/// A table missing on a server is omitted for that server; a table whose
/// lookup fails is skipped. Fails with `NotFound` only when nothing resolves.
#[instrument(skip(gateway, resources, selection))]
pub async fn columns(
    gateway: &dyn FederationGateway,
    resources: &Resources,
    selection: Option<&[String]>,
) -> OmopResult<ColumnCatalog> {
    let tables = resolve_tables(gateway, resources, selection).await?;
    let mut catalog = ColumnCatalog::new();

    for table in &tables {
        match gateway.columns(resources, table).await {
            Ok(per_server) => {
                for (server, columns) in per_server {
                    if !columns.is_empty() {
                        catalog.entry(server).or_default().insert(table.clone(), columns);
                    }
                }
            }
            Err(err) => debug!(table = %table, error = %err, "Skipping table in column lookup"),
        }
    }

    if catalog.is_empty() {
        return Err(OmopError::not_found(format!(
            "No columns found for tables [{}] on any server",
            tables.join(", ")
        )));
    }
    Ok(catalog)
}

/// Concepts of the selected tables, concatenated into one dictionary per
/// server, with names optionally truncated to `max_name_length` characters.
#[instrument(skip(gateway, resources, selection))]
pub async fn concepts(
    gateway: &dyn FederationGateway,
    resources: &Resources,
    selection: Option<&[String]>,
    max_name_length: Option<usize>,
) -> OmopResult<ServerMap<ConceptDictionary>> {
    if let Some(max) = max_name_length {
        if max < ELLIPSIS.len() {
            return Err(OmopError::configuration(format!(
                "max_name_length must be at least {}, got {max}",
                ELLIPSIS.len()
            )));
        }
    }

    let tables = resolve_tables(gateway, resources, selection).await?;
    let mut catalog: ServerMap<ConceptDictionary> = ServerMap::new();

    for table in &tables {
        match gateway.concepts(resources, table).await {
            Ok(per_server) => {
                for (server, dictionary) in per_server {
                    if dictionary.is_empty() {
                        continue;
                    }
                    let merged = catalog.entry(server).or_default();
                    for (id, name) in dictionary {
                        let name = match max_name_length {
                            Some(max) => truncate_name(&name, max),
                            None => name,
                        };
                        merged.entry(id).or_insert(name);
                    }
                }
            }
            Err(err) => debug!(table = %table, error = %err, "Skipping table in concept lookup"),
        }
    }

    if catalog.is_empty() {
        return Err(OmopError::not_found(format!(
            "No concepts found for tables [{}] on any server",
            tables.join(", ")
        )));
    }
    Ok(catalog)
}

/// Truncates `name` to exactly `max` characters, the last three being `...`.
/// Names that already fit are returned unchanged.
pub fn truncate_name(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let mut truncated: String = name.chars().take(keep).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

/// Union of table names across the federation.
pub fn combine_tables(per_server: &ServerMap<BTreeSet<String>>) -> BTreeSet<String> {
    per_server.values().flatten().cloned().collect()
}

/// Union of `{table → {column}}` across the federation.
pub fn combine_columns(catalog: &ColumnCatalog) -> BTreeMap<String, BTreeSet<String>> {
    let mut combined: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for tables in catalog.values() {
        for (table, columns) in tables {
            combined
                .entry(table.clone())
                .or_default()
                .extend(columns.iter().cloned());
        }
    }
    combined
}

/// Union of concept dictionaries. On a name conflict the server with the
/// lowest id wins.
pub fn combine_concepts(catalog: &ServerMap<ConceptDictionary>) -> ConceptDictionary {
    let mut combined = ConceptDictionary::new();
    for (server, dictionary) in catalog {
        for (id, name) in dictionary {
            match combined.get(id) {
                Some(existing) if existing != name => {
                    debug!(server = %server, concept_id = id, "Conflicting concept name ignored");
                }
                Some(_) => {}
                None => {
                    combined.insert(*id, name.clone());
                }
            }
        }
    }
    combined
}
