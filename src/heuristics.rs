// SPDX-License-Identifier: Apache-2.0

//! Column name heuristics for OMOP table families
//!
//! CDM tables mix generic names (`start_date`) with table-prefixed ones
//! (`drug_exposure_start_date`, `condition_start_date`). A column filter given
//! once for many tables is expanded so that it matches either convention.

use std::collections::BTreeSet;

/// Compound-table suffixes stripped to obtain the short column prefix.
pub const COMPOUND_SUFFIXES: &[&str] = &["_occurrence", "_exposure", "_era"];

/// Lowercased table name with a known compound suffix removed.
///
/// `drug_exposure` → `drug`, `condition_occurrence` → `condition`,
/// `measurement` → `measurement`.
pub fn table_prefix(table: &str) -> String {
    let lower = table.trim().to_lowercase();
    for suffix in COMPOUND_SUFFIXES {
        if let Some(stripped) = lower.strip_suffix(suffix) {
            if !stripped.is_empty() {
                return stripped.to_string();
            }
        }
    }
    lower
}

/// Expands a column filter with table-prefixed variants.
///
/// `None` means "all columns" and stays `None`. Otherwise every requested
/// column is kept and `prefix_column` is added, plus `table_column` when the
/// table name carries a compound suffix.
pub fn heuristic_columns(
    table: &str,
    requested: Option<&BTreeSet<String>>,
) -> Option<BTreeSet<String>> {
    let requested = requested?;
    let full = table.trim().to_lowercase();
    let prefix = table_prefix(table);

    let mut expanded = BTreeSet::new();
    for column in requested {
        expanded.insert(column.clone());
        expanded.insert(format!("{prefix}_{column}"));
        if full != prefix {
            expanded.insert(format!("{full}_{column}"));
        }
    }
    Some(expanded)
}

/// Picks the concept-bearing column of a table among its available columns.
///
/// Tries `<prefix>_concept_id`, then `<table>_concept_id`, then `concept_id`.
pub fn concept_column<'a, I>(table: &str, available: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let available: BTreeSet<String> = available.into_iter().map(str::to_lowercase).collect();
    let full = table.trim().to_lowercase();
    let candidates = [
        format!("{}_concept_id", table_prefix(table)),
        format!("{full}_concept_id"),
        "concept_id".to_string(),
    ];
    candidates.into_iter().find(|c| available.contains(c))
}
