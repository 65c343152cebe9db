// SPDX-License-Identifier: Apache-2.0

//! SQL text for the DuckDB reference servers.
//!
//! Every identifier is quoted; concept ids are integers and are inlined.

use std::collections::{BTreeSet, HashSet};

use omopfed_core::{ConceptId, MergeRequest};

/// Schema holding session symbols on every server.
pub const SYMBOL_SCHEMA: &str = "main";

/// Row ordinal column added while reshaping, never part of an output.
const ORDINAL: &str = "__omopfed_ord";

/// Quotes an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Subject restriction of a fetch: `link IN (SELECT column FROM symbol)`.
pub struct SubjectRestriction<'a> {
    pub link: &'a str,
    pub symbol: &'a str,
    pub column: &'a str,
}

/// `SELECT *` over `source` with the concept and subject predicates applied.
pub fn filtered_source(
    source: &str,
    concept: Option<(&str, &BTreeSet<ConceptId>)>,
    subjects: Option<&SubjectRestriction<'_>>,
    non_null_link: Option<&str>,
) -> String {
    let mut predicates = Vec::new();

    if let Some((column, ids)) = concept {
        if ids.is_empty() {
            predicates.push("FALSE".to_string());
        } else {
            let list = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
            predicates.push(format!("{} IN ({list})", quote_ident(column)));
        }
    }

    if let Some(restriction) = subjects {
        predicates.push(format!(
            "{} IN (SELECT {} FROM {})",
            quote_ident(restriction.link),
            quote_ident(restriction.column),
            qualified(SYMBOL_SCHEMA, restriction.symbol)
        ));
    }

    if let Some(link) = non_null_link {
        predicates.push(format!("{} IS NOT NULL", quote_ident(link)));
    }

    let mut sql = format!("SELECT * FROM {source}");
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    sql
}

/// Columns ranking a table's records, earliest first: the start date (or
/// first date) column, then the table's own id. Empty when neither exists.
pub fn record_order(table: &str, available: &[String]) -> Vec<String> {
    let mut order = Vec::new();
    let date = available
        .iter()
        .find(|c| c.to_lowercase().ends_with("start_date"))
        .or_else(|| available.iter().find(|c| c.to_lowercase().ends_with("_date")));
    if let Some(date) = date {
        order.push(date.clone());
    }
    let id = format!("{table}_id");
    if let Some(id) = available.iter().find(|c| c.eq_ignore_ascii_case(&id)) {
        order.push(id.clone());
    }
    order
}

fn ordered(filtered: &str, order: &[String]) -> String {
    let window = if order.is_empty() {
        String::new()
    } else {
        let keys = order
            .iter()
            .map(|c| format!("{} NULLS LAST", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("ORDER BY {keys}")
    };
    format!(
        "(SELECT *, row_number() OVER ({window}) AS {} FROM ({filtered}) AS filtered) AS ordered",
        quote_ident(ORDINAL)
    )
}

/// Binds the filtered rows as they are, restricted to `columns`.
pub fn project(target: &str, filtered: &str, columns: &[String]) -> String {
    let list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    format!(
        "CREATE OR REPLACE TABLE {} AS SELECT {list} FROM ({filtered}) AS filtered",
        qualified(SYMBOL_SCHEMA, target)
    )
}

/// One row per subject, keeping the earliest record's values (by `order`).
pub fn collapse(target: &str, filtered: &str, link: &str, values: &[String], order: &[String]) -> String {
    let mut select = vec![quote_ident(link)];
    for column in values {
        select.push(format!(
            "arg_min({}, {}) AS {}",
            quote_ident(column),
            quote_ident(ORDINAL),
            quote_ident(column)
        ));
    }
    format!(
        "CREATE OR REPLACE TABLE {} AS SELECT {} FROM {} GROUP BY {}",
        qualified(SYMBOL_SCHEMA, target),
        select.join(", "),
        ordered(filtered, order),
        quote_ident(link)
    )
}

/// One row per subject, one column per (concept, value column), keeping the
/// earliest record of each concept. Output columns are `<slug>.<column>`.
pub fn pivot(
    target: &str,
    filtered: &str,
    link: &str,
    concept_column: &str,
    concepts: &[(ConceptId, String)],
    values: &[String],
    order: &[String],
) -> String {
    let mut select = vec![quote_ident(link)];
    for (id, slug) in concepts {
        for column in values {
            select.push(format!(
                "arg_min({}, {}) FILTER (WHERE {} = {id}) AS {}",
                quote_ident(column),
                quote_ident(ORDINAL),
                quote_ident(concept_column),
                quote_ident(&format!("{slug}.{column}"))
            ));
        }
    }
    format!(
        "CREATE OR REPLACE TABLE {} AS SELECT {} FROM {} GROUP BY {}",
        qualified(SYMBOL_SCHEMA, target),
        select.join(", "),
        ordered(filtered, order),
        quote_ident(link)
    )
}

/// Column-name-safe label for a concept, unique within `taken`.
pub fn concept_slug(id: ConceptId, name: Option<&str>, taken: &mut HashSet<String>) -> String {
    let mut slug = String::new();
    for c in name.unwrap_or_default().trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_end_matches('_').to_string();

    let base = if slug.is_empty() || slug.starts_with(|c: char| c.is_ascii_digit()) {
        format!("concept_{id}")
    } else {
        slug
    };
    let mut slug = base.clone();
    if taken.contains(&slug) {
        slug = format!("{base}_{id}");
        let mut n = 2;
        while taken.contains(&slug) {
            slug = format!("{base}_{id}_{n}");
            n += 1;
        }
    }
    taken.insert(slug.clone());
    slug
}

/// Which side of a join an output column comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// One output column of a merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeColumn {
    pub side: Side,
    pub source: String,
    pub output: String,
}

/// Decides the output columns of a merge.
///
/// Left columns clashing with a kept right column take the left suffix (when
/// non-empty); right columns still clashing take the right suffix, then a
/// counter. The right join key is dropped when `drop_duplicate_columns`.
pub fn plan_merge_columns(left: &[String], right: &[String], request: &MergeRequest) -> Vec<MergeColumn> {
    let right_kept: Vec<&String> = right
        .iter()
        .filter(|c| !(request.drop_duplicate_columns && c.eq_ignore_ascii_case(&request.link_right)))
        .collect();
    let right_names: HashSet<String> = right_kept.iter().map(|c| c.to_lowercase()).collect();

    let mut used = HashSet::new();
    let mut plan = Vec::with_capacity(left.len() + right_kept.len());

    for column in left {
        let clashes = !column.eq_ignore_ascii_case(&request.link_left)
            && right_names.contains(&column.to_lowercase());
        let output = if clashes && !request.suffixes.left.is_empty() {
            format!("{column}{}", request.suffixes.left)
        } else {
            column.clone()
        };
        used.insert(output.to_lowercase());
        plan.push(MergeColumn {
            side: Side::Left,
            source: column.clone(),
            output,
        });
    }

    for column in right_kept {
        let mut output = column.clone();
        if used.contains(&output.to_lowercase()) {
            output = format!("{column}{}", request.suffixes.right);
            let mut n = 2;
            while used.contains(&output.to_lowercase()) {
                output = format!("{column}{}{n}", request.suffixes.right);
                n += 1;
            }
        }
        used.insert(output.to_lowercase());
        plan.push(MergeColumn {
            side: Side::Right,
            source: column.clone(),
            output,
        });
    }

    plan
}

/// `CREATE TABLE stage AS SELECT ... FROM base JOIN other`.
pub fn merge_select(stage: &str, plan: &[MergeColumn], request: &MergeRequest) -> String {
    let join = match (request.keep_all_left, request.keep_all_right) {
        (true, false) => "LEFT JOIN",
        (false, true) => "RIGHT JOIN",
        (true, true) => "FULL OUTER JOIN",
        (false, false) => "INNER JOIN",
    };
    let coalesce_key = request.keep_all_right && request.drop_duplicate_columns;

    let select = plan
        .iter()
        .map(|column| {
            let expr = match column.side {
                Side::Left
                    if coalesce_key && column.source.eq_ignore_ascii_case(&request.link_left) =>
                {
                    format!(
                        "COALESCE(l.{}, r.{})",
                        quote_ident(&column.source),
                        quote_ident(&request.link_right)
                    )
                }
                Side::Left => format!("l.{}", quote_ident(&column.source)),
                Side::Right => format!("r.{}", quote_ident(&column.source)),
            };
            format!("{expr} AS {}", quote_ident(&column.output))
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE {} AS SELECT {select} FROM {} AS l {join} {} AS r ON l.{} = r.{}",
        qualified(SYMBOL_SCHEMA, stage),
        qualified(SYMBOL_SCHEMA, request.base.as_str()),
        qualified(SYMBOL_SCHEMA, request.other.as_str()),
        quote_ident(&request.link_left),
        quote_ident(&request.link_right)
    )
}
