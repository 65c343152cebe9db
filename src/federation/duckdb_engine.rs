// SPDX-License-Identifier: Apache-2.0

//! DuckDB in-memory engine acting as one federation server.
//!
//! Each resource is a DuckDB schema holding CDM tables; session symbols live
//! in `main`. Every operation runs synchronously under the connection lock
//! and never holds it across an await point.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use duckdb::{params, params_from_iter, types::Value as DuckValue, Connection};
use parking_lot::Mutex;
use tracing::debug;

use omopfed_core::{
    ColumnInfo, ColumnProfile, ConceptDictionary, ConceptId, FetchRequest, MergeRequest,
    OmopError, OmopResult, RemoteStage, Row, TableProfile, Value,
};

use crate::heuristics::concept_column;

use super::sql::{self, qualified, quote_ident, SubjectRestriction, SYMBOL_SCHEMA};

/// Batch size for inserting rows into loaded tables.
const INSERT_BATCH_SIZE: usize = 1000;

/// One federation server backed by an in-memory DuckDB database.
pub struct DuckDbServer {
    conn: Mutex<Connection>,
}

impl DuckDbServer {
    /// Creates a new in-memory DuckDB instance.
    pub fn open_in_memory() -> OmopResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| OmopError::catalog(format!("Failed to open DuckDB: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs setup statements verbatim.
    pub fn execute_batch(&self, sql: &str) -> OmopResult<()> {
        self.conn
            .lock()
            .execute_batch(sql)
            .map_err(|e| OmopError::catalog(format!("DuckDB batch failed: {e}")))
    }

    /// Creates `schema.table` with the given columns and inserts `rows`.
    pub fn load_table(
        &self,
        schema: &str,
        table: &str,
        columns: &[ColumnInfo],
        rows: &[Row],
    ) -> OmopResult<()> {
        if columns.is_empty() {
            return Err(OmopError::configuration(format!(
                "Cannot create table '{table}': no columns"
            )));
        }

        let col_defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), map_type_to_duckdb(&c.data_type)))
            .collect();
        let target = qualified(schema, table);

        let conn = self.conn.lock();
        conn.execute_batch(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}; CREATE OR REPLACE TABLE {target} ({})",
            quote_ident(schema),
            col_defs.join(", ")
        ))
        .map_err(|e| OmopError::catalog(format!("Failed to create table '{table}': {e}")))?;

        if rows.is_empty() {
            return Ok(());
        }

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let insert = format!("INSERT INTO {target} VALUES ({})", placeholders.join(", "));

        for chunk in rows.chunks(INSERT_BATCH_SIZE) {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| OmopError::catalog(format!("DuckDB transaction failed: {e}")))?;
            {
                let mut stmt = tx
                    .prepare_cached(&insert)
                    .map_err(|e| OmopError::catalog(format!("DuckDB prepare failed: {e}")))?;
                for row in chunk {
                    if row.values.len() != columns.len() {
                        return Err(OmopError::configuration(format!(
                            "Row has {} values, table '{table}' has {} columns",
                            row.values.len(),
                            columns.len()
                        )));
                    }
                    let values: Vec<DuckValue> = row.values.iter().map(value_to_duckdb).collect();
                    stmt.execute(params_from_iter(values.iter()))
                        .map_err(|e| OmopError::catalog(format!("DuckDB insert failed: {e}")))?;
                }
            }
            tx.commit()
                .map_err(|e| OmopError::catalog(format!("DuckDB commit failed: {e}")))?;
        }

        Ok(())
    }

    /// Tables of a resource schema, lowercased.
    pub fn list_tables(&self, schema: &str) -> OmopResult<BTreeSet<String>> {
        let conn = self.conn.lock();
        query_strings(
            &conn,
            "SELECT lower(table_name) FROM information_schema.tables \
             WHERE table_schema = ? ORDER BY table_name",
            &[schema],
        )
        .map(|tables| tables.into_iter().collect())
        .map_err(|e| OmopError::catalog(format!("Failed to list tables: {e}")))
    }

    /// Columns of `schema.table` in ordinal order. Empty when the table does
    /// not exist.
    pub fn table_columns(&self, schema: &str, table: &str) -> OmopResult<Vec<String>> {
        let conn = self.conn.lock();
        columns_of(&conn, schema, table)
            .map_err(|e| OmopError::catalog(format!("Failed to list columns of '{table}': {e}")))
    }

    /// Distinct concepts observed in `table`, named from `concept_table`.
    ///
    /// `None` when the table does not exist; empty when it has no
    /// concept-bearing column.
    pub fn concepts(
        &self,
        schema: &str,
        table: &str,
        concept_table: &str,
    ) -> OmopResult<Option<ConceptDictionary>> {
        let conn = self.conn.lock();
        let available = columns_of(&conn, schema, table)
            .map_err(|e| OmopError::catalog(format!("Failed to list columns of '{table}': {e}")))?;
        if available.is_empty() {
            return Ok(None);
        }
        let Some(column) = concept_column(table, available.iter().map(String::as_str)) else {
            return Ok(Some(ConceptDictionary::new()));
        };

        let has_names = !columns_of(&conn, schema, concept_table)
            .map_err(|e| OmopError::catalog(format!("Failed to inspect '{concept_table}': {e}")))?
            .is_empty();
        let source = qualified(schema, table);
        let cc = quote_ident(&column);
        let sql = if has_names {
            format!(
                "SELECT DISTINCT CAST(t.{cc} AS BIGINT), \
                 CAST(COALESCE(c.\"concept_name\", CAST(t.{cc} AS VARCHAR)) AS VARCHAR) \
                 FROM {source} AS t LEFT JOIN {} AS c ON c.\"concept_id\" = t.{cc} \
                 WHERE t.{cc} IS NOT NULL ORDER BY 1",
                qualified(schema, concept_table)
            )
        } else {
            format!(
                "SELECT DISTINCT CAST({cc} AS BIGINT), CAST({cc} AS VARCHAR) \
                 FROM {source} WHERE {cc} IS NOT NULL ORDER BY 1"
            )
        };

        let pairs = query_pairs(&conn, &sql)
            .map_err(|e| OmopError::catalog(format!("Failed to read concepts of '{table}': {e}")))?;
        Ok(Some(pairs.into_iter().collect()))
    }

    /// Binds the filtered, reshaped table to `request.symbol`. Returns the
    /// number of rows bound.
    pub fn fetch(&self, schema: &str, request: &FetchRequest, concept_table: &str) -> OmopResult<u64> {
        let conn = self.conn.lock();
        let table = request.table.as_str();
        let target = request.symbol.as_str();

        let available = columns_of(&conn, schema, table)
            .map_err(|e| OmopError::fetch(format!("Failed to inspect '{table}': {e}")))?;
        if available.is_empty() {
            return Err(OmopError::fetch(format!("Table '{table}' not found")));
        }

        let link = request.link_column.as_str();
        let has_link = available.iter().any(|c| c.eq_ignore_ascii_case(link));
        let concept_col = concept_column(table, available.iter().map(String::as_str));

        let selected: Vec<String> = match &request.columns {
            Some(wanted) => {
                let wanted: HashSet<String> = wanted.iter().map(|c| c.to_lowercase()).collect();
                available
                    .iter()
                    .filter(|c| wanted.contains(&c.to_lowercase()))
                    .cloned()
                    .collect()
            }
            None => available.clone(),
        };

        let concept_filter = match (&request.concepts, &concept_col) {
            (Some(ids), Some(column)) => Some((column.as_str(), ids)),
            (Some(_), None) => {
                return Err(OmopError::fetch(format!(
                    "Table '{table}' has no concept column to filter on"
                )))
            }
            (None, _) => None,
        };

        let restriction = match &request.person_filter {
            Some(filter) if has_link => Some(SubjectRestriction {
                link,
                symbol: filter.symbol.as_str(),
                column: filter.column.as_str(),
            }),
            Some(_) => {
                return Err(OmopError::fetch(format!(
                    "Table '{table}' has no link column '{link}'"
                )))
            }
            None => None,
        };

        let filtered = sql::filtered_source(
            &qualified(schema, table),
            concept_filter,
            restriction.as_ref(),
            has_link.then_some(link),
        );

        let statement = if !has_link {
            if selected.is_empty() {
                return Err(OmopError::fetch(format!(
                    "None of the requested columns exist in '{table}'"
                )));
            }
            sql::project(target, &filtered, &selected)
        } else {
            let values: Vec<String> = selected
                .iter()
                .filter(|c| {
                    !c.eq_ignore_ascii_case(link)
                        && concept_col.as_deref().map_or(true, |cc| !c.eq_ignore_ascii_case(cc))
                })
                .cloned()
                .collect();

            let order = sql::record_order(table, &available);
            match &concept_col {
                Some(cc) => {
                    let concepts = pivot_concepts(&conn, schema, &filtered, cc, concept_table)?;
                    sql::pivot(target, &filtered, link, cc, &concepts, &values, &order)
                }
                None => sql::collapse(target, &filtered, link, &values, &order),
            }
        };

        debug!(table, symbol = target, "Binding fetched table");
        conn.execute_batch(&statement)
            .map_err(|e| OmopError::fetch(format!("Failed to fetch '{table}': {e}")))?;

        if request.drop_empty_columns {
            drop_empty_columns(&conn, target, has_link.then_some(link))?;
        }

        count_rows(&conn, target).map_err(|e| OmopError::fetch(format!("Failed to count '{target}': {e}")))
    }

    /// Joins `request.other` into `request.base`, binding `request.result`.
    pub fn merge(&self, request: &MergeRequest) -> OmopResult<()> {
        let conn = self.conn.lock();
        let merge_err = |e: duckdb::Error| OmopError::merge(e.to_string());

        let left = columns_of(&conn, SYMBOL_SCHEMA, request.base.as_str()).map_err(merge_err)?;
        let right = columns_of(&conn, SYMBOL_SCHEMA, request.other.as_str()).map_err(merge_err)?;
        if left.is_empty() {
            return Err(OmopError::merge(format!("Symbol '{}' not found", request.base)));
        }
        if right.is_empty() {
            return Err(OmopError::merge(format!("Symbol '{}' not found", request.other)));
        }
        if !left.iter().any(|c| c.eq_ignore_ascii_case(&request.link_left)) {
            return Err(OmopError::merge(format!(
                "Link column '{}' missing from '{}'",
                request.link_left, request.base
            )));
        }
        if !right.iter().any(|c| c.eq_ignore_ascii_case(&request.link_right)) {
            return Err(OmopError::merge(format!(
                "Link column '{}' missing from '{}'",
                request.link_right, request.other
            )));
        }

        // A repeated right key would duplicate base rows.
        let duplicates: i64 = conn
            .query_row(
                &format!(
                    "SELECT count(*) - count(DISTINCT {key}) FROM {} WHERE {key} IS NOT NULL",
                    qualified(SYMBOL_SCHEMA, request.other.as_str()),
                    key = quote_ident(&request.link_right)
                ),
                [],
                |row| row.get(0),
            )
            .map_err(merge_err)?;
        if duplicates > 0 {
            return Err(OmopError::merge(format!(
                "Link column '{}' of '{}' is not unique ({duplicates} repeated values)",
                request.link_right, request.other
            )));
        }

        let plan = sql::plan_merge_columns(&left, &right, request);
        let stage = request.result.with_suffix("merge_stage");
        let stage_table = qualified(SYMBOL_SCHEMA, stage.as_str());
        let result_table = qualified(SYMBOL_SCHEMA, request.result.as_str());

        let tx = conn.unchecked_transaction().map_err(merge_err)?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {stage_table}; {}; \
             CREATE OR REPLACE TABLE {result_table} AS SELECT * FROM {stage_table}; \
             DROP TABLE {stage_table};",
            sql::merge_select(stage.as_str(), &plan, request)
        ))
        .map_err(merge_err)?;
        tx.commit().map_err(merge_err)?;
        Ok(())
    }

    pub fn remove(&self, symbol: &str) -> OmopResult<()> {
        self.conn
            .lock()
            .execute_batch(&format!(
                "DROP TABLE IF EXISTS {}",
                qualified(SYMBOL_SCHEMA, symbol)
            ))
            .map_err(|e| OmopError::remote(RemoteStage::Remove, e.to_string()))
    }

    pub fn exists(&self, symbol: &str) -> OmopResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM information_schema.tables \
                 WHERE table_schema = ? AND lower(table_name) = lower(?)",
                params![SYMBOL_SCHEMA, symbol],
                |row| row.get(0),
            )
            .map_err(|e| OmopError::catalog(e.to_string()))?;
        Ok(count > 0)
    }

    /// Row count and per-column non-null counts. `None` when unbound.
    pub fn profile(&self, symbol: &str) -> OmopResult<Option<TableProfile>> {
        let conn = self.conn.lock();
        let columns = columns_of(&conn, SYMBOL_SCHEMA, symbol)
            .map_err(|e| OmopError::catalog(e.to_string()))?;
        if columns.is_empty() {
            return Ok(None);
        }

        let counts = non_null_counts(&conn, symbol, &columns)
            .map_err(|e| OmopError::catalog(format!("Failed to profile '{symbol}': {e}")))?;
        let rows = counts.first().copied().unwrap_or_default();
        Ok(Some(TableProfile {
            rows,
            columns: columns
                .into_iter()
                .zip(counts.into_iter().skip(1))
                .map(|(name, non_null)| ColumnProfile { name, non_null })
                .collect(),
        }))
    }
}

/// Distinct concepts of the filtered rows, with unique column slugs.
fn pivot_concepts(
    conn: &Connection,
    schema: &str,
    filtered: &str,
    concept_col: &str,
    concept_table: &str,
) -> OmopResult<Vec<(ConceptId, String)>> {
    let cc = quote_ident(concept_col);
    let ids = query_pairs(
        conn,
        &format!(
            "SELECT DISTINCT CAST({cc} AS BIGINT), CAST({cc} AS VARCHAR) \
             FROM ({filtered}) AS filtered WHERE {cc} IS NOT NULL ORDER BY 1"
        ),
    )
    .map_err(|e| OmopError::fetch(format!("Failed to read concepts: {e}")))?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let has_names = !columns_of(conn, schema, concept_table)
        .map_err(|e| OmopError::fetch(e.to_string()))?
        .is_empty();
    let names: BTreeMap<ConceptId, String> = if has_names {
        let list = ids.iter().map(|(id, _)| id.to_string()).collect::<Vec<_>>().join(", ");
        query_pairs(
            conn,
            &format!(
                "SELECT CAST(\"concept_id\" AS BIGINT), CAST(\"concept_name\" AS VARCHAR) \
                 FROM {} WHERE \"concept_id\" IN ({list}) AND \"concept_name\" IS NOT NULL",
                qualified(schema, concept_table)
            ),
        )
        .map_err(|e| OmopError::fetch(format!("Failed to read concept names: {e}")))?
        .into_iter()
        .collect()
    } else {
        BTreeMap::new()
    };

    let mut taken = HashSet::new();
    Ok(ids
        .into_iter()
        .map(|(id, _)| {
            let slug = sql::concept_slug(id, names.get(&id).map(String::as_str), &mut taken);
            (id, slug)
        })
        .collect())
}

/// Drops columns with no non-null value, keeping `keep` and at least one column.
fn drop_empty_columns(conn: &Connection, symbol: &str, keep: Option<&str>) -> OmopResult<()> {
    let fetch_err = |e: duckdb::Error| OmopError::fetch(format!("Failed to prune '{symbol}': {e}"));
    let columns = columns_of(conn, SYMBOL_SCHEMA, symbol).map_err(fetch_err)?;
    let counts = non_null_counts(conn, symbol, &columns).map_err(fetch_err)?;

    let mut remaining = columns.len();
    for (column, non_null) in columns.iter().zip(counts.iter().skip(1)) {
        let is_kept = keep.map_or(false, |k| column.eq_ignore_ascii_case(k));
        if *non_null > 0 || is_kept || remaining <= 1 {
            continue;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE {} DROP COLUMN {}",
            qualified(SYMBOL_SCHEMA, symbol),
            quote_ident(column)
        ))
        .map_err(fetch_err)?;
        remaining -= 1;
    }
    Ok(())
}

fn columns_of(conn: &Connection, schema: &str, table: &str) -> duckdb::Result<Vec<String>> {
    query_strings(
        conn,
        "SELECT column_name FROM information_schema.columns \
         WHERE table_schema = ? AND lower(table_name) = lower(?) ORDER BY ordinal_position",
        &[schema, table],
    )
}

fn query_strings(conn: &Connection, sql: &str, args: &[&str]) -> duckdb::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?;
    rows.collect()
}

fn query_pairs(conn: &Connection, sql: &str) -> duckdb::Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
    rows.collect()
}

fn count_rows(conn: &Connection, symbol: &str) -> duckdb::Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT count(*) FROM {}", qualified(SYMBOL_SCHEMA, symbol)),
        [],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

/// `[count(*), count(c1), count(c2), ...]`
fn non_null_counts(conn: &Connection, symbol: &str, columns: &[String]) -> duckdb::Result<Vec<u64>> {
    let mut select = vec!["count(*)".to_string()];
    select.extend(columns.iter().map(|c| format!("count({})", quote_ident(c))));
    let width = select.len();
    conn.query_row(
        &format!(
            "SELECT {} FROM {}",
            select.join(", "),
            qualified(SYMBOL_SCHEMA, symbol)
        ),
        [],
        |row| {
            (0..width)
                .map(|i| row.get::<_, i64>(i).map(|n| n.max(0) as u64))
                .collect()
        },
    )
}

/// Maps a CDM column type to a DuckDB type.
fn map_type_to_duckdb(data_type: &str) -> &'static str {
    let lower = data_type.to_lowercase();
    match lower.trim() {
        "boolean" | "bool" => "BOOLEAN",
        "smallint" | "int2" => "SMALLINT",
        "integer" | "int" | "int4" => "INTEGER",
        "bigint" | "int8" => "BIGINT",
        "real" | "float4" | "float" => "FLOAT",
        "double precision" | "double" | "float8" | "numeric" | "decimal" => "DOUBLE",
        "timestamp" | "datetime" => "TIMESTAMP",
        "date" => "DATE",
        other if other.starts_with("numeric") || other.starts_with("decimal") => "DOUBLE",
        _ => "VARCHAR",
    }
}

fn value_to_duckdb(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Bool(b) => DuckValue::Boolean(*b),
        Value::Int(i) => DuckValue::BigInt(*i),
        Value::Float(f) => DuckValue::Double(*f),
        Value::Text(s) => DuckValue::Text(s.clone()),
    }
}
