// SPDX-License-Identifier: Apache-2.0

//! Universal data types for federated OMOP sessions
//!
//! Everything that crosses the gateway boundary lives here. None of these
//! types carries row-level values out of a server except `Value`/`Row`, which
//! are only used to load data into a server.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{OmopError, OmopResult};

/// Identifier of one server in a federation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Per-server results. A server that has nothing to report is a missing key.
pub type ServerMap<T> = BTreeMap<ServerId, T>;

/// Integer id of an OMOP vocabulary concept
pub type ConceptId = i64;

/// concept_id → concept_name, one entry per distinct concept
pub type ConceptDictionary = BTreeMap<ConceptId, String>;

/// Longest symbol name accepted by `Symbol::parse`.
pub const MAX_SYMBOL_LEN: usize = 63;

fn symbol_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,62}$").expect("valid regex"))
}

fn column_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]{0,127}$").expect("valid regex"))
}

/// Name bound to a remote table on every server of a federation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Validates a symbol name: a letter followed by letters, digits or `_`.
    pub fn parse(name: impl Into<String>) -> OmopResult<Self> {
        let name = name.into();
        if symbol_pattern().is_match(&name) {
            Ok(Self(name))
        } else {
            Err(OmopError::configuration(format!(
                "Invalid symbol '{name}': expected a letter followed by letters, digits or '_'"
            )))
        }
    }

    /// Derives `<self>_<suffix>`. Characters that are not valid in a symbol
    /// are replaced by `_`, and the stem is shortened so the result stays
    /// within `MAX_SYMBOL_LEN`.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        let mut cleaned: String = suffix
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        cleaned.truncate(MAX_SYMBOL_LEN - 2);
        let stem = MAX_SYMBOL_LEN - 1 - cleaned.len();
        Self(format!("{}_{}", &self.0[..self.0.len().min(stem)], cleaned))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Symbol {
    type Error = OmopError;

    fn try_from(value: String) -> OmopResult<Self> {
        Self::parse(value)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Checks that a column name can be safely quoted by any gateway.
pub fn validate_column_name(name: &str) -> OmopResult<()> {
    if column_pattern().is_match(name) {
        Ok(())
    } else {
        Err(OmopError::configuration(format!("Invalid column name '{name}'")))
    }
}

/// Logical identifier that a server resolves into a live CDM connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource binding for a session: one identifier for every server, or a
/// per-server override on top of an optional default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub default: Option<ResourceId>,
    #[serde(default)]
    pub per_server: BTreeMap<ServerId, ResourceId>,
}

impl Resources {
    pub fn uniform(id: impl Into<String>) -> Self {
        Self {
            default: Some(ResourceId::new(id)),
            per_server: BTreeMap::new(),
        }
    }

    pub fn per_server<I, S, R>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, R)>,
        S: Into<String>,
        R: Into<String>,
    {
        Self {
            default: None,
            per_server: entries
                .into_iter()
                .map(|(server, resource)| (ServerId::new(server), ResourceId::new(resource)))
                .collect(),
        }
    }

    /// Resource the given server should resolve, if any
    pub fn for_server(&self, server: &ServerId) -> Option<&ResourceId> {
        self.per_server.get(server).or(self.default.as_ref())
    }
}

/// Pair of columns joining the base table (left) and a fetched table (right)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkColumns {
    pub left: String,
    pub right: String,
}

impl LinkColumns {
    pub fn same(column: impl Into<String>) -> Self {
        let column = column.into();
        Self {
            left: column.clone(),
            right: column,
        }
    }

    /// Resolves an optional explicit pair. Both or neither must be given;
    /// neither falls back to `default` on both sides.
    pub fn resolve(left: Option<&str>, right: Option<&str>, default: &str) -> OmopResult<Self> {
        let pair = match (left, right) {
            (Some(left), Some(right)) => Self {
                left: left.to_string(),
                right: right.to_string(),
            },
            (None, None) => Self::same(default),
            (Some(_), None) | (None, Some(_)) => {
                return Err(OmopError::configuration(
                    "Link columns must be given as a pair: set both left and right or neither",
                ))
            }
        };
        validate_column_name(&pair.left)?;
        validate_column_name(&pair.right)?;
        Ok(pair)
    }
}

/// Restricts a fetch to subjects present in an existing remote table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonFilter {
    /// Remote table holding the subjects to keep
    pub symbol: Symbol,
    /// Column of `symbol` holding subject ids
    pub column: String,
}

/// Request to bind a filtered CDM table to `symbol` on each target server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub resources: Resources,
    pub table: String,
    pub symbol: Symbol,
    /// Columns to keep (None = all). Names a table lacks are ignored.
    pub columns: Option<BTreeSet<String>>,
    /// Concept ids matched against the table's concept-bearing column
    pub concepts: Option<BTreeSet<ConceptId>>,
    pub person_filter: Option<PersonFilter>,
    /// Column of `table` identifying the subject
    pub link_column: String,
    /// Drop columns that are entirely null after filtering
    pub drop_empty_columns: bool,
    pub servers: Vec<ServerId>,
}

/// Suffixes appended to clashing column names during a merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSuffixes {
    pub left: String,
    pub right: String,
}

impl Default for MergeSuffixes {
    fn default() -> Self {
        Self {
            left: String::new(),
            right: ".y".to_string(),
        }
    }
}

/// Request to join two remote tables and bind the result to `result`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub base: Symbol,
    pub other: Symbol,
    pub link_left: String,
    pub link_right: String,
    pub keep_all_left: bool,
    pub keep_all_right: bool,
    pub suffixes: MergeSuffixes,
    /// Discard the right-hand join key, which duplicates the left one
    pub drop_duplicate_columns: bool,
    pub result: Symbol,
    pub servers: Vec<ServerId>,
}

/// Aggregate profile of one column of a remote table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub non_null: u64,
}

/// Aggregate shape of a remote table. Carries counts only, never values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProfile {
    pub rows: u64,
    pub columns: Vec<ColumnProfile>,
}

impl TableProfile {
    pub fn column(&self, name: &str) -> Option<&ColumnProfile> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Universal value representation, used to load rows into a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Column metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }
}

/// A single row of data (indexed by column order)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }
}
