// SPDX-License-Identifier: Apache-2.0

//! Subject-table sessions
//!
//! A session owns one base table per server, seeded from the subject
//! dictionary and grown by appends. Operations that write to the base table
//! take `&mut self`.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use omopfed_core::{
    ConceptDictionary, ConceptId, FederationGateway, FetchRequest, OmopError, OmopResult,
    PersonFilter, Resources, ServerId, ServerMap, Symbol, TableProfile,
};

use crate::append::{self, AppendRequest, AppendSummary};
use crate::bulk::{self, BulkOptions, BulkReport};
use crate::catalog::{self, ColumnCatalog};
use crate::config::SessionConfig;
use crate::heuristics::heuristic_columns;
use crate::symbols::SymbolAllocator;

/// Default symbol of the base table
pub const DEFAULT_BASE_SYMBOL: &str = "omop_subjects";

/// Everything the join engine and the orchestrator need from a session
#[derive(Debug)]
pub struct SessionState {
    pub resources: Resources,
    /// Symbol bound to the base table on every server
    pub base: Symbol,
    /// Servers the session spans, in federation order
    pub servers: Vec<ServerId>,
    pub config: SessionConfig,
    pub symbols: SymbolAllocator,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub resources: Resources,
    pub base_symbol: Option<String>,
    /// Columns of the subject table to seed with (None = all)
    pub subject_columns: Option<BTreeSet<String>>,
    /// Keep only subjects listed in an existing remote table
    pub subject_filter: Option<PersonFilter>,
    /// Servers to span (None = the whole federation)
    pub servers: Option<Vec<ServerId>>,
    pub config: SessionConfig,
}

impl SessionOptions {
    pub fn new(resources: Resources) -> Self {
        Self {
            resources,
            base_symbol: None,
            subject_columns: None,
            subject_filter: None,
            servers: None,
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_base_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.base_symbol = Some(symbol.into());
        self
    }

    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = Some(servers.into_iter().map(ServerId::new).collect());
        self
    }
}

/// Raw single-table fetch into a caller-named symbol
#[derive(Debug, Clone)]
pub struct GetOptions {
    pub symbol: Symbol,
    pub columns: Option<BTreeSet<String>>,
    pub concepts: Option<BTreeSet<ConceptId>>,
    /// Restrict to the subjects of the base table
    pub restrict_to_base: bool,
    pub link_column: Option<String>,
    pub drop_empty_columns: bool,
}

impl GetOptions {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            columns: None,
            concepts: None,
            restrict_to_base: false,
            link_column: None,
            drop_empty_columns: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    pub columns: Option<BTreeSet<String>>,
    pub concepts: Option<BTreeSet<ConceptId>>,
    pub link_left: Option<String>,
    pub link_right: Option<String>,
    /// Expand `columns` with table-prefixed variants
    pub expand_columns: bool,
}

/// A subject-level table under construction across a federation
pub struct OmopSession {
    gateway: Arc<dyn FederationGateway>,
    state: SessionState,
}

impl OmopSession {
    /// Seeds the base table from the subject dictionary on every server.
    ///
    /// A failed seed leaves nothing bound.
    #[instrument(skip(gateway, options))]
    pub async fn connect(
        gateway: Arc<dyn FederationGateway>,
        options: SessionOptions,
    ) -> OmopResult<Self> {
        let SessionOptions {
            resources,
            base_symbol,
            subject_columns,
            subject_filter,
            servers,
            config,
        } = options;

        config.validate()?;
        let base = Symbol::parse(base_symbol.as_deref().unwrap_or(DEFAULT_BASE_SYMBOL))?;
        let servers = resolve_servers(gateway.as_ref(), servers)?;
        let symbols = SymbolAllocator::new(&config.symbol_prefix, config.max_symbol_attempts)?;

        let seed = FetchRequest {
            resources: resources.clone(),
            table: config.subject_table.clone(),
            symbol: base.clone(),
            columns: subject_columns,
            concepts: None,
            person_filter: subject_filter,
            link_column: config.link_column.clone(),
            drop_empty_columns: false,
            servers: servers.clone(),
        };
        if let Err(err) = gateway.get(&seed).await {
            if let Err(cleanup) = gateway.remove(&base, &servers).await {
                warn!(symbol = %base, error = %cleanup, "Failed to remove partial base table");
            }
            return Err(err);
        }

        info!(base = %base, servers = servers.len(), "Session connected");
        Ok(Self {
            gateway,
            state: SessionState {
                resources,
                base,
                servers,
                config,
                symbols,
            },
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn base(&self) -> &Symbol {
        &self.state.base
    }

    pub fn servers(&self) -> &[ServerId] {
        &self.state.servers
    }

    pub fn gateway(&self) -> &Arc<dyn FederationGateway> {
        &self.gateway
    }

    /// Binds a filtered table to `options.symbol` without touching the base table.
    pub async fn get(&self, table: &str, options: GetOptions) -> OmopResult<()> {
        if options.symbol == self.state.base {
            return Err(OmopError::configuration(format!(
                "'{}' is the base table; use append to extend it",
                options.symbol
            )));
        }
        let link_column = options
            .link_column
            .unwrap_or_else(|| self.state.config.link_column.clone());
        let person_filter = options.restrict_to_base.then(|| PersonFilter {
            symbol: self.state.base.clone(),
            column: self.state.config.link_column.clone(),
        });

        self.gateway
            .get(&FetchRequest {
                resources: self.state.resources.clone(),
                table: table.to_string(),
                symbol: options.symbol,
                columns: options.columns,
                concepts: options.concepts,
                person_filter,
                link_column,
                drop_empty_columns: options.drop_empty_columns,
                servers: self.state.servers.clone(),
            })
            .await
    }

    /// Removes a symbol bound by [`OmopSession::get`].
    pub async fn remove(&self, symbol: &Symbol) -> OmopResult<()> {
        if *symbol == self.state.base {
            return Err(OmopError::configuration(
                "The base table is removed by closing the session",
            ));
        }
        self.gateway.remove(symbol, &self.state.servers).await
    }

    pub async fn append(&mut self, table: &str, options: AppendOptions) -> OmopResult<AppendSummary> {
        let columns = if options.expand_columns {
            heuristic_columns(table, options.columns.as_ref())
        } else {
            options.columns
        };
        let request = AppendRequest {
            table: table.trim().to_lowercase(),
            columns,
            concepts: options.concepts,
            link_left: options.link_left,
            link_right: options.link_right,
            servers: None,
        };
        append::append(&self.gateway, &self.state, &request).await
    }

    pub async fn bulk(&mut self, options: BulkOptions) -> OmopResult<BulkReport> {
        bulk::run(&self.gateway, &self.state, &options).await
    }

    /// Same as [`OmopSession::bulk`].
    pub async fn auto(&mut self, options: BulkOptions) -> OmopResult<BulkReport> {
        self.bulk(options).await
    }

    pub async fn tables(&self) -> OmopResult<ServerMap<BTreeSet<String>>> {
        catalog::tables(self.gateway.as_ref(), &self.state.resources).await
    }

    pub async fn columns(&self, tables: Option<&[String]>) -> OmopResult<ColumnCatalog> {
        catalog::columns(self.gateway.as_ref(), &self.state.resources, tables).await
    }

    pub async fn concepts(
        &self,
        tables: Option<&[String]>,
        max_name_length: Option<usize>,
    ) -> OmopResult<ServerMap<ConceptDictionary>> {
        catalog::concepts(
            self.gateway.as_ref(),
            &self.state.resources,
            tables,
            max_name_length,
        )
        .await
    }

    /// Aggregate shape of the base table on each server.
    pub async fn profile(&self) -> OmopResult<ServerMap<TableProfile>> {
        self.gateway
            .profile(&self.state.base, &self.state.servers)
            .await
    }

    /// Removes the base table from every server.
    pub async fn close(self) -> OmopResult<()> {
        self.gateway
            .remove(&self.state.base, &self.state.servers)
            .await?;
        info!(base = %self.state.base, "Session closed");
        Ok(())
    }
}

fn resolve_servers(
    gateway: &dyn FederationGateway,
    requested: Option<Vec<ServerId>>,
) -> OmopResult<Vec<ServerId>> {
    let federation = gateway.servers();
    let servers = match requested {
        Some(requested) => {
            let mut seen = HashSet::new();
            let mut servers = Vec::with_capacity(requested.len());
            for server in requested {
                if !federation.contains(&server) {
                    return Err(OmopError::configuration(format!(
                        "Server '{server}' is not part of the federation"
                    )));
                }
                if seen.insert(server.clone()) {
                    servers.push(server);
                }
            }
            servers
        }
        None => federation,
    };
    if servers.is_empty() {
        return Err(OmopError::configuration("A session needs at least one server"));
    }
    Ok(servers)
}
