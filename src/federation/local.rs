// SPDX-License-Identifier: Apache-2.0

//! In-process federation of DuckDB servers.
//!
//! Implements the gateway contract over an ordered list of servers: every
//! call is fanned out sequentially and answers are keyed by server id. Rows
//! never leave the server that holds them; only counts and names come back.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use omopfed_core::{
    ConceptDictionary, FederationGateway, FetchRequest, MergeRequest, OmopError, OmopResult,
    Resources, ServerId, ServerMap, Symbol, TableProfile,
};

use super::duckdb_engine::DuckDbServer;
use crate::config::SessionConfig;

/// Ordered set of DuckDB servers behind one gateway
pub struct LocalFederation {
    servers: Vec<(ServerId, DuckDbServer)>,
    concept_table: String,
}

impl LocalFederation {
    pub fn new() -> Self {
        Self {
            servers: Vec::new(),
            concept_table: "concept".to_string(),
        }
    }

    /// Adds a server. Ids must be unique; a repeated id replaces the server.
    pub fn with_server(mut self, id: impl Into<String>, server: DuckDbServer) -> Self {
        let id = ServerId::new(id);
        self.servers.retain(|(existing, _)| *existing != id);
        self.servers.push((id, server));
        self
    }

    /// Table used to name concepts (default `concept`).
    pub fn with_concept_table(mut self, table: impl Into<String>) -> Self {
        self.concept_table = table.into();
        self
    }

    /// Takes the concept table from `config`.
    pub fn with_session_config(self, config: &SessionConfig) -> Self {
        self.with_concept_table(config.concept_table.clone())
    }

    pub fn server(&self, id: &str) -> Option<&DuckDbServer> {
        self.servers
            .iter()
            .find(|(existing, _)| existing.as_str() == id)
            .map(|(_, server)| server)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    fn targets(&self, ids: &[ServerId]) -> OmopResult<Vec<(&ServerId, &DuckDbServer)>> {
        ids.iter()
            .map(|id| {
                self.servers
                    .iter()
                    .find(|(existing, _)| existing == id)
                    .map(|(existing, server)| (existing, server))
                    .ok_or_else(|| OmopError::configuration(format!("Unknown server '{id}'")))
            })
            .collect()
    }

    fn schema_for<'a>(resources: &'a Resources, server: &ServerId) -> OmopResult<&'a str> {
        resources
            .for_server(server)
            .map(|resource| resource.as_str())
            .ok_or_else(|| {
                OmopError::configuration(format!("No resource bound for server '{server}'"))
            })
    }

    /// Servers that have a resource bound, in federation order.
    fn bound<'a>(&'a self, resources: &'a Resources) -> impl Iterator<Item = (&'a ServerId, &'a DuckDbServer, &'a str)> {
        self.servers.iter().filter_map(move |(id, server)| {
            resources
                .for_server(id)
                .map(|resource| (id, server, resource.as_str()))
        })
    }
}

/// Collects per-server catalog answers. A failing server is logged and left
/// out; the call fails only when every server failed.
fn gather<'a, T>(
    answers: impl Iterator<Item = (&'a ServerId, OmopResult<Option<T>>)>,
) -> OmopResult<ServerMap<T>> {
    let mut result = ServerMap::new();
    let mut first_error = None;
    let mut answered = false;
    for (id, answer) in answers {
        match answer {
            Ok(value) => {
                answered = true;
                if let Some(value) = value {
                    result.insert(id.clone(), value);
                }
            }
            Err(err) => {
                let err = err.on_server(id.as_str());
                warn!(server = %id, error = %err, "Catalog query failed, skipping server");
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) if !answered => Err(err),
        _ => Ok(result),
    }
}

impl Default for LocalFederation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FederationGateway for LocalFederation {
    fn servers(&self) -> Vec<ServerId> {
        self.servers.iter().map(|(id, _)| id.clone()).collect()
    }

    #[instrument(skip(self, request), fields(table = %request.table, symbol = %request.symbol))]
    async fn get(&self, request: &FetchRequest) -> OmopResult<()> {
        let mut total_rows = 0u64;
        for (id, server) in self.targets(&request.servers)? {
            let schema = Self::schema_for(&request.resources, id)?;
            let rows = server
                .fetch(schema, request, &self.concept_table)
                .map_err(|e| e.on_server(id.as_str()))?;
            debug!(server = %id, rows, "Fetched");
            total_rows += rows;
        }

        if total_rows == 0 {
            return Err(OmopError::empty_result(&request.table));
        }
        Ok(())
    }

    async fn tables(&self, resources: &Resources) -> OmopResult<ServerMap<BTreeSet<String>>> {
        gather(self.bound(resources).map(|(id, server, schema)| {
            let tables = server.list_tables(schema);
            (id, tables.map(|tables| (!tables.is_empty()).then_some(tables)))
        }))
    }

    async fn columns(
        &self,
        resources: &Resources,
        table: &str,
    ) -> OmopResult<ServerMap<BTreeSet<String>>> {
        gather(self.bound(resources).map(|(id, server, schema)| {
            let columns = server.table_columns(schema, table);
            (
                id,
                columns.map(|columns| (!columns.is_empty()).then(|| columns.into_iter().collect())),
            )
        }))
    }

    async fn concepts(
        &self,
        resources: &Resources,
        table: &str,
    ) -> OmopResult<ServerMap<ConceptDictionary>> {
        gather(
            self.bound(resources)
                .map(|(id, server, schema)| (id, server.concepts(schema, table, &self.concept_table))),
        )
    }

    #[instrument(skip(self, request), fields(base = %request.base, other = %request.other))]
    async fn merge(&self, request: &MergeRequest) -> OmopResult<()> {
        for (id, server) in self.targets(&request.servers)? {
            server.merge(request).map_err(|e| e.on_server(id.as_str()))?;
        }
        Ok(())
    }

    async fn remove(&self, symbol: &Symbol, servers: &[ServerId]) -> OmopResult<()> {
        // Attempt every server before reporting the first failure.
        let mut first_error = None;
        for (id, server) in self.targets(servers)? {
            if let Err(err) = server.remove(symbol.as_str()) {
                first_error.get_or_insert(err.on_server(id.as_str()));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn exists(&self, symbol: &Symbol, servers: &[ServerId]) -> OmopResult<ServerMap<bool>> {
        let mut result = ServerMap::new();
        for (id, server) in self.targets(servers)? {
            let bound = server.exists(symbol.as_str()).map_err(|e| e.on_server(id.as_str()))?;
            result.insert(id.clone(), bound);
        }
        Ok(result)
    }

    async fn profile(
        &self,
        symbol: &Symbol,
        servers: &[ServerId],
    ) -> OmopResult<ServerMap<TableProfile>> {
        let mut result = ServerMap::new();
        for (id, server) in self.targets(servers)? {
            match server.profile(symbol.as_str()).map_err(|e| e.on_server(id.as_str()))? {
                Some(profile) => {
                    result.insert(id.clone(), profile);
                }
                None => {
                    return Err(OmopError::not_found(format!("Symbol '{symbol}' is not bound"))
                        .on_server(id.as_str()))
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omopfed_core::{ColumnInfo, Row, Value};

    fn server(with_measurement: bool) -> DuckDbServer {
        let server = DuckDbServer::open_in_memory().unwrap();
        server
            .load_table(
                "cdm",
                "person",
                &[ColumnInfo::new("person_id", "bigint")],
                &[Row::new(vec![Value::Int(1)])],
            )
            .unwrap();
        if with_measurement {
            server
                .load_table(
                    "cdm",
                    "measurement",
                    &[
                        ColumnInfo::new("person_id", "bigint"),
                        ColumnInfo::new("measurement_concept_id", "bigint"),
                    ],
                    &[],
                )
                .unwrap();
        }
        server
    }

    fn federation() -> LocalFederation {
        LocalFederation::new()
            .with_server("a", server(false))
            .with_server("b", server(true))
    }

    #[tokio::test]
    async fn columns_omit_servers_without_table() {
        let fed = federation();
        let columns = fed.columns(&Resources::uniform("cdm"), "measurement").await.unwrap();
        assert_eq!(columns.keys().map(ServerId::as_str).collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn unknown_target_is_a_configuration_error() {
        let fed = federation();
        let err = fed
            .exists(&Symbol::parse("x").unwrap(), &[ServerId::new("zz")])
            .await
            .unwrap_err();
        assert!(matches!(err, OmopError::Configuration { .. }));
    }

    #[tokio::test]
    async fn servers_without_resource_are_skipped_in_catalog() {
        let fed = federation();
        let tables = fed.tables(&Resources::per_server([("b", "cdm")])).await.unwrap();
        assert_eq!(tables.len(), 1);
        assert!(tables[&ServerId::new("b")].contains("measurement"));
    }

    #[test]
    fn failing_server_is_left_out_of_catalog_answers() {
        let a = ServerId::new("a");
        let b = ServerId::new("b");
        let answers = vec![
            (&a, Err(OmopError::catalog("connection lost"))),
            (&b, Ok(Some(3))),
        ];
        let result = gather(answers.into_iter()).unwrap();
        assert_eq!(result.into_iter().collect::<Vec<_>>(), vec![(b.clone(), 3)]);

        let answers: Vec<(&ServerId, OmopResult<Option<u8>>)> = vec![
            (&a, Err(OmopError::catalog("connection lost"))),
            (&b, Err(OmopError::catalog("timeout"))),
        ];
        let err = gather(answers.into_iter()).unwrap_err();
        assert_eq!(err, OmopError::catalog("server 'a': connection lost"));
    }

    #[tokio::test]
    async fn session_config_names_the_concept_table() {
        let server = server(true);
        server
            .execute_batch(
                "INSERT INTO cdm.measurement VALUES (1, 3025315); \
                 CREATE TABLE cdm.vocabulary (concept_id BIGINT, concept_name VARCHAR); \
                 INSERT INTO cdm.vocabulary VALUES (3025315, 'Body weight');",
            )
            .unwrap();
        let config = SessionConfig {
            concept_table: "vocabulary".to_string(),
            ..SessionConfig::default()
        };
        let fed = LocalFederation::new()
            .with_server("b", server)
            .with_session_config(&config);

        let concepts = fed.concepts(&Resources::uniform("cdm"), "measurement").await.unwrap();
        assert_eq!(concepts[&ServerId::new("b")][&3025315], "Body weight");
    }

    #[test]
    fn replacing_a_server_keeps_ids_unique() {
        let fed = federation().with_server("a", server(true));
        assert_eq!(fed.len(), 2);
        assert_eq!(fed.servers(), vec![ServerId::new("b"), ServerId::new("a")]);
    }
}
