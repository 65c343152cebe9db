// SPDX-License-Identifier: Apache-2.0

//! FederationGateway trait definition
//!
//! The gateway is the only path from a session to the servers of a
//! federation. One call is one logical round trip: the gateway fans it out to
//! the target servers and collects per-server answers. Implementations must
//! never move row-level values from one server to another.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::OmopResult;
use crate::types::{
    ConceptDictionary, FetchRequest, MergeRequest, Resources, ServerId, ServerMap, Symbol,
    TableProfile,
};

#[async_trait]
pub trait FederationGateway: Send + Sync {
    /// Servers of the federation, in federation order
    fn servers(&self) -> Vec<ServerId>;

    /// Binds a filtered CDM table to `request.symbol` on each target server.
    ///
    /// Fails with `EmptyResult` when the filters exclude every row on every
    /// target server. A failure may leave `request.symbol` bound on some
    /// servers; callers remove it.
    async fn get(&self, request: &FetchRequest) -> OmopResult<()>;

    /// Lists the CDM tables each server exposes.
    async fn tables(&self, resources: &Resources) -> OmopResult<ServerMap<BTreeSet<String>>>;

    /// Lists the columns of `table` on each server. Servers without the
    /// table are omitted.
    async fn columns(
        &self,
        resources: &Resources,
        table: &str,
    ) -> OmopResult<ServerMap<BTreeSet<String>>>;

    /// Lists the distinct concepts observed in `table` on each server.
    /// Servers without the table are omitted.
    async fn concepts(
        &self,
        resources: &Resources,
        table: &str,
    ) -> OmopResult<ServerMap<ConceptDictionary>>;

    /// Joins `request.other` into `request.base` and binds the result.
    async fn merge(&self, request: &MergeRequest) -> OmopResult<()>;

    /// Unbinds `symbol` on the given servers. Unbound symbols are not an error.
    async fn remove(&self, symbol: &Symbol, servers: &[ServerId]) -> OmopResult<()>;

    /// Reports whether `symbol` is bound on each of the given servers.
    async fn exists(&self, symbol: &Symbol, servers: &[ServerId]) -> OmopResult<ServerMap<bool>>;

    /// Aggregate shape of `symbol` on each of the given servers.
    async fn profile(
        &self,
        symbol: &Symbol,
        servers: &[ServerId],
    ) -> OmopResult<ServerMap<TableProfile>>;
}
