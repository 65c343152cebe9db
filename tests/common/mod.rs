// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures: small CDM shards loaded into in-memory DuckDB servers.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use omopfed::{
    ColumnInfo, ConceptDictionary, DuckDbServer, FederationGateway, FetchRequest, LocalFederation,
    MergeRequest, OmopError, OmopResult, Resources, Row, ServerId, ServerMap, Symbol, TableProfile,
    Value,
};

pub const CDM: &str = "cdm";

pub const ASTHMA: i64 = 317009;
pub const DIABETES: i64 = 201826;
pub const ASPIRIN: i64 = 1112807;
pub const BODY_WEIGHT: i64 = 3025315;
pub const SMOKER: i64 = 4298794;

/// Exactly 30 characters
pub const DIABETES_NAME: &str = "Type 2 diabetes mellitus w/out";

pub fn resources() -> Resources {
    Resources::uniform(CDM)
}

fn cols(spec: &[(&str, &str)]) -> Vec<ColumnInfo> {
    spec.iter().map(|(name, ty)| ColumnInfo::new(*name, *ty)).collect()
}

fn date(day: i64) -> Value {
    Value::Text(format!("2020-01-{:02}", 1 + day % 28))
}

pub fn load_person(server: &DuckDbServer, ids: RangeInclusive<i64>) {
    let rows: Vec<Row> = ids
        .map(|id| {
            Row::new(vec![
                Value::Int(id),
                Value::Int(1940 + id % 50),
                Value::Int(if id % 2 == 0 { 8507 } else { 8532 }),
            ])
        })
        .collect();
    server
        .load_table(
            CDM,
            "person",
            &cols(&[
                ("person_id", "bigint"),
                ("year_of_birth", "integer"),
                ("gender_concept_id", "bigint"),
            ]),
            &rows,
        )
        .unwrap();
}

pub fn load_concepts(server: &DuckDbServer) {
    let rows = vec![
        Row::new(vec![ASTHMA.into(), "Asthma".into()]),
        Row::new(vec![DIABETES.into(), DIABETES_NAME.into()]),
        Row::new(vec![ASPIRIN.into(), "Aspirin".into()]),
        Row::new(vec![BODY_WEIGHT.into(), "Body weight".into()]),
        Row::new(vec![SMOKER.into(), "Smoker".into()]),
    ];
    server
        .load_table(
            CDM,
            "concept",
            &cols(&[("concept_id", "bigint"), ("concept_name", "varchar")]),
            &rows,
        )
        .unwrap();
}

/// Subjects with `id % 5 < 2` have asthma (40%), every tenth has diabetes.
pub fn load_conditions(server: &DuckDbServer, ids: RangeInclusive<i64>) {
    let mut rows = Vec::new();
    for id in ids {
        if id % 5 < 2 {
            rows.push(Row::new(vec![
                Value::Int(1000 + id),
                Value::Int(id),
                Value::Int(ASTHMA),
                date(id),
            ]));
        }
        if id % 10 == 0 {
            rows.push(Row::new(vec![
                Value::Int(5000 + id),
                Value::Int(id),
                Value::Int(DIABETES),
                date(id + 3),
            ]));
        }
    }
    server
        .load_table(
            CDM,
            "condition_occurrence",
            &cols(&[
                ("condition_occurrence_id", "bigint"),
                ("person_id", "bigint"),
                ("condition_concept_id", "bigint"),
                ("condition_start_date", "varchar"),
            ]),
            &rows,
        )
        .unwrap();
}

/// Every third subject takes aspirin, some twice.
pub fn load_drugs(server: &DuckDbServer, ids: RangeInclusive<i64>) {
    let mut rows = Vec::new();
    for id in ids.filter(|id| id % 3 == 0) {
        rows.push(Row::new(vec![Value::Int(2000 + id), Value::Int(id), Value::Int(ASPIRIN), date(id)]));
        if id % 2 == 0 {
            rows.push(Row::new(vec![
                Value::Int(3000 + id),
                Value::Int(id),
                Value::Int(ASPIRIN),
                date(id + 1),
            ]));
        }
    }
    server
        .load_table(
            CDM,
            "drug_exposure",
            &cols(&[
                ("drug_exposure_id", "bigint"),
                ("person_id", "bigint"),
                ("drug_concept_id", "bigint"),
                ("drug_exposure_start_date", "varchar"),
            ]),
            &rows,
        )
        .unwrap();
}

pub fn load_measurements(server: &DuckDbServer, ids: RangeInclusive<i64>) {
    let rows: Vec<Row> = ids
        .filter(|id| id % 2 == 1)
        .map(|id| {
            Row::new(vec![
                Value::Int(4000 + id),
                Value::Int(id),
                Value::Int(BODY_WEIGHT),
                Value::Float(50.0 + id as f64 / 2.0),
            ])
        })
        .collect();
    server
        .load_table(
            CDM,
            "measurement",
            &cols(&[
                ("measurement_id", "bigint"),
                ("person_id", "bigint"),
                ("measurement_concept_id", "bigint"),
                ("value_as_number", "double"),
            ]),
            &rows,
        )
        .unwrap();
}

pub fn load_observations(server: &DuckDbServer, ids: RangeInclusive<i64>) {
    let rows: Vec<Row> = ids
        .filter(|id| id % 4 == 0)
        .map(|id| Row::new(vec![Value::Int(6000 + id), Value::Int(id), Value::Int(SMOKER), date(id)]))
        .collect();
    server
        .load_table(
            CDM,
            "observation",
            &cols(&[
                ("observation_id", "bigint"),
                ("person_id", "bigint"),
                ("observation_concept_id", "bigint"),
                ("observation_date", "varchar"),
            ]),
            &rows,
        )
        .unwrap();
}

/// Reference table without a subject column.
pub fn load_care_sites(server: &DuckDbServer) {
    server
        .load_table(
            CDM,
            "care_site",
            &cols(&[("care_site_id", "bigint"), ("care_site_name", "varchar")]),
            &[
                Row::new(vec![1.into(), "North clinic".into()]),
                Row::new(vec![2.into(), "South clinic".into()]),
            ],
        )
        .unwrap();
}

/// A shard holding every fixture table for the given subjects.
pub fn full_shard(ids: RangeInclusive<i64>) -> DuckDbServer {
    let server = DuckDbServer::open_in_memory().unwrap();
    load_person(&server, ids.clone());
    load_concepts(&server);
    load_conditions(&server, ids.clone());
    load_drugs(&server, ids.clone());
    load_measurements(&server, ids.clone());
    load_observations(&server, ids);
    load_care_sites(&server);
    server
}

/// One server with subjects 1..=100.
pub fn single_site() -> LocalFederation {
    LocalFederation::new().with_server("site_a", full_shard(1..=100))
}

/// Two servers splitting subjects 1..=100; `site_a` has no measurement table.
pub fn two_sites() -> LocalFederation {
    let site_a = DuckDbServer::open_in_memory().unwrap();
    load_person(&site_a, 1..=50);
    load_concepts(&site_a);
    load_conditions(&site_a, 1..=50);
    LocalFederation::new()
        .with_server("site_a", site_a)
        .with_server("site_b", full_shard(51..=100))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// Bind the fetched symbol, then report a failure
    AfterFetch,
    /// Fail the merge without touching the base table
    Merge,
    /// Fail every removal
    Remove,
    /// Repeat one base table row after a successful merge
    DuplicateBaseRow,
    /// Drop the merged base table after a successful merge
    DropBase,
}

/// Gateway wrapper that injects failures and records every fetched symbol.
pub struct FaultyGateway {
    pub inner: LocalFederation,
    pub fault: Mutex<Fault>,
    pub fetched: Mutex<Vec<Symbol>>,
}

impl FaultyGateway {
    pub fn new(inner: LocalFederation) -> Self {
        Self {
            inner,
            fault: Mutex::new(Fault::None),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fault(&self, fault: Fault) {
        *self.fault.lock() = fault;
    }

    pub fn last_fetched(&self) -> Symbol {
        self.fetched.lock().last().cloned().unwrap()
    }

    /// Whether `symbol` is bound on any server.
    pub async fn is_bound(&self, symbol: &Symbol) -> bool {
        self.inner
            .exists(symbol, &self.inner.servers())
            .await
            .unwrap()
            .values()
            .any(|bound| *bound)
    }
}

#[async_trait]
impl FederationGateway for FaultyGateway {
    fn servers(&self) -> Vec<ServerId> {
        self.inner.servers()
    }

    async fn get(&self, request: &FetchRequest) -> OmopResult<()> {
        self.fetched.lock().push(request.symbol.clone());
        self.inner.get(request).await?;
        if *self.fault.lock() == Fault::AfterFetch {
            return Err(OmopError::fetch("injected fetch failure"));
        }
        Ok(())
    }

    async fn tables(&self, resources: &Resources) -> OmopResult<ServerMap<BTreeSet<String>>> {
        self.inner.tables(resources).await
    }

    async fn columns(&self, resources: &Resources, table: &str) -> OmopResult<ServerMap<BTreeSet<String>>> {
        self.inner.columns(resources, table).await
    }

    async fn concepts(&self, resources: &Resources, table: &str) -> OmopResult<ServerMap<ConceptDictionary>> {
        self.inner.concepts(resources, table).await
    }

    async fn merge(&self, request: &MergeRequest) -> OmopResult<()> {
        if *self.fault.lock() == Fault::Merge {
            return Err(OmopError::merge("injected merge failure"));
        }
        self.inner.merge(request).await?;
        let fault = *self.fault.lock();
        let base = format!("main.\"{}\"", request.result);
        let sql = match fault {
            Fault::DuplicateBaseRow => format!("INSERT INTO {base} SELECT * FROM {base} LIMIT 1"),
            Fault::DropBase => format!("DROP TABLE {base}"),
            _ => return Ok(()),
        };
        for id in &request.servers {
            self.inner.server(id.as_str()).unwrap().execute_batch(&sql).unwrap();
        }
        Ok(())
    }

    async fn remove(&self, symbol: &Symbol, servers: &[ServerId]) -> OmopResult<()> {
        if *self.fault.lock() == Fault::Remove {
            return Err(OmopError::remote(omopfed::RemoteStage::Remove, "injected remove failure"));
        }
        self.inner.remove(symbol, servers).await
    }

    async fn exists(&self, symbol: &Symbol, servers: &[ServerId]) -> OmopResult<ServerMap<bool>> {
        self.inner.exists(symbol, servers).await
    }

    async fn profile(&self, symbol: &Symbol, servers: &[ServerId]) -> OmopResult<ServerMap<TableProfile>> {
        self.inner.profile(symbol, servers).await
    }
}

pub fn shared(gateway: LocalFederation) -> Arc<dyn FederationGateway> {
    Arc::new(gateway)
}

pub fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}
