// SPDX-License-Identifier: Apache-2.0

//! Reference federation gateway
//!
//! One in-memory DuckDB database per server, driven through the same
//! gateway contract a remote federation exposes.

pub mod duckdb_engine;
pub mod local;
pub mod sql;

pub use duckdb_engine::DuckDbServer;
pub use local::LocalFederation;
