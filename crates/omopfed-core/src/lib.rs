// SPDX-License-Identifier: Apache-2.0

//! Federated OMOP CDM abstraction
//!
//! Types, the federation gateway trait and the error taxonomy shared by the
//! session layer and every gateway implementation.

pub mod error;
pub mod gateway;
pub mod types;

pub use error::{OmopError, OmopResult, RemoteStage};
pub use gateway::FederationGateway;
pub use types::*;
