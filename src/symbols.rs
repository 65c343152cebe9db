// SPDX-License-Identifier: Apache-2.0

//! Ephemeral remote symbols
//!
//! Names for intermediate remote tables are `<prefix>_<session tag>_<n>`.
//! The counter makes names unique within a session, the tag separates
//! sessions sharing a server, and an existence probe skips any name that is
//! already bound remotely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

use omopfed_core::{FederationGateway, OmopResult, ServerId, Symbol};

use crate::metrics;

/// Issues unique ephemeral symbols for one session
#[derive(Debug)]
pub struct SymbolAllocator {
    stem: Symbol,
    counter: AtomicU64,
    max_attempts: u32,
}

impl SymbolAllocator {
    /// `prefix` must itself be a valid symbol.
    pub fn new(prefix: &str, max_attempts: u32) -> OmopResult<Self> {
        let tag = Uuid::new_v4().simple().to_string();
        let stem = Symbol::parse(prefix)?.with_suffix(&tag[..8]);
        Ok(Self {
            stem,
            counter: AtomicU64::new(0),
            max_attempts: max_attempts.max(1),
        })
    }

    /// Next name in sequence, without probing the federation.
    pub fn next_name(&self) -> Symbol {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.stem.with_suffix(&n.to_string())
    }

    /// Picks a name not bound on any of `servers` and arms a guard for it.
    ///
    /// Probe failures are logged and the candidate is used as is; the counter
    /// and session tag already make a clash unlikely.
    pub async fn acquire(
        &self,
        gateway: &Arc<dyn FederationGateway>,
        servers: &[ServerId],
    ) -> EphemeralSymbol {
        for _ in 0..self.max_attempts {
            let candidate = self.next_name();
            match gateway.exists(&candidate, servers).await {
                Ok(bound) if bound.values().any(|taken| *taken) => {
                    debug!(symbol = %candidate, "Ephemeral symbol already bound, skipping");
                }
                Ok(_) => return EphemeralSymbol::new(Arc::clone(gateway), candidate, servers),
                Err(err) => {
                    warn!(symbol = %candidate, error = %err, "Symbol existence probe failed");
                    return EphemeralSymbol::new(Arc::clone(gateway), candidate, servers);
                }
            }
        }

        let fallback = self.stem.with_suffix(&Uuid::new_v4().simple().to_string());
        warn!(
            symbol = %fallback,
            attempts = self.max_attempts,
            "Sequential ephemeral names exhausted, using a UUID name"
        );
        EphemeralSymbol::new(Arc::clone(gateway), fallback, servers)
    }
}

/// Guard over a remote table that must not outlive its consumer.
///
/// Call [`EphemeralSymbol::release`] on every exit path. A guard dropped
/// while still armed schedules the removal on the current Tokio runtime.
pub struct EphemeralSymbol {
    gateway: Arc<dyn FederationGateway>,
    symbol: Symbol,
    servers: Vec<ServerId>,
    armed: bool,
}

impl EphemeralSymbol {
    fn new(gateway: Arc<dyn FederationGateway>, symbol: Symbol, servers: &[ServerId]) -> Self {
        Self {
            gateway,
            symbol,
            servers: servers.to_vec(),
            armed: true,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Removes the remote table. Failures are logged and counted, never
    /// returned: the caller's own outcome takes precedence.
    pub async fn release(mut self) {
        self.armed = false;
        if let Err(err) = self.gateway.remove(&self.symbol, &self.servers).await {
            metrics::record_cleanup_failure();
            error!(symbol = %self.symbol, error = %err, "Failed to remove ephemeral symbol");
        } else {
            debug!(symbol = %self.symbol, "Ephemeral symbol removed");
        }
    }
}

impl Drop for EphemeralSymbol {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let gateway = Arc::clone(&self.gateway);
        let symbol = self.symbol.clone();
        let servers = std::mem::take(&mut self.servers);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(symbol = %symbol, "Ephemeral symbol dropped unreleased, removing in background");
                handle.spawn(async move {
                    if let Err(err) = gateway.remove(&symbol, &servers).await {
                        metrics::record_cleanup_failure();
                        error!(symbol = %symbol, error = %err, "Background removal failed");
                    }
                });
            }
            Err(_) => {
                metrics::record_cleanup_failure();
                error!(symbol = %symbol, "Ephemeral symbol dropped outside a runtime, left bound");
            }
        }
    }
}
