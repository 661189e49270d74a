//! In-process transport.
//!
//! [`PeerRegistry`] maps addresses to request handlers; each node gets an
//! [`InProcessNetwork`] bound to its own address. Every request and response
//! is pushed through the wire codec, so anything that does not survive
//! encoding fails here exactly as it would on a real link.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tracing::trace;

use crate::messages::{self, AndnaRequest, AndnaResponse};
use crate::protocols::{AndnaRpc, RequestHandler};
use crate::topology::PeerAddress;

#[derive(Default)]
struct RegistryState {
    peers: HashMap<PeerAddress, Arc<dyn RequestHandler>>,
    unreachable: HashSet<PeerAddress>,
    received: HashMap<PeerAddress, usize>,
}

/// Shared directory of the handlers of an in-process mesh.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: RequestHandler>(&self, addr: PeerAddress, handler: H) {
        if let Ok(mut state) = self.state.write() {
            state.peers.insert(addr, Arc::new(handler));
        }
    }

    /// Makes every request to or from `addr` fail until cleared.
    pub fn set_unreachable(&self, addr: PeerAddress, unreachable: bool) {
        if let Ok(mut state) = self.state.write() {
            if unreachable {
                state.unreachable.insert(addr);
            } else {
                state.unreachable.remove(&addr);
            }
        }
    }

    /// Requests delivered to `addr` so far.
    pub fn received_count(&self, addr: &PeerAddress) -> usize {
        self.state
            .read()
            .map(|s| s.received.get(addr).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn network(&self, self_addr: PeerAddress) -> InProcessNetwork {
        InProcessNetwork {
            registry: self.clone(),
            self_addr,
        }
    }

    fn route(&self, from: PeerAddress, to: PeerAddress) -> Result<Arc<dyn RequestHandler>> {
        let mut state = self.state.write().map_err(|_| anyhow!("peer registry poisoned"))?;
        if state.unreachable.contains(&to) || state.unreachable.contains(&from) {
            bail!("peer {to} unreachable");
        }
        let handler = state
            .peers
            .get(&to)
            .cloned()
            .ok_or_else(|| anyhow!("no peer at {to}"))?;
        *state.received.entry(to).or_insert(0) += 1;
        Ok(handler)
    }
}

/// One node's view of the in-process mesh.
#[derive(Clone)]
pub struct InProcessNetwork {
    registry: PeerRegistry,
    self_addr: PeerAddress,
}

impl InProcessNetwork {
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }
}

#[async_trait]
impl AndnaRpc for InProcessNetwork {
    async fn call(&self, to: PeerAddress, request: AndnaRequest) -> Result<AndnaResponse> {
        let handler = self.registry.route(self.self_addr, to)?;
        trace!(from = %self.self_addr, to = %to, kind = request.kind(), "delivering request");

        let bytes = messages::serialize(&request).context("failed to encode request")?;
        let request: AndnaRequest =
            messages::deserialize_bounded(&bytes).context("failed to decode request")?;

        let response = handler.handle_request(self.self_addr, request).await;

        let bytes = messages::serialize(&response).context("failed to encode response")?;
        messages::deserialize_bounded(&bytes).context("failed to decode response")
    }
}
