//! # Cache Migration
//!
//! When the topology shifts, a hash can become the responsibility of a peer
//! that has never seen it. Such a young owner asks the previous hash-gnode,
//! found by locating the hash with itself excluded. A previous owner that is
//! itself young and empty-handed asks its own predecessor, adding itself to
//! the excluded list, so the request walks back hop by hop until some peer
//! has the entry or the hop limit is reached.
//!
//! After adopting an entry, the new owner floods a spread instruction so the
//! rest of its group fetches the entry too. A node joining a group pulls the
//! full ANDNA and counter caches from its nearest group peer.
//!
//! Migration failures are logged and dropped; the next lookup miss retries.

use tracing::{debug, info, trace, warn};

use crate::cache::AndnaCacheEntry;
use crate::crypto::HostnameHash;
use crate::error::AndnaError;
use crate::flood::FloodKind;
use crate::identity::now_ms;
use crate::locator::{Relation, locate};
use crate::messages::{
    AndnaRequest, AndnaResponse, FullCacheReply, GetSingleCacheRequest, SpreadCacheInstruction,
    new_request_id,
};
use crate::node::AndnaNode;
use crate::protocols::AndnaRpc;
use crate::topology::{PeerAddress, Topology};

impl<N: AndnaRpc, T: Topology> AndnaNode<N, T> {
    /// Fetches `hash`'s entry from the previous owner, adopts it and tells
    /// the local group to do the same. Returns whether an entry was found.
    pub(crate) async fn fetch_from_previous_owner(&self, hash: HostnameHash) -> bool {
        let me = self.address();
        let request = GetSingleCacheRequest {
            request_id: new_request_id(),
            requester: me,
            hostname_hash: hash,
            excluded: vec![me],
        };
        let Some(entry) = self.query_previous_owner(request).await else {
            trace!(hash = %hash, "no previous owner holds the entry");
            return false;
        };
        self.adopt(entry, false).await;
        info!(hash = %hash, "adopted entry from previous owner");

        let instruction = SpreadCacheInstruction {
            request_id: new_request_id(),
            sender: me,
            hostname_hash: hash,
        };
        self.inner
            .flood
            .first_sighting(FloodKind::Spread, instruction.request_id)
            .await;
        self.spawn_group_flood(AndnaRequest::SpreadCache(instruction), None);
        true
    }

    async fn query_previous_owner(
        &self,
        request: GetSingleCacheRequest,
    ) -> Option<AndnaCacheEntry> {
        let located = locate(
            self.inner.topology.as_ref(),
            &request.hostname_hash,
            &request.excluded,
            false,
        );
        match located.relation {
            Relation::GroupMember | Relation::ForwardToBorderPeer => {
                self.ask_for_entry(located.address, request).await
            }
            Relation::IAmOwner | Relation::NotFound => None,
        }
    }

    async fn ask_for_entry(
        &self,
        to: PeerAddress,
        request: GetSingleCacheRequest,
    ) -> Option<AndnaCacheEntry> {
        let hash = request.hostname_hash;
        match self.rpc(to, AndnaRequest::GetSingleCache(request)).await {
            Ok(AndnaResponse::SingleCache(entry)) => entry,
            Ok(_) => None,
            Err(e) => {
                warn!(hash = %hash, peer = %to, error = %e, "cache fetch abandoned");
                None
            }
        }
    }

    async fn adopt(&self, mut entry: AndnaCacheEntry, backup: bool) {
        entry.flags.backup = backup;
        self.inner
            .andna
            .lock()
            .await
            .merge(entry, now_ms(), &self.inner.config);
    }

    pub(crate) async fn handle_get_single_cache(
        &self,
        from: PeerAddress,
        mut request: GetSingleCacheRequest,
    ) -> Option<AndnaCacheEntry> {
        let hash = request.hostname_hash;
        if let Some(entry) = self.andna_entry(&hash).await {
            trace!(hash = %hash, peer = %from, "serving cache entry");
            return Some(entry);
        }
        if request.excluded.len() >= self.inner.config.max_spread_hops {
            debug!(hash = %hash, hops = request.excluded.len(), "cache fetch hop limit reached");
            return None;
        }

        let located = locate(self.inner.topology.as_ref(), &hash, &request.excluded, false);
        match located.relation {
            Relation::IAmOwner if self.is_young_owner() => {
                request.excluded.push(self.address());
                self.query_previous_owner(request).await
            }
            Relation::GroupMember | Relation::ForwardToBorderPeer if located.address != from => {
                self.ask_for_entry(located.address, request).await
            }
            _ => None,
        }
    }

    pub(crate) async fn handle_spread_cache(
        &self,
        from: PeerAddress,
        instruction: SpreadCacheInstruction,
    ) {
        if !self
            .inner
            .flood
            .first_sighting(FloodKind::Spread, instruction.request_id)
            .await
        {
            return;
        }
        let hash = instruction.hostname_hash;
        if self.andna_entry(&hash).await.is_some() {
            return;
        }

        let me = self.address();
        let request = GetSingleCacheRequest {
            request_id: new_request_id(),
            requester: me,
            hostname_hash: hash,
            excluded: vec![me],
        };
        let Some(entry) = self.ask_for_entry(instruction.sender, request).await else {
            debug!(hash = %hash, sender = %instruction.sender, "spread source had no entry");
            return;
        };
        self.adopt(entry, true).await;
        debug!(hash = %hash, sender = %instruction.sender, "adopted spread entry");

        self.flood_to_group(AndnaRequest::SpreadCache(instruction), Some(from)).await;
    }

    /// Pulls the ANDNA and counter caches of the nearest group peer and
    /// merges them. Returns the number of entries received.
    pub async fn join_group(&self) -> Result<usize, AndnaError> {
        let me = self.address();
        let mine = me.position(crate::topology::LEVELS - 1);
        let Some(peer) = self
            .inner
            .topology
            .local_group()
            .into_iter()
            .min_by_key(|p| p.position(crate::topology::LEVELS - 1).abs_diff(mine))
        else {
            debug!("no group peers to fetch caches from");
            return Ok(0);
        };

        let reply = match self.rpc(peer, AndnaRequest::GetFullCache).await? {
            AndnaResponse::FullCache(reply) => reply,
            _ => return Err(AndnaError::MalformedRequest),
        };
        let received = reply.andna.len() + reply.counter.len();

        let now = now_ms();
        let config = &self.inner.config;
        {
            let mut andna = self.inner.andna.lock().await;
            for entry in reply.andna {
                andna.merge(entry, now, config);
            }
        }
        {
            let mut counter = self.inner.counter.lock().await;
            for entry in reply.counter {
                counter.merge(entry, now, config);
            }
        }
        info!(peer = %peer, received, "merged group caches");
        Ok(received)
    }

    pub(crate) async fn handle_get_full_cache(&self) -> FullCacheReply {
        FullCacheReply {
            andna: self.inner.andna.lock().await.entries(),
            counter: self.inner.counter.lock().await.entries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::AndnaConfig;
    use crate::identity::Keypair;
    use crate::network::{InProcessNetwork, PeerRegistry};
    use crate::topology::{MeshView, StaticTopology};

    type Node = AndnaNode<InProcessNetwork, StaticTopology>;

    fn addr(s: &str) -> PeerAddress {
        s.parse().unwrap()
    }

    fn spawn(registry: &PeerRegistry, mesh: &MeshView, at: &str) -> Node {
        let topology = Arc::new(StaticTopology::new(addr(at), mesh.clone()));
        let node = AndnaNode::new(
            AndnaConfig::default(),
            Keypair::generate(),
            topology,
            registry.network(addr(at)),
        );
        registry.register(addr(at), node.clone());
        node
    }

    #[tokio::test]
    async fn joining_node_pulls_group_caches() {
        let registry = PeerRegistry::new();
        let mesh = MeshView::new();
        let first = spawn(&registry, &mesh, "10.0.0.1");
        first.add_hostname("alpha", Vec::new()).await.unwrap();
        first.register_hostname("alpha").await.unwrap();

        let joiner = spawn(&registry, &mesh, "10.0.0.2");
        let received = joiner.join_group().await.unwrap();
        assert_eq!(received, 2);
        let hash = HostnameHash::of_hostname("alpha");
        assert!(joiner.andna_entry(&hash).await.is_some());
        assert_eq!(joiner.stored_counter(&first.public_key(), &hash).await, Some(1));
    }

    #[tokio::test]
    async fn lone_node_join_is_a_no_op() {
        let registry = PeerRegistry::new();
        let node = spawn(&registry, &MeshView::new(), "10.0.0.1");
        assert_eq!(node.join_group().await, Ok(0));
    }

    #[tokio::test]
    async fn hop_limit_stops_cache_fetch() {
        let registry = PeerRegistry::new();
        let node = spawn(&registry, &MeshView::new(), "10.0.0.1");
        let excluded = (0..8).map(|i| PeerAddress::new([99, 0, 0, i])).collect();
        let request = GetSingleCacheRequest {
            request_id: 1,
            requester: addr("99.0.0.0"),
            hostname_hash: HostnameHash::of_hostname("alpha"),
            excluded,
        };
        assert!(node.handle_get_single_cache(addr("99.0.0.0"), request).await.is_none());
    }
}
