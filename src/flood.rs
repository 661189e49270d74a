//! # Flood Replication
//!
//! Accepted facts are re-broadcast to every peer of the local finest group.
//! Each flood category keeps a small FIFO ring of recently seen request ids;
//! an id already in the ring is dropped without being processed again, which
//! is what stops re-broadcasts from looping.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::messages::AndnaRequest;
use crate::protocols::AndnaRpc;
use crate::topology::PeerAddress;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloodKind {
    Registration,
    CounterCheck,
    Spread,
}

impl FloodKind {
    fn index(self) -> usize {
        match self {
            FloodKind::Registration => 0,
            FloodKind::CounterCheck => 1,
            FloodKind::Spread => 2,
        }
    }
}

#[derive(Debug)]
struct DedupRing {
    ids: VecDeque<u64>,
    capacity: usize,
}

impl DedupRing {
    fn new(capacity: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Records `id` at the head; returns false if it was already present.
    fn check_and_record(&mut self, id: u64) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        if self.ids.len() >= self.capacity {
            self.ids.pop_back();
        }
        self.ids.push_front(id);
        true
    }
}

pub struct FloodReplicator {
    rings: Mutex<[DedupRing; 3]>,
}

impl FloodReplicator {
    pub fn new(ring_size: usize) -> Self {
        Self {
            rings: Mutex::new([
                DedupRing::new(ring_size),
                DedupRing::new(ring_size),
                DedupRing::new(ring_size),
            ]),
        }
    }

    /// True the first time `id` is seen in `kind` within the ring window.
    pub async fn first_sighting(&self, kind: FloodKind, id: u64) -> bool {
        let mut rings = self.rings.lock().await;
        let fresh = rings[kind.index()].check_and_record(id);
        if !fresh {
            trace!(?kind, id, "duplicate flood id dropped");
        }
        fresh
    }

    /// Group peers a flood goes to: everyone but the peer it came from.
    pub fn recipients(group: Vec<PeerAddress>, except: Option<PeerAddress>) -> Vec<PeerAddress> {
        group.into_iter().filter(|p| Some(*p) != except).collect()
    }

    /// Sends `request` to every recipient. Failures are logged and skipped.
    /// Returns the number of peers that answered.
    pub async fn broadcast<N: AndnaRpc + ?Sized>(
        &self,
        network: &N,
        recipients: &[PeerAddress],
        request: &AndnaRequest,
        timeout: Duration,
    ) -> usize {
        let mut delivered = 0;
        for peer in recipients {
            match tokio::time::timeout(timeout, network.call(*peer, request.clone())).await {
                Ok(Ok(_)) => delivered += 1,
                Ok(Err(e)) => {
                    debug!(peer = %peer, kind = request.kind(), error = %e, "flood delivery failed")
                }
                Err(_) => debug!(peer = %peer, kind = request.kind(), "flood delivery timed out"),
            }
        }
        trace!(kind = request.kind(), delivered, total = recipients.len(), "flood sent");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::messages::AndnaResponse;

    #[test]
    fn ring_drops_repeats_and_ages_out_oldest() {
        let mut ring = DedupRing::new(2);
        assert!(ring.check_and_record(1));
        assert!(!ring.check_and_record(1));
        assert!(ring.check_and_record(2));
        assert!(ring.check_and_record(3));
        // 1 fell off the tail.
        assert!(ring.check_and_record(1));
        assert!(!ring.check_and_record(3));
    }

    #[tokio::test]
    async fn categories_are_independent() {
        let flood = FloodReplicator::new(4);
        assert!(flood.first_sighting(FloodKind::Registration, 7).await);
        assert!(!flood.first_sighting(FloodKind::Registration, 7).await);
        assert!(flood.first_sighting(FloodKind::Spread, 7).await);
        assert!(flood.first_sighting(FloodKind::CounterCheck, 7).await);
    }

    #[test]
    fn recipients_skip_sender() {
        let a: PeerAddress = "10.0.0.1".parse().unwrap();
        let b: PeerAddress = "10.0.0.2".parse().unwrap();
        assert_eq!(FloodReplicator::recipients(vec![a, b], Some(a)), vec![b]);
        assert_eq!(FloodReplicator::recipients(vec![a, b], None), vec![a, b]);
    }

    struct Recorder {
        calls: Arc<Mutex<Vec<PeerAddress>>>,
        down: PeerAddress,
    }

    #[async_trait]
    impl AndnaRpc for Recorder {
        async fn call(
            &self,
            to: PeerAddress,
            _request: AndnaRequest,
        ) -> anyhow::Result<AndnaResponse> {
            self.calls.lock().await.push(to);
            if to == self.down {
                anyhow::bail!("unreachable");
            }
            Ok(AndnaResponse::Ack)
        }
    }

    #[tokio::test]
    async fn broadcast_counts_successful_deliveries() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let down: PeerAddress = "10.0.0.3".parse().unwrap();
        let net = Recorder { calls: calls.clone(), down };
        let peers: Vec<PeerAddress> = ["10.0.0.2", "10.0.0.3", "10.0.0.4"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let flood = FloodReplicator::new(4);
        let delivered = flood
            .broadcast(&net, &peers, &AndnaRequest::GetFullCache, Duration::from_secs(1))
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(calls.lock().await.len(), 3);
    }
}
