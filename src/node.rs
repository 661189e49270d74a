//! # ANDNA Node
//!
//! [`AndnaNode`] is the entry point: a cheap-to-clone handle around the
//! node's shared state. It owns the four caches, the flood dedup rings and
//! the background maintenance loop, and it answers peer requests through
//! [`RequestHandler`].
//!
//! ```ignore
//! let node = AndnaNode::open(AndnaConfig::default(), state_dir, topology, network)?;
//! node.add_hostname("alpha", Vec::new()).await?;
//! node.start().await?;
//! let records = node.resolve("beta", ServiceSelector::default()).await?;
//! node.shutdown().await?;
//! ```
//!
//! The protocol halves live in their own modules as further `impl` blocks:
//! registration in `register`, resolution in `resolve`, cache migration in
//! `spread`.
//!
//! ## Locking
//!
//! Each cache sits behind its own async mutex. Guards are never held across
//! a network round-trip; registration commits re-check and mutate the
//! AndnaCache under a single guard.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{
    AndnaCache, AndnaCacheEntry, CounterCache, LocalCache, LocalCacheEntry, ResolvedNameCache,
    ResolvedNameEntry,
};
use crate::config::{AndnaConfig, is_valid_hostname};
use crate::crypto::HostnameHash;
use crate::error::AndnaError;
use crate::flood::FloodReplicator;
use crate::identity::{Keypair, PublicKey, now_ms};
use crate::messages::{AndnaRequest, AndnaResponse};
use crate::protocols::{AndnaRpc, RequestHandler};
use crate::records::{self, ServiceRecord};
use crate::storage;
use crate::topology::{PeerAddress, Topology};

/// Entry counts of the four caches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub local: usize,
    pub andna: usize,
    pub counter: usize,
    pub resolved: usize,
}

/// Counts of entries removed by one eviction sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub andna: usize,
    pub counter: usize,
    pub resolved: usize,
    pub local_reset: usize,
}

pub struct AndnaNode<N: AndnaRpc, T: Topology> {
    pub(crate) inner: Arc<Inner<N, T>>,
}

impl<N: AndnaRpc, T: Topology> Clone for AndnaNode<N, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct Inner<N, T> {
    pub(crate) config: AndnaConfig,
    pub(crate) keypair: Keypair,
    pub(crate) topology: Arc<T>,
    pub(crate) network: N,
    pub(crate) local: Mutex<LocalCache>,
    pub(crate) andna: Mutex<AndnaCache>,
    pub(crate) counter: Mutex<CounterCache>,
    pub(crate) resolved: Mutex<ResolvedNameCache>,
    pub(crate) flood: FloodReplicator,
    /// Permits for registrations processed concurrently as hash-gnode.
    pub(crate) inbound: Semaphore,
    /// Own hostnames waiting out a retry backoff, with the earliest retry time.
    pub(crate) retry_at: Mutex<HashMap<String, u64>>,
    started_at: u64,
    state_dir: Option<PathBuf>,
    shutdown_tx: watch::Sender<bool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<N: AndnaRpc, T: Topology> AndnaNode<N, T> {
    /// In-memory node with empty caches.
    pub fn new(config: AndnaConfig, keypair: Keypair, topology: Arc<T>, network: N) -> Self {
        let resolved = ResolvedNameCache::new(config.resolved_cache_size);
        Self::assemble(
            config,
            keypair,
            topology,
            network,
            LocalCache::default(),
            AndnaCache::default(),
            CounterCache::default(),
            resolved,
            None,
        )
    }

    /// Node backed by `state_dir`: loads the keypair (creating it on first
    /// start) and whatever caches were saved there.
    pub fn open(
        config: AndnaConfig,
        state_dir: &Path,
        topology: Arc<T>,
        network: N,
    ) -> Result<Self> {
        let keypair = storage::load_or_generate_keypair(&state_dir.join(storage::KEYPAIR_FILE))
            .context("failed to load node keypair")?;
        let local: LocalCache =
            storage::load_or_default(&state_dir.join(storage::LOCAL_CACHE_FILE));
        let andna: AndnaCache =
            storage::load_or_default(&state_dir.join(storage::ANDNA_CACHE_FILE));
        let counter: CounterCache =
            storage::load_or_default(&state_dir.join(storage::COUNTER_CACHE_FILE));
        let resolved_snapshot: Vec<ResolvedNameEntry> =
            storage::load_or_default(&state_dir.join(storage::RESOLVED_CACHE_FILE));
        let resolved =
            ResolvedNameCache::from_snapshot(config.resolved_cache_size, resolved_snapshot);

        info!(
            state_dir = %state_dir.display(),
            local = local.len(),
            andna = andna.len(),
            counter = counter.len(),
            resolved = resolved.len(),
            "loaded ANDNA state"
        );

        Ok(Self::assemble(
            config,
            keypair,
            topology,
            network,
            local,
            andna,
            counter,
            resolved,
            Some(state_dir.to_path_buf()),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: AndnaConfig,
        keypair: Keypair,
        topology: Arc<T>,
        network: N,
        local: LocalCache,
        andna: AndnaCache,
        counter: CounterCache,
        resolved: ResolvedNameCache,
        state_dir: Option<PathBuf>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let flood = FloodReplicator::new(config.flood_ring_size);
        let inbound = Semaphore::new(config.max_inbound_registrations);
        Self {
            inner: Arc::new(Inner {
                config,
                keypair,
                topology,
                network,
                local: Mutex::new(local),
                andna: Mutex::new(andna),
                counter: Mutex::new(counter),
                resolved: Mutex::new(resolved),
                flood,
                inbound,
                retry_at: Mutex::new(HashMap::new()),
                started_at: now_ms(),
                state_dir,
                shutdown_tx,
                maintenance: Mutex::new(None),
            }),
        }
    }

    pub fn address(&self) -> PeerAddress {
        self.inner.topology.self_address()
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.keypair.public_key()
    }

    pub fn config(&self) -> &AndnaConfig {
        &self.inner.config
    }

    pub fn topology(&self) -> &Arc<T> {
        &self.inner.topology
    }

    pub fn uptime_ms(&self) -> u64 {
        now_ms().saturating_sub(self.inner.started_at)
    }

    /// A node that joined less than a third of an expiration window ago may
    /// have inherited hashes it holds no record for.
    pub fn is_young_owner(&self) -> bool {
        self.uptime_ms() < self.inner.config.expiration_ms() / 3
    }

    /// Adds a hostname to register, with service records beyond the primary
    /// address record.
    pub async fn add_hostname(
        &self,
        hostname: &str,
        records: Vec<ServiceRecord>) -> Result<(), AndnaError> {
        if !is_valid_hostname(hostname) {
            return Err(AndnaError::MalformedRequest);
        }
        records::validate(&records, self.inner.config.max_records.saturating_sub(1))?;
        self.inner
            .local
            .lock()
            .await
            .add(hostname, records, self.inner.config.max_hostnames)
    }

    pub async fn local_entry(&self, hostname: &str) -> Option<LocalCacheEntry> {
        self.inner.local.lock().await.get(hostname).cloned()
    }

    pub async fn andna_entry(&self, hash: &HostnameHash) -> Option<AndnaCacheEntry> {
        let window = self.inner.config.expiration_ms();
        self.inner.andna.lock().await.get(hash, now_ms(), window).cloned()
    }

    pub async fn stored_counter(&self, public_key: &PublicKey, hash: &HostnameHash) -> Option<u32> {
        self.inner.counter.lock().await.stored_counter(public_key, hash)
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            local: self.inner.local.lock().await.len(),
            andna: self.inner.andna.lock().await.len(),
            counter: self.inner.counter.lock().await.len(),
            resolved: self.inner.resolved.lock().await.len(),
        }
    }

    /// Starts the maintenance loop and returns once it is running.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.inner.maintenance.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        let node = self.clone();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(async move {
            node.run_maintenance_loop(shutdown_rx, ready_tx).await;
        }));
        drop(slot);
        ready_rx.await.context("maintenance loop exited before becoming ready")?;
        info!(address = %self.address(), public_key = %self.public_key(), "ANDNA node started");
        Ok(())
    }

    /// Stops background work after its current iteration and flushes state.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.inner.shutdown_tx.send(true);
        let handle = self.inner.maintenance.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "maintenance loop panicked");
        }
        self.flush().await?;
        info!(address = %self.address(), "ANDNA node stopped");
        Ok(())
    }

    /// Saves every cache to the state directory, if there is one.
    pub async fn flush(&self) -> Result<()> {
        let Some(dir) = self.inner.state_dir.as_deref() else {
            return Ok(());
        };
        storage::save(&dir.join(storage::LOCAL_CACHE_FILE), &*self.inner.local.lock().await)?;
        storage::save(&dir.join(storage::ANDNA_CACHE_FILE), &*self.inner.andna.lock().await)?;
        storage::save(&dir.join(storage::COUNTER_CACHE_FILE), &*self.inner.counter.lock().await)?;
        let resolved = self.inner.resolved.lock().await.snapshot();
        storage::save(&dir.join(storage::RESOLVED_CACHE_FILE), &resolved)?;
        debug!(state_dir = %dir.display(), "flushed ANDNA state");
        Ok(())
    }

    async fn run_maintenance_loop(
        &self,
        mut shutdown_rx: watch::Receiver<bool>,
        ready: oneshot::Sender<()>,
    ) {
        let mut ticker = tokio::time::interval(self.inner.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let _ = ready.send(());
        info!(
            interval_ms = self.inner.config.sweep_interval.as_millis() as u64,
            "maintenance loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                    self.reregister_due().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("maintenance loop stopped");
    }

    /// Purges expired entries from all four caches.
    pub async fn sweep(&self) -> SweepReport {
        let now = now_ms();
        let window = self.inner.config.expiration_ms();
        let report = SweepReport {
            andna: self.inner.andna.lock().await.sweep(now, window),
            counter: self.inner.counter.lock().await.sweep(now, window),
            resolved: self.inner.resolved.lock().await.sweep(now, window),
            local_reset: self.inner.local.lock().await.sweep(now, window),
        };
        if report != SweepReport::default() {
            debug!(?report, "evicted expired entries");
        } else {
            trace!("sweep found nothing to evict");
        }
        report
    }

    /// Sends `request` to `to`, bounded by the RPC timeout.
    pub(crate) async fn rpc(
        &self,
        to: PeerAddress,
        request: AndnaRequest,
    ) -> Result<AndnaResponse, AndnaError> {
        let kind = request.kind();
        let call = self.inner.network.call(to, request);
        match tokio::time::timeout(self.inner.config.rpc_timeout, call).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                debug!(peer = %to, kind, error = %e, "request failed");
                Err(AndnaError::NetworkTimeout)
            }
            Err(_) => {
                debug!(peer = %to, kind, "request timed out");
                Err(AndnaError::NetworkTimeout)
            }
        }
    }

    /// Peers that must not be routed back to when relaying a request that
    /// arrived from outside the local group.
    pub(crate) fn route_exclusions(&self, from: PeerAddress, forward: bool) -> Vec<PeerAddress> {
        let me = self.address();
        if forward && from != me && !me.local_group().contains(&from) {
            vec![from]
        } else {
            Vec::new()
        }
    }

    /// Floods `request` to the local group from a background task, so the
    /// caller can answer its requester without waiting on the group.
    pub(crate) fn spawn_group_flood(&self, request: AndnaRequest, except: Option<PeerAddress>) {
        let node = self.clone();
        tokio::spawn(async move {
            let kind = request.kind();
            let reached = node.flood_to_group(request, except).await;
            trace!(kind, reached, "group flood finished");
        });
    }

    /// Sends an already-accepted request to the local group.
    pub(crate) async fn flood_to_group(
        &self,
        request: AndnaRequest,
        except: Option<PeerAddress>,
    ) -> usize {
        let recipients = FloodReplicator::recipients(self.inner.topology.local_group(), except);
        if recipients.is_empty() {
            return 0;
        }
        self.inner
            .flood
            .broadcast(&self.inner.network, &recipients, &request, self.inner.config.rpc_timeout)
            .await
    }
}

#[async_trait]
impl<N: AndnaRpc, T: Topology> RequestHandler for AndnaNode<N, T> {
    async fn handle_request(&self, from: PeerAddress, request: AndnaRequest) -> AndnaResponse {
        trace!(peer = %from, kind = request.kind(), "incoming request");
        match request {
            AndnaRequest::Register(req) => {
                AndnaResponse::Register(self.handle_register(from, req).await)
            }
            AndnaRequest::CheckCounter(req) => {
                AndnaResponse::CheckCounter(self.handle_check_counter(from, req).await)
            }
            AndnaRequest::Resolve(req) => {
                AndnaResponse::Resolve(self.handle_resolve(from, req).await)
            }
            AndnaRequest::ReverseResolve => {
                AndnaResponse::ReverseResolve(self.handle_reverse_resolve().await)
            }
            AndnaRequest::GetSingleCache(req) => {
                AndnaResponse::SingleCache(self.handle_get_single_cache(from, req).await)
            }
            AndnaRequest::SpreadCache(instruction) => {
                self.handle_spread_cache(from, instruction).await;
                AndnaResponse::Ack
            }
            AndnaRequest::GetFullCache => {
                AndnaResponse::FullCache(self.handle_get_full_cache().await)
            }
        }
    }
}
