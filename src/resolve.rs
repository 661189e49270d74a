//! # Resolution Protocol
//!
//! Lookup order for a hostname hash: own hostnames, the resolved-name cache,
//! the ANDNA cache (this node is the hash-gnode or holds a backup), and
//! finally the hash-gnode over the network. Network answers carry the age
//! of the claim rather than its timestamp, and are cached rebased on the
//! local clock.
//!
//! The hash-gnode returns the whole active record list; selection with the
//! default-service fallback happens at the requester.

use tracing::{debug, trace};

use crate::config::is_valid_hostname;
use crate::crypto::HostnameHash;
use crate::error::AndnaError;
use crate::identity::now_ms;
use crate::locator::{Relation, locate};
use crate::messages::{
    AndnaRequest, AndnaResponse, ResolveReply, ResolveRequest, ResolveResponse, ReverseResolveReply,
    new_request_id,
};
use crate::node::AndnaNode;
use crate::protocols::AndnaRpc;
use crate::records::{ServiceRecord, ServiceSelector, select};
use crate::topology::{PeerAddress, Topology};

fn selected(
    elapsed_ms: u64,
    records: &[ServiceRecord],
    selector: ServiceSelector,
) -> Result<ResolveReply, AndnaError> {
    let records = select(records, selector);
    if records.is_empty() {
        return Err(AndnaError::NoSuchHostname);
    }
    Ok(ResolveReply { elapsed_ms, records })
}

impl<N: AndnaRpc, T: Topology> AndnaNode<N, T> {
    /// Records for `hostname` matching `selector`, best first.
    pub async fn resolve(
        &self,
        hostname: &str,
        selector: ServiceSelector,
    ) -> Result<Vec<ServiceRecord>, AndnaError> {
        if !is_valid_hostname(hostname) {
            return Err(AndnaError::MalformedRequest);
        }
        self.lookup(HostnameHash::of_hostname(hostname), selector)
            .await
            .map(|reply| reply.records)
    }

    /// Resolves a hash, reporting how long ago the answering claim was
    /// registered alongside the selected records.
    pub async fn lookup(
        &self,
        hash: HostnameHash,
        selector: ServiceSelector,
    ) -> Result<ResolveReply, AndnaError> {
        let now = now_ms();
        let window = self.inner.config.expiration_ms();
        let short = hash.short();

        {
            let local = self.inner.local.lock().await;
            if let Some(entry) = local.find_by_hash(short)
                && HostnameHash::of_hostname(&entry.hostname) == hash
            {
                let mut records = vec![ServiceRecord::primary(self.address())];
                records.extend(entry.records.iter().cloned());
                let elapsed = if entry.is_registered() {
                    now.saturating_sub(entry.timestamp)
                } else {
                    0
                };
                return selected(elapsed, &records, selector);
            }
        }

        if let Some(cached) = self.inner.resolved.lock().await.get(short, now, window) {
            trace!(hash = %hash, "resolved from cache");
            return selected(now.saturating_sub(cached.timestamp), &cached.records, selector);
        }

        if let Some((timestamp, records)) = self.active_claim(&hash).await {
            trace!(hash = %hash, "resolved from ANDNA cache");
            return selected(now.saturating_sub(timestamp), &records, selector);
        }

        let mut request = ResolveRequest {
            request_id: new_request_id(),
            requester: self.address(),
            hostname_hash: hash,
            selector,
            forward: false,
        };
        let located = locate(self.inner.topology.as_ref(), &hash, &[], false);
        let response = match located.relation {
            Relation::IAmOwner => self.handle_resolve(self.address(), request).await,
            Relation::GroupMember | Relation::ForwardToBorderPeer => {
                request.forward = located.relation == Relation::ForwardToBorderPeer;
                self.send_resolve(located.address, request).await?
            }
            Relation::NotFound => return Err(AndnaError::NoSuchHostname),
        };

        match response {
            ResolveResponse::Found(reply) => {
                if located.relation != Relation::IAmOwner {
                    let timestamp = now_ms().saturating_sub(reply.elapsed_ms);
                    self.inner
                        .resolved
                        .lock()
                        .await
                        .insert(short, timestamp, reply.records.clone());
                }
                debug!(
                    hash = %hash,
                    owner = %located.address,
                    elapsed_ms = reply.elapsed_ms,
                    "resolved"
                );
                selected(reply.elapsed_ms, &reply.records, selector)
            }
            ResolveResponse::Rejected(e) => Err(e),
        }
    }

    /// Hostnames registered by `peer`.
    pub async fn reverse_resolve(&self, peer: PeerAddress) -> Result<Vec<String>, AndnaError> {
        if peer == self.address() {
            return Ok(self.handle_reverse_resolve().await.hostnames);
        }
        match self.rpc(peer, AndnaRequest::ReverseResolve).await? {
            AndnaResponse::ReverseResolve(reply) => Ok(reply.hostnames),
            _ => Err(AndnaError::MalformedRequest),
        }
    }

    /// Timestamp and records of the active claim on `hash`.
    async fn active_claim(&self, hash: &HostnameHash) -> Option<(u64, Vec<ServiceRecord>)> {
        let window = self.inner.config.expiration_ms();
        let mut andna = self.inner.andna.lock().await;
        let slot = andna.get(hash, now_ms(), window)?.active()?;
        Some((slot.timestamp, slot.records.clone()))
    }

    async fn send_resolve(
        &self,
        to: PeerAddress,
        request: ResolveRequest,
    ) -> Result<ResolveResponse, AndnaError> {
        match self.rpc(to, AndnaRequest::Resolve(request)).await? {
            AndnaResponse::Resolve(response) => Ok(response),
            _ => Err(AndnaError::MalformedRequest),
        }
    }

    pub(crate) async fn handle_resolve(
        &self,
        from: PeerAddress,
        request: ResolveRequest,
    ) -> ResolveResponse {
        let hash = request.hostname_hash;
        let excluded = self.route_exclusions(from, request.forward);
        let located = locate(self.inner.topology.as_ref(), &hash, &excluded, false);
        match located.relation {
            Relation::IAmOwner => {}
            Relation::GroupMember | Relation::ForwardToBorderPeer if request.forward => {
                let mut request = request;
                request.forward = located.relation == Relation::ForwardToBorderPeer;
                trace!(hash = %hash, next = %located.address, "relaying resolve");
                return match self.send_resolve(located.address, request).await {
                    Ok(response) => response,
                    Err(e) => ResolveResponse::Rejected(e),
                };
            }
            _ => return ResolveResponse::Rejected(AndnaError::WrongResponsibleNode),
        }

        if self.active_claim(&hash).await.is_none() && self.is_young_owner() {
            self.fetch_from_previous_owner(hash).await;
        }

        match self.active_claim(&hash).await {
            Some((timestamp, records)) if !select(&records, request.selector).is_empty() => {
                ResolveResponse::Found(ResolveReply {
                    elapsed_ms: now_ms().saturating_sub(timestamp),
                    records,
                })
            }
            _ => ResolveResponse::Rejected(AndnaError::NoSuchHostname),
        }
    }

    pub(crate) async fn handle_reverse_resolve(&self) -> ReverseResolveReply {
        ReverseResolveReply {
            hostnames: self.inner.local.lock().await.registered_hostnames(),
        }
    }
}
