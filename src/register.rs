//! # Registration Protocol
//!
//! Requester side: sign a [`RegisterRequest`] for an own hostname, send it
//! to the hash-gnode (or the border peer in front of it) and adopt the
//! returned update counter.
//!
//! Hash-gnode side, in order:
//! 1. drop request ids already seen
//! 2. verify the signature and bounds
//! 3. confirm responsibility, relaying forwarded requests onward
//! 4. as a young owner, fetch a missing entry from the previous owner
//! 5. answer a repeat of the claimant's last accepted request with the
//!    counter already committed
//! 6. pre-check the queue and have the counter node verify the counter
//!    (except for deletions)
//! 7. commit the claim atomically, then let the counter node count it
//! 8. reply, while the claim is flooded to the local group in the background
//!
//! Counter side: advance (or, for `just_check`, only verify) the registrant's
//! per-hostname counter. The counter node only advances after the owner has
//! committed, so a failed commit never leaves it ahead of the owner.
//!
//! Flood recipients store the registration as a backup entry after a
//! `just_check` with the counter node, then re-broadcast it once.

use tracing::{debug, info, trace, warn};

use crate::cache::Claim;
use crate::crypto::HostnameHash;
use crate::error::AndnaError;
use crate::flood::FloodKind;
use crate::identity::now_ms;
use crate::locator::{self, Located, Relation, locate};
use crate::messages::{
    AndnaRequest, AndnaResponse, CheckCounterRequest, CounterReply, RegisterFlags, RegisterReply,
    RegisterRequest,
};
use crate::node::AndnaNode;
use crate::protocols::AndnaRpc;
use crate::records::{self, ServiceRecord};
use crate::topology::{PeerAddress, Topology};

/// Clears a hostname's in-flight flag when the attempt ends, including when
/// the registration future is dropped mid-flight.
struct UpdateGuard<N: AndnaRpc, T: Topology> {
    node: Option<AndnaNode<N, T>>,
    hostname: String,
}

impl<N: AndnaRpc, T: Topology> UpdateGuard<N, T> {
    async fn finish(mut self, committed: Option<(u32, u64)>) {
        if let Some(node) = self.node.take() {
            node.inner.local.lock().await.finish_update(&self.hostname, committed);
        }
    }
}

impl<N: AndnaRpc, T: Topology> Drop for UpdateGuard<N, T> {
    fn drop(&mut self) {
        let Some(node) = self.node.take() else {
            return;
        };
        let hostname = std::mem::take(&mut self.hostname);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                node.inner.local.lock().await.finish_update(&hostname, None);
            });
        }
    }
}

impl<N: AndnaRpc, T: Topology> AndnaNode<N, T> {
    // ------------------------------------------------------------------
    // Requester side
    // ------------------------------------------------------------------

    /// Registers or refreshes an own hostname. Returns the update counter
    /// the hash-gnode committed.
    pub async fn register_hostname(&self, hostname: &str) -> Result<u32, AndnaError> {
        let (entry, guard) = match self.begin_update(hostname).await {
            Ok(started) => started,
            Err(AndnaError::AddressUnstable) => {
                let outcome = Err(AndnaError::AddressUnstable);
                self.record_outcome(&hostname.to_ascii_lowercase(), &outcome).await;
                return outcome;
            }
            Err(e) => return Err(e),
        };

        let mut records = vec![ServiceRecord::primary(self.address())];
        records.extend(entry.records.iter().cloned());
        let flags = RegisterFlags {
            update: entry.is_registered(),
            delete: false,
        };

        let outcome = self.submit(&entry.hostname, entry.update_counter, records, flags).await;
        guard.finish(outcome.ok().map(|c| (c, now_ms()))).await;
        self.record_outcome(&entry.hostname, &outcome).await;
        outcome
    }

    /// Withdraws service records from an own, already registered hostname.
    pub async fn delete_records(
        &self,
        hostname: &str,
        to_delete: Vec<ServiceRecord>,
    ) -> Result<u32, AndnaError> {
        let (entry, guard) = self.begin_update(hostname).await?;

        let outcome = if entry.is_registered() {
            let flags = RegisterFlags {
                update: true,
                delete: true,
            };
            self.submit(&entry.hostname, entry.update_counter, to_delete.clone(), flags)
                .await
        } else {
            Err(AndnaError::NoSuchHostname)
        };

        if outcome.is_ok() {
            let mut local = self.inner.local.lock().await;
            if let Some(mut current) = local.get(&entry.hostname).cloned() {
                records::remove_matching(&mut current.records, &to_delete);
                let max = self.inner.config.max_hostnames;
                if let Err(e) = local.add(&entry.hostname, current.records, max) {
                    warn!(
                        hostname = %entry.hostname,
                        error = %e,
                        "failed to drop deleted records locally"
                    );
                }
            }
        }
        guard.finish(outcome.ok().map(|c| (c, now_ms()))).await;
        self.record_outcome(&entry.hostname, &outcome).await;
        outcome
    }

    /// Re-registers own hostnames that are unregistered or close to expiry
    /// and not waiting out a retry backoff. Returns how many succeeded.
    pub async fn reregister_due(&self) -> usize {
        let now = now_ms();
        let config = &self.inner.config;
        let due = self.inner.local.lock().await.due_for_registration(
            now,
            config.expiration_ms(),
            config.reregister_margin_ms(),
        );

        let mut registered = 0;
        for hostname in due {
            let backing_off = self
                .inner
                .retry_at
                .lock()
                .await
                .get(&hostname)
                .is_some_and(|at| *at > now);
            if backing_off {
                continue;
            }
            if self.register_hostname(&hostname).await.is_ok() {
                registered += 1;
            }
        }
        registered
    }

    async fn begin_update(
        &self,
        hostname: &str,
    ) -> Result<(crate::cache::LocalCacheEntry, UpdateGuard<N, T>), AndnaError> {
        if !self.inner.topology.address_stable() {
            return Err(AndnaError::AddressUnstable);
        }
        let entry = self.inner.local.lock().await.begin_update(
            hostname,
            now_ms(),
            self.inner.config.min_update_ms(),
        )?;
        let guard = UpdateGuard {
            node: Some(self.clone()),
            hostname: entry.hostname.clone(),
        };
        Ok((entry, guard))
    }

    async fn submit(
        &self,
        hostname: &str,
        update_counter: u32,
        records: Vec<ServiceRecord>,
        flags: RegisterFlags,
    ) -> Result<u32, AndnaError> {
        let hash = HostnameHash::of_hostname(hostname);
        let mut request = RegisterRequest::signed(
            &self.inner.keypair,
            self.address(),
            hash,
            update_counter,
            records,
            flags,
        );
        let located = locate(self.inner.topology.as_ref(), &hash, &[], false);
        debug!(
            hostname,
            hash = %hash,
            owner = %located.address,
            relation = ?located.relation,
            update_counter,
            "submitting registration"
        );

        let reply = match located.relation {
            Relation::IAmOwner => self.handle_register(self.address(), request).await,
            Relation::GroupMember | Relation::ForwardToBorderPeer => {
                request.forward = located.relation == Relation::ForwardToBorderPeer;
                self.send_register(located.address, request).await?
            }
            Relation::NotFound => return Err(AndnaError::NetworkTimeout),
        };

        match reply {
            RegisterReply::Accepted { update_counter } => Ok(update_counter),
            RegisterReply::Rejected(e) => Err(e),
            RegisterReply::Ignored => Err(AndnaError::NetworkTimeout),
        }
    }

    async fn record_outcome(&self, hostname: &str, outcome: &Result<u32, AndnaError>) {
        let mut retry_at = self.inner.retry_at.lock().await;
        match outcome {
            Ok(counter) => {
                retry_at.remove(hostname);
                info!(hostname, update_counter = counter, "hostname registered");
            }
            Err(e) => {
                let at = now_ms() + self.inner.config.retry_backoff.as_millis() as u64;
                retry_at.insert(hostname.to_string(), at);
                if e.is_retryable() {
                    info!(hostname, error = %e, "registration deferred, will retry");
                } else {
                    warn!(hostname, error = %e, "registration rejected");
                }
            }
        }
    }

    async fn send_register(
        &self,
        to: PeerAddress,
        request: RegisterRequest,
    ) -> Result<RegisterReply, AndnaError> {
        match self.rpc(to, AndnaRequest::Register(request)).await? {
            AndnaResponse::Register(reply) => Ok(reply),
            _ => Err(AndnaError::MalformedRequest),
        }
    }

    // ------------------------------------------------------------------
    // Hash-gnode side
    // ------------------------------------------------------------------

    pub(crate) async fn handle_register(
        &self,
        from: PeerAddress,
        request: RegisterRequest,
    ) -> RegisterReply {
        if request.flooded {
            if !self.first_registration_sighting(&request).await {
                return RegisterReply::Ignored;
            }
            return self.handle_flooded_register(from, request).await;
        }

        let Ok(_permit) = self.inner.inbound.try_acquire() else {
            return RegisterReply::Rejected(AndnaError::TooManyConcurrentRegistrations);
        };

        if let Err(e) = self.validate_registration(&request) {
            debug!(peer = %from, hash = %request.hostname_hash, error = %e, "registration refused");
            return RegisterReply::Rejected(e);
        }

        let excluded = self.route_exclusions(from, request.forward);
        let hash = request.hostname_hash;
        let located = locate(self.inner.topology.as_ref(), &hash, &excluded, false);
        match located.relation {
            Relation::IAmOwner => {}
            Relation::GroupMember | Relation::ForwardToBorderPeer if request.forward => {
                return self.relay_register(located, request).await;
            }
            _ => {
                debug!(peer = %from, hash = %hash, "not responsible for registration");
                return RegisterReply::Rejected(AndnaError::WrongResponsibleNode);
            }
        }

        // Relays leave the id unrecorded so the flooded copy is still taken.
        if !self.first_registration_sighting(&request).await {
            return RegisterReply::Ignored;
        }

        match self.accept_registration(from, &request, located.rounded).await {
            Ok(update_counter) => RegisterReply::Accepted { update_counter },
            Err(e) => {
                debug!(
                    requester = %request.requester,
                    hash = %request.hostname_hash,
                    error = %e,
                    "registration rejected"
                );
                RegisterReply::Rejected(e)
            }
        }
    }

    async fn first_registration_sighting(&self, request: &RegisterRequest) -> bool {
        self.inner
            .flood
            .first_sighting(FloodKind::Registration, request.request_id)
            .await
    }

    fn validate_registration(&self, request: &RegisterRequest) -> Result<(), AndnaError> {
        request.verify().map_err(|_| AndnaError::InvalidSignature)?;
        records::validate(&request.records, self.inner.config.max_records)?;
        if !request.flags.delete && request.records.is_empty() {
            return Err(AndnaError::MalformedRequest);
        }
        Ok(())
    }

    async fn relay_register(
        &self,
        located: Located,
        mut request: RegisterRequest,
    ) -> RegisterReply {
        request.forward = located.relation == Relation::ForwardToBorderPeer;
        trace!(hash = %request.hostname_hash, next = %located.address, "relaying registration");
        match self.send_register(located.address, request).await {
            Ok(reply) => reply,
            Err(e) => RegisterReply::Rejected(e),
        }
    }

    async fn accept_registration(
        &self,
        from: PeerAddress,
        request: &RegisterRequest,
        rounded: bool,
    ) -> Result<u32, AndnaError> {
        let config = &self.inner.config;
        let hash = request.hostname_hash;
        let claim = Claim {
            hash,
            public_key: request.public_key,
            update_counter: request.update_counter,
            records: &request.records,
            requester: request.requester,
            delete: request.flags.delete,
            backup: false,
            rounded,
        };

        let known = self
            .inner
            .andna
            .lock()
            .await
            .contains(&hash, now_ms(), config.expiration_ms());
        if !known && self.is_young_owner() {
            self.fetch_from_previous_owner(hash).await;
        }

        {
            let mut andna = self.inner.andna.lock().await;
            let repeated = andna.repeated_claim(&claim, now_ms(), config.expiration_ms());
            if let Some(update_counter) = repeated {
                debug!(
                    hash = %hash,
                    requester = %request.requester,
                    update_counter,
                    "registration already committed, repeating reply"
                );
                return Ok(update_counter);
            }
            andna.precheck(&claim, now_ms(), config)?;
        }

        if !request.flags.delete {
            self.verify_counter(request, self.address(), true).await?;
        }

        let update_counter = self.inner.andna.lock().await.commit(&claim, now_ms(), config)?;
        info!(
            hash = %hash,
            requester = %request.requester,
            update_counter,
            delete = request.flags.delete,
            "registration committed"
        );

        if !request.flags.delete
            && let Err(e) = self.verify_counter(request, self.address(), false).await
        {
            warn!(
                hash = %hash,
                requester = %request.requester,
                error = %e,
                "counter node did not count registration"
            );
        }

        let mut flooded = request.clone();
        flooded.flooded = true;
        flooded.forward = false;
        let except = (from != self.address()).then_some(from);
        self.spawn_group_flood(AndnaRequest::Register(flooded), except);

        Ok(update_counter)
    }

    // ------------------------------------------------------------------
    // Flood recipient side
    // ------------------------------------------------------------------

    async fn handle_flooded_register(
        &self,
        from: PeerAddress,
        request: RegisterRequest,
    ) -> RegisterReply {
        if let Err(e) = self.validate_registration(&request) {
            return RegisterReply::Rejected(e);
        }

        let located = locate(self.inner.topology.as_ref(), &request.hostname_hash, &[], false);
        if !matches!(located.relation, Relation::IAmOwner | Relation::GroupMember) {
            trace!(peer = %from, hash = %request.hostname_hash, "flood for a foreign hash");
            return RegisterReply::Ignored;
        }

        if !request.flags.delete
            && let Err(e) = self.verify_counter(&request, located.address, true).await
        {
            debug!(
                peer = %from,
                hash = %request.hostname_hash,
                error = %e,
                "flooded registration failed counter check"
            );
            return RegisterReply::Rejected(e);
        }

        let config = &self.inner.config;
        let claim = Claim {
            hash: request.hostname_hash,
            public_key: request.public_key,
            update_counter: request.update_counter,
            records: &request.records,
            requester: request.requester,
            delete: request.flags.delete,
            backup: located.relation != Relation::IAmOwner,
            rounded: located.rounded,
        };
        let committed = self.inner.andna.lock().await.commit(&claim, now_ms(), config);
        let update_counter = match committed {
            Ok(counter) => counter,
            Err(e) => {
                trace!(hash = %request.hostname_hash, error = %e, "backup not stored");
                return RegisterReply::Rejected(e);
            }
        };
        debug!(hash = %request.hostname_hash, update_counter, "stored backup registration");

        self.flood_to_group(AndnaRequest::Register(request), Some(from)).await;
        RegisterReply::Accepted { update_counter }
    }

    // ------------------------------------------------------------------
    // Counter node
    // ------------------------------------------------------------------

    /// Asks the counter node of `request`'s registrant to approve it. The
    /// counter node is located away from `hash_owner`; when no other peer
    /// exists the local counter cache answers.
    async fn verify_counter(
        &self,
        request: &RegisterRequest,
        hash_owner: PeerAddress,
        just_check: bool,
    ) -> Result<(), AndnaError> {
        let mut check = request.counter_check(hash_owner, just_check);
        let counter_hash = locator::counter_hash(&request.requester);
        let located = locate(self.inner.topology.as_ref(), &counter_hash, &[hash_owner], false);

        let reply = match located.relation {
            Relation::IAmOwner | Relation::NotFound => {
                return self
                    .apply_counter_check(&check)
                    .await
                    .map_err(|_| AndnaError::CounterCheckFailed);
            }
            Relation::GroupMember | Relation::ForwardToBorderPeer => {
                check.forward = located.relation == Relation::ForwardToBorderPeer;
                self.send_counter_check(located.address, check).await?
            }
        };

        match reply {
            CounterReply::Accepted => Ok(()),
            CounterReply::Rejected(e) => {
                debug!(counter_node = %located.address, error = %e, "counter node refused");
                Err(AndnaError::CounterCheckFailed)
            }
            CounterReply::Ignored => Err(AndnaError::CounterCheckFailed),
        }
    }

    async fn send_counter_check(
        &self,
        to: PeerAddress,
        check: CheckCounterRequest,
    ) -> Result<CounterReply, AndnaError> {
        match self.rpc(to, AndnaRequest::CheckCounter(check)).await? {
            AndnaResponse::CheckCounter(reply) => Ok(reply),
            _ => Err(AndnaError::MalformedRequest),
        }
    }

    pub(crate) async fn handle_check_counter(
        &self,
        from: PeerAddress,
        check: CheckCounterRequest,
    ) -> CounterReply {
        if !check.just_check
            && !self
                .inner
                .flood
                .first_sighting(FloodKind::CounterCheck, check.request_id)
                .await
        {
            return CounterReply::Ignored;
        }
        if check.verify().is_err() {
            return CounterReply::Rejected(AndnaError::InvalidSignature);
        }

        let mut excluded = self.route_exclusions(from, check.forward);
        excluded.push(check.hash_owner);
        let counter_hash = locator::counter_hash(&check.requester);
        let located = locate(self.inner.topology.as_ref(), &counter_hash, &excluded, false);
        match located.relation {
            Relation::IAmOwner => {}
            Relation::GroupMember | Relation::ForwardToBorderPeer if check.forward => {
                let mut check = check;
                check.forward = located.relation == Relation::ForwardToBorderPeer;
                return match self.send_counter_check(located.address, check).await {
                    Ok(reply) => reply,
                    Err(e) => CounterReply::Rejected(e),
                };
            }
            _ => return CounterReply::Rejected(AndnaError::WrongResponsibleNode),
        }

        match self.apply_counter_check(&check).await {
            Ok(()) => CounterReply::Accepted,
            Err(e) => CounterReply::Rejected(e),
        }
    }

    async fn apply_counter_check(&self, check: &CheckCounterRequest) -> Result<(), AndnaError> {
        let result = self.inner.counter.lock().await.check(
            check.public_key,
            check.hostname_hash,
            check.update_counter,
            check.just_check,
            now_ms(),
            &self.inner.config,
        );
        match &result {
            Ok(()) => trace!(
                hash = %check.hostname_hash,
                update_counter = check.update_counter,
                just_check = check.just_check,
                "counter check passed"
            ),
            Err(e) => debug!(
                hash = %check.hostname_hash,
                update_counter = check.update_counter,
                just_check = check.just_check,
                error = %e,
                "counter check failed"
            ),
        }
        result
    }
}
