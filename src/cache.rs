//! # Registration and Resolution Caches
//!
//! | Cache | Key | Holds |
//! |-------|-----|-------|
//! | [`LocalCache`] | hostname | names this node wants registered |
//! | [`AndnaCache`] | hostname hash | claims this node is responsible for |
//! | [`CounterCache`] | registrant public key | per-hostname update counters |
//! | [`ResolvedNameCache`] | 32-bit hostname hash | memoized resolutions (LRU) |
//!
//! All timestamps are milliseconds since the Unix epoch. An entry stamped
//! `t` is expired once `now > t + window`; lookups never return expired
//! entries and [`sweep`](AndnaCache::sweep) physically removes them.
//!
//! The caches are plain data structures. The node wraps each one in its own
//! lock and performs every find-or-create-then-mutate sequence while holding
//! it.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::config::AndnaConfig;
use crate::crypto::HostnameHash;
use crate::error::AndnaError;
use crate::identity::PublicKey;
use crate::records::{self, ServiceRecord};
use crate::topology::PeerAddress;

#[inline]
pub fn is_expired(timestamp: u64, now: u64, window: u64) -> bool {
    now > timestamp.saturating_add(window)
}

// ============================================================================
// Local Cache
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCacheEntry {
    pub hostname: String,
    pub short_hash: u32,
    pub update_counter: u32,
    /// Time of the last successful registration, 0 if never registered.
    pub timestamp: u64,
    pub records: Vec<ServiceRecord>,
    /// Set while a registration for this hostname is in flight.
    #[serde(skip)]
    pub updating: bool,
}

impl LocalCacheEntry {
    pub fn is_registered(&self) -> bool {
        self.timestamp != 0
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalCache {
    entries: BTreeMap<String, LocalCacheEntry>,
}

impl LocalCache {
    /// Adds or replaces the records of a hostname this node wants. The
    /// registration state of an existing entry is kept.
    pub fn add(
        &mut self,
        hostname: &str,
        records: Vec<ServiceRecord>,
        max_hostnames: usize,
    ) -> Result<(), AndnaError> {
        let hostname = hostname.to_ascii_lowercase();
        if let Some(entry) = self.entries.get_mut(&hostname) {
            entry.records = records;
            return Ok(());
        }
        if self.entries.len() >= max_hostnames {
            return Err(AndnaError::TooManyHostnames);
        }
        let short_hash = HostnameHash::of_hostname(&hostname).short();
        self.entries.insert(
            hostname.clone(),
            LocalCacheEntry {
                hostname,
                short_hash,
                update_counter: 0,
                timestamp: 0,
                records,
                updating: false,
            },
        );
        Ok(())
    }

    pub fn get(&self, hostname: &str) -> Option<&LocalCacheEntry> {
        self.entries.get(&hostname.to_ascii_lowercase())
    }

    pub fn find_by_hash(&self, short_hash: u32) -> Option<&LocalCacheEntry> {
        self.entries.values().find(|e| e.short_hash == short_hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn registered_hostnames(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.is_registered())
            .map(|e| e.hostname.clone())
            .collect()
    }

    /// Marks a hostname as being updated. Fails if it is unknown, already in
    /// flight, or was updated less than `min_interval` ago.
    pub fn begin_update(
        &mut self,
        hostname: &str,
        now: u64,
        min_interval: u64,
    ) -> Result<LocalCacheEntry, AndnaError> {
        let entry = self
            .entries
            .get_mut(&hostname.to_ascii_lowercase())
            .ok_or(AndnaError::NoSuchHostname)?;
        if entry.updating {
            return Err(AndnaError::TooManyConcurrentRegistrations);
        }
        if entry.is_registered() && now < entry.timestamp.saturating_add(min_interval) {
            return Err(AndnaError::TooEarly);
        }
        entry.updating = true;
        Ok(entry.clone())
    }

    /// Clears the in-flight flag; records the new counter on success.
    pub fn finish_update(&mut self, hostname: &str, committed: Option<(u32, u64)>) {
        if let Some(entry) = self.entries.get_mut(&hostname.to_ascii_lowercase()) {
            entry.updating = false;
            if let Some((counter, timestamp)) = committed {
                entry.update_counter = counter;
                entry.timestamp = timestamp;
            }
        }
    }

    /// Own hostnames that need (re-)registration at `now`.
    pub fn due_for_registration(&self, now: u64, window: u64, margin: u64) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| !e.updating)
            .filter(|e| {
                !e.is_registered()
                    || now.saturating_add(margin) >= e.timestamp.saturating_add(window)
            })
            .map(|e| e.hostname.clone())
            .collect()
    }

    /// Forgets registrations that expired while nobody refreshed them, so
    /// they are registered from scratch.
    pub fn sweep(&mut self, now: u64, window: u64) -> usize {
        let mut reset = 0;
        for entry in self.entries.values_mut() {
            if entry.is_registered() && is_expired(entry.timestamp, now, window) {
                entry.timestamp = 0;
                reset += 1;
            }
        }
        reset
    }
}

// ============================================================================
// ANDNA Cache
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSlot {
    pub public_key: PublicKey,
    pub update_counter: u32,
    pub timestamp: u64,
    pub records: Vec<ServiceRecord>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AndnaCacheFlags {
    /// The queue is at capacity.
    pub full: bool,
    /// Stored as a group backup rather than as the hash-gnode.
    pub backup: bool,
    /// Owned through a rounded lookup rather than an exact position match.
    pub rounded: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AndnaCacheEntry {
    pub hash: HostnameHash,
    pub flags: AndnaCacheFlags,
    /// Head slot is the active claim.
    pub queue: Vec<QueueSlot>,
}

impl AndnaCacheEntry {
    pub fn new(hash: HostnameHash) -> Self {
        Self {
            hash,
            flags: AndnaCacheFlags::default(),
            queue: Vec::new(),
        }
    }

    pub fn active(&self) -> Option<&QueueSlot> {
        self.queue.first()
    }

    fn purge_expired(&mut self, now: u64, window: u64) {
        self.queue.retain(|s| !is_expired(s.timestamp, now, window));
    }
}

/// A claim on a hostname, as validated by the responsible peer.
#[derive(Clone, Debug)]
pub struct Claim<'a> {
    pub hash: HostnameHash,
    pub public_key: PublicKey,
    pub update_counter: u32,
    pub records: &'a [ServiceRecord],
    pub requester: PeerAddress,
    pub delete: bool,
    pub backup: bool,
    pub rounded: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AndnaCache {
    entries: HashMap<HostnameHash, AndnaCacheEntry>,
}

impl AndnaCache {
    /// Live entry for `hash`; expired slots are dropped on the way.
    pub fn get(&mut self, hash: &HostnameHash, now: u64, window: u64) -> Option<&AndnaCacheEntry> {
        let empty = match self.entries.get_mut(hash) {
            Some(entry) => {
                entry.purge_expired(now, window);
                entry.queue.is_empty()
            }
            None => return None,
        };
        if empty {
            self.entries.remove(hash);
            return None;
        }
        self.entries.get(hash)
    }

    pub fn contains(&mut self, hash: &HostnameHash, now: u64, window: u64) -> bool {
        self.get(hash, now, window).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> Vec<AndnaCacheEntry> {
        self.entries.values().cloned().collect()
    }

    /// Counter already committed for a repeat of the claimant's last
    /// accepted request, identified by a slot exactly one counter ahead.
    /// The requester missed that reply and retried with its old counter.
    pub fn repeated_claim(&mut self, claim: &Claim<'_>, now: u64, window: u64) -> Option<u32> {
        let slot = self
            .get(&claim.hash, now, window)?
            .queue
            .iter()
            .find(|s| s.public_key == claim.public_key)?;
        let next = claim.update_counter.checked_add(1)?;
        (slot.timestamp != 0 && slot.update_counter == next).then_some(slot.update_counter)
    }

    /// Checks a claim against the current queue without modifying it.
    pub fn precheck(
        &mut self,
        claim: &Claim<'_>,
        now: u64,
        config: &AndnaConfig) -> Result<(), AndnaError> {
        let window = config.expiration_ms();
        let Some(entry) = self.get(&claim.hash, now, window) else {
            return if claim.delete {
                Err(AndnaError::NoSuchHostname)
            } else {
                Ok(())
            };
        };
        match entry.queue.iter().find(|s| s.public_key == claim.public_key) {
            Some(slot) => check_slot(slot, claim.update_counter, now, config.min_update_ms()),
            None if claim.delete => Err(AndnaError::NoSuchHostname),
            None if entry.queue.len() >= config.max_queue => Err(AndnaError::QueueFull),
            None => Ok(()),
        }
    }

    /// Applies a claim: finds or appends the requester's slot, enforces the
    /// counter and interval rules, updates its records and stamps it.
    /// Returns the slot's new update counter.
    pub fn commit(
        &mut self,
        claim: &Claim<'_>,
        now: u64,
        config: &AndnaConfig,
    ) -> Result<u32, AndnaError> {
        let window = config.expiration_ms();
        let entry = self
            .entries
            .entry(claim.hash)
            .or_insert_with(|| AndnaCacheEntry::new(claim.hash));
        entry.purge_expired(now, window);

        let result = apply_claim(entry, claim, now, config);

        if entry.queue.is_empty() {
            self.entries.remove(&claim.hash);
        }
        result
    }

    /// Merges an entry fetched from another peer. Slots are matched by public
    /// key and the fresher state wins; foreign slots are appended while the
    /// queue has room.
    pub fn merge(&mut self, incoming: AndnaCacheEntry, now: u64, config: &AndnaConfig) {
        let window = config.expiration_ms();
        let entry = self
            .entries
            .entry(incoming.hash)
            .or_insert_with(|| AndnaCacheEntry {
                hash: incoming.hash,
                flags: incoming.flags,
                queue: Vec::new(),
            });
        for slot in incoming.queue {
            if is_expired(slot.timestamp, now, window) {
                continue;
            }
            match entry.queue.iter().position(|s| s.public_key == slot.public_key) {
                Some(i) => {
                    let existing = &mut entry.queue[i];
                    let fresher = (slot.update_counter, slot.timestamp)
                        > (existing.update_counter, existing.timestamp);
                    if fresher {
                        *existing = slot;
                    }
                }
                None if entry.queue.len() < config.max_queue => entry.queue.push(slot),
                None => {}
            }
        }
        entry.purge_expired(now, window);
        entry.flags.full = entry.queue.len() >= config.max_queue;
        if entry.queue.is_empty() {
            let hash = entry.hash;
            self.entries.remove(&hash);
        }
    }

    pub fn sweep(&mut self, now: u64, window: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.purge_expired(now, window);
            !entry.queue.is_empty()
        });
        before - self.entries.len()
    }
}

fn check_slot(
    slot: &QueueSlot,
    update_counter: u32,
    now: u64,
    min_interval: u64) -> Result<(), AndnaError> {
    if slot.update_counter > update_counter {
        return Err(AndnaError::UpdateCounterMismatch);
    }
    if slot.timestamp != 0 && now < slot.timestamp.saturating_add(min_interval) {
        return Err(AndnaError::TooEarly);
    }
    Ok(())
}

fn apply_claim(
    entry: &mut AndnaCacheEntry,
    claim: &Claim<'_>,
    now: u64,
    config: &AndnaConfig,
) -> Result<u32, AndnaError> {
    let idx = match entry.queue.iter().position(|s| s.public_key == claim.public_key) {
        Some(i) => i,
        None if claim.delete => return Err(AndnaError::NoSuchHostname),
        None if entry.queue.len() >= config.max_queue => return Err(AndnaError::QueueFull),
        None => {
            entry.queue.push(QueueSlot {
                public_key: claim.public_key,
                update_counter: 0,
                timestamp: 0,
                records: Vec::new(),
            });
            entry.queue.len() - 1
        }
    };

    let is_active = idx == 0;
    let slot = &mut entry.queue[idx];
    if let Err(e) = check_slot(slot, claim.update_counter, now, config.min_update_ms()) {
        if slot.timestamp == 0 {
            entry.queue.remove(idx);
        }
        return Err(e);
    }

    if claim.delete {
        records::remove_matching(&mut slot.records, claim.records);
    } else if is_active {
        slot.records = claim.records.to_vec();
    } else {
        slot.records = vec![ServiceRecord::primary(claim.requester)];
    }
    slot.timestamp = now;
    slot.update_counter = claim.update_counter.saturating_add(1);
    let counter = slot.update_counter;

    entry.flags.full = entry.queue.len() >= config.max_queue;
    entry.flags.backup = claim.backup;
    entry.flags.rounded = claim.rounded;
    Ok(counter)
}

// ============================================================================
// Counter Cache
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterHash {
    pub hash: HostnameHash,
    pub update_counter: u32,
    pub timestamp: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterCacheFlags {
    /// The key holds the maximum number of hostnames.
    pub full: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterCacheEntry {
    pub public_key: PublicKey,
    pub flags: CounterCacheFlags,
    pub hashes: Vec<CounterHash>,
}

impl CounterCacheEntry {
    fn purge_expired(&mut self, now: u64, window: u64) {
        self.hashes.retain(|h| !is_expired(h.timestamp, now, window));
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CounterCache {
    entries: HashMap<PublicKey, CounterCacheEntry>,
}

impl CounterCache {
    /// Counter-node verdict on a registration.
    ///
    /// The advancing check accepts iff the stored counter is not ahead of the
    /// request, then stores `update_counter + 1`. A `just_check` is issued for
    /// registrations the counter node has already counted once, so it
    /// tolerates a stored counter exactly one ahead and never mutates state.
    pub fn check(
        &mut self,
        public_key: PublicKey,
        hash: HostnameHash,
        update_counter: u32,
        just_check: bool,
        now: u64,
        config: &AndnaConfig,
    ) -> Result<(), AndnaError> {
        let window = config.expiration_ms();
        let tolerance = u32::from(just_check);

        if let Some(entry) = self.entries.get_mut(&public_key) {
            entry.purge_expired(now, window);
            if let Some(stored) = entry.hashes.iter_mut().find(|h| h.hash == hash) {
                if stored.update_counter > update_counter.saturating_add(tolerance) {
                    return Err(AndnaError::UpdateCounterMismatch);
                }
                if !just_check {
                    stored.update_counter = update_counter.saturating_add(1);
                    stored.timestamp = now;
                }
                return Ok(());
            }
        }

        if just_check {
            return Ok(());
        }

        let entry = self
            .entries
            .entry(public_key)
            .or_insert_with(|| CounterCacheEntry {
                public_key,
                flags: CounterCacheFlags::default(),
                hashes: Vec::new(),
            });
        if entry.hashes.len() >= config.max_hostnames {
            entry.flags.full = true;
            return Err(AndnaError::TooManyHostnames);
        }
        entry.hashes.push(CounterHash {
            hash,
            update_counter: update_counter.saturating_add(1),
            timestamp: now,
        });
        entry.flags.full = entry.hashes.len() >= config.max_hostnames;
        Ok(())
    }

    pub fn stored_counter(&self, public_key: &PublicKey, hash: &HostnameHash) -> Option<u32> {
        self.entries
            .get(public_key)?
            .hashes
            .iter()
            .find(|h| h.hash == *hash)
            .map(|h| h.update_counter)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> Vec<CounterCacheEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn merge(&mut self, incoming: CounterCacheEntry, now: u64, config: &AndnaConfig) {
        let window = config.expiration_ms();
        let entry = self
            .entries
            .entry(incoming.public_key)
            .or_insert_with(|| CounterCacheEntry {
                public_key: incoming.public_key,
                flags: CounterCacheFlags::default(),
                hashes: Vec::new(),
            });
        for h in incoming.hashes {
            if is_expired(h.timestamp, now, window) {
                continue;
            }
            match entry.hashes.iter().position(|e| e.hash == h.hash) {
                Some(i) => {
                    if h.update_counter > entry.hashes[i].update_counter {
                        entry.hashes[i] = h;
                    }
                }
                None if entry.hashes.len() < config.max_hostnames => entry.hashes.push(h),
                None => {}
            }
        }
        entry.flags.full = entry.hashes.len() >= config.max_hostnames;
        if entry.hashes.is_empty() {
            let key = entry.public_key;
            self.entries.remove(&key);
        }
    }

    pub fn sweep(&mut self, now: u64, window: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.purge_expired(now, window);
            !entry.hashes.is_empty()
        });
        before - self.entries.len()
    }
}

// ============================================================================
// Resolved Name Cache
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedNameEntry {
    pub short_hash: u32,
    /// Registration time of the answer, adjusted to the local clock.
    pub timestamp: u64,
    pub records: Vec<ServiceRecord>,
}

/// Most-recently-used ordered cache of resolutions.
pub struct ResolvedNameCache {
    entries: LruCache<u32, ResolvedNameEntry>,
}

impl ResolvedNameCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Cached entry, promoted to most-recently-used. Expired entries are
    /// removed instead.
    pub fn get(&mut self, short_hash: u32, now: u64, window: u64) -> Option<ResolvedNameEntry> {
        let expired = is_expired(self.entries.peek(&short_hash)?.timestamp, now, window);
        if expired {
            self.entries.pop(&short_hash);
            return None;
        }
        self.entries.get(&short_hash).cloned()
    }

    /// Inserts at the most-recently-used position, evicting the least
    /// recently used entry when full.
    pub fn insert(&mut self, short_hash: u32, timestamp: u64, records: Vec<ServiceRecord>) {
        self.entries.put(
            short_hash,
            ResolvedNameEntry {
                short_hash,
                timestamp,
                records,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sweep(&mut self, now: u64, window: u64) -> usize {
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| is_expired(e.timestamp, now, window))
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    /// Entries in recency order, most recent first.
    pub fn snapshot(&self) -> Vec<ResolvedNameEntry> {
        self.entries.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn from_snapshot(capacity: usize, snapshot: Vec<ResolvedNameEntry>) -> Self {
        let mut cache = Self::new(capacity);
        for entry in snapshot.into_iter().rev() {
            cache.entries.put(entry.short_hash, entry);
        }
        cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn addr(s: &str) -> PeerAddress {
        s.parse().unwrap()
    }

    fn config() -> AndnaConfig {
        AndnaConfig {
            expiration_window: std::time::Duration::from_millis(10_000),
            min_update_interval: std::time::Duration::from_millis(1_000),
            max_queue: 3,
            max_hostnames: 2,
            ..AndnaConfig::default()
        }
    }

    fn claim<'a>(
        hash: HostnameHash,
        key: PublicKey,
        counter: u32,
        records: &'a [ServiceRecord],
        requester: &str,
    ) -> Claim<'a> {
        Claim {
            hash,
            public_key: key,
            update_counter: counter,
            records,
            requester: addr(requester),
            delete: false,
            backup: false,
            rounded: false,
        }
    }

    #[test]
    fn commit_sets_counter_to_request_plus_one() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let key = Keypair::generate().public_key();
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];

        assert_eq!(cache.commit(&claim(hash, key, 0, &recs, "10.0.0.1"), 1_000, &cfg), Ok(1));
        let entry = cache.get(&hash, 1_000, cfg.expiration_ms()).unwrap();
        assert_eq!(entry.active().unwrap().update_counter, 1);
        assert_eq!(entry.active().unwrap().records, recs);
    }

    #[test]
    fn commit_rejects_stale_counter_and_early_update() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let key = Keypair::generate().public_key();
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];

        cache.commit(&claim(hash, key, 4, &recs, "10.0.0.1"), 1_000, &cfg).unwrap();
        assert_eq!(
            cache.commit(&claim(hash, key, 5, &recs, "10.0.0.1"), 1_500, &cfg),
            Err(AndnaError::TooEarly)
        );
        assert_eq!(
            cache.commit(&claim(hash, key, 3, &recs, "10.0.0.1"), 5_000, &cfg),
            Err(AndnaError::UpdateCounterMismatch)
        );
        assert_eq!(cache.commit(&claim(hash, key, 5, &recs, "10.0.0.1"), 5_000, &cfg), Ok(6));
    }

    #[test]
    fn same_key_reuses_its_slot() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let key = Keypair::generate().public_key();
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];

        cache.commit(&claim(hash, key, 0, &recs, "10.0.0.1"), 1_000, &cfg).unwrap();
        cache.commit(&claim(hash, key, 1, &recs, "10.0.0.1"), 3_000, &cfg).unwrap();
        assert_eq!(cache.get(&hash, 3_000, cfg.expiration_ms()).unwrap().queue.len(), 1);
    }

    #[test]
    fn queued_claimant_keeps_only_primary_address() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let first = Keypair::generate().public_key();
        let second = Keypair::generate().public_key();
        let first_recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];
        let mut second_recs = vec![ServiceRecord::primary(addr("10.0.0.2"))];
        second_recs.push(ServiceRecord {
            service: 80,
            protocol: crate::records::Protocol::Tcp,
            priority: 0,
            weight: 1,
            target: crate::records::RecordTarget::Address(addr("10.0.0.99")),
        });

        cache.commit(&claim(hash, first, 0, &first_recs, "10.0.0.1"), 1_000, &cfg).unwrap();
        cache.commit(&claim(hash, second, 0, &second_recs, "10.0.0.2"), 1_100, &cfg).unwrap();

        let entry = cache.get(&hash, 1_100, cfg.expiration_ms()).unwrap();
        assert_eq!(entry.queue.len(), 2);
        assert_eq!(entry.active().unwrap().public_key, first);
        assert_eq!(entry.queue[1].records, vec![ServiceRecord::primary(addr("10.0.0.2"))]);
    }

    #[test]
    fn queue_full_rejects_new_keys_only() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];
        let keys: Vec<_> = (0..3).map(|_| Keypair::generate().public_key()).collect();
        for key in &keys {
            cache.commit(&claim(hash, *key, 0, &recs, "10.0.0.1"), 1_000, &cfg).unwrap();
        }
        let outsider = Keypair::generate().public_key();
        assert_eq!(
            cache.commit(&claim(hash, outsider, 0, &recs, "10.0.0.1"), 1_000, &cfg),
            Err(AndnaError::QueueFull)
        );
        assert!(cache.get(&hash, 1_000, cfg.expiration_ms()).unwrap().flags.full);
        assert_eq!(cache.commit(&claim(hash, keys[1], 1, &recs, "10.0.0.1"), 5_000, &cfg), Ok(2));
        assert_eq!(cache.get(&hash, 5_000, cfg.expiration_ms()).unwrap().queue.len(), 3);
    }

    #[test]
    fn expired_head_promotes_next_claimant() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let first = Keypair::generate().public_key();
        let second = Keypair::generate().public_key();
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];
        cache.commit(&claim(hash, first, 0, &recs, "10.0.0.1"), 1_000, &cfg).unwrap();
        cache.commit(&claim(hash, second, 0, &recs, "10.0.0.2"), 6_000, &cfg).unwrap();

        let entry = cache.get(&hash, 12_000, cfg.expiration_ms()).unwrap();
        assert_eq!(entry.active().unwrap().public_key, second);
    }

    #[test]
    fn delete_removes_selected_records() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let key = Keypair::generate().public_key();
        let web = ServiceRecord {
            service: 80,
            protocol: crate::records::Protocol::Tcp,
            priority: 0,
            weight: 1,
            target: crate::records::RecordTarget::Address(addr("10.0.0.9")),
        };
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1")), web.clone()];
        cache.commit(&claim(hash, key, 0, &recs, "10.0.0.1"), 1_000, &cfg).unwrap();

        let to_delete = vec![web];
        let mut del = claim(hash, key, 1, &to_delete, "10.0.0.1");
        del.delete = true;
        cache.commit(&del, 3_000, &cfg).unwrap();
        let entry = cache.get(&hash, 3_000, cfg.expiration_ms()).unwrap();
        assert_eq!(entry.active().unwrap().records, vec![ServiceRecord::primary(addr("10.0.0.1"))]);
    }

    #[test]
    fn delete_of_unknown_claim_is_rejected_without_residue() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let key = Keypair::generate().public_key();
        let mut del = claim(hash, key, 0, &[], "10.0.0.1");
        del.delete = true;
        assert_eq!(cache.precheck(&del, 1_000, &cfg), Err(AndnaError::NoSuchHostname));
        assert_eq!(cache.commit(&del, 1_000, &cfg), Err(AndnaError::NoSuchHostname));
        assert!(cache.is_empty());
    }

    #[test]
    fn precheck_mirrors_commit_rules() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let key = Keypair::generate().public_key();
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];
        assert!(cache.precheck(&claim(hash, key, 0, &recs, "10.0.0.1"), 1_000, &cfg).is_ok());
        cache.commit(&claim(hash, key, 0, &recs, "10.0.0.1"), 1_000, &cfg).unwrap();
        assert_eq!(
            cache.precheck(&claim(hash, key, 1, &recs, "10.0.0.1"), 1_200, &cfg),
            Err(AndnaError::TooEarly)
        );
        assert_eq!(
            cache.precheck(&claim(hash, key, 0, &recs, "10.0.0.1"), 5_000, &cfg),
            Err(AndnaError::UpdateCounterMismatch)
        );
    }

    #[test]
    fn expired_entries_are_unreachable_then_swept() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let key = Keypair::generate().public_key();
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];
        cache.commit(&claim(hash, key, 0, &recs, "10.0.0.1"), 1_000, &cfg).unwrap();

        assert!(cache.contains(&hash, 11_000, cfg.expiration_ms()));
        assert_eq!(cache.sweep(11_001, cfg.expiration_ms()), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn merge_prefers_fresher_slot() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let key = Keypair::generate().public_key();
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];
        cache.commit(&claim(hash, key, 0, &recs, "10.0.0.1"), 1_000, &cfg).unwrap();

        let mut newer = cache.get(&hash, 1_000, cfg.expiration_ms()).unwrap().clone();
        newer.queue[0].update_counter = 7;
        newer.queue[0].timestamp = 2_000;
        cache.merge(newer, 2_000, &cfg);
        let entry = cache.get(&hash, 2_000, cfg.expiration_ms()).unwrap();
        assert_eq!(entry.active().unwrap().update_counter, 7);
    }

    #[test]
    fn merge_into_full_queue_only_refreshes_known_slots() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let keys: Vec<PublicKey> = (0..3).map(|_| Keypair::generate().public_key()).collect();
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];
        for key in &keys {
            cache.commit(&claim(hash, *key, 0, &recs, "10.0.0.1"), 1_000, &cfg).unwrap();
        }

        let mut incoming = cache.get(&hash, 1_000, cfg.expiration_ms()).unwrap().clone();
        incoming.queue[2].update_counter = 5;
        incoming.queue[2].timestamp = 2_000;
        let mut stranger = incoming.queue[0].clone();
        stranger.public_key = Keypair::generate().public_key();
        incoming.queue.push(stranger.clone());
        cache.merge(incoming, 2_000, &cfg);

        let entry = cache.get(&hash, 2_000, cfg.expiration_ms()).unwrap();
        assert_eq!(entry.queue.len(), 3);
        assert!(entry.flags.full);
        assert_eq!(entry.queue[2].update_counter, 5);
        assert!(entry.queue.iter().all(|s| s.public_key != stranger.public_key));
    }

    #[test]
    fn repeated_claim_reports_the_committed_counter() {
        let cfg = config();
        let mut cache = AndnaCache::default();
        let hash = HostnameHash::of_hostname("alpha");
        let key = Keypair::generate().public_key();
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];
        let window = cfg.expiration_ms();

        let repeat = |cache: &mut AndnaCache, key, counter| {
            cache.repeated_claim(&claim(hash, key, counter, &recs, "10.0.0.1"), 1_200, window)
        };

        assert_eq!(repeat(&mut cache, key, 0), None);
        cache.commit(&claim(hash, key, 3, &recs, "10.0.0.1"), 1_000, &cfg).unwrap();

        assert_eq!(repeat(&mut cache, key, 3), Some(4));
        assert_eq!(repeat(&mut cache, key, 4), None);
        assert_eq!(repeat(&mut cache, key, 2), None);
        assert_eq!(repeat(&mut cache, Keypair::generate().public_key(), 3), None);
        // Answering a repeat leaves the slot untouched.
        assert_eq!(cache.get(&hash, 1_200, window).unwrap().active().unwrap().timestamp, 1_000);
    }

    #[test]
    fn counter_merge_into_full_key_only_refreshes_known_hashes() {
        let cfg = config();
        let mut cache = CounterCache::default();
        let key = Keypair::generate().public_key();
        let a = HostnameHash::of_hostname("a");
        cache.check(key, a, 0, false, 1_000, &cfg).unwrap();
        cache.check(key, HostnameHash::of_hostname("b"), 0, false, 1_000, &cfg).unwrap();

        let mut incoming = cache.entries().pop().unwrap();
        for h in incoming.hashes.iter_mut().filter(|h| h.hash == a) {
            h.update_counter = 9;
        }
        incoming.hashes.push(CounterHash {
            hash: HostnameHash::of_hostname("c"),
            update_counter: 1,
            timestamp: 1_000,
        });
        cache.merge(incoming, 1_500, &cfg);

        assert_eq!(cache.stored_counter(&key, &a), Some(9));
        assert_eq!(cache.stored_counter(&key, &HostnameHash::of_hostname("c")), None);
        assert!(cache.entries()[0].flags.full);
    }

    #[test]
    fn counter_check_advances_and_orders() {
        let cfg = config();
        let mut cache = CounterCache::default();
        let key = Keypair::generate().public_key();
        let hash = HostnameHash::of_hostname("alpha");

        assert!(cache.check(key, hash, 0, false, 1_000, &cfg).is_ok());
        assert_eq!(cache.stored_counter(&key, &hash), Some(1));
        assert_eq!(
            cache.check(key, hash, 0, false, 1_000, &cfg),
            Err(AndnaError::UpdateCounterMismatch)
        );
        assert!(cache.check(key, hash, 1, false, 2_000, &cfg).is_ok());
        assert_eq!(cache.stored_counter(&key, &hash), Some(2));
    }

    #[test]
    fn just_check_tolerates_counted_registration_without_advancing() {
        let cfg = config();
        let mut cache = CounterCache::default();
        let key = Keypair::generate().public_key();
        let hash = HostnameHash::of_hostname("alpha");

        cache.check(key, hash, 3, false, 1_000, &cfg).unwrap();
        assert_eq!(cache.stored_counter(&key, &hash), Some(4));

        // A relayed copy of the same registration is verified but not counted.
        assert!(cache.check(key, hash, 3, true, 1_000, &cfg).is_ok());
        assert!(cache.check(key, hash, 3, true, 1_000, &cfg).is_ok());
        assert_eq!(cache.stored_counter(&key, &hash), Some(4));

        // An older registration is still refused.
        assert_eq!(
            cache.check(key, hash, 2, true, 1_000, &cfg),
            Err(AndnaError::UpdateCounterMismatch)
        );
        // And the counted one cannot be counted twice.
        assert_eq!(
            cache.check(key, hash, 3, false, 1_000, &cfg),
            Err(AndnaError::UpdateCounterMismatch)
        );
    }

    #[test]
    fn just_check_on_unknown_hash_creates_nothing() {
        let cfg = config();
        let mut cache = CounterCache::default();
        let key = Keypair::generate().public_key();
        assert!(cache.check(key, HostnameHash::of_hostname("a"), 0, true, 1_000, &cfg).is_ok());
        assert!(cache.is_empty());
    }

    #[test]
    fn counter_cache_bounds_hostnames_per_key() {
        let cfg = config();
        let mut cache = CounterCache::default();
        let key = Keypair::generate().public_key();
        cache.check(key, HostnameHash::of_hostname("a"), 0, false, 1_000, &cfg).unwrap();
        cache.check(key, HostnameHash::of_hostname("b"), 0, false, 1_000, &cfg).unwrap();
        assert_eq!(
            cache.check(key, HostnameHash::of_hostname("c"), 0, false, 1_000, &cfg),
            Err(AndnaError::TooManyHostnames)
        );
        let other = Keypair::generate().public_key();
        assert!(cache.check(other, HostnameHash::of_hostname("c"), 0, false, 1_000, &cfg).is_ok());
    }

    #[test]
    fn counter_cache_sweep_frees_expired_hashes() {
        let cfg = config();
        let mut cache = CounterCache::default();
        let key = Keypair::generate().public_key();
        cache.check(key, HostnameHash::of_hostname("a"), 0, false, 1_000, &cfg).unwrap();
        assert_eq!(cache.sweep(20_000, cfg.expiration_ms()), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn resolved_cache_evicts_least_recently_used() {
        let mut cache = ResolvedNameCache::new(2);
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];
        cache.insert(1, 1_000, recs.clone());
        cache.insert(2, 1_000, recs.clone());
        assert!(cache.get(1, 1_000, 10_000).is_some());
        cache.insert(3, 1_000, recs.clone());
        assert!(cache.get(2, 1_000, 10_000).is_none());
        assert!(cache.get(1, 1_000, 10_000).is_some());
        assert!(cache.get(3, 1_000, 10_000).is_some());
    }

    #[test]
    fn resolved_cache_drops_expired_on_lookup() {
        let mut cache = ResolvedNameCache::new(4);
        cache.insert(1, 1_000, vec![ServiceRecord::primary(addr("10.0.0.1"))]);
        assert!(cache.get(1, 12_000, 10_000).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn resolved_snapshot_preserves_recency() {
        let mut cache = ResolvedNameCache::new(4);
        let recs = vec![ServiceRecord::primary(addr("10.0.0.1"))];
        cache.insert(1, 1_000, recs.clone());
        cache.insert(2, 1_000, recs.clone());
        cache.insert(3, 1_000, recs);
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.iter().map(|e| e.short_hash).collect::<Vec<_>>(), vec![3, 2, 1]);

        let restored = ResolvedNameCache::from_snapshot(4, snapshot.clone());
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn local_cache_update_flag_and_interval() {
        let mut cache = LocalCache::default();
        cache.add("Alpha", Vec::new(), 4).unwrap();
        cache.begin_update("alpha", 1_000, 500).unwrap();
        assert_eq!(
            cache.begin_update("alpha", 1_000, 500),
            Err(AndnaError::TooManyConcurrentRegistrations)
        );
        cache.finish_update("alpha", Some((1, 1_000)));
        assert_eq!(cache.begin_update("alpha", 1_200, 500), Err(AndnaError::TooEarly));
        assert!(cache.begin_update("alpha", 1_600, 500).is_ok());
        cache.finish_update("alpha", None);
        assert_eq!(cache.get("alpha").unwrap().update_counter, 1);
        assert!(!cache.get("alpha").unwrap().updating);
        assert_eq!(cache.begin_update("beta", 0, 0), Err(AndnaError::NoSuchHostname));
    }

    #[test]
    fn local_cache_due_and_bounds() {
        let mut cache = LocalCache::default();
        cache.add("a", Vec::new(), 2).unwrap();
        cache.add("b", Vec::new(), 2).unwrap();
        assert_eq!(cache.add("c", Vec::new(), 2), Err(AndnaError::TooManyHostnames));
        cache.finish_update("a", Some((1, 1_000)));
        assert_eq!(cache.due_for_registration(2_000, 10_000, 2_500), vec!["b".to_string()]);
        assert_eq!(cache.due_for_registration(9_000, 10_000, 2_500).len(), 2);
        assert_eq!(cache.registered_hostnames(), vec!["a".to_string()]);
        assert_eq!(cache.sweep(20_000, 10_000), 1);
        assert!(cache.registered_hostnames().is_empty());
    }
}
