// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The shared-state cache: one demand-loaded, mutation-tracked state object per
//! identity. Lifecycle: absent -> loading -> resident -> (dirty -> queued-for-writeback ->
//! clean) and resident -> unused-on-LRU -> evicted, the latter only when clean and not
//! in writeback.

pub mod lru;
pub mod writeback;

use ahash::AHasher;
use coord_common::{Identity, StateBlob};
use minstant::Instant;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::BuildHasherDefault;
use std::time::Duration;
use tracing::debug;

use crate::cache::lru::LruList;
use crate::cache::writeback::WritebackQ;
use crate::locks::LockTable;

/// In-memory shared state for one identity.
pub struct StateCache {
    identity: Identity,
    objects: HashMap<String, Value, BuildHasherDefault<AHasher>>,
    /// Keys mutated since the last successful writeback.
    dirty: HashSet<String, BuildHasherDefault<AHasher>>,
    /// Bumped once per mutation. Survives restarts only via the optional version store.
    version: u64,
    /// Set while this cache's dirty set is being staged/committed by a flush.
    in_writeback: bool,
    /// LRU membership handle. `None` while a session owns this cache.
    lru_slot: Option<usize>,
    last_touched: Instant,
}

impl StateCache {
    fn from_blob(identity: Identity, blob: StateBlob) -> Self {
        Self {
            identity,
            objects: blob.objects.into_iter().collect(),
            dirty: Default::default(),
            version: blob.version,
            in_writeback: false,
            lru_slot: None,
            last_touched: Instant::now(),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.objects.get(key)
    }

    /// Insert or replace an object, recording it as needing writeback.
    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.objects.insert(key.clone(), value);
        self.dirty.insert(key);
        self.version += 1;
        self.last_touched = Instant::now();
    }

    /// Record an existing object as mutated in place.
    pub fn mark_dirty(&mut self, key: impl Into<String>) {
        let key = key.into();
        debug_assert!(self.objects.contains_key(&key), "dirtying unknown object");
        self.dirty.insert(key);
        self.version += 1;
        self.last_touched = Instant::now();
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn in_writeback(&self) -> bool {
        self.in_writeback
    }

    pub fn on_lru(&self) -> bool {
        self.lru_slot.is_some()
    }

    /// Snapshot the dirty objects for staging into a storage transaction.
    pub(crate) fn dirty_objects(&self) -> Vec<(String, Value)> {
        self.dirty
            .iter()
            .filter_map(|k| self.objects.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    pub(crate) fn set_in_writeback(&mut self, v: bool) {
        self.in_writeback = v;
    }
}

/// Outcome of a `find_or_load` attempt, from the calling job's point of view.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FindOrLoad {
    /// The cache is resident (and was touched to MRU if on the LRU list).
    Resident,
    /// A load is in flight (started by this call or an earlier one); the caller must
    /// suspend until the load completes and then retry.
    Loading,
}

/// The process-wide cache directory plus the structures that manage unused and dirty
/// caches: the LRU list and the writeback queue. Mutated only from the scheduler
/// thread; the cooperative model is the lock.
pub struct CacheMap {
    caches: HashMap<Identity, StateCache, BuildHasherDefault<AHasher>>,
    /// Identities with a demand-load in flight. Guards against duplicate loads.
    loading: HashSet<Identity, BuildHasherDefault<AHasher>>,
    /// Loads the scheduler still has to perform, in request order.
    load_requests: VecDeque<Identity>,
    pub(crate) lru: LruList,
    pub(crate) writeback: WritebackQ,
}

impl CacheMap {
    pub fn new() -> Self {
        Self {
            caches: Default::default(),
            loading: Default::default(),
            load_requests: Default::default(),
            lru: LruList::new(),
            writeback: WritebackQ::new(),
        }
    }

    /// Demand-load entry point. Resident caches are touched to MRU. A miss marks the
    /// identity loading and queues a load request for the scheduler; concurrent callers
    /// during the load window observe `Loading` and park, they never start a second
    /// load. The check-then-mark is a single non-suspending step.
    pub fn find_or_load(&mut self, identity: Identity) -> FindOrLoad {
        if let Some(cache) = self.caches.get_mut(&identity) {
            cache.last_touched = Instant::now();
            if let Some(slot) = cache.lru_slot {
                cache.lru_slot = Some(self.lru.touch(slot));
            }
            return FindOrLoad::Resident;
        }
        if self.loading.contains(&identity) {
            return FindOrLoad::Loading;
        }
        self.loading.insert(identity);
        self.load_requests.push_back(identity);
        FindOrLoad::Loading
    }

    pub fn get(&self, identity: Identity) -> Option<&StateCache> {
        self.caches.get(&identity)
    }

    pub fn get_mut(&mut self, identity: Identity) -> Option<&mut StateCache> {
        self.caches.get_mut(&identity)
    }

    pub fn is_resident(&self, identity: Identity) -> bool {
        self.caches.contains_key(&identity)
    }

    pub fn is_loading(&self, identity: Identity) -> bool {
        self.loading.contains(&identity)
    }

    /// Next queued demand-load, taken by the scheduler's load pump.
    pub(crate) fn next_load_request(&mut self) -> Option<Identity> {
        self.load_requests.pop_front()
    }

    /// Install a freshly loaded cache and clear the loading mark. The cache starts on
    /// the LRU list; session start detaches it.
    pub(crate) fn install_loaded(&mut self, identity: Identity, blob: StateBlob) {
        debug_assert!(!self.caches.contains_key(&identity), "duplicate load install");
        let mut cache = StateCache::from_blob(identity, blob);
        cache.lru_slot = Some(self.lru.push_mru(identity));
        self.caches.insert(identity, cache);
        self.loading.remove(&identity);
    }

    /// Clear the loading mark after a failed load, so a later retry can start fresh.
    pub(crate) fn abandon_load(&mut self, identity: Identity) {
        self.loading.remove(&identity);
    }

    /// Detach from the LRU list for the lifetime of an owning session.
    pub(crate) fn detach_for_session(&mut self, identity: Identity) {
        if let Some(cache) = self.caches.get_mut(&identity)
            && let Some(slot) = cache.lru_slot.take()
        {
            self.lru.remove(slot);
        }
    }

    /// Reattach at the MRU position on session teardown, making the cache eligible for
    /// later eviction.
    pub(crate) fn reattach_after_session(&mut self, identity: Identity) {
        if let Some(cache) = self.caches.get_mut(&identity)
            && cache.lru_slot.is_none()
        {
            cache.lru_slot = Some(self.lru.push_mru(identity));
        }
    }

    /// Idempotent: a cache already queued is not re-queued.
    pub fn enqueue_writeback(&mut self, identity: Identity) {
        if self.caches.contains_key(&identity) {
            self.writeback.enqueue(identity);
        }
    }

    /// Walk the LRU list from the cold end, evicting unused caches until the resident
    /// count is at `target` or the `budget` is spent. Skips caches that are locked, in
    /// writeback, or dirty; a dirty cache is only removable after a successful
    /// writeback clears it.
    pub fn evict_unused(&mut self, target: usize, budget: Duration, locks: &LockTable) -> usize {
        let start = Instant::now();
        let mut evicted = 0;
        let mut cursor = self.lru.peek_lru();
        while self.caches.len() > target {
            if start.elapsed() >= budget {
                break;
            }
            let Some((slot, identity)) = cursor else {
                break;
            };
            // Find the next entry before we mutate the list.
            cursor = self
                .lru
                .iter_lru()
                .skip_while(|(s, _)| *s != slot)
                .nth(1);
            let cache = self.caches.get(&identity).expect("lru entry without cache");
            if locks.is_locked(identity) || cache.in_writeback || cache.is_dirty() {
                continue;
            }
            self.lru.remove(slot);
            self.caches.remove(&identity);
            evicted += 1;
            debug!(%identity, "evicted unused cache");
        }
        evicted
    }

    pub fn resident_count(&self) -> usize {
        self.caches.len()
    }

    pub fn loading_count(&self) -> usize {
        self.loading.len()
    }

    pub fn writeback(&self) -> &WritebackQ {
        &self.writeback
    }

    pub fn lru(&self) -> &LruList {
        &self.lru
    }
}

impl Default for CacheMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const U1: Identity = Identity::mk_user(1);
    const U2: Identity = Identity::mk_user(2);

    fn blob() -> StateBlob {
        StateBlob::default()
    }

    #[test]
    fn test_find_or_load_single_load_request() {
        let mut cm = CacheMap::new();
        assert_eq!(cm.find_or_load(U1), FindOrLoad::Loading);
        // Concurrent requesters during the load window never queue a second load.
        assert_eq!(cm.find_or_load(U1), FindOrLoad::Loading);
        assert_eq!(cm.find_or_load(U1), FindOrLoad::Loading);
        assert_eq!(cm.next_load_request(), Some(U1));
        assert_eq!(cm.next_load_request(), None);

        cm.install_loaded(U1, blob());
        assert_eq!(cm.find_or_load(U1), FindOrLoad::Resident);
        assert!(!cm.is_loading(U1));
    }

    #[test]
    fn test_detach_reattach_lru() {
        let mut cm = CacheMap::new();
        cm.find_or_load(U1);
        cm.next_load_request();
        cm.install_loaded(U1, blob());
        assert!(cm.get(U1).unwrap().on_lru());

        cm.detach_for_session(U1);
        assert!(!cm.get(U1).unwrap().on_lru());
        assert_eq!(cm.lru.len(), 0);

        cm.reattach_after_session(U1);
        assert!(cm.get(U1).unwrap().on_lru());
        assert_eq!(cm.lru.len(), 1);
    }

    #[test]
    fn test_evict_skips_dirty() {
        let mut cm = CacheMap::new();
        let locks = LockTable::new();
        for id in [U1, U2] {
            cm.find_or_load(id);
            cm.next_load_request();
            cm.install_loaded(id, blob());
        }
        cm.get_mut(U1).unwrap().put("o", serde_json::json!(1));

        let evicted = cm.evict_unused(0, Duration::from_secs(1), &locks);
        assert_eq!(evicted, 1);
        assert!(cm.is_resident(U1), "dirty cache must not be evicted");
        assert!(!cm.is_resident(U2));
    }

    #[test]
    fn test_evict_respects_target() {
        let mut cm = CacheMap::new();
        let locks = LockTable::new();
        for n in 1..=4 {
            let id = Identity::mk_user(n);
            cm.find_or_load(id);
            cm.next_load_request();
            cm.install_loaded(id, blob());
        }
        cm.evict_unused(2, Duration::from_secs(1), &locks);
        assert_eq!(cm.resident_count(), 2);
        // Coldest entries went first.
        assert!(!cm.is_resident(Identity::mk_user(1)));
        assert!(!cm.is_resident(Identity::mk_user(2)));
    }
}
