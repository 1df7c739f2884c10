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

//! The writeback queue and the batched flush. Dirty caches wait here until a
//! maintenance pass stages them all into one storage transaction. The batch is
//! all-or-nothing: a failed commit re-queues every member unchanged.

use ahash::AHasher;
use coord_common::{Identity, MAINTENANCE_JOB, Storage, VersionStore};
use minstant::Instant;
use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasherDefault;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::CacheMap;
use crate::locks::LockTable;

/// Queue of caches with unpersisted mutations. Membership is tracked alongside the
/// enqueue time, which drives the debounce window.
pub struct WritebackQ {
    queue: VecDeque<Identity>,
    queued_at: HashMap<Identity, Instant, BuildHasherDefault<AHasher>>,
}

impl WritebackQ {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            queued_at: Default::default(),
        }
    }

    /// Idempotent: an identity already queued keeps its position and enqueue time.
    pub fn enqueue(&mut self, identity: Identity) {
        if self.queued_at.contains_key(&identity) {
            return;
        }
        self.queued_at.insert(identity, Instant::now());
        self.queue.push_back(identity);
    }

    pub fn contains(&self, identity: Identity) -> bool {
        self.queued_at.contains_key(&identity)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for WritebackQ {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushStats {
    /// Caches whose dirty set was committed and cleared.
    pub flushed: usize,
    /// Caches put back because the batch commit failed.
    pub requeued: usize,
    /// Caches skipped this pass (debounce, lock contention).
    pub skipped: usize,
}

/// One flush pass. Picks queued caches whose identity lock can be taken immediately
/// (skipping those inside the debounce window or contended), stages every picked
/// cache's dirty objects into a single transaction, and commits once. On failure the
/// whole batch is re-queued with its original enqueue times and nothing is cleared.
pub(crate) fn flush_writeback_batch(
    cm: &mut CacheMap,
    locks: &mut LockTable,
    storage: &dyn Storage,
    version_store: Option<&dyn VersionStore>,
    debounce: Duration,
    budget: Duration,
) -> FlushStats {
    let start = Instant::now();
    let mut stats = FlushStats::default();
    let mut retained: Vec<Identity> = Vec::new();
    let mut batch: Vec<Identity> = Vec::new();

    while start.elapsed() < budget {
        let Some(identity) = cm.writeback.queue.pop_front() else {
            break;
        };
        let Some(&queued_at) = cm.writeback.queued_at.get(&identity) else {
            // Stale queue entry, membership already dropped.
            continue;
        };
        let Some(cache) = cm.caches.get_mut(&identity) else {
            cm.writeback.queued_at.remove(&identity);
            continue;
        };
        if !cache.is_dirty() {
            cm.writeback.queued_at.remove(&identity);
            continue;
        }
        // Recently queued: let writes accumulate before paying for a commit.
        if start.duration_since(queued_at) < debounce {
            retained.push(identity);
            stats.skipped += 1;
            continue;
        }
        if !locks.try_acquire(identity, MAINTENANCE_JOB) {
            retained.push(identity);
            stats.skipped += 1;
            continue;
        }
        cache.set_in_writeback(true);
        batch.push(identity);
    }

    if !batch.is_empty() {
        let mut txn = storage.begin();
        for identity in &batch {
            let cache = cm.caches.get(identity).expect("picked cache vanished");
            txn.stage(*identity, cache.version(), cache.dirty_objects());
        }
        match txn.commit() {
            Ok(()) => {
                for identity in &batch {
                    let cache = cm.caches.get_mut(identity).expect("picked cache vanished");
                    cache.clear_dirty();
                    cache.set_in_writeback(false);
                    if let Some(vs) = version_store {
                        vs.set(&format!("sv/{identity}"), cache.version());
                    }
                    cm.writeback.queued_at.remove(identity);
                    if locks.release(*identity, MAINTENANCE_JOB).is_err() {
                        warn!(%identity, "maintenance lock vanished during flush");
                    }
                    stats.flushed += 1;
                }
                debug!(flushed = stats.flushed, "writeback batch committed");
            }
            Err(e) => {
                // All-or-nothing: every member keeps its dirty set and its original
                // enqueue time, and goes back on the queue for the next pass.
                warn!(error = %e, batch = batch.len(), "writeback batch commit failed, re-queueing");
                for identity in batch.iter().rev() {
                    let cache = cm.caches.get_mut(identity).expect("picked cache vanished");
                    cache.set_in_writeback(false);
                    if locks.release(*identity, MAINTENANCE_JOB).is_err() {
                        warn!(%identity, "maintenance lock vanished during flush");
                    }
                    cm.writeback.queue.push_front(*identity);
                    stats.requeued += 1;
                }
            }
        }
    }

    // Skipped entries go back ahead of anything newly enqueued, preserving their
    // relative order.
    for identity in retained.into_iter().rev() {
        cm.writeback.queue.push_front(identity);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    const U1: Identity = Identity::mk_user(1);

    #[test]
    fn test_enqueue_idempotent() {
        let mut q = WritebackQ::new();
        q.enqueue(U1);
        q.enqueue(U1);
        q.enqueue(U1);
        assert_eq!(q.len(), 1);
        assert!(q.contains(U1));
    }
}
