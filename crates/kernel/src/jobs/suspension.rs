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

//! Wake-condition indexes for suspended jobs. The job bodies themselves stay in the
//! scheduler's job table; this tracks only who is waiting on what. Lock waits live in
//! the lock table's own queues, not here.

use ahash::AHasher;
use coord_common::{Identity, JobId};
use minstant::Instant;
use std::collections::{HashMap, HashSet};
use std::hash::BuildHasherDefault;
use uuid::Uuid;

use crate::jobs::WakeReason;

pub(crate) struct ReplyWait {
    pub(crate) job: JobId,
    pub(crate) deadline: Instant,
}

struct FarmWait {
    pending: HashSet<JobId, BuildHasherDefault<AHasher>>,
}

/// The suspended side of the job table: per-condition indexes consulted on each tick
/// and on each external stimulus.
#[derive(Default)]
pub(crate) struct SuspensionQ {
    /// Jobs waiting on an instant. Scanned per tick; populations here are small and
    /// the scan keeps wake order deterministic without a timer wheel.
    timers: Vec<(Instant, JobId)>,
    /// Jobs waiting on an absolute tick number.
    tick_waits: Vec<(u64, JobId)>,
    reply_waits: HashMap<Uuid, ReplyWait, BuildHasherDefault<AHasher>>,
    load_waits: HashMap<Identity, Vec<JobId>, BuildHasherDefault<AHasher>>,
    /// child -> waiting parent, for single sub-job waits.
    child_waiters: HashMap<JobId, JobId, BuildHasherDefault<AHasher>>,
    /// parent -> outstanding farm members.
    farms: HashMap<JobId, FarmWait, BuildHasherDefault<AHasher>>,
    /// farm member -> parent.
    farm_parents: HashMap<JobId, JobId, BuildHasherDefault<AHasher>>,
}

impl SuspensionQ {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn park_timer(&mut self, job: JobId, at: Instant) {
        self.timers.push((at, job));
    }

    pub(crate) fn park_ticks(&mut self, job: JobId, wake_tick: u64) {
        self.tick_waits.push((wake_tick, job));
    }

    pub(crate) fn park_reply(&mut self, job: JobId, correlation: Uuid, deadline: Instant) {
        self.reply_waits
            .insert(correlation, ReplyWait { job, deadline });
    }

    pub(crate) fn park_load(&mut self, job: JobId, identity: Identity) {
        self.load_waits.entry(identity).or_default().push(job);
    }

    pub(crate) fn park_child(&mut self, parent: JobId, child: JobId) {
        self.child_waiters.insert(child, parent);
    }

    pub(crate) fn park_farm(&mut self, parent: JobId, pending: Vec<JobId>) {
        let mut set = HashSet::with_hasher(BuildHasherDefault::<AHasher>::default());
        for child in &pending {
            self.farm_parents.insert(*child, parent);
            set.insert(*child);
        }
        self.farms.insert(parent, FarmWait { pending: set });
    }

    /// Collect timer and tick wakes due now, plus reply waits past their deadline.
    pub(crate) fn collect_due(&mut self, now: Instant, tick: u64) -> Vec<(JobId, WakeReason)> {
        let mut due = Vec::new();

        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].0 <= now {
                let (_, job) = self.timers.swap_remove(i);
                due.push((job, WakeReason::TimerFired));
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < self.tick_waits.len() {
            if self.tick_waits[i].0 <= tick {
                let (_, job) = self.tick_waits.swap_remove(i);
                due.push((job, WakeReason::TimerFired));
            } else {
                i += 1;
            }
        }

        let expired: Vec<Uuid> = self
            .reply_waits
            .iter()
            .filter_map(|(c, w)| (w.deadline <= now).then_some(*c))
            .collect();
        for correlation in expired {
            let w = self.reply_waits.remove(&correlation).expect("expired wait");
            due.push((w.job, WakeReason::ReplyTimeout { correlation }));
        }
        due
    }

    /// Claim the job waiting on this correlation id, if its wait is still live.
    pub(crate) fn take_reply_waiter(&mut self, correlation: Uuid) -> Option<JobId> {
        self.reply_waits.remove(&correlation).map(|w| w.job)
    }

    /// All jobs parked on this identity's demand-load.
    pub(crate) fn take_load_waiters(&mut self, identity: Identity) -> Vec<JobId> {
        self.load_waits.remove(&identity).unwrap_or_default()
    }

    /// Resolve a completed child against single-job and farm waits. Returns the parent
    /// to wake, if this completion satisfied its wait.
    pub(crate) fn on_child_complete(&mut self, child: JobId) -> Option<(JobId, WakeReason)> {
        if let Some(parent) = self.child_waiters.remove(&child) {
            return Some((parent, WakeReason::JobCompleted { job: child }));
        }
        if let Some(parent) = self.farm_parents.remove(&child) {
            let farm = self.farms.get_mut(&parent).expect("farm without record");
            farm.pending.remove(&child);
            if farm.pending.is_empty() {
                self.farms.remove(&parent);
                return Some((parent, WakeReason::FarmCompleted));
            }
        }
        None
    }

    /// Purge every index entry involving `job`, both as waiter and as awaited child.
    /// Called on job teardown.
    pub(crate) fn remove_job(&mut self, job: JobId) {
        self.timers.retain(|(_, j)| *j != job);
        self.tick_waits.retain(|(_, j)| *j != job);
        self.reply_waits.retain(|_, w| w.job != job);
        for waiters in self.load_waits.values_mut() {
            waiters.retain(|j| *j != job);
        }
        self.child_waiters.retain(|child, parent| *child != job && *parent != job);
        if let Some(farm) = self.farms.remove(&job) {
            for child in farm.pending {
                self.farm_parents.remove(&child);
            }
        }
        self.farm_parents.remove(&job);
    }

    pub(crate) fn waiting_count(&self) -> usize {
        self.timers.len()
            + self.tick_waits.len()
            + self.reply_waits.len()
            + self.load_waits.values().map(Vec::len).sum::<usize>()
            + self.child_waiters.len()
            + self.farms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_reply_deadline_expiry() {
        let mut sq = SuspensionQ::new();
        let c = Uuid::new_v4();
        let now = Instant::now();
        sq.park_reply(7, c, now + Duration::from_millis(50));

        assert!(sq.collect_due(now, 0).is_empty());
        let due = sq.collect_due(now + Duration::from_millis(51), 0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, 7);
        // The wait is consumed; a late reply finds nobody.
        assert_eq!(sq.take_reply_waiter(c), None);
    }

    #[test]
    fn test_farm_wakes_on_last_child() {
        let mut sq = SuspensionQ::new();
        sq.park_farm(1, vec![10, 11, 12]);
        assert!(sq.on_child_complete(10).is_none());
        assert!(sq.on_child_complete(11).is_none());
        let woken = sq.on_child_complete(12);
        assert!(matches!(woken, Some((1, WakeReason::FarmCompleted))));
    }

    #[test]
    fn test_remove_job_purges_all_indexes() {
        let mut sq = SuspensionQ::new();
        sq.park_timer(3, Instant::now());
        sq.park_load(3, Identity::mk_user(9));
        sq.park_child(3, 4);
        sq.park_farm(3, vec![5, 6]);
        sq.remove_job(3);
        assert_eq!(sq.waiting_count(), 0);
        assert!(sq.on_child_complete(4).is_none());
        assert!(sq.on_child_complete(5).is_none());
    }
}
