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

//! The admission queue: pending start-session requests, one per identity, drained by a
//! bounded number of concurrent start jobs. Sustained depth above the surge threshold
//! flips the service into surge mode, shedding low-priority work until the queue has
//! stayed below threshold for a dwell period.

use ahash::AHasher;
use coord_common::Identity;
use minstant::Instant;
use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::sessions::StartParams;

pub struct AdmissionQ {
    /// Drain order. Entries whose identity is no longer in `pending` are stale and
    /// skipped on pop.
    queue: VecDeque<Identity>,
    /// identity -> most recent parameters. Presence here is queue membership.
    pending: HashMap<Identity, StartParams, BuildHasherDefault<AHasher>>,
    surged: bool,
    /// When the queue last dropped below the threshold, while surged.
    below_since: Option<Instant>,
    /// Shared with `SchedulerClient` so hosts can gate low-priority work without a
    /// round-trip into the scheduler.
    surge_flag: Arc<AtomicBool>,
}

impl AdmissionQ {
    pub fn new(surge_flag: Arc<AtomicBool>) -> Self {
        Self {
            queue: VecDeque::new(),
            pending: Default::default(),
            surged: false,
            below_since: None,
            surge_flag,
        }
    }

    /// Queue a start request. A request already pending for this identity is replaced
    /// in place: newest parameters win, queue position is kept.
    pub fn submit(&mut self, identity: Identity, params: StartParams) {
        if self.pending.insert(identity, params).is_none() {
            self.queue.push_back(identity);
        }
    }

    /// Remove and return the head entry, skipping stale queue slots.
    pub fn pop_next(&mut self) -> Option<(Identity, StartParams)> {
        while let Some(identity) = self.queue.pop_front() {
            if let Some(params) = self.pending.remove(&identity) {
                return Some((identity, params));
            }
        }
        None
    }

    /// Drop a pending request (e.g. a stop arrived before the start was drained).
    pub fn cancel(&mut self, identity: Identity) -> bool {
        self.pending.remove(&identity).is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_surged(&self) -> bool {
        self.surged
    }

    /// Re-evaluate surge state against the current queue depth. Entering is immediate
    /// on crossing the threshold; leaving requires the queue to stay below it for the
    /// full dwell, to avoid flapping.
    pub fn update_surge(&mut self, threshold: usize, dwell: Duration, now: Instant) {
        let depth = self.pending.len();
        if !self.surged {
            if depth > threshold {
                warn!(depth, threshold, "admission surge: shedding low-priority work");
                self.surged = true;
                self.below_since = None;
                self.surge_flag.store(true, Ordering::Relaxed);
            }
            return;
        }
        if depth > threshold {
            self.below_since = None;
            return;
        }
        match self.below_since {
            None => self.below_since = Some(now),
            Some(since) if now.duration_since(since) >= dwell => {
                info!(depth, "admission surge cleared");
                self.surged = false;
                self.below_since = None;
                self.surge_flag.store(false, Ordering::Relaxed);
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const U1: Identity = Identity::mk_user(1);
    const U2: Identity = Identity::mk_user(2);

    fn q() -> AdmissionQ {
        AdmissionQ::new(Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_resubmission_replaces_entry() {
        let mut aq = q();
        aq.submit(U1, StartParams::default());
        aq.submit(
            U1,
            StartParams {
                server: Some(Identity::mk_server(5)),
                payload: json!(null),
            },
        );
        assert_eq!(aq.len(), 1);
        let (id, params) = aq.pop_next().unwrap();
        assert_eq!(id, U1);
        // Newest parameters won.
        assert_eq!(params.server, Some(Identity::mk_server(5)));
        assert!(aq.pop_next().is_none());
    }

    #[test]
    fn test_fifo_across_identities() {
        let mut aq = q();
        aq.submit(U1, StartParams::default());
        aq.submit(U2, StartParams::default());
        aq.submit(U1, StartParams::default());
        assert_eq!(aq.pop_next().unwrap().0, U1);
        assert_eq!(aq.pop_next().unwrap().0, U2);
    }

    #[test]
    fn test_surge_enter_and_dwell_exit() {
        let mut aq = q();
        for n in 0..4 {
            aq.submit(Identity::mk_user(n), StartParams::default());
        }
        let t0 = Instant::now();
        aq.update_surge(3, Duration::from_secs(10), t0);
        assert!(aq.is_surged());

        // Drain below threshold: surge must hold through the dwell window.
        while aq.len() > 1 {
            aq.pop_next();
        }
        aq.update_surge(3, Duration::from_secs(10), t0 + Duration::from_secs(1));
        assert!(aq.is_surged());
        aq.update_surge(3, Duration::from_secs(10), t0 + Duration::from_secs(5));
        assert!(aq.is_surged());
        aq.update_surge(3, Duration::from_secs(10), t0 + Duration::from_secs(12));
        assert!(!aq.is_surged());
    }

    #[test]
    fn test_surge_dwell_resets_on_spike() {
        let mut aq = q();
        for n in 0..5 {
            aq.submit(Identity::mk_user(n), StartParams::default());
        }
        let t0 = Instant::now();
        aq.update_surge(3, Duration::from_secs(10), t0);
        while aq.len() > 0 {
            aq.pop_next();
        }
        aq.update_surge(3, Duration::from_secs(10), t0 + Duration::from_secs(6));

        // Depth spikes again before the dwell elapses: the clock starts over.
        for n in 0..5 {
            aq.submit(Identity::mk_user(n), StartParams::default());
        }
        aq.update_surge(3, Duration::from_secs(10), t0 + Duration::from_secs(8));
        while aq.len() > 0 {
            aq.pop_next();
        }
        aq.update_surge(3, Duration::from_secs(10), t0 + Duration::from_secs(9));
        aq.update_surge(3, Duration::from_secs(10), t0 + Duration::from_secs(17));
        assert!(aq.is_surged());
        aq.update_surge(3, Duration::from_secs(10), t0 + Duration::from_secs(20));
        assert!(!aq.is_surged());
    }
}
