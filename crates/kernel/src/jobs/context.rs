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

//! The view of the engine a job body programs against while it is the running job.
//! Every method here runs inside the caller's resume span, so sequences of calls with
//! no suspension between them are atomic with respect to all other jobs.
//!
//! Methods that can park the job hand back a [`JobStep`] the body must return
//! unchanged; the wait registration has already happened by then.

use coord_common::{Identity, JobId, ReplyKey, SchedulerError};
use minstant::Instant;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::cache::{FindOrLoad, StateCache};
use crate::config::Config;
use crate::jobs::scheduler::{EngineContext, JobQ};
use crate::jobs::{JobBody, JobStep, WakeCondition};
use crate::locks::{LockGrant, pair_order};
use crate::sessions::StartParams;

/// Outcome of a demand-load request from inside a job.
pub enum Demand {
    /// Resident; access it with [`JobContext::cache`] / [`JobContext::cache_mut`].
    Ready,
    /// Load in flight. Return the step; the job is resumed with `Loaded` (retry the
    /// call) or `LoadFailed`.
    Wait(JobStep),
}

pub struct JobContext<'a> {
    pub(crate) job_id: JobId,
    pub(crate) tick: u64,
    pub(crate) engine: &'a mut EngineContext,
    pub(crate) jobs: &'a mut JobQ,
}

impl JobContext<'_> {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn config(&self) -> &Config {
        &self.engine.config
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    // --- locks ---

    /// Acquire the identity's lock, or hand back the step to suspend on. On wake the
    /// job holds the lock.
    pub fn acquire_or_wait(&mut self, identity: Identity) -> Option<JobStep> {
        match self.engine.locks.acquire(identity, self.job_id) {
            LockGrant::Granted => None,
            LockGrant::Queued => Some(JobStep::Suspend(WakeCondition::Lock(identity))),
        }
    }

    /// Acquire both identities in canonical order, one per suspension at most. Call
    /// again on each wake until it returns `None`; circular waits cannot occur because
    /// every pair is taken in the same order everywhere.
    pub fn acquire_pair_or_wait(&mut self, a: Identity, b: Identity) -> Option<JobStep> {
        let (first, second) = pair_order(a, b);
        if !self.holds_lock(first)
            && let Some(step) = self.acquire_or_wait(first)
        {
            return Some(step);
        }
        if first != second
            && !self.holds_lock(second)
            && let Some(step) = self.acquire_or_wait(second)
        {
            return Some(step);
        }
        None
    }

    pub fn try_acquire(&mut self, identity: Identity) -> bool {
        self.engine.locks.try_acquire(identity, self.job_id)
    }

    /// Release a lock this job holds. Releasing one it does not hold is a contract
    /// violation that aborts the job.
    pub fn release(&mut self, identity: Identity) -> Result<(), SchedulerError> {
        match self.engine.locks.release(identity, self.job_id) {
            Ok(next) => {
                if let Some(next) = next {
                    self.jobs.wake(next, crate::jobs::WakeReason::LockAcquired(identity));
                }
                Ok(())
            }
            Err(fault) => Err(SchedulerError::ContractViolation(fault.to_string())),
        }
    }

    pub fn holds_lock(&self, identity: Identity) -> bool {
        self.engine.locks.is_locked_by(identity, self.job_id)
    }

    // --- shared-state cache ---

    /// Demand-load the identity's state. Must not be interleaved with a second
    /// `find_or_load` for the same identity in the same span (it cannot be: the call
    /// either answers `Ready` or the body returns the step).
    pub fn find_or_load(&mut self, identity: Identity) -> Demand {
        match self.engine.caches.find_or_load(identity) {
            FindOrLoad::Resident => Demand::Ready,
            FindOrLoad::Loading => {
                self.jobs.suspended.park_load(self.job_id, identity);
                Demand::Wait(JobStep::Suspend(WakeCondition::Load(identity)))
            }
        }
    }

    pub fn cache(&self, identity: Identity) -> Option<&StateCache> {
        self.engine.caches.get(identity)
    }

    /// Mutable state access. Contract: the identity's lock must be held by this job;
    /// mutation without it breaks the per-identity total order.
    pub fn cache_mut(&mut self, identity: Identity) -> Option<&mut StateCache> {
        debug_assert!(
            self.engine.locks.is_locked_by(identity, self.job_id),
            "cache mutation without holding the identity lock"
        );
        self.engine.caches.get_mut(identity)
    }

    pub fn enqueue_writeback(&mut self, identity: Identity) {
        self.engine.caches.enqueue_writeback(identity);
    }

    // --- sessions ---

    /// Install (or merge into) the user session for `identity`. Contract: runs with
    /// the identity locked and its state resident. Returns whether a session was
    /// created (as opposed to merged).
    pub fn start_user_session(
        &mut self,
        identity: Identity,
        params: &StartParams,
    ) -> Result<bool, SchedulerError> {
        self.check_session_preconditions(identity)?;
        if let Some(server) = params.server
            && self.engine.sessions.server(server).is_none()
        {
            warn!(%identity, %server, "binding user session to unregistered server");
        }
        let created = self.engine.sessions.upsert_user(identity, params);
        self.engine.caches.detach_for_session(identity);
        if created {
            self.engine
                .sessions
                .invoke_start_hooks(identity, &mut self.engine.extensions);
        }
        Ok(created)
    }

    /// Server-process variant of session start.
    pub fn start_server_session(
        &mut self,
        identity: Identity,
        params: &StartParams,
    ) -> Result<bool, SchedulerError> {
        self.check_session_preconditions(identity)?;
        let created = self.engine.sessions.upsert_server(identity, params);
        self.engine.caches.detach_for_session(identity);
        if created {
            self.engine
                .sessions
                .invoke_start_hooks(identity, &mut self.engine.extensions);
        }
        Ok(created)
    }

    fn check_session_preconditions(&self, identity: Identity) -> Result<(), SchedulerError> {
        if !self.engine.locks.is_locked_by(identity, self.job_id) {
            return Err(SchedulerError::ContractViolation(format!(
                "session operation on {identity} without holding its lock"
            )));
        }
        if !self.engine.caches.is_resident(identity) {
            return Err(SchedulerError::ContractViolation(format!(
                "session operation on {identity} with no resident state"
            )));
        }
        Ok(())
    }

    /// Tear down the session: stop hooks, unbind, reattach the cache to the LRU list,
    /// queue dirty state for writeback, remove from the registry. Contract: identity
    /// locked. Returns whether a session existed.
    pub fn stop_session(&mut self, identity: Identity) -> Result<bool, SchedulerError> {
        if !self.engine.sessions.has_session(identity) {
            return Ok(false);
        }
        if !self.engine.locks.is_locked_by(identity, self.job_id) {
            return Err(SchedulerError::ContractViolation(format!(
                "session teardown on {identity} without holding its lock"
            )));
        }
        self.engine
            .sessions
            .invoke_stop_hooks(identity, &mut self.engine.extensions);
        self.engine.sessions.remove(identity);
        self.engine.caches.reattach_after_session(identity);
        if self
            .engine
            .caches
            .get(identity)
            .is_some_and(|c| c.is_dirty())
        {
            self.engine.caches.enqueue_writeback(identity);
        }
        Ok(true)
    }

    pub fn session_exists(&self, identity: Identity) -> bool {
        self.engine.sessions.has_session(identity)
    }

    pub fn mark_session_shutting_down(&mut self, identity: Identity) -> bool {
        self.engine.sessions.mark_shutting_down(identity)
    }

    pub fn touch_session(&mut self, identity: Identity) {
        self.engine.sessions.touch(identity);
    }

    /// Withdraw a not-yet-drained admission entry (a stop overtaking its start).
    pub fn cancel_admission(&mut self, identity: Identity) -> bool {
        self.engine.admission.cancel(identity)
    }

    // --- messaging ---

    /// Fire-and-forget send through the transport.
    pub fn send(&mut self, target: Identity, msg_type: u32, payload: Value) {
        self.engine.transport.send(target, msg_type, payload, None);
    }

    /// Send expecting a reply. The returned step parks the job until the reply
    /// arrives or the configured timeout passes, whichever is first.
    pub fn send_expecting_reply(
        &mut self,
        target: Identity,
        msg_type: u32,
        payload: Value,
    ) -> JobStep {
        let correlation = Uuid::new_v4();
        let deadline = Instant::now() + self.engine.config.reply_timeout;
        self.jobs
            .suspended
            .park_reply(self.job_id, correlation, deadline);
        self.engine.transport.send(
            target,
            msg_type,
            payload,
            Some(ReplyKey {
                job: self.job_id,
                correlation,
            }),
        );
        JobStep::Suspend(WakeCondition::Reply {
            correlation,
            deadline,
        })
    }

    // --- sub-jobs ---

    /// Spawn a child job, runnable from the next tick.
    pub fn spawn(&mut self, name: &'static str, body: Box<dyn JobBody>) -> JobId {
        self.jobs.spawn(name, body, Some(self.job_id))
    }

    /// Park until the child completes. Collect its result with `take_result` on wake.
    pub fn wait_for_job(&mut self, child: JobId) -> JobStep {
        self.jobs.suspended.park_child(self.job_id, child);
        JobStep::Suspend(WakeCondition::Job(child))
    }

    /// Park until every child in the farm completes. `None` means all of them already
    /// have and there is nothing to wait for.
    pub fn wait_for_farm(&mut self, children: &[JobId]) -> Option<JobStep> {
        let pending: Vec<JobId> = children
            .iter()
            .copied()
            .filter(|c| !self.jobs.completed.contains_key(c))
            .collect();
        if pending.is_empty() {
            return None;
        }
        self.jobs.suspended.park_farm(self.job_id, pending.clone());
        Some(JobStep::Suspend(WakeCondition::Farm(pending)))
    }

    /// Take a completed child's result. Yields once per child, to the parent only.
    pub fn take_result(&mut self, child: JobId) -> Option<Result<Value, SchedulerError>> {
        match self.jobs.completed.get(&child) {
            Some((parent, _)) if *parent == self.job_id => {
                self.jobs.completed.remove(&child).map(|(_, r)| r)
            }
            _ => None,
        }
    }

    // --- timers ---

    pub fn sleep(&mut self, duration: std::time::Duration) -> JobStep {
        JobStep::Suspend(WakeCondition::Time(Instant::now() + duration))
    }

    /// Yield for `n` ticks (clamped to at least one).
    pub fn yield_ticks(&mut self, n: u64) -> JobStep {
        JobStep::Suspend(WakeCondition::Ticks(n.max(1)))
    }
}
