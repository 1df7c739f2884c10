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

//! Cooperative jobs. A job's body is a state machine the scheduler resumes one at a
//! time; everything a body does between two suspension points runs without
//! interference from any other job. Suspension points are exactly: lock waits, reply
//! waits, timer/tick waits, sub-job waits, parallel-farm waits, and demand-load waits.

pub mod context;
pub mod scheduler;
pub mod session_jobs;
pub mod suspension;

use coord_common::{Identity, JobId, SchedulerError, StorageError};
use minstant::Instant;
use serde_json::Value;
use strum::Display;
use uuid::Uuid;

use crate::jobs::context::JobContext;

/// What a suspended job is waiting for.
#[derive(Clone, Debug)]
pub enum WakeCondition {
    /// A lock grant for this identity (the job is already in the wait queue).
    Lock(Identity),
    /// A reply message carrying this correlation id, or the deadline passing.
    Reply { correlation: Uuid, deadline: Instant },
    /// The given instant arriving.
    Time(Instant),
    /// N further scheduler ticks elapsing (0 = next tick).
    Ticks(u64),
    /// Completion of a single sub-job.
    Job(JobId),
    /// Completion of every job in a parallel farm.
    Farm(Vec<JobId>),
    /// The in-flight demand-load for this identity finishing.
    Load(Identity),
}

/// Why a job was resumed. Paired with the condition it suspended on.
#[derive(Clone, Debug)]
pub enum WakeReason {
    /// First resume after spawn.
    Start,
    /// The lock wait was granted; the job now holds the lock.
    LockAcquired(Identity),
    /// The awaited reply arrived.
    Reply { correlation: Uuid, payload: Value },
    /// No reply arrived within the deadline. The wait failed, not the job; callers
    /// proceed with a degraded result.
    ReplyTimeout { correlation: Uuid },
    /// A `Time` or `Ticks` wait elapsed.
    TimerFired,
    /// The awaited sub-job (or the last member of a farm) finished. Results are
    /// collected with [`JobContext::take_result`].
    JobCompleted { job: JobId },
    /// Every member of the awaited farm finished.
    FarmCompleted,
    /// The demand-load for this identity completed; the cache is now resident.
    Loaded(Identity),
    /// The demand-load failed. The requesting operation fails; the client may retry.
    LoadFailed {
        identity: Identity,
        error: StorageError,
    },
}

/// What a resume span ended with.
pub enum JobStep {
    /// The job is done; its result goes to any subscriber and waiting parent.
    Complete(Value),
    /// Park until the condition is satisfied.
    Suspend(WakeCondition),
}

/// The body of a job: a state machine advanced by the scheduler. One `resume` call is
/// one uninterrupted span; returning `Err` aborts the job (locks force-released,
/// subscribers notified), never the scheduler.
pub trait JobBody {
    fn resume(
        &mut self,
        ctx: &mut JobContext<'_>,
        wake: WakeReason,
    ) -> Result<JobStep, SchedulerError>;
}

/// Scheduler-side state a job can be observed in.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum JobState {
    Runnable,
    WaitingLock,
    WaitingReply,
    WaitingTimer,
    WaitingJob,
    WaitingFarm,
    WaitingLoad,
}

impl JobState {
    pub(crate) fn of(cond: &WakeCondition) -> Self {
        match cond {
            WakeCondition::Lock(_) => JobState::WaitingLock,
            WakeCondition::Reply { .. } => JobState::WaitingReply,
            WakeCondition::Time(_) | WakeCondition::Ticks(_) => JobState::WaitingTimer,
            WakeCondition::Job(_) => JobState::WaitingJob,
            WakeCondition::Farm(_) => JobState::WaitingFarm,
            WakeCondition::Load(_) => JobState::WaitingLoad,
        }
    }
}

/// External interface description of a job, for diagnostics.
#[derive(Clone, Debug)]
pub struct JobDescription {
    pub job_id: JobId,
    pub name: &'static str,
    pub state: JobState,
    pub created: Instant,
}

/// One live job as the scheduler tracks it. The body is taken out for the duration of
/// a resume call and put back (or dropped) afterwards.
pub(crate) struct Job {
    pub(crate) name: &'static str,
    pub(crate) body: Option<Box<dyn JobBody>>,
    pub(crate) state: JobState,
    pub(crate) parent: Option<JobId>,
    pub(crate) created: Instant,
    pub(crate) result_sender: Option<oneshot::Sender<Result<Value, SchedulerError>>>,
}
