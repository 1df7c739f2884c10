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

use crate::{Identity, JobId};
use std::time::Duration;
use thiserror::Error;

/// Reasons a job might be aborted for a 'limit'
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AbortLimitReason {
    /// This job hit its allotted tick limit.
    Ticks(usize),
    /// This job hit its allotted time limit.
    Time(Duration),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Scheduler not responding")]
    SchedulerNotResponding,
    #[error("Job not found: {0:?}")]
    JobNotFound(JobId),
    #[error("Could not start job (internal error)")]
    CouldNotStartJob,
    #[error("Job aborted due to limit: {0:?}")]
    JobAbortedLimit(AbortLimitReason),
    #[error("Job aborted due to error.")]
    JobAbortedError,
    #[error("Job aborted due to cancellation.")]
    JobAbortedCancelled,
    /// A programming-contract violation inside a job (e.g. releasing a lock it does not
    /// hold). Aborts the job, never the scheduler.
    #[error("Contract violation in job: {0}")]
    ContractViolation(String),
    #[error("Session operation failed")]
    SessionFailed(#[source] SessionError),
    #[error("State cache operation failed")]
    CacheFailed(#[source] CacheError),
}

impl From<SessionError> for SchedulerError {
    fn from(e: SessionError) -> Self {
        SchedulerError::SessionFailed(e)
    }
}

impl From<CacheError> for SchedulerError {
    fn from(e: CacheError) -> Self {
        SchedulerError::CacheFailed(e)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("No session for {0}")]
    NoSession(Identity),
    #[error("Session for {0} is shutting down")]
    ShuttingDown(Identity),
    #[error("Could not load state for {identity}")]
    LoadFailed {
        identity: Identity,
        #[source]
        source: StorageError,
    },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CacheError {
    #[error("State load failed for {identity}")]
    LoadFailed {
        identity: Identity,
        #[source]
        source: StorageError,
    },
    #[error("No resident state for {0}")]
    NotResident(Identity),
}

/// Failures surfaced by the storage adapter. All are treated as transient by the engine:
/// loads fail the requesting operation, commit failures re-queue the writeback batch.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error("Storage read failed: {0}")]
    ReadFailed(String),
    #[error("Storage commit failed: {0}")]
    CommitFailed(String),
}
