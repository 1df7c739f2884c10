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

//! The session lifecycle jobs: start (admission drain) and stop. Both are written as
//! re-entrant bodies: every resume re-checks what is already done (lock held? state
//! resident?) and continues from there, so wake-and-retry needs no explicit phase
//! bookkeeping.

use coord_common::{IdentityKind, SchedulerError, SessionError};
use coord_common::Identity;
use serde_json::json;
use tracing::debug;

use crate::jobs::context::{Demand, JobContext};
use crate::jobs::{JobBody, JobStep, WakeReason};
use crate::router::msg;
use crate::sessions::StartParams;

/// Locks the identity, demand-loads its state, installs (or merges) the session, and
/// notifies the principal. A storage failure along the way aborts this job only; the
/// principal sees no session and may retry.
pub struct SessionStartJob {
    identity: Identity,
    params: StartParams,
}

impl SessionStartJob {
    pub fn new(identity: Identity, params: StartParams) -> Self {
        Self { identity, params }
    }
}

impl JobBody for SessionStartJob {
    fn resume(
        &mut self,
        ctx: &mut JobContext<'_>,
        wake: WakeReason,
    ) -> Result<JobStep, SchedulerError> {
        if let WakeReason::LoadFailed { identity, error } = wake {
            // Clean up our lock before failing so the next attempt starts fresh.
            if ctx.holds_lock(self.identity) {
                ctx.release(self.identity)?;
            }
            return Err(SessionError::LoadFailed {
                identity,
                source: error,
            }
            .into());
        }

        if !ctx.holds_lock(self.identity)
            && let Some(step) = ctx.acquire_or_wait(self.identity)
        {
            return Ok(step);
        }
        if let Demand::Wait(step) = ctx.find_or_load(self.identity) {
            return Ok(step);
        }

        let created = match self.identity.kind() {
            IdentityKind::User => ctx.start_user_session(self.identity, &self.params)?,
            IdentityKind::Server => ctx.start_server_session(self.identity, &self.params)?,
            // Malformed identities are dropped at intake; reaching here is a bug.
            IdentityKind::Malformed => {
                return Err(SchedulerError::ContractViolation(format!(
                    "start job for malformed identity {}",
                    self.identity
                )));
            }
        };
        ctx.release(self.identity)?;

        debug!(identity = %self.identity, created, "session start complete");
        ctx.send(self.identity, msg::SESSION_STARTED, json!({ "created": created }));
        Ok(JobStep::Complete(json!({ "created": created })))
    }
}

/// Tears down the identity's session: cancels any undrained admission entry, marks the
/// session shutting-down so late operations can see it, then takes the lock and
/// unwinds: hooks, unbinding, cache back on the LRU list, dirty state queued for
/// writeback.
pub struct SessionStopJob {
    identity: Identity,
}

impl SessionStopJob {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }
}

impl JobBody for SessionStopJob {
    fn resume(
        &mut self,
        ctx: &mut JobContext<'_>,
        _wake: WakeReason,
    ) -> Result<JobStep, SchedulerError> {
        if !ctx.holds_lock(self.identity) {
            // First entry: a stop can overtake its own start while it still sits in
            // the admission queue.
            let cancelled = ctx.cancel_admission(self.identity);
            if !ctx.session_exists(self.identity) {
                debug!(identity = %self.identity, cancelled, "stop with no session");
                return Ok(JobStep::Complete(json!({
                    "stopped": false,
                    "cancelled": cancelled,
                })));
            }
            ctx.mark_session_shutting_down(self.identity);
            if let Some(step) = ctx.acquire_or_wait(self.identity) {
                return Ok(step);
            }
        }

        let stopped = ctx.stop_session(self.identity)?;
        ctx.release(self.identity)?;

        if stopped {
            ctx.send(self.identity, msg::SESSION_STOPPED, json!({}));
        }
        Ok(JobStep::Complete(json!({ "stopped": stopped })))
    }
}
