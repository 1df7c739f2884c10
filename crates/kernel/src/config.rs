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

//! Config is created by the host, and passed into the scheduler, whereupon it is
//! available to all components. Used to hold things typically configured by CLI flags
//! or a deployment config file.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// How many session-start jobs may be draining the admission queue at once.
    pub admission_concurrency: usize,
    /// Queue depth above which the service enters surge mode and sheds low-priority
    /// work.
    pub surge_threshold: usize,
    /// How long the queue must stay below the threshold before the surge flag clears.
    pub surge_dwell: Duration,
    /// Resident cache count the LRU eviction sweep works down towards.
    pub cache_target: usize,
    /// Caches queued for writeback more recently than this are skipped by the flush, so
    /// writes can accumulate.
    pub writeback_debounce: Duration,
    /// Unheld locks with no waiters older than this are swept from the lock table.
    pub lock_expiry: Duration,
    /// Sessions with no activity for this long are stopped by the idle sweep. `None`
    /// disables idle eviction.
    pub session_idle_timeout: Option<Duration>,
    /// How long a job waits on a message reply before being resumed with a timeout.
    pub reply_timeout: Duration,
    /// Budget for a single uninterrupted resume span. A job observed to overrun it is
    /// aborted with a limit error.
    pub job_slice: Duration,
    /// Cadence of the maintenance pass (writeback flush, eviction, sweeps).
    pub maintenance_interval: Duration,
    /// Time budget for each maintenance pass.
    pub maintenance_budget: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admission_concurrency: 4,
            surge_threshold: 64,
            surge_dwell: Duration::from_secs(30),
            cache_target: 1024,
            writeback_debounce: Duration::from_secs(5),
            lock_expiry: Duration::from_secs(60),
            session_idle_timeout: Some(Duration::from_secs(30 * 60)),
            reply_timeout: Duration::from_secs(10),
            job_slice: Duration::from_millis(100),
            maintenance_interval: Duration::from_secs(1),
            maintenance_budget: Duration::from_millis(5),
        }
    }
}
