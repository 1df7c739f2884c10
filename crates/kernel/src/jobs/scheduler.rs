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

//! Responsible for the dispatching, control, and accounting of jobs in the system.
//! There should be only one scheduler per service process.
//!
//! All engine state (lock table, cache map, LRU list, writeback queue, session
//! registry, admission queue) lives here and is mutated only from the tick loop. Jobs
//! are resumed one at a time; external stimuli enter through the event channel and are
//! drained at the top of each tick. That single-threaded discipline, not language-level
//! locking, is what makes the spans between suspension points atomic.

use ahash::AHasher;
use coord_common::{
    Identity, JobId, SchedulerError, StateBlob, Storage, Transport, VersionStore,
};
use flume::{Receiver, Sender};
use minstant::Instant;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::admission::AdmissionQ;
use crate::cache::CacheMap;
use crate::cache::writeback::flush_writeback_batch;
use crate::config::Config;
use crate::jobs::context::JobContext;
use crate::jobs::session_jobs::{SessionStartJob, SessionStopJob};
use crate::jobs::suspension::SuspensionQ;
use crate::jobs::{Job, JobBody, JobDescription, JobState, JobStep, WakeCondition, WakeReason};
use crate::locks::LockTable;
use crate::router::{MessageRouter, msg};
use crate::sessions::{SessionExtension, SessionRegistry, StartParams};

const SCHEDULER_TICK_TIME: Duration = Duration::from_millis(5);

/// The process-wide singleton state bundle. Owned by the scheduler, handed to each
/// running job through its [`JobContext`].
pub struct EngineContext {
    pub(crate) config: Config,
    pub(crate) locks: LockTable,
    pub(crate) caches: CacheMap,
    pub(crate) sessions: SessionRegistry,
    pub(crate) admission: AdmissionQ,
    pub(crate) router: MessageRouter,
    pub(crate) storage: Box<dyn Storage>,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) version_store: Option<Box<dyn VersionStore>>,
    pub(crate) extensions: Vec<Box<dyn SessionExtension>>,
}

/// The job table: bodies and states of every live job, the runnable queue, the
/// suspension indexes, and buffered results of completed children.
pub(crate) struct JobQ {
    pub(crate) jobs: HashMap<JobId, Job, BuildHasherDefault<AHasher>>,
    pub(crate) runnable: VecDeque<(JobId, WakeReason)>,
    pub(crate) suspended: SuspensionQ,
    /// child -> (parent, result); retained until the parent takes it or dies.
    pub(crate) completed:
        HashMap<JobId, (JobId, Result<Value, SchedulerError>), BuildHasherDefault<AHasher>>,
    next_job_id: JobId,
}

impl JobQ {
    fn new() -> Self {
        Self {
            jobs: Default::default(),
            runnable: VecDeque::new(),
            suspended: SuspensionQ::new(),
            completed: Default::default(),
            // Id 0 is MAINTENANCE_JOB, reserved.
            next_job_id: 1,
        }
    }

    pub(crate) fn spawn(
        &mut self,
        name: &'static str,
        body: Box<dyn JobBody>,
        parent: Option<JobId>,
    ) -> JobId {
        let job_id = self.next_job_id;
        self.next_job_id += 1;
        self.jobs.insert(
            job_id,
            Job {
                name,
                body: Some(body),
                state: JobState::Runnable,
                parent,
                created: Instant::now(),
                result_sender: None,
            },
        );
        self.runnable.push_back((job_id, WakeReason::Start));
        job_id
    }

    /// Move a suspended job back to the runnable queue.
    pub(crate) fn wake(&mut self, job_id: JobId, reason: WakeReason) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        job.state = JobState::Runnable;
        self.runnable.push_back((job_id, reason));
    }
}

/// What arrives from outside the scheduler thread.
pub(crate) enum EngineEvent {
    Inbound {
        msg_type: u32,
        payload: Value,
        source: Identity,
        correlation: Option<Uuid>,
    },
    SubmitStart {
        identity: Identity,
        params: StartParams,
    },
    SubmitStop {
        identity: Identity,
    },
}

/// Handle for feeding the scheduler from hosts and transports. Cheap to clone; all
/// methods are thread-safe.
#[derive(Clone)]
pub struct SchedulerClient {
    event_tx: Sender<EngineEvent>,
    surge_flag: Arc<AtomicBool>,
}

impl SchedulerClient {
    /// Deliver an inbound protocol message for routing.
    pub fn deliver(
        &self,
        msg_type: u32,
        payload: Value,
        source: Identity,
        correlation: Option<Uuid>,
    ) -> Result<(), SchedulerError> {
        self.event_tx
            .send(EngineEvent::Inbound {
                msg_type,
                payload,
                source,
                correlation,
            })
            .map_err(|_| SchedulerError::SchedulerNotResponding)
    }

    /// Queue a start-session request for admission.
    pub fn submit_start(
        &self,
        identity: Identity,
        params: StartParams,
    ) -> Result<(), SchedulerError> {
        self.event_tx
            .send(EngineEvent::SubmitStart { identity, params })
            .map_err(|_| SchedulerError::SchedulerNotResponding)
    }

    pub fn submit_stop(&self, identity: Identity) -> Result<(), SchedulerError> {
        self.event_tx
            .send(EngineEvent::SubmitStop { identity })
            .map_err(|_| SchedulerError::SchedulerNotResponding)
    }

    /// Gate for non-essential work. Answers false while the service is in surge mode,
    /// during which callers are expected to shed such work outright.
    pub fn allow_low_priority(&self) -> bool {
        !self.surge_flag.load(Ordering::Relaxed)
    }
}

/// Read-only diagnostic snapshot of the engine, for operational introspection.
#[derive(Clone, Debug, Serialize)]
pub struct EngineSnapshot {
    pub tick: u64,
    pub jobs_live: usize,
    pub jobs_runnable: usize,
    pub jobs_waiting: usize,
    pub locks_total: usize,
    pub locks_waiting: usize,
    pub caches_resident: usize,
    pub caches_loading: usize,
    pub lru_len: usize,
    pub writeback_depth: usize,
    pub admission_depth: usize,
    pub surged: bool,
    pub user_sessions: usize,
    pub server_sessions: usize,
    pub unrouted_messages: u64,
}

pub struct Scheduler {
    engine: EngineContext,
    jobs: JobQ,
    event_tx: Sender<EngineEvent>,
    event_rx: Receiver<EngineEvent>,
    surge_flag: Arc<AtomicBool>,
    tick: u64,
    last_maintenance: Instant,
    maintenance_due: bool,
    /// Jobs currently draining the admission queue, for the concurrency cap.
    admission_jobs: HashSet<JobId, BuildHasherDefault<AHasher>>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        storage: Box<dyn Storage>,
        transport: Box<dyn Transport>,
        version_store: Option<Box<dyn VersionStore>>,
    ) -> Self {
        let (event_tx, event_rx) = flume::unbounded();
        let surge_flag = Arc::new(AtomicBool::new(false));
        Self {
            engine: EngineContext {
                config,
                locks: LockTable::new(),
                caches: CacheMap::new(),
                sessions: SessionRegistry::new(),
                admission: AdmissionQ::new(surge_flag.clone()),
                router: MessageRouter::new(),
                storage,
                transport,
                version_store,
                extensions: Vec::new(),
            },
            jobs: JobQ::new(),
            event_tx,
            event_rx,
            surge_flag,
            tick: 0,
            last_maintenance: Instant::now(),
            maintenance_due: false,
            admission_jobs: Default::default(),
        }
    }

    pub fn client(&self) -> SchedulerClient {
        SchedulerClient {
            event_tx: self.event_tx.clone(),
            surge_flag: self.surge_flag.clone(),
        }
    }

    /// Register a spawning handler for a message type beyond the engine's own.
    pub fn register_handler(
        &mut self,
        msg_type: u32,
        name: &'static str,
        factory: crate::router::HandlerFactory,
    ) {
        self.engine.router.register(msg_type, name, factory);
    }

    pub fn register_extension(&mut self, ext: Box<dyn SessionExtension>) {
        self.engine.extensions.push(ext);
    }

    /// Spawn a top-level job. The receiver resolves with the job's result when it
    /// completes or aborts.
    pub fn spawn(
        &mut self,
        name: &'static str,
        body: Box<dyn JobBody>,
    ) -> (JobId, oneshot::Receiver<Result<Value, SchedulerError>>) {
        let job_id = self.jobs.spawn(name, body, None);
        let (tx, rx) = oneshot::channel();
        self.jobs
            .jobs
            .get_mut(&job_id)
            .expect("just spawned")
            .result_sender = Some(tx);
        (job_id, rx)
    }

    /// One full scheduler pass: drain external events, drain admission, wake due
    /// waiters, pump demand-loads, run the runnable batch, then maintenance if due.
    pub fn tick(&mut self) {
        self.tick += 1;
        let now = Instant::now();

        self.drain_events();
        self.drain_admission();
        self.engine.admission.update_surge(
            self.engine.config.surge_threshold,
            self.engine.config.surge_dwell,
            now,
        );

        for (job_id, reason) in self.jobs.suspended.collect_due(now, self.tick) {
            self.jobs.wake(job_id, reason);
        }

        self.pump_loads();
        self.run_batch();

        if self.maintenance_due
            || now.duration_since(self.last_maintenance) >= self.engine.config.maintenance_interval
        {
            self.maintenance_due = false;
            self.last_maintenance = now;
            self.run_maintenance();
        }
    }

    /// Drive ticks until no live jobs, queued events, pending admissions, or in-flight
    /// loads remain, or `max_ticks` pass. Returns true on quiescence. Writeback
    /// residue does not count as work; it drains on maintenance cadence.
    pub fn run_until_quiescent(&mut self, max_ticks: u64) -> bool {
        for _ in 0..max_ticks {
            self.tick();
            let idle = self.jobs.jobs.is_empty()
                && self.event_rx.is_empty()
                && self.engine.admission.is_empty()
                && self.engine.caches.loading_count() == 0;
            if idle {
                return true;
            }
        }
        false
    }

    /// Endless tick loop for embedding on a dedicated thread.
    pub fn run(&mut self, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Relaxed) {
            self.tick();
            std::thread::sleep(SCHEDULER_TICK_TIME);
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                EngineEvent::Inbound {
                    msg_type,
                    payload,
                    source,
                    correlation,
                } => self.route_inbound(msg_type, payload, source, correlation),
                EngineEvent::SubmitStart { identity, params } => {
                    self.submit_admission(identity, params)
                }
                EngineEvent::SubmitStop { identity } => {
                    if identity.is_wellformed() {
                        self.jobs.spawn(
                            "session-stop",
                            Box::new(SessionStopJob::new(identity)),
                            None,
                        );
                    } else {
                        warn!(%identity, "dropping stop request for malformed identity");
                    }
                }
            }
        }
    }

    /// Inbound dispatch: a correlated message goes to the job blocked on that exact
    /// reply; anything else spawns by message type.
    fn route_inbound(
        &mut self,
        msg_type: u32,
        payload: Value,
        source: Identity,
        correlation: Option<Uuid>,
    ) {
        if let Some(correlation) = correlation {
            match self.jobs.suspended.take_reply_waiter(correlation) {
                Some(job_id) => self.jobs.wake(
                    job_id,
                    WakeReason::Reply {
                        correlation,
                        payload,
                    },
                ),
                // Waiter timed out or died; late replies are dropped.
                None => self.engine.router.count_unrouted(msg_type, source),
            }
            return;
        }
        match msg_type {
            msg::START_PLAYING => {
                let params = parse_start_params(&payload);
                self.submit_admission(source, params);
            }
            msg::STOP_PLAYING => {
                if source.is_wellformed() {
                    self.jobs
                        .spawn("session-stop", Box::new(SessionStopJob::new(source)), None);
                } else {
                    warn!(%source, "dropping stop message for malformed identity");
                }
            }
            _ => match self.engine.router.spawn_for(msg_type, payload, source) {
                Some((name, body)) => {
                    self.jobs.spawn(name, body, None);
                }
                None => self.engine.router.count_unrouted(msg_type, source),
            },
        }
    }

    fn submit_admission(&mut self, identity: Identity, params: StartParams) {
        if !identity.is_wellformed() {
            warn!(%identity, "dropping start request for malformed identity");
            return;
        }
        self.engine.admission.submit(identity, params);
    }

    /// Pop admission entries into start jobs, up to the concurrency cap.
    fn drain_admission(&mut self) {
        self.admission_jobs
            .retain(|job_id| self.jobs.jobs.contains_key(job_id));
        while self.admission_jobs.len() < self.engine.config.admission_concurrency {
            let Some((identity, params)) = self.engine.admission.pop_next() else {
                break;
            };
            let job_id = self.jobs.spawn(
                "session-start",
                Box::new(SessionStartJob::new(identity, params)),
                None,
            );
            self.admission_jobs.insert(job_id);
        }
    }

    /// Perform queued demand-loads. Runs outside any job span; waiters are woken with
    /// the outcome and retry (success) or fail their operation (error).
    fn pump_loads(&mut self) {
        while let Some(identity) = self.engine.caches.next_load_request() {
            match self.engine.storage.load(identity) {
                Ok(blob) => {
                    let mut blob = blob.unwrap_or_else(StateBlob::default);
                    // Best-effort version continuity across restarts; absence or
                    // staleness of the store leaves the loaded counter authoritative.
                    if let Some(vs) = self.engine.version_store.as_deref()
                        && let Some(recovered) = vs.get(&format!("sv/{identity}"))
                        && recovered > blob.version
                    {
                        debug!(%identity, recovered, "recovered cache version from store");
                        blob.version = recovered;
                    }
                    self.engine.caches.install_loaded(identity, blob);
                    for job_id in self.jobs.suspended.take_load_waiters(identity) {
                        self.jobs.wake(job_id, WakeReason::Loaded(identity));
                    }
                }
                Err(e) => {
                    warn!(%identity, error = %e, "demand-load failed");
                    self.engine.caches.abandon_load(identity);
                    for job_id in self.jobs.suspended.take_load_waiters(identity) {
                        self.jobs.wake(
                            job_id,
                            WakeReason::LoadFailed {
                                identity,
                                error: e.clone(),
                            },
                        );
                    }
                }
            }
        }
    }

    /// Resume this tick's runnable batch. Jobs woken during the batch (lock handoffs,
    /// completions) run next tick, keeping the batch bounded.
    fn run_batch(&mut self) {
        let batch = self.jobs.runnable.len();
        for _ in 0..batch {
            let Some((job_id, reason)) = self.jobs.runnable.pop_front() else {
                break;
            };
            let Some(job) = self.jobs.jobs.get_mut(&job_id) else {
                continue;
            };
            let Some(mut body) = job.body.take() else {
                error!(job_id, "runnable job with no body");
                continue;
            };
            let name = job.name;

            let started = Instant::now();
            let step = {
                let mut ctx = JobContext {
                    job_id,
                    tick: self.tick,
                    engine: &mut self.engine,
                    jobs: &mut self.jobs,
                };
                body.resume(&mut ctx, reason)
            };
            let elapsed = started.elapsed();
            let overran = elapsed > self.engine.config.job_slice;

            match step {
                Ok(JobStep::Complete(value)) => {
                    if overran {
                        warn!(job_id, name, ?elapsed, "job overran its slice while completing");
                    }
                    self.finish_job(job_id, Ok(value));
                }
                Ok(JobStep::Suspend(condition)) => {
                    if overran {
                        // Cooperative scheduling cannot preempt; the budget is enforced
                        // after the fact on jobs that keep going.
                        error!(job_id, name, ?elapsed, "job overran its slice, aborting");
                        self.finish_job(
                            job_id,
                            Err(SchedulerError::JobAbortedLimit(
                                coord_common::AbortLimitReason::Time(elapsed),
                            )),
                        );
                        continue;
                    }
                    match &condition {
                        WakeCondition::Time(at) => {
                            self.jobs.suspended.park_timer(job_id, *at);
                        }
                        WakeCondition::Ticks(n) => {
                            self.jobs.suspended.park_ticks(job_id, self.tick + (*n).max(1));
                        }
                        // Lock waits live in the lock table queue; reply, load, job and
                        // farm waits were registered by the context call that produced
                        // this step.
                        _ => {}
                    }
                    let job = self.jobs.jobs.get_mut(&job_id).expect("job vanished");
                    job.state = JobState::of(&condition);
                    job.body = Some(body);
                }
                Err(e) => {
                    error!(job_id, name, error = %e, "job aborted");
                    self.finish_job(job_id, Err(e));
                }
            }
        }
    }

    /// Tear a job down: force-release its locks, purge its waits, deliver its result
    /// to subscriber and waiting parent, and drop its children's unconsumed results.
    fn finish_job(&mut self, job_id: JobId, result: Result<Value, SchedulerError>) {
        let Some(job) = self.jobs.jobs.remove(&job_id) else {
            return;
        };
        for (identity, next_holder) in self.engine.locks.forsake_all(job_id) {
            self.jobs
                .wake(next_holder, WakeReason::LockAcquired(identity));
        }
        self.jobs.suspended.remove_job(job_id);
        self.jobs.completed.retain(|_, (parent, _)| *parent != job_id);
        self.admission_jobs.remove(&job_id);

        if let Some(parent) = job.parent
            && self.jobs.jobs.contains_key(&parent)
        {
            self.jobs
                .completed
                .insert(job_id, (parent, result.clone()));
        }
        if let Some((parent, reason)) = self.jobs.suspended.on_child_complete(job_id) {
            self.jobs.wake(parent, reason);
        }
        if let Some(sender) = job.result_sender {
            let _ = sender.send(result);
        }
    }

    /// Periodic housekeeping: writeback flush, LRU eviction, idle-lock sweep, idle
    /// session eviction.
    fn run_maintenance(&mut self) {
        let EngineContext {
            config,
            locks,
            caches,
            storage,
            version_store,
            ..
        } = &mut self.engine;
        let stats = flush_writeback_batch(
            caches,
            locks,
            storage.as_ref(),
            version_store.as_deref(),
            config.writeback_debounce,
            config.maintenance_budget,
        );
        if stats.flushed > 0 || stats.requeued > 0 {
            debug!(?stats, "writeback pass");
        }

        caches.evict_unused(config.cache_target, config.maintenance_budget, locks);
        locks.sweep_idle(config.lock_expiry);
        let idle_timeout = config.session_idle_timeout;

        if let Some(timeout) = idle_timeout {
            for identity in self.engine.sessions.idle_sessions(timeout) {
                debug!(%identity, "stopping idle session");
                self.jobs.spawn(
                    "session-stop-idle",
                    Box::new(SessionStopJob::new(identity)),
                    None,
                );
            }
        }
    }

    pub fn diagnostics(&self) -> EngineSnapshot {
        EngineSnapshot {
            tick: self.tick,
            jobs_live: self.jobs.jobs.len(),
            jobs_runnable: self.jobs.runnable.len(),
            jobs_waiting: self.jobs.suspended.waiting_count(),
            locks_total: self.engine.locks.len(),
            locks_waiting: self.engine.locks.waiting_count(),
            caches_resident: self.engine.caches.resident_count(),
            caches_loading: self.engine.caches.loading_count(),
            lru_len: self.engine.caches.lru.len(),
            writeback_depth: self.engine.caches.writeback.len(),
            admission_depth: self.engine.admission.len(),
            surged: self.engine.admission.is_surged(),
            user_sessions: self.engine.sessions.user_count(),
            server_sessions: self.engine.sessions.server_count(),
            unrouted_messages: self.engine.router.unrouted(),
        }
    }

    /// A friendly list of every live job, for diagnostics.
    pub fn describe_jobs(&self) -> Vec<JobDescription> {
        self.jobs
            .jobs
            .iter()
            .map(|(job_id, job)| JobDescription {
                job_id: *job_id,
                name: job.name,
                state: job.state,
                created: job.created,
            })
            .collect()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.engine.sessions
    }

    pub fn caches(&self) -> &CacheMap {
        &self.engine.caches
    }

    pub fn locks(&self) -> &LockTable {
        &self.engine.locks
    }

    /// Force a maintenance pass on the next tick regardless of cadence. Intended for
    /// tests and shutdown paths that need the writeback queue drained now.
    pub fn expedite_maintenance(&mut self) {
        self.maintenance_due = true;
    }
}

/// Decode start parameters from a wire payload; malformed extras degrade to defaults
/// rather than rejecting the start.
fn parse_start_params(payload: &Value) -> StartParams {
    match serde_json::from_value::<StartParams>(payload.clone()) {
        Ok(params) => params,
        Err(e) => {
            debug!(error = %e, "unparseable start parameters, using defaults");
            StartParams::default()
        }
    }
}
