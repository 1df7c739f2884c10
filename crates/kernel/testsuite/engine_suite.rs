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

//! End-to-end suite driving the whole engine through its public surface: sessions
//! started and stopped through the client, jobs contending on locks, writeback and
//! eviction through expedited maintenance passes.

use coord_common::{Identity, SchedulerError, StateBlob};
use coord_kernel::jobs::context::{Demand, JobContext};
use coord_kernel::router::msg;
use coord_kernel::testing::{TestEngine, test_config, test_engine};
use coord_kernel::{JobBody, JobStep, StartParams, WakeReason};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::time::Duration;
use test_case::test_case;

const U1: Identity = Identity::mk_user(1);
const U2: Identity = Identity::mk_user(2);
const S1: Identity = Identity::mk_server(1);

fn engine() -> TestEngine {
    coord_common::tracing::init_tracing_for_tests();
    test_engine(test_config())
}

/// Drive ticks until quiescent, panicking if the engine wedges.
fn settle(engine: &mut TestEngine) {
    assert!(
        engine.scheduler.run_until_quiescent(10_000),
        "engine failed to quiesce: {:?}",
        engine.scheduler.diagnostics()
    );
}

/// Tick with real time passing, for tests that wait on deadlines.
fn settle_slowly(engine: &mut TestEngine, max: usize) {
    for _ in 0..max {
        if engine.scheduler.run_until_quiescent(10) {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!(
        "engine failed to quiesce: {:?}",
        engine.scheduler.diagnostics()
    );
}

/// Locks the identity, writes one object into its state, releases.
struct MutateJob {
    identity: Identity,
    key: &'static str,
    value: Value,
}

impl JobBody for MutateJob {
    fn resume(
        &mut self,
        ctx: &mut JobContext<'_>,
        _wake: WakeReason,
    ) -> Result<JobStep, SchedulerError> {
        if !ctx.holds_lock(self.identity)
            && let Some(step) = ctx.acquire_or_wait(self.identity)
        {
            return Ok(step);
        }
        if let Demand::Wait(step) = ctx.find_or_load(self.identity) {
            return Ok(step);
        }
        ctx.cache_mut(self.identity)
            .expect("resident")
            .put(self.key, self.value.clone());
        ctx.release(self.identity)?;
        Ok(JobStep::Complete(json!(null)))
    }
}

fn start_session(engine: &mut TestEngine, identity: Identity, params: StartParams) {
    engine.scheduler.client().submit_start(identity, params).unwrap();
    settle(engine);
}

fn dirty_cache(engine: &mut TestEngine, identity: Identity, key: &'static str, value: Value) {
    engine.scheduler.spawn(
        "test-mutate",
        Box::new(MutateJob {
            identity,
            key,
            value,
        }),
    );
    settle(engine);
}

// Scenario: start with no prior session loads the cache, installs the session, and
// detaches the cache from the LRU list; stop reverses all of it and queues dirty
// state for writeback.
#[test]
fn test_session_lifecycle_scenario() {
    let mut e = engine();
    start_session(&mut e, U1, StartParams::default());

    assert!(e.scheduler.sessions().user(U1).is_some());
    assert_eq!(e.scheduler.sessions().user(U1).unwrap().bound_server, None);
    let cache = e.scheduler.caches().get(U1).expect("cache resident");
    assert!(!cache.on_lru(), "session-owned cache must be off the LRU list");
    assert_eq!(e.storage.loads_of(U1), 1);
    assert_eq!(e.transport.sent_of_type(msg::SESSION_STARTED).len(), 1);

    dirty_cache(&mut e, U1, "loadout", json!({"slot": 3}));

    e.scheduler.client().submit_stop(U1).unwrap();
    settle(&mut e);

    assert!(e.scheduler.sessions().user(U1).is_none());
    let cache = e.scheduler.caches().get(U1).expect("cache stays resident");
    assert!(cache.on_lru(), "stopped session's cache returns to the LRU list");
    assert!(cache.is_dirty());
    assert!(e.scheduler.caches().writeback().contains(U1));
    assert_eq!(e.transport.sent_of_type(msg::SESSION_STOPPED).len(), 1);
}

// Two start requests before either drains leave exactly one admission entry; the
// session comes up with the newest parameters and a single storage load.
#[test]
fn test_admission_dedup_newest_params_win() {
    let mut e = engine();
    let client = e.scheduler.client();
    client.submit_start(U1, StartParams::default()).unwrap();
    client
        .submit_start(
            U1,
            StartParams {
                server: Some(S1),
                payload: json!({"attempt": 2}),
            },
        )
        .unwrap();
    settle(&mut e);

    assert_eq!(e.scheduler.sessions().user_count(), 1);
    assert_eq!(e.scheduler.sessions().user(U1).unwrap().bound_server, Some(S1));
    assert_eq!(e.storage.loads_of(U1), 1, "one admission entry, one load");
    assert_eq!(e.transport.sent_of_type(msg::SESSION_STARTED).len(), 1);
}

/// Completes once the identity's state is resident, reporting the version it saw.
struct LoadProbeJob {
    identity: Identity,
}

impl JobBody for LoadProbeJob {
    fn resume(
        &mut self,
        ctx: &mut JobContext<'_>,
        _wake: WakeReason,
    ) -> Result<JobStep, SchedulerError> {
        if let Demand::Wait(step) = ctx.find_or_load(self.identity) {
            return Ok(step);
        }
        let version = ctx.cache(self.identity).expect("resident").version();
        Ok(JobStep::Complete(json!(version)))
    }
}

// K concurrent find_or_load calls, one storage load.
#[test_case(2)]
#[test_case(5)]
#[test_case(16)]
fn test_no_duplicate_load(k: usize) {
    let mut e = engine();
    e.storage.seed(
        U1,
        StateBlob {
            objects: [("a".to_string(), json!(1))].into(),
            version: 7,
        },
    );
    let mut receivers = Vec::new();
    for _ in 0..k {
        let (_, rx) = e
            .scheduler
            .spawn("load-probe", Box::new(LoadProbeJob { identity: U1 }));
        receivers.push(rx);
    }
    settle(&mut e);

    assert_eq!(e.storage.loads_of(U1), 1, "exactly one load for {k} callers");
    for rx in receivers {
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!(7));
    }
}

/// Read-modify-write across a deliberate suspension while holding the lock. Lost
/// updates appear immediately if mutual exclusion is broken.
struct ContendJob {
    identity: Identity,
    snapshot: Option<i64>,
}

impl JobBody for ContendJob {
    fn resume(
        &mut self,
        ctx: &mut JobContext<'_>,
        _wake: WakeReason,
    ) -> Result<JobStep, SchedulerError> {
        if !ctx.holds_lock(self.identity)
            && let Some(step) = ctx.acquire_or_wait(self.identity)
        {
            return Ok(step);
        }
        if let Demand::Wait(step) = ctx.find_or_load(self.identity) {
            return Ok(step);
        }
        match self.snapshot {
            None => {
                let current = ctx
                    .cache(self.identity)
                    .and_then(|c| c.get("counter"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                self.snapshot = Some(current);
                // Hold the lock across a tick; contenders must still see our write.
                Ok(ctx.yield_ticks(1))
            }
            Some(snapshot) => {
                let next = snapshot + 1;
                ctx.cache_mut(self.identity)
                    .expect("resident")
                    .put("counter", json!(next));
                ctx.release(self.identity)?;
                Ok(JobStep::Complete(json!(next)))
            }
        }
    }
}

#[test_case(2)]
#[test_case(4)]
#[test_case(8)]
fn test_mutual_exclusion_no_lost_updates(n: i64) {
    let mut e = engine();
    let mut receivers = Vec::new();
    for _ in 0..n {
        let (_, rx) = e.scheduler.spawn(
            "contend",
            Box::new(ContendJob {
                identity: U1,
                snapshot: None,
            }),
        );
        receivers.push(rx);
    }
    settle(&mut e);

    let counter = e
        .scheduler
        .caches()
        .get(U1)
        .and_then(|c| c.get("counter"))
        .and_then(Value::as_i64)
        .unwrap();
    assert_eq!(counter, n, "every increment observed, none lost");

    let mut seen: Vec<i64> = receivers
        .into_iter()
        .map(|rx| rx.try_recv().unwrap().unwrap().as_i64().unwrap())
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (1..=n).collect::<Vec<_>>(), "strict total order per identity");
}

/// Takes both identities via pair ordering, holds them across one tick, releases.
struct PairJob {
    a: Identity,
    b: Identity,
    held: bool,
}

impl JobBody for PairJob {
    fn resume(
        &mut self,
        ctx: &mut JobContext<'_>,
        _wake: WakeReason,
    ) -> Result<JobStep, SchedulerError> {
        if !self.held {
            if let Some(step) = ctx.acquire_pair_or_wait(self.a, self.b) {
                return Ok(step);
            }
            self.held = true;
            return Ok(ctx.yield_ticks(1));
        }
        ctx.release(self.a)?;
        ctx.release(self.b)?;
        Ok(JobStep::Complete(json!(null)))
    }
}

// acquire_pair(A,B) racing acquire_pair(B,A) must not deadlock.
#[test]
fn test_pair_locking_deadlock_free() {
    let mut e = engine();
    let (_, rx1) = e.scheduler.spawn(
        "pair-ab",
        Box::new(PairJob {
            a: U1,
            b: U2,
            held: false,
        }),
    );
    let (_, rx2) = e.scheduler.spawn(
        "pair-ba",
        Box::new(PairJob {
            a: U2,
            b: U1,
            held: false,
        }),
    );
    settle(&mut e);
    assert!(rx1.try_recv().unwrap().is_ok());
    assert!(rx2.try_recv().unwrap().is_ok());
    assert!(!e.scheduler.locks().is_locked(U1));
    assert!(!e.scheduler.locks().is_locked(U2));
}

// A dirty cache survives eviction passes until a successful writeback clears it.
#[test]
fn test_dirty_cache_never_evicted() {
    let mut config = test_config();
    config.cache_target = 0;
    let mut e = test_engine(config);

    start_session(&mut e, U1, StartParams::default());
    dirty_cache(&mut e, U1, "inv", json!(["item"]));
    e.scheduler.client().submit_stop(U1).unwrap();
    settle(&mut e);

    // Commit failure leaves the cache dirty and re-queued; eviction must skip it.
    e.storage.fail_next_commits(1);
    e.scheduler.expedite_maintenance();
    e.scheduler.tick();
    let cache = e.scheduler.caches().get(U1).expect("dirty cache survives");
    assert!(cache.is_dirty());
    assert!(e.scheduler.caches().writeback().contains(U1));

    // Next pass commits, clears dirty, and only then may eviction take it.
    e.scheduler.expedite_maintenance();
    e.scheduler.tick();
    assert!(
        e.scheduler.caches().get(U1).is_none(),
        "clean unused cache evicted once target is exceeded"
    );
    let record = e.storage.record(U1).expect("writeback persisted");
    assert_eq!(record.objects.get("inv"), Some(&json!(["item"])));
}

// A failed batch commit re-queues every member with its dirty set intact; the retry
// commits all of them in one transaction.
#[test]
fn test_writeback_batch_atomicity() {
    let mut e = engine();
    for identity in [U1, U2] {
        start_session(&mut e, identity, StartParams::default());
        dirty_cache(&mut e, identity, "k", json!(identity.number()));
        e.scheduler.client().submit_stop(identity).unwrap();
        settle(&mut e);
    }

    e.storage.fail_next_commits(1);
    e.scheduler.expedite_maintenance();
    e.scheduler.tick();
    for identity in [U1, U2] {
        let cache = e.scheduler.caches().get(identity).unwrap();
        assert!(cache.is_dirty(), "{identity} keeps dirty state after failed commit");
        assert!(e.scheduler.caches().writeback().contains(identity));
        assert!(e.storage.record(identity).is_none(), "nothing partially persisted");
    }

    e.scheduler.expedite_maintenance();
    e.scheduler.tick();
    for identity in [U1, U2] {
        assert!(!e.scheduler.caches().get(identity).unwrap().is_dirty());
        assert!(e.storage.record(identity).is_some());
    }
    assert_eq!(e.storage.handle().lock().unwrap().commit_count, 1);
}

/// Pings a server and completes with the reply, or a degraded local result on timeout.
struct PingJob {
    target: Identity,
    sent: bool,
}

impl JobBody for PingJob {
    fn resume(
        &mut self,
        ctx: &mut JobContext<'_>,
        wake: WakeReason,
    ) -> Result<JobStep, SchedulerError> {
        match wake {
            WakeReason::Reply { payload, .. } => Ok(JobStep::Complete(payload)),
            WakeReason::ReplyTimeout { .. } => {
                Ok(JobStep::Complete(json!({"degraded": true})))
            }
            _ => {
                assert!(!self.sent, "ping sent twice");
                self.sent = true;
                Ok(ctx.send_expecting_reply(self.target, 42, json!({"ping": 1})))
            }
        }
    }
}

#[test]
fn test_reply_wakes_correlated_job() {
    let mut e = engine();
    let (_, rx) = e.scheduler.spawn(
        "ping",
        Box::new(PingJob {
            target: S1,
            sent: false,
        }),
    );
    e.scheduler.tick();
    let key = e.transport.last_reply_key().expect("reply-expecting send");
    e.scheduler
        .client()
        .deliver(43, json!({"pong": 1}), S1, Some(key.correlation))
        .unwrap();
    settle(&mut e);
    assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"pong": 1}));
}

#[test]
fn test_reply_timeout_degrades() {
    let mut e = engine();
    let (_, rx) = e.scheduler.spawn(
        "ping",
        Box::new(PingJob {
            target: S1,
            sent: false,
        }),
    );
    settle_slowly(&mut e, 200);
    assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"degraded": true}));

    // A reply arriving after the timeout is dropped, not re-dispatched.
    let key = e.transport.last_reply_key().unwrap();
    let before = e.scheduler.diagnostics().unrouted_messages;
    e.scheduler
        .client()
        .deliver(43, json!({"pong": 1}), S1, Some(key.correlation))
        .unwrap();
    settle(&mut e);
    assert_eq!(e.scheduler.diagnostics().unrouted_messages, before + 1);
}

/// Fans out N children and sums their results.
struct FarmParentJob {
    children: Vec<coord_common::JobId>,
    spawned: bool,
}

struct FarmChildJob {
    value: i64,
}

impl JobBody for FarmChildJob {
    fn resume(
        &mut self,
        _ctx: &mut JobContext<'_>,
        _wake: WakeReason,
    ) -> Result<JobStep, SchedulerError> {
        Ok(JobStep::Complete(json!(self.value)))
    }
}

impl JobBody for FarmParentJob {
    fn resume(
        &mut self,
        ctx: &mut JobContext<'_>,
        _wake: WakeReason,
    ) -> Result<JobStep, SchedulerError> {
        if !self.spawned {
            self.spawned = true;
            for value in 1..=3 {
                self.children
                    .push(ctx.spawn("farm-child", Box::new(FarmChildJob { value })));
            }
            if let Some(step) = ctx.wait_for_farm(&self.children) {
                return Ok(step);
            }
        }
        let mut sum = 0;
        for child in &self.children {
            let result = ctx.take_result(*child).expect("child result retained");
            sum += result.expect("child succeeded").as_i64().unwrap();
        }
        Ok(JobStep::Complete(json!(sum)))
    }
}

#[test]
fn test_parallel_farm_completion() {
    let mut e = engine();
    let (_, rx) = e.scheduler.spawn(
        "farm-parent",
        Box::new(FarmParentJob {
            children: Vec::new(),
            spawned: false,
        }),
    );
    settle(&mut e);
    assert_eq!(rx.try_recv().unwrap().unwrap(), json!(6));
}

/// Acquires a lock legitimately, then violates the release contract on another
/// identity.
struct RogueJob;

impl JobBody for RogueJob {
    fn resume(
        &mut self,
        ctx: &mut JobContext<'_>,
        _wake: WakeReason,
    ) -> Result<JobStep, SchedulerError> {
        assert!(ctx.try_acquire(U2));
        // Contract violation: U1 is not ours to release.
        ctx.release(U1)?;
        Ok(JobStep::Complete(json!(null)))
    }
}

// A contract violation aborts only the offending job; its locks are force-released
// and waiters proceed.
#[test]
fn test_contract_violation_aborts_job_only() {
    let mut e = engine();
    let (_, rogue_rx) = e.scheduler.spawn("rogue", Box::new(RogueJob));
    let (_, mutate_rx) = e.scheduler.spawn(
        "test-mutate",
        Box::new(MutateJob {
            identity: U2,
            key: "k",
            value: json!(1),
        }),
    );
    settle(&mut e);

    assert!(matches!(
        rogue_rx.try_recv().unwrap(),
        Err(SchedulerError::ContractViolation(_))
    ));
    // The force-released lock let the well-behaved job through.
    assert!(mutate_rx.try_recv().unwrap().is_ok());
    assert!(!e.scheduler.locks().is_locked(U2));
}

// A load failure aborts the session start; no session is created and a retry works
// once storage recovers.
#[test]
fn test_load_failure_fails_start_cleanly() {
    let mut e = engine();
    e.storage.fail_loads_of(U1);
    start_session(&mut e, U1, StartParams::default());
    assert!(e.scheduler.sessions().user(U1).is_none());
    assert!(!e.scheduler.locks().is_locked(U1));

    e.storage.handle().lock().unwrap().fail_loads.clear();
    start_session(&mut e, U1, StartParams::default());
    assert!(e.scheduler.sessions().user(U1).is_some());
}

// A stop that overtakes its start withdraws the pending admission entry.
#[test]
fn test_stop_cancels_pending_admission() {
    let mut config = test_config();
    config.admission_concurrency = 0;
    let mut e = test_engine(config);
    let client = e.scheduler.client();

    client.submit_start(U1, StartParams::default()).unwrap();
    e.scheduler.tick();
    assert_eq!(e.scheduler.diagnostics().admission_depth, 1);

    client.submit_stop(U1).unwrap();
    settle(&mut e);
    assert_eq!(e.scheduler.diagnostics().admission_depth, 0);
    assert!(e.scheduler.sessions().user(U1).is_none());
    assert_eq!(e.storage.loads_of(U1), 0, "cancelled start never loads");
}

// Surge mode trips on queue depth, gates low-priority work, and clears only after
// the dwell.
#[test]
fn test_surge_mode_dwell() {
    let mut config = test_config();
    config.admission_concurrency = 0;
    config.surge_threshold = 2;
    let mut e = test_engine(config);
    let client = e.scheduler.client();

    for n in 1..=5 {
        client
            .submit_start(Identity::mk_user(n), StartParams::default())
            .unwrap();
    }
    e.scheduler.tick();
    assert!(e.scheduler.diagnostics().surged);
    assert!(!client.allow_low_priority());

    for n in 1..=5 {
        client.submit_stop(Identity::mk_user(n)).unwrap();
    }
    for _ in 0..200 {
        e.scheduler.tick();
        if client.allow_low_priority() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(client.allow_low_priority(), "surge clears after the dwell");
}

// Server sessions register through the same admission path, and users bind to them.
#[test]
fn test_server_session_and_binding() {
    let mut e = engine();
    start_session(&mut e, S1, StartParams {
        server: None,
        payload: json!({"region": "eu"}),
    });
    assert!(e.scheduler.sessions().server(S1).is_some());

    start_session(&mut e, U1, StartParams {
        server: Some(S1),
        payload: json!(null),
    });
    assert_eq!(e.scheduler.sessions().user(U1).unwrap().bound_server, Some(S1));

    // Server teardown unbinds the user without stopping their session.
    e.scheduler.client().submit_stop(S1).unwrap();
    settle(&mut e);
    assert!(e.scheduler.sessions().server(S1).is_none());
    let user = e.scheduler.sessions().user(U1).unwrap();
    assert_eq!(user.bound_server, None);
}

// The wire path: START_PLAYING and STOP_PLAYING route through admission and stop
// jobs; unknown types count as unrouted; registered handlers spawn jobs.
#[test]
fn test_message_routing() -> eyre::Result<()> {
    let mut e = engine();
    e.scheduler.register_handler(
        100,
        "echo-handler",
        Box::new(|_msg_type, payload, source| {
            Box::new(MutateJob {
                identity: source,
                key: "echo",
                value: payload,
            })
        }),
    );
    let client = e.scheduler.client();

    client.deliver(msg::START_PLAYING, json!({}), U1, None)?;
    settle(&mut e);
    assert!(e.scheduler.sessions().user(U1).is_some());

    client.deliver(100, json!("hello"), U1, None)?;
    settle(&mut e);
    assert_eq!(
        e.scheduler.caches().get(U1).unwrap().get("echo"),
        Some(&json!("hello"))
    );

    let before = e.scheduler.diagnostics().unrouted_messages;
    client.deliver(999, json!({}), U1, None)?;
    settle(&mut e);
    assert_eq!(e.scheduler.diagnostics().unrouted_messages, before + 1);

    client.deliver(msg::STOP_PLAYING, json!({}), U1, None)?;
    settle(&mut e);
    assert!(e.scheduler.sessions().user(U1).is_none());
    Ok(())
}

// Version counters survive restarts through the optional store, and a stale store
// value never wins over the loaded one.
#[test]
fn test_version_store_reconciliation() {
    let mut e = engine();
    e.storage.seed(
        U1,
        StateBlob {
            objects: Default::default(),
            version: 3,
        },
    );
    e.version_store.put("sv/u:1", 10);

    start_session(&mut e, U1, StartParams::default());
    assert_eq!(e.scheduler.caches().get(U1).unwrap().version(), 10);

    dirty_cache(&mut e, U1, "k", json!(1));
    e.scheduler.client().submit_stop(U1).unwrap();
    settle(&mut e);
    e.scheduler.expedite_maintenance();
    e.scheduler.tick();

    // Flush pushed the advanced counter back out.
    assert_eq!(e.version_store.values().get("sv/u:1"), Some(&11));
    assert_eq!(e.storage.record(U1).unwrap().version, 11);
}

// Sessions idle past the configured timeout are stopped by the maintenance sweep.
#[test]
fn test_idle_session_eviction() {
    let mut config = test_config();
    config.session_idle_timeout = Some(Duration::from_millis(5));
    let mut e = test_engine(config);

    start_session(&mut e, U1, StartParams::default());
    assert!(e.scheduler.sessions().user(U1).is_some());

    std::thread::sleep(Duration::from_millis(10));
    e.scheduler.expedite_maintenance();
    e.scheduler.tick();
    settle(&mut e);

    assert!(e.scheduler.sessions().user(U1).is_none());
    assert!(
        e.scheduler.caches().get(U1).is_some_and(|c| c.on_lru()),
        "idle-stopped session returns its cache to the LRU list"
    );
}

// The locked/unused distinction in eviction: a locked cache on the LRU list is
// skipped until released.
#[test]
fn test_locked_cache_not_evicted() {
    let mut config = test_config();
    config.cache_target = 0;
    let mut e = test_engine(config);

    struct HoldJob {
        ticks_left: u64,
        acquired: bool,
    }
    impl JobBody for HoldJob {
        fn resume(
            &mut self,
            ctx: &mut JobContext<'_>,
            _wake: WakeReason,
        ) -> Result<JobStep, SchedulerError> {
            if !self.acquired {
                if let Demand::Wait(step) = ctx.find_or_load(U1) {
                    return Ok(step);
                }
                assert!(ctx.try_acquire(U1));
                self.acquired = true;
            }
            if self.ticks_left > 0 {
                self.ticks_left -= 1;
                return Ok(ctx.yield_ticks(1));
            }
            ctx.release(U1)?;
            Ok(JobStep::Complete(json!(null)))
        }
    }

    let (_, rx) = e.scheduler.spawn(
        "hold",
        Box::new(HoldJob {
            ticks_left: 3,
            acquired: false,
        }),
    );
    e.scheduler.tick();
    e.scheduler.tick();
    e.scheduler.expedite_maintenance();
    e.scheduler.tick();
    assert!(
        e.scheduler.caches().get(U1).is_some(),
        "locked cache skipped by eviction"
    );

    settle(&mut e);
    assert!(rx.try_recv().unwrap().is_ok());
    e.scheduler.expedite_maintenance();
    e.scheduler.tick();
    assert!(e.scheduler.caches().get(U1).is_none());
}
