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

//! In-memory collaborator implementations for tests: a scriptable storage adapter, a
//! recording transport, and a map-backed version store. Each hands out shared handles
//! so a test can inspect and script behavior while the scheduler owns the adapter.

use coord_common::{
    Identity, ReplyKey, StateBlob, Storage, StorageError, StorageTransaction, Transport,
    VersionStore,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::jobs::scheduler::Scheduler;

#[derive(Default)]
pub struct StorageInner {
    pub records: HashMap<Identity, StateBlob>,
    /// Per-identity count of `load` calls, for duplicate-load assertions.
    pub load_count: HashMap<Identity, usize>,
    /// Identities whose loads fail.
    pub fail_loads: HashSet<Identity>,
    /// Number of upcoming commits to fail, counting down.
    pub fail_next_commits: usize,
    pub commit_count: usize,
}

/// Map-backed storage with scriptable failures.
#[derive(Clone, Default)]
pub struct TestStorage {
    inner: Arc<Mutex<StorageInner>>,
}

impl TestStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<Mutex<StorageInner>> {
        self.inner.clone()
    }

    pub fn seed(&self, identity: Identity, blob: StateBlob) {
        self.inner.lock().unwrap().records.insert(identity, blob);
    }

    pub fn loads_of(&self, identity: Identity) -> usize {
        self.inner
            .lock()
            .unwrap()
            .load_count
            .get(&identity)
            .copied()
            .unwrap_or(0)
    }

    pub fn record(&self, identity: Identity) -> Option<StateBlob> {
        self.inner.lock().unwrap().records.get(&identity).cloned()
    }

    pub fn fail_next_commits(&self, n: usize) {
        self.inner.lock().unwrap().fail_next_commits = n;
    }

    pub fn fail_loads_of(&self, identity: Identity) {
        self.inner.lock().unwrap().fail_loads.insert(identity);
    }
}

impl Storage for TestStorage {
    fn load(&self, identity: Identity) -> Result<Option<StateBlob>, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        *inner.load_count.entry(identity).or_insert(0) += 1;
        if inner.fail_loads.contains(&identity) {
            return Err(StorageError::ReadFailed(format!("scripted failure for {identity}")));
        }
        Ok(inner.records.get(&identity).cloned())
    }

    fn begin(&self) -> Box<dyn StorageTransaction> {
        Box::new(TestTransaction {
            inner: self.inner.clone(),
            staged: Vec::new(),
        })
    }
}

struct TestTransaction {
    inner: Arc<Mutex<StorageInner>>,
    staged: Vec<(Identity, u64, Vec<(String, Value)>)>,
}

impl StorageTransaction for TestTransaction {
    fn stage(&mut self, identity: Identity, version: u64, objects: Vec<(String, Value)>) {
        self.staged.push((identity, version, objects));
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_commits > 0 {
            inner.fail_next_commits -= 1;
            return Err(StorageError::CommitFailed("scripted failure".into()));
        }
        for (identity, version, objects) in self.staged {
            let record = inner.records.entry(identity).or_default();
            for (key, value) in objects {
                record.objects.insert(key, value);
            }
            record.version = version;
        }
        inner.commit_count += 1;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SentMessage {
    pub target: Identity,
    pub msg_type: u32,
    pub payload: Value,
    pub expect_reply: Option<ReplyKey>,
}

/// Transport that records every outbound message for assertion.
#[derive(Clone, Default)]
pub struct TestTransport {
    sent: Arc<Mutex<Vec<SentMessage>>>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_of_type(&self, msg_type: u32) -> Vec<SentMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.msg_type == msg_type)
            .cloned()
            .collect()
    }

    /// The most recent reply-expecting send, for echoing a reply back in.
    pub fn last_reply_key(&self) -> Option<ReplyKey> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|m| m.expect_reply)
    }
}

impl Transport for TestTransport {
    fn send(
        &self,
        target: Identity,
        msg_type: u32,
        payload: Value,
        expect_reply: Option<ReplyKey>,
    ) {
        self.sent.lock().unwrap().push(SentMessage {
            target,
            msg_type,
            payload,
            expect_reply,
        });
    }
}

/// Map-backed version store.
#[derive(Clone, Default)]
pub struct TestVersionStore {
    values: Arc<Mutex<HashMap<String, u64>>>,
}

impl TestVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> HashMap<String, u64> {
        self.values.lock().unwrap().clone()
    }

    pub fn put(&self, key: &str, value: u64) {
        self.values.lock().unwrap().insert(key.to_string(), value);
    }
}

impl VersionStore for TestVersionStore {
    fn get(&self, key: &str) -> Option<u64> {
        self.values.lock().unwrap().get(key).copied()
    }

    fn set(&self, key: &str, value: u64) {
        self.values.lock().unwrap().insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) {
        self.values.lock().unwrap().remove(key);
    }
}

/// A scheduler wired to fresh test collaborators, with the handles a test needs.
pub struct TestEngine {
    pub scheduler: Scheduler,
    pub storage: TestStorage,
    pub transport: TestTransport,
    pub version_store: TestVersionStore,
}

/// Build an engine with the given config and a version store attached.
pub fn test_engine(config: Config) -> TestEngine {
    let storage = TestStorage::new();
    let transport = TestTransport::new();
    let version_store = TestVersionStore::new();
    let scheduler = Scheduler::new(
        config,
        Box::new(storage.clone()),
        Box::new(transport.clone()),
        Some(Box::new(version_store.clone())),
    );
    TestEngine {
        scheduler,
        storage,
        transport,
        version_store,
    }
}

/// A config tuned for tests: no debounce, short reply timeouts, and maintenance that
/// runs only when a test calls `expedite_maintenance`.
pub fn test_config() -> Config {
    Config {
        admission_concurrency: 4,
        surge_threshold: 8,
        surge_dwell: std::time::Duration::from_millis(20),
        cache_target: 64,
        writeback_debounce: std::time::Duration::ZERO,
        lock_expiry: std::time::Duration::from_secs(60),
        session_idle_timeout: None,
        reply_timeout: std::time::Duration::from_millis(50),
        job_slice: std::time::Duration::from_secs(5),
        maintenance_interval: std::time::Duration::from_secs(3600),
        maintenance_budget: std::time::Duration::from_millis(50),
    }
}
