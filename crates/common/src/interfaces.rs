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

//! The narrow contracts through which the engine talks to its collaborators: durable
//! storage, the message transport, and the optional external version store. Hosts
//! provide implementations; the kernel's `testing` module has in-memory ones.

use crate::{Identity, JobId, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// The persisted form of one identity's shared state, as handed back by the storage
/// adapter. The engine treats the object graph as opaque records keyed by name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateBlob {
    pub objects: BTreeMap<String, Value>,
    pub version: u64,
}

/// A single all-or-nothing batch of staged writes. Dropping a transaction without
/// committing discards it.
pub trait StorageTransaction {
    /// Stage the given dirty objects for `identity` into this transaction.
    fn stage(&mut self, identity: Identity, version: u64, objects: Vec<(String, Value)>);

    /// Commit everything staged. All-or-nothing: on failure nothing staged was
    /// persisted and the caller re-queues the whole batch.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Durable storage for per-identity shared state.
pub trait Storage: Send {
    /// Fetch the persisted state for `identity`. `Ok(None)` means no record exists and
    /// a fresh empty state should be constructed.
    fn load(&self, identity: Identity) -> Result<Option<StateBlob>, StorageError>;

    fn begin(&self) -> Box<dyn StorageTransaction>;
}

/// Correlation handle for an outbound message that expects a reply: which job to wake
/// and the id the reply must carry to reach it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplyKey {
    pub job: JobId,
    pub correlation: Uuid,
}

/// Outbound half of the message envelope layer. Inbound delivery goes through the
/// scheduler's `route` entry point instead.
pub trait Transport: Send {
    fn send(
        &self,
        target: Identity,
        msg_type: u32,
        payload: Value,
        expect_reply: Option<ReplyKey>,
    );
}

/// Optional cache-aside store used to carry cache version counters across restarts.
/// Purely a best-effort latency optimization: implementations may drop writes and
/// return `None` freely, and its absence must never block normal operation.
pub trait VersionStore: Send {
    fn get(&self, key: &str) -> Option<u64>;
    fn set(&self, key: &str, value: u64);
    fn delete(&self, key: &str);
}
