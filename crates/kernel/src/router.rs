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

//! Inbound message dispatch. A message either carries a correlation id (in which case
//! it wakes the specific job blocked waiting for that reply), or it is matched by type
//! against the handler registry and a fresh job is spawned for it. Correlated messages
//! whose waiter is gone (typed out, aborted) are dropped, not re-dispatched.

use ahash::AHasher;
use coord_common::Identity;
use serde_json::Value;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use tracing::debug;

use crate::jobs::JobBody;

/// Message type codes for the engine's own protocol. The envelope layer speaks numeric
/// types; hosts register handlers for anything beyond these.
pub mod msg {
    /// A principal started playing; queues admission.
    pub const START_PLAYING: u32 = 1;
    /// A principal stopped playing; spawns a session-stop job.
    pub const STOP_PLAYING: u32 = 2;
    /// Outbound: session established notification.
    pub const SESSION_STARTED: u32 = 3;
    /// Outbound: session torn down notification.
    pub const SESSION_STOPPED: u32 = 4;
}

/// Factory invoked per inbound message of a registered type; the returned body is
/// spawned as a new job.
pub type HandlerFactory = Box<dyn Fn(u32, Value, Identity) -> Box<dyn JobBody> + Send>;

pub struct MessageRouter {
    handlers: HashMap<u32, (&'static str, HandlerFactory), BuildHasherDefault<AHasher>>,
    /// Messages that matched neither a waiter nor a handler.
    unrouted: u64,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            handlers: Default::default(),
            unrouted: 0,
        }
    }

    /// Register a spawning handler for a message type. Replaces any previous handler
    /// for the same type.
    pub fn register(&mut self, msg_type: u32, name: &'static str, factory: HandlerFactory) {
        self.handlers.insert(msg_type, (name, factory));
    }

    /// Build a job for this message type, if a handler is registered.
    pub(crate) fn spawn_for(
        &self,
        msg_type: u32,
        payload: Value,
        source: Identity,
    ) -> Option<(&'static str, Box<dyn JobBody>)> {
        let (name, factory) = self.handlers.get(&msg_type)?;
        Some((*name, factory(msg_type, payload, source)))
    }

    pub(crate) fn count_unrouted(&mut self, msg_type: u32, source: Identity) {
        self.unrouted += 1;
        debug!(msg_type, %source, "dropping unroutable message");
    }

    pub fn unrouted(&self) -> u64 {
        self.unrouted
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}
