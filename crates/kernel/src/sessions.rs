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

//! The session registry: which principals are currently active against the service.
//! Two keyed collections (user sessions, server-process sessions), each entry
//! referencing (not owning) the identity's shared-state cache. Sessions are created
//! and destroyed only while the identity's lock is held, by the session jobs.

use ahash::AHasher;
use coord_common::{Identity, IdentityKind};
use minstant::Instant;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::time::Duration;
use tracing::warn;

/// Parameters carried by a start-session request. Re-submissions for the same identity
/// replace these wholesale.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StartParams {
    /// For user sessions: the server process this user is playing on, if any.
    #[serde(default)]
    pub server: Option<Identity>,
    /// Opaque extras from the envelope (client version, address, and the like).
    #[serde(default)]
    pub payload: Value,
}

#[derive(Clone, Debug)]
pub struct UserSession {
    pub identity: Identity,
    /// Bound server-process session, if the user is playing on one.
    pub bound_server: Option<Identity>,
    pub started: Instant,
    pub last_activity: Instant,
    /// Set before awaiting the lock on stop, so late-arriving operations can detect a
    /// session on its way out.
    pub shutting_down: bool,
}

#[derive(Clone, Debug)]
pub struct ServerSession {
    pub identity: Identity,
    pub started: Instant,
    pub last_activity: Instant,
    pub shutting_down: bool,
    /// Opaque registration payload (address, region, capacity...).
    pub payload: Value,
}

/// A view of either session variant, for hooks and diagnostics. The closed set of
/// variants is dispatched by `match`, not virtually.
#[derive(Clone, Debug)]
pub enum Session<'a> {
    User(&'a UserSession),
    Server(&'a ServerSession),
}

impl Session<'_> {
    pub fn identity(&self) -> Identity {
        match self {
            Session::User(s) => s.identity,
            Session::Server(s) => s.identity,
        }
    }
}

/// Host-registered extension invoked at session start/stop. Hook failures are logged
/// and do not fail the session operation.
pub trait SessionExtension: Send {
    fn on_session_start(&mut self, session: Session<'_>);
    fn on_session_stop(&mut self, session: Session<'_>);
}

#[derive(Default)]
pub struct SessionRegistry {
    users: HashMap<Identity, UserSession, BuildHasherDefault<AHasher>>,
    servers: HashMap<Identity, ServerSession, BuildHasherDefault<AHasher>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Panics on identities that are neither user nor server shaped: reaching the
    /// registry with a malformed identity is a programming error upstream, not a
    /// runtime condition.
    fn assert_wellformed(identity: Identity) {
        assert!(
            identity.is_wellformed(),
            "malformed identity in session registry: {identity}"
        );
    }

    pub fn user(&self, identity: Identity) -> Option<&UserSession> {
        Self::assert_wellformed(identity);
        self.users.get(&identity)
    }

    pub fn user_mut(&mut self, identity: Identity) -> Option<&mut UserSession> {
        Self::assert_wellformed(identity);
        self.users.get_mut(&identity)
    }

    pub fn server(&self, identity: Identity) -> Option<&ServerSession> {
        Self::assert_wellformed(identity);
        self.servers.get(&identity)
    }

    pub fn server_mut(&mut self, identity: Identity) -> Option<&mut ServerSession> {
        Self::assert_wellformed(identity);
        self.servers.get_mut(&identity)
    }

    pub fn has_session(&self, identity: Identity) -> bool {
        Self::assert_wellformed(identity);
        match identity.kind() {
            IdentityKind::User => self.users.contains_key(&identity),
            IdentityKind::Server => self.servers.contains_key(&identity),
            IdentityKind::Malformed => unreachable!(),
        }
    }

    /// Install a user session, or merge updated parameters into an existing one (a
    /// re-start while active means the bound server changed, not a new session).
    /// Returns true if a session was created.
    pub(crate) fn upsert_user(&mut self, identity: Identity, params: &StartParams) -> bool {
        Self::assert_wellformed(identity);
        let now = Instant::now();
        if let Some(existing) = self.users.get_mut(&identity) {
            existing.bound_server = params.server;
            existing.last_activity = now;
            return false;
        }
        self.users.insert(
            identity,
            UserSession {
                identity,
                bound_server: params.server,
                started: now,
                last_activity: now,
                shutting_down: false,
            },
        );
        true
    }

    /// Install a server session, or refresh an existing one's registration payload.
    pub(crate) fn upsert_server(&mut self, identity: Identity, params: &StartParams) -> bool {
        Self::assert_wellformed(identity);
        let now = Instant::now();
        if let Some(existing) = self.servers.get_mut(&identity) {
            existing.payload = params.payload.clone();
            existing.last_activity = now;
            return false;
        }
        self.servers.insert(
            identity,
            ServerSession {
                identity,
                started: now,
                last_activity: now,
                shutting_down: false,
                payload: params.payload.clone(),
            },
        );
        true
    }

    /// Flag the session as on its way out. Returns false if there is no session.
    pub(crate) fn mark_shutting_down(&mut self, identity: Identity) -> bool {
        Self::assert_wellformed(identity);
        match identity.kind() {
            IdentityKind::User => {
                if let Some(s) = self.users.get_mut(&identity) {
                    s.shutting_down = true;
                    true
                } else {
                    false
                }
            }
            IdentityKind::Server => {
                if let Some(s) = self.servers.get_mut(&identity) {
                    s.shutting_down = true;
                    true
                } else {
                    false
                }
            }
            IdentityKind::Malformed => unreachable!(),
        }
    }

    /// Remove and return the session. For a server session, any user sessions bound to
    /// it are unbound (their own stop arrives separately).
    pub(crate) fn remove(&mut self, identity: Identity) -> bool {
        Self::assert_wellformed(identity);
        match identity.kind() {
            IdentityKind::User => self.users.remove(&identity).is_some(),
            IdentityKind::Server => {
                let removed = self.servers.remove(&identity).is_some();
                if removed {
                    for user in self.users.values_mut() {
                        if user.bound_server == Some(identity) {
                            user.bound_server = None;
                        }
                    }
                }
                removed
            }
            IdentityKind::Malformed => unreachable!(),
        }
    }

    pub(crate) fn touch(&mut self, identity: Identity) {
        Self::assert_wellformed(identity);
        let now = Instant::now();
        match identity.kind() {
            IdentityKind::User => {
                if let Some(s) = self.users.get_mut(&identity) {
                    s.last_activity = now;
                }
            }
            IdentityKind::Server => {
                if let Some(s) = self.servers.get_mut(&identity) {
                    s.last_activity = now;
                }
            }
            IdentityKind::Malformed => unreachable!(),
        }
    }

    /// Sessions idle past the timeout, candidates for idle eviction.
    pub(crate) fn idle_sessions(&self, timeout: Duration) -> Vec<Identity> {
        let now = Instant::now();
        self.users
            .values()
            .filter(|s| !s.shutting_down)
            .filter(|s| now.duration_since(s.last_activity) >= timeout)
            .map(|s| s.identity)
            .chain(
                self.servers
                    .values()
                    .filter(|s| !s.shutting_down)
                    .filter(|s| now.duration_since(s.last_activity) >= timeout)
                    .map(|s| s.identity),
            )
            .collect()
    }

    pub(crate) fn invoke_start_hooks(
        &self,
        identity: Identity,
        extensions: &mut [Box<dyn SessionExtension>],
    ) {
        let session = match identity.kind() {
            IdentityKind::User => self.users.get(&identity).map(Session::User),
            IdentityKind::Server => self.servers.get(&identity).map(Session::Server),
            IdentityKind::Malformed => unreachable!(),
        };
        let Some(session) = session else {
            warn!(%identity, "start hook with no session installed");
            return;
        };
        for ext in extensions {
            ext.on_session_start(session.clone());
        }
    }

    pub(crate) fn invoke_stop_hooks(
        &self,
        identity: Identity,
        extensions: &mut [Box<dyn SessionExtension>],
    ) {
        let session = match identity.kind() {
            IdentityKind::User => self.users.get(&identity).map(Session::User),
            IdentityKind::Server => self.servers.get(&identity).map(Session::Server),
            IdentityKind::Malformed => unreachable!(),
        };
        let Some(session) = session else {
            return;
        };
        for ext in extensions {
            ext.on_session_stop(session.clone());
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const U1: Identity = Identity::mk_user(1);
    const S1: Identity = Identity::mk_server(1);

    #[test]
    fn test_upsert_merges_instead_of_duplicating() {
        let mut reg = SessionRegistry::new();
        assert!(reg.upsert_user(U1, &StartParams::default()));
        assert!(!reg.upsert_user(
            U1,
            &StartParams {
                server: Some(S1),
                payload: json!(null),
            }
        ));
        assert_eq!(reg.user_count(), 1);
        assert_eq!(reg.user(U1).unwrap().bound_server, Some(S1));
    }

    #[test]
    fn test_server_removal_unbinds_users() {
        let mut reg = SessionRegistry::new();
        reg.upsert_server(S1, &StartParams::default());
        reg.upsert_user(
            U1,
            &StartParams {
                server: Some(S1),
                payload: json!(null),
            },
        );
        assert!(reg.remove(S1));
        assert_eq!(reg.user(U1).unwrap().bound_server, None);
    }

    #[test]
    #[should_panic(expected = "malformed identity")]
    fn test_malformed_lookup_asserts() {
        let reg = SessionRegistry::new();
        let _ = reg.user(Identity::from_raw(7 << 61));
    }
}
