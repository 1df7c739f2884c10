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

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use strum::Display;

const KIND_USER: u8 = 1;
const KIND_SERVER: u8 = 2;

/// A reference to a principal known to the coordinator: either an individual user or a
/// server process. Globally unique, never mutated.
///
/// Internal representation is lower 32 bits principal number, top 3 bits a "kind" code,
/// with the remaining bits unused for now. The derived `Ord` (raw u64 order) is the
/// canonical total order used for deadlock-avoidance pair locking.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct Identity(u64);

/// What shape of principal an `Identity` refers to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Display)]
pub enum IdentityKind {
    User,
    Server,
    /// Kind code outside the known set. Produced only by decoding hostile or corrupt
    /// input; registry operations assert against it.
    Malformed,
}

impl Identity {
    pub const fn mk_user(number: u32) -> Self {
        Self(((KIND_USER as u64) << 61) | (number as u64))
    }

    pub const fn mk_server(number: u32) -> Self {
        Self(((KIND_SERVER as u64) << 61) | (number as u64))
    }

    /// Reconstruct from a raw wire value. The result may be malformed; callers on
    /// untrusted paths must check `kind()`.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// The principal number, without the kind code.
    pub fn number(&self) -> u32 {
        (self.0 & 0x0000_0000_ffff_ffff) as u32
    }

    pub fn kind(&self) -> IdentityKind {
        match (self.0 >> 61) as u8 {
            KIND_USER => IdentityKind::User,
            KIND_SERVER => IdentityKind::Server,
            _ => IdentityKind::Malformed,
        }
    }

    pub fn is_user(&self) -> bool {
        self.kind() == IdentityKind::User
    }

    pub fn is_server(&self) -> bool {
        self.kind() == IdentityKind::Server
    }

    pub fn is_wellformed(&self) -> bool {
        self.kind() != IdentityKind::Malformed
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            IdentityKind::User => write!(f, "u:{}", self.number()),
            IdentityKind::Server => write!(f, "s:{}", self.number()),
            IdentityKind::Malformed => write!(f, "?:{:x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kind_roundtrip() {
        let u = Identity::mk_user(42);
        let s = Identity::mk_server(42);
        assert_eq!(u.kind(), IdentityKind::User);
        assert_eq!(s.kind(), IdentityKind::Server);
        assert_eq!(u.number(), 42);
        assert_eq!(s.number(), 42);
        assert_ne!(u, s);
    }

    #[test]
    fn test_malformed_detection() {
        let bogus = Identity::from_raw(7 << 61);
        assert_eq!(bogus.kind(), IdentityKind::Malformed);
        assert!(!bogus.is_wellformed());
        // Raw round-trip preserves the value even when malformed.
        assert_eq!(Identity::from_raw(bogus.raw()), bogus);
    }

    #[test]
    fn test_canonical_order_is_total() {
        // Same-kind identities order by number; the order is what pair-locking keys on,
        // so it only matters that it is total and stable.
        let a = Identity::mk_user(1);
        let b = Identity::mk_user(2);
        let s = Identity::mk_server(1);
        assert!(a < b);
        assert_eq!(a.cmp(&b).reverse(), b.cmp(&a));
        assert_ne!(a.cmp(&s), std::cmp::Ordering::Equal);
    }
}
