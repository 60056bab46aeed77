// Copyright 2025 Oxide Computer Company
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// Lock compatibility modes, weakest to strongest.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize,
    Deserialize,
)]
pub enum LockMode {
    ConcurrentRead,
    ProtectedRead,
    ProtectedWrite,
    Exclusive,
}

impl LockMode {
    pub fn compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (ConcurrentRead, Exclusive) | (Exclusive, ConcurrentRead) => {
                false
            }
            (ConcurrentRead, _) | (_, ConcurrentRead) => true,
            (ProtectedRead, ProtectedRead) => true,
            _ => false,
        }
    }

    /// The stronger of two modes, used when coalescing duplicate resources
    /// in a lock set.
    pub fn stronger(self, other: LockMode) -> LockMode {
        self.max(other)
    }
}

/// Inode-bits style lock policy: which aspects of the resource the lock
/// covers.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default,
)]
pub struct PolicyBits(pub u32);

impl PolicyBits {
    pub const LOOKUP: PolicyBits = PolicyBits(1 << 0);
    pub const UPDATE: PolicyBits = PolicyBits(1 << 1);
    pub const OPEN: PolicyBits = PolicyBits(1 << 2);
    pub const LAYOUT: PolicyBits = PolicyBits(1 << 3);
    pub const FULL: PolicyBits = PolicyBits(0xf);

    pub fn contains(self, other: PolicyBits) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PolicyBits {
    type Output = PolicyBits;
    fn bitor(self, rhs: PolicyBits) -> PolicyBits {
        PolicyBits(self.0 | rhs.0)
    }
}
