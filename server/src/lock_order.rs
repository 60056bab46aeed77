// Copyright 2025 Oxide Computer Company
//! Deadlock-free multi-resource lock acquisition.
//!
//! Compound metadata operations need 1–4 resource locks at once.  Every
//! caller acquires them in ascending resource-identity order, which imposes
//! one global partial order on lock acquisition process-wide and makes
//! circular wait impossible.  The empty identity (a not-yet-existing child)
//! sorts after every real identity.
//!
//! Because the child of a name lookup can change between the unlocked
//! lookup and the grant, the caller re-resolves each child under the locks
//! and calls [`LockedSet::reverify`]; the set either patches itself up in
//! place (when the ordering invariant still holds) or tells the caller to
//! restart from scratch.

use std::collections::HashSet;

use slog::{warn, Logger};

use crate::dlm::{LockManager, LockMode, LockRef, PolicyBits};
use talus_common::{FileId, TalusError};

/// The well-known resource serializing every rename on this target against
/// every other rename, including ones originated by peer metadata servers.
/// Taken (exclusive) before any per-object lock.
pub const RENAME_SERIAL: FileId = FileId { ino: 1, gen: 1 };

/// Retry budget after which repeated child races get logged; acquisition
/// itself retries as long as the caller keeps asking.
pub const RETRY_WARN_THRESHOLD: u32 = 5;

/// One requested lock, by caller role position (e.g. rename passes
/// source-parent, target-parent, source-child, target-child).
#[derive(Clone, Copy, Debug)]
pub struct LockSpec {
    pub resource: FileId,
    pub mode: LockMode,
    pub policy: PolicyBits,
}

#[derive(Debug)]
enum Slot {
    /// This role holds the lock.
    Held(LockRef),
    /// This role's resource coalesced with another role's; the index is
    /// the holding slot.
    Alias(usize),
    /// Not-yet-existing object; nothing to lock.
    Empty,
}

/// Outcome of re-verifying one child identity under the locks.
#[derive(Debug, Eq, PartialEq)]
pub enum Reverify {
    /// The lock set matches current reality; proceed.
    Verified,
    /// The sort order computed at acquisition no longer holds; release
    /// everything and start over from the unlocked lookup.
    Restart,
}

/// A verified, ordered set of held locks, indexed by caller role.
#[derive(Debug)]
pub struct LockedSet {
    slots: Vec<Slot>,
    /// Role indices that hold real locks, in acquisition order.
    acquired: Vec<usize>,
}

impl LockedSet {
    /// The lock covering a role, if any (resolving coalesced aliases).
    pub fn lock(&self, role: usize) -> Option<&LockRef> {
        match &self.slots[role] {
            Slot::Held(l) => Some(l),
            Slot::Alias(j) => match &self.slots[*j] {
                Slot::Held(l) => Some(l),
                _ => None,
            },
            Slot::Empty => None,
        }
    }

    /// The identity a role is currently locked under.
    fn identity(&self, role: usize) -> FileId {
        self.lock(role).map(|l| l.resource).unwrap_or(FileId::EMPTY)
    }

    /// Largest real identity held by any role other than `role`.
    fn max_other_identity(&self, role: usize) -> Option<FileId> {
        let mut max: Option<FileId> = None;
        for (i, s) in self.slots.iter().enumerate() {
            if i == role {
                continue;
            }
            if let Slot::Held(l) = s {
                if max.map(|m| l.resource > m).unwrap_or(true) {
                    max = Some(l.resource);
                }
            }
        }
        max
    }

    /// Re-verify a child role against the identity a fresh (locked)
    /// lookup produced.
    ///
    /// On a mismatch the stale child lock is dropped; if the fresh
    /// identity still sorts after everything else held, its lock is taken
    /// in place and the set remains valid, otherwise the caller must
    /// restart from scratch.
    pub async fn reverify(
        &mut self,
        dlm: &dyn LockManager,
        role: usize,
        fresh: FileId,
        mode: LockMode,
        policy: PolicyBits,
    ) -> Result<Reverify, TalusError> {
        if self.identity(role) == fresh {
            return Ok(Reverify::Verified);
        }

        // Aliased slots were coalesced against an identity that is now
        // wrong for one of the two roles; the cheap fixups below cannot
        // express that, so start over.
        if matches!(self.slots[role], Slot::Alias(_))
            || self
                .slots
                .iter()
                .any(|s| matches!(s, Slot::Alias(j) if *j == role))
        {
            return Ok(Reverify::Restart);
        }

        // Drop the stale child lock.
        let old = std::mem::replace(&mut self.slots[role], Slot::Empty);
        if let Slot::Held(l) = old {
            self.acquired.retain(|r| *r != role);
            dlm.decref(l);
        }

        if fresh.is_empty() {
            // The child vanished; the caller will discover ENOENT (or a
            // create target) under the remaining locks.
            return Ok(Reverify::Verified);
        }

        // In-place acquisition is only safe while ascending order holds;
        // an identity that sorts at or before anything already held would
        // recreate the deadlock we ordered against.
        if let Some(max_other) = self.max_other_identity(role) {
            if fresh <= max_other {
                return Ok(Reverify::Restart);
            }
        }

        let l = dlm.enqueue(fresh, mode, policy).await?;
        self.slots[role] = Slot::Held(l);
        self.acquired.push(role);
        Ok(Reverify::Verified)
    }

    /// Release every held lock except those covering `keep` roles, whose
    /// references are returned (deduplicated for coalesced roles).
    /// Reverse acquisition order, as release must be.
    pub fn dismantle(
        mut self,
        dlm: &dyn LockManager,
        keep: &[usize],
    ) -> Vec<LockRef> {
        let keep_primary: HashSet<usize> = keep
            .iter()
            .filter_map(|&r| match self.slots.get(r) {
                Some(Slot::Held(_)) => Some(r),
                Some(Slot::Alias(j)) => Some(*j),
                _ => None,
            })
            .collect();

        let mut kept = Vec::new();
        for &role in self.acquired.iter().rev() {
            let slot =
                std::mem::replace(&mut self.slots[role], Slot::Empty);
            if let Slot::Held(l) = slot {
                if keep_primary.contains(&role) {
                    kept.push(l);
                } else {
                    dlm.decref(l);
                }
            }
        }
        kept
    }

    /// Release everything.
    pub fn release(self, dlm: &dyn LockManager) {
        let _ = self.dismantle(dlm, &[]);
    }
}

/// Acquire 1–4 locks in canonical order.
///
/// Duplicate identities coalesce into a single acquisition carrying the
/// union of the requested policy bits and the stronger mode; the second
/// role becomes an alias of the first rather than a second lock-manager
/// round trip.  On any acquisition failure everything already held is
/// released (in reverse) and the failure propagates.
pub async fn acquire(
    dlm: &dyn LockManager,
    specs: &[LockSpec],
    log: &Logger,
) -> Result<LockedSet, TalusError> {
    assert!(
        !specs.is_empty() && specs.len() <= 4,
        "lock sets span 1 to 4 resources"
    );

    // Ascending identity, ties broken by policy then mode so equal
    // resources group deterministically.
    let mut order: Vec<usize> = (0..specs.len()).collect();
    order.sort_by(|&a, &b| {
        specs[a]
            .resource
            .cmp(&specs[b].resource)
            .then(specs[a].policy.0.cmp(&specs[b].policy.0))
            .then(specs[a].mode.cmp(&specs[b].mode))
    });

    let mut slots: Vec<Slot> =
        (0..specs.len()).map(|_| Slot::Empty).collect();
    let mut acquired: Vec<usize> = Vec::new();

    let mut i = 0;
    while i < order.len() {
        let role = order[i];
        let resource = specs[role].resource;
        if resource.is_empty() {
            i += 1;
            continue;
        }

        // Coalesce the run of roles wanting this same identity.
        let mut mode = specs[role].mode;
        let mut policy = specs[role].policy;
        let mut aliases = Vec::new();
        let mut j = i + 1;
        while j < order.len() && specs[order[j]].resource == resource {
            mode = mode.stronger(specs[order[j]].mode);
            policy = policy | specs[order[j]].policy;
            aliases.push(order[j]);
            j += 1;
        }

        match dlm.enqueue(resource, mode, policy).await {
            Ok(l) => {
                slots[role] = Slot::Held(l);
                acquired.push(role);
                for a in aliases {
                    slots[a] = Slot::Alias(role);
                }
            }
            Err(e) => {
                warn!(
                    log,
                    "lock acquisition on {} failed: {}; unwinding",
                    resource,
                    e
                );
                let partial = LockedSet { slots, acquired };
                partial.release(dlm);
                return Err(e);
            }
        }
        i = j;
    }

    Ok(LockedSet { slots, acquired })
}
