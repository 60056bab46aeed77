// Copyright 2025 Oxide Computer Company
//! Difficult replies: replies that hold lock references past their own
//! transmission.
//!
//! A handler that grants locks back to the client cannot release its own
//! references until the operation's transaction is durable (or the client
//! is gone); until then the reply state sits in the pending-commit index.
//! Commit notification or eviction schedules it; a worker then releases
//! the locks and finalizes any unsent network state.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::dlm::LockRef;
use talus_protocol::{Message, Transno, Xid};

/// One difficult reply, from creation until its locks are released and its
/// network send is confirmed.
#[derive(Debug)]
pub struct ReplyState {
    pub id: u64,
    /// Owning export's session handle.
    pub export: Uuid,
    pub client_id: Uuid,
    pub xid: Xid,
    pub transno: Transno,
    /// The reply message, retained so an unsent reply can be finalized
    /// when the state is torn down.
    pub msg: Message,
    pub locks: Vec<LockRef>,
    /// Whether the network send already went out.
    pub sent: bool,
}

/// Queue of difficult replies: a pending-commit index plus the scheduled
/// list a worker drains.
#[derive(Debug, Default)]
pub struct ReplyScheduler {
    pending: HashMap<u64, ReplyState>,
    queue: VecDeque<u64>,
    scheduled: HashSet<u64>,
    by_export: HashMap<Uuid, HashSet<u64>>,
    next_id: u64,
}

impl ReplyScheduler {
    pub fn new() -> ReplyScheduler {
        ReplyScheduler::default()
    }

    /// Register a new difficult reply in the pending-commit index.
    pub fn insert(
        &mut self,
        export: Uuid,
        client_id: Uuid,
        xid: Xid,
        transno: Transno,
        msg: Message,
        locks: Vec<LockRef>,
        sent: bool,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(
            id,
            ReplyState {
                id,
                export,
                client_id,
                xid,
                transno,
                msg,
                locks,
                sent,
            },
        );
        self.by_export.entry(export).or_default().insert(id);
        id
    }

    /// Move a pending reply onto the scheduled queue.  Idempotent: a
    /// repeat call before the first pickup is a no-op, as is scheduling
    /// something already popped.
    pub fn schedule(&mut self, id: u64) -> bool {
        if !self.pending.contains_key(&id) || self.scheduled.contains(&id) {
            return false;
        }
        self.scheduled.insert(id);
        self.queue.push_back(id);
        true
    }

    /// Commit notification path: schedule the reply whose transaction just
    /// became durable.
    pub fn schedule_commit(&mut self, client_id: Uuid, xid: Xid) -> bool {
        let id = self
            .pending
            .values()
            .find(|r| r.client_id == client_id && r.xid == xid)
            .map(|r| r.id);
        match id {
            Some(id) => self.schedule(id),
            None => false,
        }
    }

    /// Eviction path: everything an export still holds must be scheduled
    /// so its locks get released rather than leaked.
    pub fn schedule_export(&mut self, export: Uuid) -> usize {
        let ids: Vec<u64> = self
            .by_export
            .get(&export)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let mut n = 0;
        for id in ids {
            if self.schedule(id) {
                n += 1;
            }
        }
        n
    }

    /// Pop one scheduled reply, detaching it from every index.  Removal
    /// is idempotent by construction: a reply can only be popped once.
    pub fn pop(&mut self) -> Option<ReplyState> {
        let id = self.queue.pop_front()?;
        self.scheduled.remove(&id);
        let reply = self.pending.remove(&id)?;
        if let Some(set) = self.by_export.get_mut(&reply.export) {
            set.remove(&id);
            if set.is_empty() {
                self.by_export.remove(&reply.export);
            }
        }
        Some(reply)
    }

    /// Steal-back for resends: hand the lock references of the previous
    /// attempt's outstanding reply (same client, same xid) to the new
    /// reply instead of acquiring fresh ones.
    ///
    /// This is a linear scan over the export's outstanding replies; the
    /// table is bounded by the small per-client in-flight request limit,
    /// which callers must preserve if they ever grow that limit.
    pub fn steal_locks(&mut self, export: Uuid, xid: Xid) -> Vec<LockRef> {
        let Some(ids) = self.by_export.get(&export) else {
            return Vec::new();
        };
        for id in ids.iter() {
            let reply = self.pending.get_mut(id).unwrap();
            if reply.xid == xid {
                return std::mem::take(&mut reply.locks);
            }
        }
        Vec::new()
    }

    pub fn has_scheduled(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Whether any difficult reply exists at all (scheduled or still
    /// waiting on commit); this is what gates the worker backpressure
    /// rule.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
