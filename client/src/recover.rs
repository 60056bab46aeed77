// Copyright 2025 Oxide Computer Company
use std::sync::Arc;

use slog::{info, warn};
use tokio::sync::oneshot;

use crate::import::{Import, ImportState};
use crate::request::Phase;
use talus_protocol::{Message, Transno, Xid, MSG_LAST_REPLAY};

/// Collaborator that replays locks held at disconnect time.
///
/// Lock recovery is external to this core; all the import needs to know is
/// when no lock replay remains in flight.
pub trait LockReplayer: Send + Sync {
    /// Begin replaying held locks.  Returns a receiver that fires once
    /// every replayed lock has been re-granted, or `None` when there is
    /// nothing to replay.
    fn replay_locks(&self) -> Option<oneshot::Receiver<()>>;
}

/*
 * Re-entrant recovery driver.
 *
 * Spawned on every reconnection (and re-spawned from scratch if recovery
 * itself fails and the connection is re-established).  One instance drives
 * a single connection attempt: if the attempt dies underneath it, the
 * driver notices the stale attempt number and simply exits, leaving the
 * next connection's driver to start over from the import's current state.
 */
pub(crate) async fn run_recovery(imp: Arc<Import>, attempt: u64) {
    loop {
        let state = {
            let inner = imp.inner.lock().unwrap();
            if inner.conn_attempt != attempt {
                return;
            }
            inner.state
        };

        match state {
            ImportState::Evicted => {
                info!(imp.log, "evicted; invalidating all client state");
                imp.invalidate();
            }
            ImportState::Replay => {
                if let Some(xid) = next_replay(&imp, attempt) {
                    send_replay(&imp, attempt, xid);
                    wait_replay_done(&imp, attempt, xid).await;
                } else {
                    replay_locks_and_mark(&imp, attempt).await;
                }
            }
            ImportState::ReplayWait => {
                wait_marker_ack(&imp, attempt).await;
            }
            ImportState::Recover => {
                resend_delayed(&imp, attempt);
                return;
            }
            // Disconn/Closed: this connection is gone, a future one will
            // restart recovery.  Full: nothing left to do.
            _ => return,
        }
    }
}

/// The oldest not-yet-replayed entry on the replay list.
fn next_replay(imp: &Import, attempt: u64) -> Option<Xid> {
    let inner = imp.inner.lock().unwrap();
    if inner.conn_attempt != attempt {
        return None;
    }
    inner
        .replay_list
        .iter()
        .find(|(t, _)| *t > inner.last_replayed)
        .map(|(_, x)| *x)
}

/// Re-mark a retained, completed request for replay transmission with its
/// original transno.
fn send_replay(imp: &Import, attempt: u64, xid: Xid) {
    let mut inner = imp.inner.lock().unwrap();
    if inner.conn_attempt != attempt || inner.state != ImportState::Replay {
        return;
    }
    {
        let Some(req) = inner.active.get_mut(&xid) else {
            warn!(imp.log, "replay entry {} has no request", xid);
            return;
        };
        if req.phase() != Phase::Complete {
            // Already in flight (or already failed); let it play out.
            return;
        }
        req.flags.replay = true;
    }
    info!(imp.log, "replaying request {}", xid);
    imp.transmit_locked(&mut inner, xid);
}

/// Wait until a replay transmission has been answered, or the connection
/// went away.
async fn wait_replay_done(imp: &Arc<Import>, attempt: u64, xid: Xid) {
    loop {
        let fut = imp.notify.notified();
        {
            let inner = imp.inner.lock().unwrap();
            if inner.conn_attempt != attempt
                || inner.state != ImportState::Replay
            {
                return;
            }
            match inner.active.get(&xid) {
                None => return,
                Some(req) => {
                    if req.phase() == Phase::Complete && !req.flags.replay {
                        return;
                    }
                }
            }
        }
        fut.await;
    }
}

/// Replay list exhausted: hand off to the lock-replay collaborator, then
/// send the last-replay marker and wait for its acknowledgment.
async fn replay_locks_and_mark(imp: &Arc<Import>, attempt: u64) {
    let rx = {
        let mut inner = imp.inner.lock().unwrap();
        if inner.conn_attempt != attempt
            || inner.state != ImportState::Replay
        {
            return;
        }
        Import::checked_state_transition(
            &mut inner,
            &imp.log,
            ImportState::ReplayLocks,
        );
        imp.cfg.lock_replayer.as_ref().and_then(|l| l.replay_locks())
    };

    if let Some(rx) = rx {
        // A dropped sender counts as completion; the collaborator owns its
        // own failure handling.
        let _ = rx.await;
    }

    let mut inner = imp.inner.lock().unwrap();
    if inner.conn_attempt != attempt
        || inner.state != ImportState::ReplayLocks
    {
        return;
    }
    inner.last_replay_acked = false;
    let Some(wire) = inner.wire.clone() else {
        return;
    };
    let marker = Message::Ping {
        xid: imp.xids.next(),
        flags: MSG_LAST_REPLAY,
    };
    if let Err(e) = wire.send(marker) {
        warn!(imp.log, "last-replay marker send failed: {}", e);
        imp.disconnected_locked(&mut inner, "marker send failure");
        return;
    }
    Import::checked_state_transition(
        &mut inner,
        &imp.log,
        ImportState::ReplayWait,
    );
}

/// Wait for the server to acknowledge the last-replay marker.
async fn wait_marker_ack(imp: &Arc<Import>, attempt: u64) {
    loop {
        let fut = imp.notify.notified();
        {
            let mut inner = imp.inner.lock().unwrap();
            if inner.conn_attempt != attempt
                || inner.state != ImportState::ReplayWait
            {
                return;
            }
            if inner.last_replay_acked {
                Import::checked_state_transition(
                    &mut inner,
                    &imp.log,
                    ImportState::Recover,
                );
                return;
            }
        }
        fut.await;
    }
}

/// Resend everything still sitting in the send queue (not the replay
/// list), then open the floodgates.
fn resend_delayed(imp: &Import, attempt: u64) {
    let mut inner = imp.inner.lock().unwrap();
    if inner.conn_attempt != attempt || inner.state != ImportState::Recover {
        return;
    }
    for xid in inner.delayed.clone() {
        if let Some(req) = inner.active.get_mut(&xid) {
            req.flags.resend = true;
        }
    }
    Import::checked_state_transition(&mut inner, &imp.log, ImportState::Full);
    inner.invalid = false;
    let n = inner.delayed.len();
    if n > 0 {
        info!(imp.log, "recovery complete, resending {} requests", n);
    } else {
        info!(imp.log, "recovery complete");
    }
    imp.flush_delayed_locked(&mut inner);
    drop(inner);
    imp.notify.notify_waiters();
}

/// Replay-list length reporting for recovery progress logs and tests.
impl Import {
    pub fn replay_pending(&self) -> usize {
        self.replay_len()
    }

    pub fn last_committed_seen(&self) -> Transno {
        self.inner.lock().unwrap().peer_last_committed
    }
}
