// Copyright 2025 Oxide Computer Company
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use slog::{debug, error, info, o, warn, Logger};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::recover::{run_recovery, LockReplayer};
use crate::request::{
    request_channel, ActiveRequests, ClientRequest, Phase, RequestOptions,
    RequestWaiter,
};
use crate::XidAllocator;
use talus_common::TalusError;
use talus_protocol::wire::{Connector, WireReceiver, WireSender};
use talus_protocol::{
    Message, Opcode, ReconnectStatus, ReplyHeader, RequestHeader, Transno,
    Xid, MSG_LAST_REPLAY, MSG_REPLAY, MSG_RESENT, TALUS_MESSAGE_VERSION,
};

/*
 * Client connection state machine.
 *
 *              ┌────►──────────────────────────┐
 *              │                               │
 *      ┌───────┴──┐      ┌──────────┐     ┌────▼────┐
 *      │   New    ├──►───┤Connecting├──►──┤  Full   │
 *      └──────────┘      └─┬──▲───┬─┘     └────┬────┘
 *                          │  │   │            │
 *                 ┌────────▼┐ │ ┌─▼───────┐    │
 *            ┌────┤ Evicted │ │ │ Replay  │    ▼
 *            │    └─────────┘ │ └──┬──────┘    │
 *            │                │    ▼           │
 *            │                │ ┌──▼──────────┐│
 *            ▼                │ │ ReplayLocks ││
 *            │                │ └──┬──────────┘│
 *            │                │    ▼           │
 *            │                │ ┌──▼──────────┐│
 *            │                │ │ ReplayWait  ││
 *            │                │ └──┬──────────┘│
 *            │    ┌─────────┐ │    ▼           │
 *            └──►─┤ Recover ├─►────┤           │
 *                 └────▲────┘ to Full          │
 *                      │      ┌────▼────┐      │
 *                      └──◄───┤ Disconn ├──◄───┘
 *                             └─────────┘
 *
 *      Any state can reach Closed, and Closed is absorbing.
 */
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ImportState {
    /// Never connected.
    New,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected; requests flow normally.
    Full,
    /// The connection went away; the pinger owns the retry.
    Disconn,
    /// Reconnected after the server lost state; replaying the replay list
    /// in transno order.
    Replay,
    /// Replay list exhausted; the lock-replay collaborator is working.
    ReplayLocks,
    /// Waiting for the server to acknowledge the last-replay marker.
    ReplayWait,
    /// Resending the ordinary send queue before going Full again.
    Recover,
    /// The server declared our handle unknown; all client state is stale.
    Evicted,
    /// Administratively closed; no further transitions.
    Closed,
}

impl std::fmt::Display for ImportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportState::New => write!(f, "New"),
            ImportState::Connecting => write!(f, "Connecting"),
            ImportState::Full => write!(f, "Full"),
            ImportState::Disconn => write!(f, "Disconn"),
            ImportState::Replay => write!(f, "Replay"),
            ImportState::ReplayLocks => write!(f, "ReplayLocks"),
            ImportState::ReplayWait => write!(f, "ReplayWait"),
            ImportState::Recover => write!(f, "Recover"),
            ImportState::Evicted => write!(f, "Evicted"),
            ImportState::Closed => write!(f, "Closed"),
        }
    }
}

/// What to do with a request that wants to go out right now.
#[derive(Debug)]
pub enum SendDecision {
    /// Transmit immediately.
    Send,
    /// Park on the delayed list; recovery or reactivation will wake it.
    Delay,
    /// Fail immediately with this error.
    Reject(TalusError),
}

/// Construction-time configuration for one import.
pub struct ImportConfig {
    /// Stable identity of this client, used by the server to find our
    /// ledger slot across reconnections.
    pub client_id: Uuid,
    /// Ranked list of target endpoints; consecutive connect failures rotate
    /// through it.
    pub targets: Vec<String>,
    pub connector: Arc<dyn Connector>,
    pub request_timeout: Duration,
    pub ping_interval: Duration,
    /// How long without any inbound traffic before the connection is
    /// declared dead.
    pub ping_timeout: Duration,
    /// A non-recoverable import fails requests instead of parking them.
    pub recoverable: bool,
    /// Collaborator that replays held locks during recovery.
    pub lock_replayer: Option<Arc<dyn LockReplayer>>,
    /// Invoked after an eviction has invalidated all outstanding state.
    pub on_invalidate: Option<Box<dyn Fn() + Send + Sync>>,
}

#[derive(Debug)]
pub(crate) struct ImportInner {
    pub(crate) state: ImportState,
    /// Bumped on every reconnect and eviction; stale in-flight requests are
    /// failed rather than matched against the new connection.
    pub(crate) generation: u64,
    /// Set while invalidation is pending; gates issue of non-connect
    /// requests.
    pub(crate) invalid: bool,
    /// The peer's session cookie; nil until the first connect reply.
    pub(crate) remote_handle: Uuid,
    /// Whether this target supports replay, adopted from the first connect
    /// reply.
    pub(crate) replayable: bool,
    pub(crate) active: ActiveRequests,
    /// Completed-but-uncommitted requests, ordered by (transno, xid).
    pub(crate) replay_list: std::collections::BTreeSet<(Transno, Xid)>,
    /// Requests parked until the import can send again.
    pub(crate) delayed: Vec<Xid>,
    pub(crate) wire: Option<WireSender>,
    /// Connection attempt counter; events from stale IO tasks are ignored.
    pub(crate) conn_attempt: u64,
    target_idx: usize,
    pub(crate) peer_last_committed: Transno,
    pub(crate) last_replayed: Transno,
    pub(crate) last_replay_acked: bool,
    ping_deadline: Instant,
    timeout_deadline: Instant,
}

/// One client-to-server logical connection.
pub struct Import {
    pub(crate) cfg: ImportConfig,
    pub(crate) xids: XidAllocator,
    pub(crate) inner: Mutex<ImportInner>,
    /// Kicked on every completion, state change, and recovery event.
    /// Waiters re-evaluate with a poll; there are no per-request wakeups.
    pub(crate) notify: Notify,
    pub(crate) log: Logger,
}

impl Import {
    pub fn new(
        cfg: ImportConfig,
        xids: XidAllocator,
        log: &Logger,
    ) -> Arc<Import> {
        assert!(
            !cfg.targets.is_empty(),
            "an import needs at least one target"
        );
        let target = cfg
            .targets
            .first()
            .cloned()
            .unwrap_or_else(|| "?".to_string());
        let log = log.new(o!("import" => target));
        Arc::new(Import {
            cfg,
            xids,
            inner: Mutex::new(ImportInner {
                state: ImportState::New,
                generation: 1,
                invalid: false,
                remote_handle: Uuid::nil(),
                replayable: false,
                active: ActiveRequests::new(),
                replay_list: std::collections::BTreeSet::new(),
                delayed: Vec::new(),
                wire: None,
                conn_attempt: 0,
                target_idx: 0,
                peer_last_committed: Transno::NONE,
                last_replayed: Transno::NONE,
                last_replay_acked: false,
                ping_deadline: Instant::now(),
                timeout_deadline: Instant::now(),
            }),
            notify: Notify::new(),
            log,
        })
    }

    pub fn state(&self) -> ImportState {
        self.inner.lock().unwrap().state
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    pub fn is_invalid(&self) -> bool {
        self.inner.lock().unwrap().invalid
    }

    pub fn remote_handle(&self) -> Uuid {
        self.inner.lock().unwrap().remote_handle
    }

    pub(crate) fn replay_len(&self) -> usize {
        self.inner.lock().unwrap().replay_list.len()
    }

    /// The one place import states change.
    ///
    /// # Panics
    /// On a transition the state machine does not allow.
    pub(crate) fn checked_state_transition(
        inner: &mut ImportInner,
        log: &Logger,
        new: ImportState,
    ) {
        let ok = match (inner.state, new) {
            // Closed is absorbing, and reachable from anywhere.
            (ImportState::Closed, _) => false,
            (_, ImportState::Closed) => true,

            (ImportState::New, ImportState::Connecting) => true,
            (ImportState::Disconn, ImportState::Connecting) => true,
            // A refused connect attempt goes straight to Disconn so the
            // pinger owns the retry.
            (ImportState::New, ImportState::Disconn) => true,

            // First-ever connect goes straight to Full; a reconnect lands
            // in one of the recovery entry points.
            (ImportState::Connecting, ImportState::Full) => true,
            (ImportState::Connecting, ImportState::Replay) => true,
            (ImportState::Connecting, ImportState::Recover) => true,
            (ImportState::Connecting, ImportState::Evicted) => true,

            (ImportState::Replay, ImportState::ReplayLocks) => true,
            (ImportState::ReplayLocks, ImportState::ReplayWait) => true,
            (ImportState::ReplayWait, ImportState::Recover) => true,
            (ImportState::Evicted, ImportState::Recover) => true,
            (ImportState::Recover, ImportState::Full) => true,

            // Any connected or recovering state can lose its wire.
            (ImportState::Connecting, ImportState::Disconn) => true,
            (ImportState::Full, ImportState::Disconn) => true,
            (ImportState::Replay, ImportState::Disconn) => true,
            (ImportState::ReplayLocks, ImportState::Disconn) => true,
            (ImportState::ReplayWait, ImportState::Disconn) => true,
            (ImportState::Recover, ImportState::Disconn) => true,
            (ImportState::Evicted, ImportState::Disconn) => true,

            _ => false,
        };
        assert!(
            ok,
            "illegal import state transition {} -> {}",
            inner.state, new
        );
        info!(log, "import transition {} -> {}", inner.state, new);
        inner.state = new;
    }

    /// Start a connect attempt.
    ///
    /// Fails with `AlreadyConnecting`/`AlreadyConnected` when there is
    /// nothing to do, and leaves the import `Disconn` (with the target rank
    /// rotated) when the transport refuses, so the pinger can retry.
    pub fn connect(self: &Arc<Self>) -> Result<(), TalusError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            ImportState::Connecting => {
                return Err(TalusError::AlreadyConnecting)
            }
            ImportState::Full
            | ImportState::Replay
            | ImportState::ReplayLocks
            | ImportState::ReplayWait
            | ImportState::Recover
            | ImportState::Evicted => {
                return Err(TalusError::AlreadyConnected)
            }
            ImportState::Closed => return Err(TalusError::ImportClosed),
            ImportState::New | ImportState::Disconn => {}
        }

        let target =
            &self.cfg.targets[inner.target_idx % self.cfg.targets.len()];
        let wire = match self.cfg.connector.connect(target) {
            Ok(w) => w,
            Err(e) => {
                warn!(
                    self.log,
                    "connect to {} failed: {}; will retry", target, e
                );
                inner.target_idx += 1;
                if inner.state == ImportState::New {
                    Self::checked_state_transition(
                        &mut inner,
                        &self.log,
                        ImportState::Disconn,
                    );
                }
                return Err(e);
            }
        };

        inner.conn_attempt += 1;
        let attempt = inner.conn_attempt;
        let (tx, rx) = wire.split();

        let m = Message::Connect {
            version: TALUS_MESSAGE_VERSION,
            client_id: self.cfg.client_id,
            prev_handle: inner.remote_handle,
            gen: inner.generation,
        };
        if let Err(e) = tx.send(m) {
            warn!(self.log, "connect send to {} failed: {}", target, e);
            inner.target_idx += 1;
            if inner.state == ImportState::New {
                Self::checked_state_transition(
                    &mut inner,
                    &self.log,
                    ImportState::Disconn,
                );
            }
            return Err(e);
        }

        inner.wire = Some(tx);
        Self::checked_state_transition(
            &mut inner,
            &self.log,
            ImportState::Connecting,
        );
        let now = Instant::now();
        inner.ping_deadline = now + self.cfg.ping_interval;
        inner.timeout_deadline = now + self.cfg.ping_timeout;
        drop(inner);

        let imp = Arc::clone(self);
        tokio::spawn(async move {
            io_task(imp, rx, attempt).await;
        });
        Ok(())
    }

    /// Create a request in the active table, in phase New.  Nothing is sent
    /// until [`Import::send_new`] is called (directly, or by a request
    /// set's poll pass).
    pub fn new_request(
        &self,
        opcode: Opcode,
        body: Bytes,
        opts: RequestOptions,
    ) -> (Xid, RequestWaiter) {
        let xid = self.xids.next();
        let (res, waiter) = request_channel();
        let req = ClientRequest::new(xid, opcode, body, opts, res);
        self.inner.lock().unwrap().active.insert(req);
        (xid, waiter)
    }

    /// Pure decision function consulted before every send attempt.
    pub(crate) fn delay_or_reject(
        cfg: &ImportConfig,
        inner: &ImportInner,
        req: &ClientRequest,
    ) -> SendDecision {
        if inner.state == ImportState::Closed {
            return SendDecision::Reject(TalusError::ImportClosed);
        }
        // A request stamped under an older generation must never be matched
        // against the current connection.
        if req.generation != 0 && req.generation != inner.generation {
            return SendDecision::Reject(TalusError::StaleGeneration);
        }
        if inner.invalid && req.opcode != Opcode::Connect {
            return SendDecision::Reject(TalusError::ImportInvalid);
        }
        if req.opcode == Opcode::Connect {
            return SendDecision::Send;
        }

        match inner.state {
            ImportState::Full => SendDecision::Send,
            // Replay traffic is the only thing allowed out during Replay,
            // and recovery resends the only thing during Recover.
            ImportState::Replay if req.flags.replay => SendDecision::Send,
            ImportState::Recover if req.flags.resend => SendDecision::Send,
            _ => {
                if !cfg.recoverable {
                    SendDecision::Reject(TalusError::TimedOut)
                } else if req.flags.no_delay {
                    SendDecision::Reject(TalusError::WouldBlock)
                } else if req.flags.no_resend {
                    SendDecision::Reject(TalusError::TimedOut)
                } else {
                    SendDecision::Delay
                }
            }
        }
    }

    /// Move a New request toward the wire: transmit, park, or fail it
    /// depending on what the import allows right now.
    pub fn send_new(&self, xid: Xid) {
        let mut inner = self.inner.lock().unwrap();
        let decision = {
            let Some(req) = inner.active.get(&xid) else {
                return;
            };
            if req.phase() != Phase::New {
                return;
            }
            Self::delay_or_reject(&self.cfg, &inner, req)
        };
        match decision {
            SendDecision::Send => {
                self.transmit_locked(&mut inner, xid);
            }
            SendDecision::Delay => {
                if !inner.delayed.contains(&xid) {
                    debug!(self.log, "request {} delayed", xid);
                    inner.delayed.push(xid);
                }
            }
            SendDecision::Reject(e) => {
                debug!(self.log, "request {} rejected: {}", xid, e);
                self.fail_request_locked(&mut inner, xid, e);
            }
        }
    }

    /// Stamp and transmit one request.  On a wire failure the request is
    /// requeued and the import transitions to Disconn.
    pub(crate) fn transmit_locked(
        &self,
        inner: &mut ImportInner,
        xid: Xid,
    ) {
        let generation = inner.generation;
        let handle = inner.remote_handle;
        let Some(wire) = inner.wire.clone() else {
            // No wire; leave the request parked.
            if !inner.delayed.contains(&xid) {
                inner.delayed.push(xid);
            }
            return;
        };

        let m = {
            let req = inner.active.get_mut(&xid).unwrap();
            req.generation = generation;
            req.deadline = Instant::now() + req.timeout;
            req.send_count += 1;
            req.registered = true;
            if let Some(bulk) = &mut req.bulk {
                bulk.registered = true;
            }
            req.set_phase(Phase::Rpc);

            let mut flags = 0;
            if req.flags.resend {
                flags |= MSG_RESENT;
            }
            if req.flags.replay {
                flags |= MSG_REPLAY;
            }
            Message::Request {
                header: RequestHeader {
                    opcode: req.opcode,
                    xid: req.xid,
                    transno: req.transno,
                    flags,
                    client_id: self.cfg.client_id,
                    handle,
                },
                body: req.body.clone(),
            }
        };

        if let Err(e) = wire.send(m) {
            warn!(self.log, "send of {} failed: {}", xid, e);
            self.disconnected_locked(inner, "send failure");
        }
    }

    /// Fail one request and drop it from every list.
    pub(crate) fn fail_request_locked(
        &self,
        inner: &mut ImportInner,
        xid: Xid,
        err: TalusError,
    ) {
        inner.delayed.retain(|x| *x != xid);
        if let Some(req) = inner.active.get_mut(&xid) {
            req.flags.err = true;
            inner.replay_list.remove(&(req.transno, xid));
            req.finish(Err(err));
        }
        inner.active.remove(&xid);
    }

    /// Dispatch one inbound message from the IO task for connection
    /// `attempt`.  Returns false once the task should exit.
    pub(crate) fn handle_message(
        self: &Arc<Self>,
        attempt: u64,
        m: Message,
    ) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.conn_attempt != attempt {
                return false;
            }
            if inner.state == ImportState::Closed {
                return false;
            }
            // Any traffic proves the peer is alive.
            inner.timeout_deadline =
                Instant::now() + self.cfg.ping_timeout;
        }

        match m {
            Message::ConnectReply {
                version,
                handle,
                reconnect,
                recovering,
                replayable,
                last_committed,
            } => self.handle_connect_reply(
                attempt,
                version,
                handle,
                reconnect,
                recovering,
                replayable,
                last_committed,
            ),
            Message::VersionMismatch { version } => {
                error!(
                    self.log,
                    "server wants protocol version {}, we speak {}",
                    version,
                    TALUS_MESSAGE_VERSION
                );
                self.close();
                return false;
            }
            Message::Pong {
                flags,
                last_committed,
                ..
            } => self.handle_pong(flags, last_committed),
            Message::Reply { header, body } => self.after_reply(header, body),
            Message::BulkData { xid, data } => self.handle_bulk(xid, data),
            other => {
                warn!(self.log, "unexpected message {:?}", other);
            }
        }
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_connect_reply(
        self: &Arc<Self>,
        attempt: u64,
        version: u32,
        handle: Uuid,
        reconnect: ReconnectStatus,
        recovering: bool,
        replayable: bool,
        last_committed: Transno,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if inner.conn_attempt != attempt
            || inner.state != ImportState::Connecting
        {
            return;
        }
        if version != TALUS_MESSAGE_VERSION {
            error!(self.log, "connect reply with bad version {}", version);
            drop(inner);
            self.close();
            return;
        }

        let first = inner.remote_handle.is_nil();
        let old_handle = inner.remote_handle;
        inner.remote_handle = handle;
        if last_committed > inner.peer_last_committed {
            inner.peer_last_committed = last_committed;
        }
        // Anything the server already made durable needs no replay.
        self.prune_replay_locked(&mut inner);

        if first {
            inner.replayable = replayable;
            info!(
                self.log,
                "connected, handle {} replayable {}", handle, replayable
            );
            Self::checked_state_transition(
                &mut inner,
                &self.log,
                ImportState::Full,
            );
            self.flush_delayed_locked(&mut inner);
            drop(inner);
            self.notify.notify_waiters();
            return;
        }

        // Reconnection.  The generation moves forward so anything still
        // stamped with the old connection can never complete against this
        // one.
        inner.generation += 1;
        info!(
            self.log,
            "reconnected as {:?}, old handle {} new handle {}",
            reconnect,
            old_handle,
            handle
        );
        match reconnect {
            ReconnectStatus::Evicted => {
                Self::checked_state_transition(
                    &mut inner,
                    &self.log,
                    ImportState::Evicted,
                );
            }
            ReconnectStatus::First | ReconnectStatus::Recovered => {
                if recovering && inner.replayable {
                    // Replay everything still on the list, oldest first.
                    inner.last_replayed = Transno::NONE;
                    Self::checked_state_transition(
                        &mut inner,
                        &self.log,
                        ImportState::Replay,
                    );
                } else {
                    Self::checked_state_transition(
                        &mut inner,
                        &self.log,
                        ImportState::Recover,
                    );
                }
            }
        }
        drop(inner);
        self.notify.notify_waiters();

        let imp = Arc::clone(self);
        tokio::spawn(async move {
            run_recovery(imp, attempt).await;
        });
    }

    fn handle_pong(&self, flags: u32, last_committed: Transno) {
        let mut inner = self.inner.lock().unwrap();
        if last_committed > inner.peer_last_committed {
            inner.peer_last_committed = last_committed;
        }
        if flags & MSG_LAST_REPLAY != 0 {
            inner.last_replay_acked = true;
        }
        self.prune_replay_locked(&mut inner);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Reply arrival: records the server-returned transno, classifies the
    /// status, updates replay bookkeeping, and wakes the waiter.
    fn after_reply(self: &Arc<Self>, header: ReplyHeader, body: Bytes) {
        let mut inner = self.inner.lock().unwrap();
        let xid = header.xid;

        if header.last_committed > inner.peer_last_committed {
            inner.peer_last_committed = header.last_committed;
        }

        let generation = inner.generation;
        let replayable = inner.replayable;
        if inner.active.get(&xid).is_none() {
            debug!(self.log, "reply for unknown xid {}", xid);
            self.prune_replay_locked(&mut inner);
            return;
        }
        let (was_replay, transno) = {
            let req = inner.active.get_mut(&xid).unwrap();
            if req.generation != generation {
                debug!(self.log, "reply for stale generation of {}", xid);
                return;
            }
            if req.phase() != Phase::Rpc {
                debug!(
                    self.log,
                    "reply for {} in phase {} ignored",
                    xid,
                    req.phase()
                );
                return;
            }
            req.unregister();
            if !header.transno.is_none() {
                req.transno = header.transno;
            }
            req.reply = Some(header.clone());
            (req.flags.replay, req.transno)
        };

        if was_replay {
            // Replay completion: pure bookkeeping, the original waiter was
            // answered long ago.  The recovery driver is watching.
            let req = inner.active.get_mut(&xid).unwrap();
            req.flags.replay = false;
            req.set_phase(Phase::Interpret);
            req.set_phase(Phase::Complete);
            if transno > inner.last_replayed {
                inner.last_replayed = transno;
            }
            self.prune_replay_locked(&mut inner);
            drop(inner);
            self.notify.notify_waiters();
            return;
        }

        // A server that no longer recognizes our session is a recovery
        // trigger, not an application error, unless this import cannot
        // recover.
        let stale_session = matches!(
            header.status,
            Err(TalusError::NotConnected) | Err(TalusError::HandleMismatch)
        );
        if stale_session && self.cfg.recoverable {
            let req = inner.active.get_mut(&xid).unwrap();
            req.flags.resend = true;
            req.generation = 0;
            req.set_phase(Phase::New);
            inner.delayed.push(xid);
            self.disconnected_locked(&mut inner, "stale session");
            drop(inner);
            self.notify.notify_waiters();
            return;
        }

        // Track for replay, or complete outright.
        if replayable && !transno.is_none() && header.status.is_ok() {
            inner.replay_list.insert((transno, xid));
        }

        let remove = {
            let req = inner.active.get_mut(&xid).unwrap();
            match &header.status {
                Ok(()) if req.bulk.is_some() => {
                    // Completion additionally gates on the bulk payload.
                    req.reply_body = Some(body);
                    req.set_phase(Phase::Bulk);
                    false
                }
                Ok(()) => {
                    req.reply_body = Some(body.clone());
                    req.finish(Ok(body));
                    true
                }
                Err(e) => {
                    let e = e.clone();
                    req.finish(Err(e));
                    true
                }
            }
        };
        if remove {
            self.maybe_remove_locked(&mut inner, xid);
        }
        self.prune_replay_locked(&mut inner);
        drop(inner);
        self.notify.notify_waiters();
    }

    fn handle_bulk(&self, xid: Xid, data: Bytes) {
        let mut inner = self.inner.lock().unwrap();
        let done = {
            let Some(req) = inner.active.get_mut(&xid) else {
                debug!(self.log, "bulk for unknown xid {}", xid);
                return;
            };
            if req.phase() != Phase::Bulk {
                debug!(self.log, "bulk for {} not in Bulk phase", xid);
                return;
            }
            if let Some(bulk) = &mut req.bulk {
                bulk.data = Some(data.clone());
                bulk.registered = false;
            }
            req.finish(Ok(data));
            true
        };
        if done {
            self.maybe_remove_locked(&mut inner, xid);
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Remove a completed request unless the replay list still needs it.
    pub(crate) fn maybe_remove_locked(
        &self,
        inner: &mut ImportInner,
        xid: Xid,
    ) {
        let keep = {
            let Some(req) = inner.active.get(&xid) else {
                return;
            };
            req.phase() != Phase::Complete
                || inner.replay_list.contains(&(req.transno, xid))
        };
        if !keep {
            inner.active.remove(&xid);
        }
    }

    /// Drop replay entries the server has reported durable, and release
    /// their retained requests.
    pub(crate) fn prune_replay_locked(&self, inner: &mut ImportInner) {
        let committed = inner.peer_last_committed;
        let pruned: Vec<(Transno, Xid)> = inner
            .replay_list
            .iter()
            .take_while(|(t, _)| *t <= committed)
            .copied()
            .collect();
        for (t, xid) in pruned {
            inner.replay_list.remove(&(t, xid));
            self.maybe_remove_locked(inner, xid);
        }
    }

    /// Send every parked request now that the import can.
    pub(crate) fn flush_delayed_locked(&self, inner: &mut ImportInner) {
        let delayed = std::mem::take(&mut inner.delayed);
        for xid in delayed {
            if inner.active.get(&xid).is_some() {
                self.transmit_locked(inner, xid);
            }
        }
    }

    /// The wire died (or we gave up on it): requeue everything in flight
    /// and hand the retry to the pinger.
    pub(crate) fn disconnected_locked(
        &self,
        inner: &mut ImportInner,
        reason: &str,
    ) {
        match inner.state {
            ImportState::New
            | ImportState::Disconn
            | ImportState::Closed => return,
            _ => {}
        }
        warn!(self.log, "disconnected: {}", reason);
        inner.wire = None;
        // Events from the dead IO task must not touch the next connection.
        inner.conn_attempt += 1;

        let mut requeue = Vec::new();
        let mut fail = Vec::new();
        inner.active.for_each(|xid, req| {
            if !matches!(req.phase(), Phase::Rpc | Phase::Bulk) {
                return;
            }
            req.unregister();
            if req.flags.replay {
                // Replay list entries go back to rest; the recovery driver
                // retransmits them on the next connection.
                req.set_phase(Phase::Interpret);
                req.set_phase(Phase::Complete);
            } else if req.flags.no_resend {
                fail.push(*xid);
            } else {
                req.flags.resend = true;
                req.generation = 0;
                req.set_phase(Phase::New);
                requeue.push(*xid);
            }
        });
        for xid in fail {
            self.fail_request_locked(inner, xid, TalusError::TimedOut);
        }
        for xid in requeue {
            if !inner.delayed.contains(&xid) {
                inner.delayed.push(xid);
            }
        }

        Self::checked_state_transition(
            inner,
            &self.log,
            ImportState::Disconn,
        );
    }

    /// Called by the IO task when its wire closes underneath it.
    pub(crate) fn on_wire_closed(self: &Arc<Self>, attempt: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.conn_attempt != attempt {
            return;
        }
        self.disconnected_locked(&mut inner, "wire closed");
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Deadline scan: expire in-flight requests, and kick recovery if any
    /// expired.
    pub fn tick(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, ImportState::New | ImportState::Closed) {
            return;
        }

        let mut expired = Vec::new();
        inner.active.for_each(|xid, req| {
            if matches!(req.phase(), Phase::Rpc | Phase::Bulk)
                && now >= req.deadline
            {
                req.flags.timedout = true;
                expired.push(*xid);
            }
        });
        if expired.is_empty() {
            return;
        }

        for xid in &expired {
            let (intr, no_resend, replay) = {
                let req = inner.active.get_mut(xid).unwrap();
                req.unregister();
                (req.flags.intr, req.flags.no_resend, req.flags.replay)
            };
            if replay {
                // Handled by the disconnect requeue below.
                continue;
            }
            if intr {
                warn!(self.log, "request {} interrupted after timeout", xid);
                self.fail_request_locked(
                    &mut inner,
                    *xid,
                    TalusError::Interrupted,
                );
            } else if no_resend {
                warn!(self.log, "request {} timed out (no_resend)", xid);
                self.fail_request_locked(
                    &mut inner,
                    *xid,
                    TalusError::TimedOut,
                );
            }
            // Otherwise the request stays; the disconnect below requeues
            // it for resend after reconnection.
        }

        self.disconnected_locked(&mut inner, "request timeout");
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Mark a request interrupted.  Advisory: it is abandoned only after it
    /// has also timed out.
    pub fn interrupt(&self, xid: Xid) {
        let mut inner = self.inner.lock().unwrap();
        let timedout = {
            let Some(req) = inner.active.get_mut(&xid) else {
                return;
            };
            req.flags.intr = true;
            req.flags.timedout
        };
        if timedout {
            self.fail_request_locked(&mut inner, xid, TalusError::Interrupted);
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// On generation bump, fail every request stamped with an older
    /// generation, without blocking.
    pub fn abort_inflight(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        let generation = inner.generation;
        let mut stale = Vec::new();
        inner.active.for_each(|xid, req| {
            if req.phase() != Phase::Complete && req.generation != generation
            {
                stale.push(*xid);
            }
        });
        for xid in stale {
            self.fail_request_locked(&mut inner, xid, TalusError::IoError(
                "aborted by generation bump".to_string(),
            ));
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Eviction: fail everything, clear replay state, notify the upper
    /// layer, and fall into Recover.
    pub(crate) fn invalidate(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.invalid = true;
            inner.generation += 1;

            let xids: Vec<Xid> = inner.active.keys().collect();
            for xid in xids {
                let done = {
                    let req = inner.active.get(&xid).unwrap();
                    req.phase() == Phase::Complete
                };
                if done {
                    inner.active.remove(&xid);
                } else {
                    self.fail_request_locked(
                        &mut inner,
                        xid,
                        TalusError::IoError("import evicted".to_string()),
                    );
                }
            }
            inner.replay_list.clear();
            inner.delayed.clear();
            inner.last_replayed = Transno::NONE;
            Self::checked_state_transition(
                &mut inner,
                &self.log,
                ImportState::Recover,
            );
        }
        if let Some(cb) = &self.cfg.on_invalidate {
            cb();
        }
        self.notify.notify_waiters();
    }

    /// Administrative close.  Absorbing: nothing sends after this.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ImportState::Closed {
            return;
        }
        Self::checked_state_transition(
            &mut inner,
            &self.log,
            ImportState::Closed,
        );
        inner.wire = None;
        inner.conn_attempt += 1;
        let xids: Vec<Xid> = inner.active.keys().collect();
        for xid in xids {
            let done = {
                let req = inner.active.get(&xid).unwrap();
                req.phase() == Phase::Complete
            };
            if done {
                inner.active.remove(&xid);
            } else {
                self.fail_request_locked(
                    &mut inner,
                    xid,
                    TalusError::ImportClosed,
                );
            }
        }
        inner.replay_list.clear();
        inner.delayed.clear();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// One pinger beat: liveness checks when connected, reconnect attempts
    /// when not.
    pub fn pinger_tick(self: &Arc<Self>, now: Instant) {
        let state = self.state();
        match state {
            ImportState::Full
            | ImportState::Replay
            | ImportState::ReplayLocks
            | ImportState::ReplayWait
            | ImportState::Recover => {
                self.tick(now);
                let mut inner = self.inner.lock().unwrap();
                if now >= inner.timeout_deadline {
                    self.disconnected_locked(&mut inner, "ping timeout");
                    drop(inner);
                    self.notify.notify_waiters();
                } else if now >= inner.ping_deadline {
                    inner.ping_deadline = now + self.cfg.ping_interval;
                    if let Some(wire) = inner.wire.clone() {
                        let r = wire.send(Message::Ping {
                            xid: self.xids.next(),
                            flags: 0,
                        });
                        if r.is_err() {
                            self.disconnected_locked(
                                &mut inner,
                                "ping send failure",
                            );
                            drop(inner);
                            self.notify.notify_waiters();
                        }
                    }
                }
            }
            ImportState::Disconn => {
                if let Err(e) = self.connect() {
                    debug!(self.log, "pinger reconnect attempt: {}", e);
                }
            }
            ImportState::New
            | ImportState::Connecting
            | ImportState::Evicted
            | ImportState::Closed => {}
        }
    }

    /// Wait until the import reaches Full.
    pub async fn wait_for_full(&self) {
        loop {
            let fut = self.notify.notified();
            if self.state() == ImportState::Full {
                return;
            }
            fut.await;
        }
    }

    pub(crate) fn request_phase(&self, xid: Xid) -> Option<Phase> {
        self.inner.lock().unwrap().active.get(&xid).map(|r| r.phase())
    }

    pub(crate) fn request_deadline(&self, xid: Xid) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        inner.active.get(&xid).and_then(|r| {
            if matches!(r.phase(), Phase::Rpc | Phase::Bulk) {
                Some(r.deadline)
            } else {
                None
            }
        })
    }
}

/// The IO task is "thin"; it forwards inbound messages to the import until
/// the wire closes or the import moves on to a newer connection.
async fn io_task(imp: Arc<Import>, mut rx: WireReceiver, attempt: u64) {
    while let Some(m) = rx.recv().await {
        if !imp.handle_message(attempt, m) {
            return;
        }
    }
    imp.on_wire_closed(attempt);
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use talus_protocol::wire::MemNet;

    pub(crate) fn test_config(net: &Arc<MemNet>) -> ImportConfig {
        ImportConfig {
            client_id: Uuid::new_v4(),
            targets: vec!["mds0".to_string()],
            connector: net.clone() as Arc<dyn Connector>,
            request_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_millis(50),
            ping_timeout: Duration::from_millis(500),
            recoverable: true,
            lock_replayer: None,
            on_invalidate: None,
        }
    }

    pub(crate) fn test_import() -> Arc<Import> {
        let net = MemNet::new();
        let log = talus_common::build_plain_logger();
        Import::new(test_config(&net), XidAllocator::new(), &log)
    }

    fn transition(imp: &Import, new: ImportState) {
        let mut inner = imp.inner.lock().unwrap();
        Import::checked_state_transition(&mut inner, &imp.log, new);
    }

    #[tokio::test]
    async fn import_transition_normal() {
        // Verify the correct first-connect progression
        let imp = test_import();
        transition(&imp, ImportState::Connecting);
        transition(&imp, ImportState::Full);
    }

    #[tokio::test]
    async fn import_transition_replay_chain() {
        let imp = test_import();
        transition(&imp, ImportState::Connecting);
        transition(&imp, ImportState::Full);
        transition(&imp, ImportState::Disconn);
        transition(&imp, ImportState::Connecting);
        transition(&imp, ImportState::Replay);
        transition(&imp, ImportState::ReplayLocks);
        transition(&imp, ImportState::ReplayWait);
        transition(&imp, ImportState::Recover);
        transition(&imp, ImportState::Full);
    }

    #[tokio::test]
    async fn import_transition_evicted() {
        let imp = test_import();
        transition(&imp, ImportState::Connecting);
        transition(&imp, ImportState::Full);
        transition(&imp, ImportState::Disconn);
        transition(&imp, ImportState::Connecting);
        transition(&imp, ImportState::Evicted);
        transition(&imp, ImportState::Recover);
        transition(&imp, ImportState::Full);
    }

    #[tokio::test]
    #[should_panic]
    async fn import_transition_new_to_full_panics() {
        let imp = test_import();
        transition(&imp, ImportState::Full);
    }

    #[tokio::test]
    #[should_panic]
    async fn import_transition_out_of_closed_panics() {
        let imp = test_import();
        transition(&imp, ImportState::Closed);
        transition(&imp, ImportState::Connecting);
    }

    #[tokio::test]
    async fn new_request_delays_until_connected() {
        let imp = test_import();
        let (xid, mut waiter) =
            imp.new_request(Opcode::Getattr, Bytes::new(), Default::default());
        imp.send_new(xid);
        assert_eq!(imp.request_phase(xid), Some(Phase::New));
        assert!(waiter.try_wait().is_none());
        assert!(imp.inner.lock().unwrap().delayed.contains(&xid));
    }

    #[tokio::test]
    async fn no_delay_request_fails_when_not_connected() {
        let imp = test_import();
        let (xid, waiter) = imp.new_request(
            Opcode::Getattr,
            Bytes::new(),
            RequestOptions {
                no_delay: true,
                ..Default::default()
            },
        );
        imp.send_new(xid);
        assert_eq!(waiter.wait().await, Err(TalusError::WouldBlock));
        assert!(imp.inner.lock().unwrap().active.is_empty());
    }

    #[tokio::test]
    async fn non_recoverable_import_rejects_instead_of_delaying() {
        let net = MemNet::new();
        let log = talus_common::build_plain_logger();
        let mut cfg = test_config(&net);
        cfg.recoverable = false;
        let imp = Import::new(cfg, XidAllocator::new(), &log);
        let (xid, waiter) =
            imp.new_request(Opcode::Getattr, Bytes::new(), Default::default());
        imp.send_new(xid);
        assert_eq!(waiter.wait().await, Err(TalusError::TimedOut));
    }

    #[tokio::test]
    async fn closed_import_rejects_everything() {
        let imp = test_import();
        imp.close();
        let (xid, waiter) =
            imp.new_request(Opcode::Getattr, Bytes::new(), Default::default());
        imp.send_new(xid);
        assert_eq!(waiter.wait().await, Err(TalusError::ImportClosed));
        assert!(imp.connect().is_err());
    }

    #[tokio::test]
    async fn abort_inflight_fails_only_stale_generations() {
        let imp = test_import();
        transition(&imp, ImportState::Connecting);
        transition(&imp, ImportState::Full);

        // A request stamped with the current generation, in flight.
        let (old_xid, old_waiter) =
            imp.new_request(Opcode::Getattr, Bytes::new(), Default::default());
        {
            let mut inner = imp.inner.lock().unwrap();
            let generation = inner.generation;
            let req = inner.active.get_mut(&old_xid).unwrap();
            req.generation = generation;
            req.set_phase(Phase::Rpc);
        }

        imp.abort_inflight();
        assert!(matches!(
            old_waiter.wait().await,
            Err(TalusError::IoError(_))
        ));

        // A request stamped under the new generation survives a second
        // request's perspective: it is not failed by the old abort.
        let (new_xid, mut new_waiter) =
            imp.new_request(Opcode::Getattr, Bytes::new(), Default::default());
        {
            let mut inner = imp.inner.lock().unwrap();
            let generation = inner.generation;
            let req = inner.active.get_mut(&new_xid).unwrap();
            req.generation = generation;
            req.set_phase(Phase::Rpc);
        }
        assert!(new_waiter.try_wait().is_none());
        assert_eq!(imp.request_phase(new_xid), Some(Phase::Rpc));
    }

    #[tokio::test]
    async fn interrupt_alone_does_not_abandon() {
        let imp = test_import();
        transition(&imp, ImportState::Connecting);
        transition(&imp, ImportState::Full);
        let (xid, mut waiter) =
            imp.new_request(Opcode::Getattr, Bytes::new(), Default::default());
        {
            let mut inner = imp.inner.lock().unwrap();
            let generation = inner.generation;
            let req = inner.active.get_mut(&xid).unwrap();
            req.generation = generation;
            req.set_phase(Phase::Rpc);
        }

        imp.interrupt(xid);
        assert!(waiter.try_wait().is_none());

        // Once it has also timed out, interruption takes effect.
        {
            let mut inner = imp.inner.lock().unwrap();
            let req = inner.active.get_mut(&xid).unwrap();
            req.deadline = Instant::now() - Duration::from_secs(1);
        }
        imp.tick(Instant::now());
        assert_eq!(waiter.try_wait(), Some(Err(TalusError::Interrupted)));
    }
}
