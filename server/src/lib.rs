// Copyright 2025 Oxide Computer Company
//! Metadata service: accepts connections, pools inbound requests, fans
//! them out to worker tasks, and schedules difficult replies.
//!
//! One `Service` is one logical target.  Construction restores the client
//! ledger from the store; if recoverable clients are found the service
//! starts inside a recovery window, during which only a fixed set of
//! opcodes proceeds and everything else queues until the window closes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use slog::{debug, error, info, o, warn, Logger};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use talus_common::{ServiceConfig, TalusError};
use talus_protocol::wire::{Wire, WireSender};
use talus_protocol::{
    decode_body, encode_body, CloseRequest, GetattrReply, GetattrRequest,
    LockCancelRequest, LockEnqueueReply, LockEnqueueRequest, Message,
    Opcode, OpenReply, OpenRequest, ReplyHeader, RequestHeader, Transno,
    Xid, MSG_LAST_REPLAY, MSG_REPLAY, MSG_RESENT, TALUS_MESSAGE_VERSION,
};

pub mod buffer_pool;
pub mod dlm;
pub mod ledger;
pub mod lock_order;
pub mod reint;
pub mod reply;
pub mod store;


use buffer_pool::{BufferPool, IncomingRequest};
use dlm::{LockManager, LockRef};
use ledger::ClientLedger;
use reint::{CommitEvent, ReintEngine};
use reply::{ReplyScheduler, ReplyState};
use store::ObjectStore;

/// Opcodes allowed through while the service is inside its recovery
/// window; everything else queues.
///
/// This is deliberately one table consulted in one place.  The original
/// deployments carried two slightly divergent copies of this list; which
/// of the divergent entries belong here is a product decision, so keep
/// any change to this table loud.
pub const RECOVERY_ALLOWED: &[Opcode] = &[
    Opcode::Connect,
    Opcode::Disconnect,
    Opcode::Ping,
    Opcode::ReintCreate,
    Opcode::ReintLink,
    Opcode::ReintUnlink,
    Opcode::ReintRename,
    Opcode::ReintSetattr,
    Opcode::LockEnqueue,
    Opcode::Close,
    Opcode::Sync,
];

/// Server-side handle for one connected client.
#[derive(Debug)]
pub struct Export {
    pub handle: Uuid,
    pub client_id: Uuid,
    pub slot: usize,
    /// Live connection, if any; a failover disconnect leaves the export
    /// in place with no wire.
    pub wire: Option<WireSender>,
    pub evicted: bool,
    /// Locks granted to this client through the lock-enqueue surface.
    pub held_locks: Vec<LockRef>,
}

struct RecoveryWindow {
    /// Clients that must finish replay before the window closes.
    waiting: HashSet<Uuid>,
    deadline: Instant,
    queued: VecDeque<IncomingRequest>,
}

struct ServiceInner {
    pool: BufferPool,
    queue: VecDeque<IncomingRequest>,
    scheduler: ReplyScheduler,
    /// Keyed by export handle.
    exports: HashMap<Uuid, Export>,
    /// client id -> export handle.
    by_client: HashMap<Uuid, Uuid>,
    recovery: Option<RecoveryWindow>,
    /// Workers currently processing new requests.
    busy: usize,
}

enum Job {
    Request(IncomingRequest),
    Reply(ReplyState),
    Idle,
}

pub struct Service {
    cfg: ServiceConfig,
    log: Logger,
    dlm: Arc<dyn LockManager>,
    ledger: Arc<ClientLedger>,
    engine: Arc<ReintEngine>,
    inner: Mutex<ServiceInner>,
    notify: Notify,
}

impl Service {
    /// Bring up a service on a store.  Restores the ledger; recoverable
    /// clients put the service into its recovery window.
    pub fn start(
        cfg: ServiceConfig,
        store: Arc<dyn ObjectStore>,
        dlm: Arc<dyn LockManager>,
        log: &Logger,
    ) -> Result<Arc<Service>, TalusError> {
        let log = log.new(o!("" => "service"));
        let (ledger, recovered) = ClientLedger::open(
            Arc::clone(&store),
            Uuid::new_v4(),
            cfg.max_clients,
            &log,
        )?;
        let ledger = Arc::new(ledger);

        let (commit_tx, commit_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(ReintEngine::new(
            Arc::clone(&store),
            Arc::clone(&dlm),
            Arc::clone(&ledger),
            commit_tx,
            &log,
        ));

        let pool =
            BufferPool::new(cfg.buffers_per_group, cfg.buffer_size, &log);

        let mut inner = ServiceInner {
            pool,
            queue: VecDeque::new(),
            scheduler: ReplyScheduler::new(),
            exports: HashMap::new(),
            by_client: HashMap::new(),
            recovery: None,
            busy: 0,
        };

        // Seed an export-under-recovery per surviving ledger slot; each
        // contributes to the recovery-completion threshold.
        if !recovered.is_empty() {
            let deadline = Instant::now() + cfg.recovery_window;
            let mut waiting = HashSet::new();
            for rec in &recovered {
                let handle = Uuid::new_v4();
                let slot = ledger.slot_of(rec.client_id).unwrap();
                inner.exports.insert(
                    handle,
                    Export {
                        handle,
                        client_id: rec.client_id,
                        slot,
                        wire: None,
                        evicted: false,
                        held_locks: Vec::new(),
                    },
                );
                inner.by_client.insert(rec.client_id, handle);
                waiting.insert(rec.client_id);
            }
            info!(
                log,
                "starting in recovery: {} clients to wait for",
                waiting.len()
            );
            inner.recovery = Some(RecoveryWindow {
                waiting,
                deadline,
                queued: VecDeque::new(),
            });
        }

        let svc = Arc::new(Service {
            cfg,
            log,
            dlm,
            ledger,
            engine,
            inner: Mutex::new(inner),
            notify: Notify::new(),
        });

        // Worker pool.
        for i in 0..svc.cfg.thread_count.max(1) {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move {
                worker(svc, i).await;
            });
        }

        // Commit-notification path: durability events schedule difficult
        // replies.
        {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move {
                commit_drain(svc, commit_rx).await;
            });
        }

        // Recovery deadline watcher.
        if svc.in_recovery() {
            let svc = Arc::clone(&svc);
            let deadline = {
                let inner = svc.inner.lock().unwrap();
                inner.recovery.as_ref().unwrap().deadline
            };
            tokio::spawn(async move {
                sleep_until(deadline).await;
                svc.end_recovery(true);
            });
        }

        Ok(svc)
    }

    pub fn in_recovery(&self) -> bool {
        self.inner.lock().unwrap().recovery.is_some()
    }

    pub fn last_committed(&self) -> Transno {
        self.ledger.last_committed()
    }

    pub fn engine(&self) -> &Arc<ReintEngine> {
        &self.engine
    }

    pub fn ledger(&self) -> &Arc<ClientLedger> {
        &self.ledger
    }

    /// A service is unhealthy when its oldest queued request has waited
    /// longer than the watchdog cutoff.  Liveness signal only.
    pub fn healthy(&self, now: Instant) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.queue.front() {
            Some(req) => {
                now.saturating_duration_since(req.received_at)
                    <= self.cfg.watchdog_timeout
            }
            None => true,
        }
    }

    /// Accept connections from a listener stream.
    pub fn serve(
        self: &Arc<Self>,
        mut accepted: mpsc::UnboundedReceiver<Wire>,
    ) {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(wire) = accepted.recv().await {
                let svc = Arc::clone(&svc);
                tokio::spawn(async move {
                    connection_task(svc, wire).await;
                });
            }
        });
    }

    fn handle_connect(
        &self,
        version: u32,
        client_id: Uuid,
        prev_handle: Uuid,
        tx: &WireSender,
    ) -> Option<Uuid> {
        if version != TALUS_MESSAGE_VERSION {
            warn!(
                self.log,
                "client {} speaks version {}, want {}",
                client_id,
                version,
                TALUS_MESSAGE_VERSION
            );
            let _ = tx.send(Message::VersionMismatch {
                version: TALUS_MESSAGE_VERSION,
            });
            return None;
        }

        let mut inner = self.inner.lock().unwrap();
        let existing = inner.by_client.get(&client_id).copied();
        let (handle, reconnect) = match existing {
            Some(h) => {
                // Known client: reconnect, possibly to an export seeded
                // from the ledger at startup.
                let exp = inner.exports.get_mut(&h).unwrap();
                exp.wire = Some(tx.clone());
                if !prev_handle.is_nil() && prev_handle != exp.handle {
                    debug!(
                        self.log,
                        "client {} presented stale handle {}, ours {}",
                        client_id,
                        prev_handle,
                        exp.handle
                    );
                }
                (h, talus_protocol::ReconnectStatus::Recovered)
            }
            None => {
                let status = if prev_handle.is_nil() {
                    talus_protocol::ReconnectStatus::First
                } else {
                    // The client believes it had a session here and we
                    // have nothing for it: all its state is stale.
                    talus_protocol::ReconnectStatus::Evicted
                };
                let slot = match self.ledger.attach(client_id) {
                    Ok((slot, _)) => slot,
                    Err(e) => {
                        error!(
                            self.log,
                            "cannot attach client {}: {}", client_id, e
                        );
                        return None;
                    }
                };
                let handle = Uuid::new_v4();
                inner.exports.insert(
                    handle,
                    Export {
                        handle,
                        client_id,
                        slot,
                        wire: Some(tx.clone()),
                        evicted: false,
                        held_locks: Vec::new(),
                    },
                );
                inner.by_client.insert(client_id, handle);
                (handle, status)
            }
        };

        let recovering = inner
            .recovery
            .as_ref()
            .map(|w| w.waiting.contains(&client_id))
            .unwrap_or(false);
        drop(inner);

        info!(
            self.log,
            "client {} connected as {} ({:?})", client_id, handle, reconnect
        );
        let _ = tx.send(Message::ConnectReply {
            version: TALUS_MESSAGE_VERSION,
            handle,
            reconnect,
            recovering,
            replayable: true,
            last_committed: self.ledger.last_committed(),
        });
        Some(handle)
    }

    fn handle_ping(
        &self,
        export: Option<Uuid>,
        xid: Xid,
        flags: u32,
        tx: &WireSender,
    ) {
        if flags & MSG_LAST_REPLAY != 0 {
            if let Some(h) = export {
                self.client_finished_replay(h);
            }
        }
        let _ = tx.send(Message::Pong {
            xid,
            flags,
            last_committed: self.ledger.last_committed(),
        });
    }

    /// A client's last-replay marker retires it from the recovery window;
    /// the last one out closes the window.
    fn client_finished_replay(&self, export: Uuid) {
        let done = {
            let mut inner = self.inner.lock().unwrap();
            let Some(client_id) =
                inner.exports.get(&export).map(|e| e.client_id)
            else {
                return;
            };
            match &mut inner.recovery {
                Some(w) => {
                    w.waiting.remove(&client_id);
                    info!(
                        self.log,
                        "client {} finished replay, {} remain",
                        client_id,
                        w.waiting.len()
                    );
                    w.waiting.is_empty()
                }
                None => false,
            }
        };
        if done {
            self.end_recovery(false);
        }
    }

    /// Close the recovery window.  On abort, queued requests fail with
    /// "try again"; on normal completion they join the regular queue.
    fn end_recovery(&self, aborted: bool) {
        let queued = {
            let mut inner = self.inner.lock().unwrap();
            let Some(w) = inner.recovery.take() else {
                return;
            };
            if aborted && !w.waiting.is_empty() {
                warn!(
                    self.log,
                    "recovery window expired with {} clients missing",
                    w.waiting.len()
                );
            }
            if !aborted {
                info!(self.log, "recovery complete");
                inner.queue.extend(w.queued);
                self.notify.notify_waiters();
                return;
            }
            w.queued
        };

        for req in queued {
            self.send_error_reply(&req, TalusError::TryAgain);
        }
        self.notify.notify_waiters();
    }

    fn send_error_reply(&self, req: &IncomingRequest, e: TalusError) {
        let wire = {
            let inner = self.inner.lock().unwrap();
            inner
                .exports
                .get(&req.export)
                .and_then(|exp| exp.wire.clone())
        };
        if let Some(wire) = wire {
            let _ = wire.send(Message::Reply {
                header: ReplyHeader {
                    opcode: req.header.opcode,
                    xid: req.header.xid,
                    transno: Transno::NONE,
                    flags: req.header.flags,
                    status: Err(e),
                    last_committed: self.ledger.last_committed(),
                },
                body: bytes::Bytes::new(),
            });
        }
    }

    /// Accept one inbound request into the buffer pool and the queue (or
    /// the recovery window's side queue).
    fn ingest(&self, export: Option<Uuid>, header: RequestHeader, body: &[u8]) {
        let Some(h) = export else {
            // Requests before a connect exchange are protocol-fatal:
            // dropped with no reply.
            warn!(self.log, "request {} before connect, dropped", header.xid);
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        let Some(exp) = inner.exports.get(&h) else {
            return;
        };
        if exp.evicted {
            drop(inner);
            return;
        }
        if header.handle != exp.handle {
            // A stale session talking to a new incarnation: tell it to
            // reconnect rather than executing anything.
            drop(inner);
            let req = IncomingRequest {
                export: h,
                header,
                body: bytes::Bytes::new(),
                buffer_id: 0,
                received_at: Instant::now(),
            };
            self.send_error_reply(&req, TalusError::HandleMismatch);
            return;
        }

        let req = inner.pool.ingest(h, header, body, Instant::now());

        if let Some(w) = &mut inner.recovery {
            if !RECOVERY_ALLOWED.contains(&req.header.opcode) {
                debug!(
                    self.log,
                    "request {} ({:?}) held for recovery",
                    req.header.xid,
                    req.header.opcode
                );
                w.queued.push_back(req);
                return;
            }
        }
        inner.queue.push_back(req);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Pick the next unit of work, honoring the difficult-reply
    /// backpressure rule: while difficult replies exist, at most
    /// (threads - 1) workers may chew new requests, reserving one worker
    /// to guarantee replies still get serviced.
    fn next_job(&self) -> Job {
        let mut inner = self.inner.lock().unwrap();
        let threads = self.cfg.thread_count.max(1);

        if inner.scheduler.has_scheduled()
            && (inner.queue.is_empty() || inner.busy + 1 >= threads)
        {
            if let Some(r) = inner.scheduler.pop() {
                return Job::Reply(r);
            }
        }
        if inner.scheduler.has_pending() && inner.busy + 1 >= threads {
            return Job::Idle;
        }
        if let Some(req) = inner.queue.pop_front() {
            inner.busy += 1;
            return Job::Request(req);
        }
        if let Some(r) = inner.scheduler.pop() {
            return Job::Reply(r);
        }
        Job::Idle
    }

    /// Execute one queued request and send (or park) its reply.
    async fn handle_one_request(&self, req: IncomingRequest) {
        let header = req.header;
        let (client_id, slot) = {
            let inner = self.inner.lock().unwrap();
            match inner.exports.get(&req.export) {
                Some(e) => (e.client_id, e.slot),
                None => return,
            }
        };

        // Opaque-body decode failures are protocol-fatal: the request is
        // dropped with no reply.
        macro_rules! decode_or_drop {
            ($t:ty) => {
                match decode_body::<$t>(&req.body) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(
                            self.log,
                            "malformed {} body for {}: {}; dropped",
                            stringify!($t),
                            header.xid,
                            e
                        );
                        return;
                    }
                }
            };
        }

        let mut locks: Vec<LockRef> = Vec::new();
        let mut transno = Transno::NONE;
        let mut reconstructed = false;
        let status: Result<bytes::Bytes, TalusError> = match header.opcode {
            op if op.is_reint() => {
                let body = decode_or_drop!(talus_protocol::ReintRequest);
                let out = self.engine.handle(slot, &header, body).await;
                locks = out.locks;
                transno = out.transno;
                reconstructed = out.reconstructed;
                out.status.map(|()| out.body)
            }
            Opcode::Getattr => {
                let body = decode_or_drop!(GetattrRequest);
                self.engine.attrs(body.target).and_then(|attrs| {
                    encode_body(&GetattrReply { attrs })
                })
            }
            Opcode::Statfs => self
                .engine
                .statfs()
                .and_then(|s| encode_body(&s)),
            Opcode::Open => {
                let body = decode_or_drop!(OpenRequest);
                self.engine.mark_open(client_id, body.target).and_then(
                    |(attrs, disposition)| {
                        encode_body(&OpenReply { attrs, disposition })
                    },
                )
            }
            Opcode::Close => {
                let body = decode_or_drop!(CloseRequest);
                self.engine
                    .close(client_id, body.target)
                    .await
                    .map(|()| bytes::Bytes::new())
            }
            Opcode::Sync => {
                let n = self.engine.sync_store();
                debug!(self.log, "sync retired {} transactions", n);
                Ok(bytes::Bytes::new())
            }
            Opcode::LockEnqueue => {
                let body = decode_or_drop!(LockEnqueueRequest);
                match self
                    .dlm
                    .enqueue(body.resource, body.mode, body.policy)
                    .await
                {
                    Ok(l) => {
                        let cookie = l.cookie;
                        let mut stash = Some(l);
                        let kept = {
                            let mut inner = self.inner.lock().unwrap();
                            match inner.exports.get_mut(&req.export) {
                                Some(e) if !e.evicted => {
                                    e.held_locks
                                        .push(stash.take().unwrap());
                                    true
                                }
                                _ => false,
                            }
                        };
                        if !kept {
                            // Granted to a client that vanished while we
                            // waited; do not leak it.
                            if let Some(l) = stash {
                                self.dlm.decref(l);
                            }
                            return;
                        }
                        encode_body(&LockEnqueueReply { cookie })
                    }
                    Err(e) => Err(e),
                }
            }
            Opcode::LockCancel => {
                let body = decode_or_drop!(LockCancelRequest);
                let found = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.exports.get_mut(&req.export).and_then(|e| {
                        e.held_locks
                            .iter()
                            .position(|l| l.cookie == body.cookie)
                            .map(|i| e.held_locks.remove(i))
                    })
                };
                match found {
                    Some(l) => {
                        self.dlm.decref(l);
                        Ok(bytes::Bytes::new())
                    }
                    None => Err(TalusError::NotFound),
                }
            }
            other => {
                // Connect/Disconnect/Ping belong to the connection task,
                // never the request path.
                warn!(
                    self.log,
                    "control opcode {:?} on the request path, dropped",
                    other
                );
                return;
            }
        };

        // Steal-back: a resent request whose original reply still holds
        // locks inherits them instead of acquiring fresh ones.
        if reconstructed {
            let stolen = {
                let mut inner = self.inner.lock().unwrap();
                inner.scheduler.steal_locks(req.export, header.xid)
            };
            locks.extend(stolen);
        }

        let (status, body) = match status {
            Ok(body) => (Ok(()), body),
            Err(e) => (Err(e), bytes::Bytes::new()),
        };
        let reply = Message::Reply {
            header: ReplyHeader {
                opcode: header.opcode,
                xid: header.xid,
                transno,
                flags: header.flags & (MSG_RESENT | MSG_REPLAY),
                status,
                last_committed: self.ledger.last_committed(),
            },
            body,
        };

        let wire = {
            let inner = self.inner.lock().unwrap();
            inner
                .exports
                .get(&req.export)
                .and_then(|e| e.wire.clone())
        };
        let sent = match &wire {
            Some(w) => w.send(reply.clone()).is_ok(),
            None => false,
        };

        if locks.is_empty() {
            if !sent {
                debug!(
                    self.log,
                    "reply for {} dropped (no wire); client will resend",
                    header.xid
                );
            }
            return;
        }

        // Difficult reply: the locks ride the reply state until the
        // commit-notification path (or eviction) schedules it.
        let mut inner = self.inner.lock().unwrap();
        inner.scheduler.insert(
            req.export,
            client_id,
            header.xid,
            transno,
            reply,
            locks,
            sent,
        );
    }

    /// Tear down one scheduled difficult reply: locks released, unsent
    /// network state finalized.
    fn handle_one_reply(&self, r: ReplyState) {
        debug!(
            self.log,
            "releasing difficult reply xid {} ({} locks)",
            r.xid,
            r.locks.len()
        );
        for l in r.locks {
            self.dlm.decref(l);
        }
        if !r.sent {
            let wire = {
                let inner = self.inner.lock().unwrap();
                inner.exports.get(&r.export).and_then(|e| e.wire.clone())
            };
            if let Some(w) = wire {
                let _ = w.send(r.msg);
            }
        }
    }

    fn done_busy(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.busy = inner.busy.saturating_sub(1);
        drop(inner);
        self.notify.notify_waiters();
    }

    fn on_commit(&self, ev: CommitEvent) {
        let scheduled = {
            let mut inner = self.inner.lock().unwrap();
            inner.scheduler.schedule_commit(ev.client_id, ev.xid)
        };
        if scheduled {
            self.notify.notify_waiters();
        }
    }

    fn export_wire_closed(&self, handle: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = inner.exports.get_mut(&handle) {
            debug!(
                self.log,
                "connection to client {} lost; export stays", e.client_id
            );
            e.wire = None;
        }
    }

    async fn handle_disconnect(
        &self,
        client_id: Uuid,
        handle: Uuid,
        failover: bool,
    ) {
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(e) = inner.exports.get_mut(&handle) else {
                return;
            };
            if e.client_id != client_id {
                return;
            }
            if failover {
                e.wire = None;
                return;
            }

            // Clean disconnect: the slot, the locks, and any difficult
            // replies all go.
            let held = std::mem::take(&mut e.held_locks);
            for l in held {
                self.dlm.decref(l);
            }
            inner.exports.remove(&handle);
            inner.by_client.remove(&client_id);
            inner.scheduler.schedule_export(handle);
        }
        if let Err(e) = self.ledger.detach(client_id, failover) {
            warn!(self.log, "detach of {} failed: {}", client_id, e);
        }
        self.engine.client_gone(client_id).await;
        self.notify.notify_waiters();
        info!(
            self.log,
            "client {} disconnected ({})",
            client_id,
            if failover { "failover" } else { "clean" }
        );
    }

    /// Forcibly evict a client: its difficult replies are scheduled so
    /// their locks release, its held locks drop, and its ledger slot is
    /// preserved for a later reconnect (failover semantics).
    pub async fn evict(&self, client_id: Uuid) {
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(&handle) = inner.by_client.get(&client_id) else {
                return;
            };
            let e = inner.exports.get_mut(&handle).unwrap();
            e.evicted = true;
            e.wire = None;
            let held = std::mem::take(&mut e.held_locks);
            for l in held {
                self.dlm.decref(l);
            }
            inner.exports.remove(&handle);
            inner.by_client.remove(&client_id);
            inner.scheduler.schedule_export(handle);
        }
        self.engine.client_gone(client_id).await;
        self.notify.notify_waiters();
        warn!(self.log, "client {} evicted", client_id);
    }
}

/// Per-connection task: negotiation and control messages inline, requests
/// into the pool.
async fn connection_task(svc: Arc<Service>, wire: Wire) {
    let (tx, mut rx) = wire.split();
    let mut export: Option<Uuid> = None;

    while let Some(m) = rx.recv().await {
        match m {
            Message::Connect {
                version,
                client_id,
                prev_handle,
                gen: _,
            } => {
                export =
                    svc.handle_connect(version, client_id, prev_handle, &tx);
                if export.is_none() {
                    break;
                }
            }
            Message::Disconnect {
                client_id,
                handle,
                failover,
            } => {
                svc.handle_disconnect(client_id, handle, failover).await;
                break;
            }
            Message::Ping { xid, flags } => {
                svc.handle_ping(export, xid, flags, &tx);
            }
            Message::Request { header, body } => {
                svc.ingest(export, header, &body);
            }
            other => {
                warn!(svc.log, "unexpected message {:?}", other);
            }
        }
    }

    if let Some(h) = export {
        svc.export_wire_closed(h);
    }
}

async fn worker(svc: Arc<Service>, id: usize) {
    debug!(svc.log, "worker {} up", id);
    loop {
        let fut = svc.notify.notified();
        match svc.next_job() {
            Job::Request(req) => {
                svc.handle_one_request(req).await;
                svc.done_busy();
            }
            Job::Reply(r) => {
                svc.handle_one_reply(r);
            }
            Job::Idle => {
                fut.await;
            }
        }
    }
}

async fn commit_drain(
    svc: Arc<Service>,
    mut rx: mpsc::UnboundedReceiver<CommitEvent>,
) {
    while let Some(ev) = rx.recv().await {
        svc.on_commit(ev);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dlm::MemLockManager;
    use crate::store::MemStore;
    use std::time::Duration;

    fn csl() -> Logger {
        talus_common::build_plain_logger()
    }

    fn small_cfg() -> ServiceConfig {
        ServiceConfig {
            thread_count: 3,
            recovery_window: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fresh_service_is_healthy_and_not_recovering() {
        let svc = Service::start(
            small_cfg(),
            Arc::new(MemStore::new()),
            Arc::new(MemLockManager::new()),
            &csl(),
        )
        .unwrap();
        assert!(!svc.in_recovery());
        assert!(svc.healthy(Instant::now()));
    }

    #[tokio::test]
    async fn recovery_allowed_table_is_the_single_source() {
        // The recovery filter admits exactly the connect/control surface
        // plus reintegration, lock enqueue, close and sync.
        for op in [
            Opcode::Connect,
            Opcode::Disconnect,
            Opcode::Ping,
            Opcode::ReintRename,
            Opcode::LockEnqueue,
            Opcode::Close,
            Opcode::Sync,
        ] {
            assert!(RECOVERY_ALLOWED.contains(&op), "{:?} missing", op);
        }
        for op in [Opcode::Getattr, Opcode::Statfs, Opcode::Open] {
            assert!(!RECOVERY_ALLOWED.contains(&op), "{:?} extra", op);
        }
    }

    #[tokio::test]
    async fn restart_with_clients_opens_recovery_window() {
        let store: Arc<MemStore> = Arc::new(MemStore::new());

        // First incarnation: one client attaches.
        {
            let svc = Service::start(
                small_cfg(),
                store.clone(),
                Arc::new(MemLockManager::new()),
                &csl(),
            )
            .unwrap();
            svc.ledger().attach(Uuid::new_v4()).unwrap();
            assert!(!svc.in_recovery());
        }

        // Second incarnation on the same store sees the survivor.
        let svc = Service::start(
            small_cfg(),
            store,
            Arc::new(MemLockManager::new()),
            &csl(),
        )
        .unwrap();
        assert!(svc.in_recovery());

        // The deadline watcher eventually aborts the window.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!svc.in_recovery());
    }
}
