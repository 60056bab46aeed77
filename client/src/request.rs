// Copyright 2025 Oxide Computer Company
use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use talus_common::TalusError;
use talus_protocol::{Opcode, ReplyHeader, Transno, Xid};

/// Lifecycle phase of one request.
///
/// Phases only move forward, with two exceptions: a request that was in
/// flight when its connection died is requeued (back to `New`) for resend,
/// and a completed request retained for replay is re-marked `Rpc` when it is
/// replayed.  All mutation goes through [`ClientRequest::set_phase`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    New,
    Rpc,
    Bulk,
    Interpret,
    Complete,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::New => write!(f, "New"),
            Phase::Rpc => write!(f, "Rpc"),
            Phase::Bulk => write!(f, "Bulk"),
            Phase::Interpret => write!(f, "Interpret"),
            Phase::Complete => write!(f, "Complete"),
        }
    }
}

/// Per-request behavior flags.
#[derive(Copy, Clone, Debug, Default)]
pub struct RequestFlags {
    /// This transmission is a resend of an earlier one (same xid).
    pub resend: bool,
    /// This request is being replayed after reconnection, carrying its
    /// original transno.
    pub replay: bool,
    /// The caller asked to interrupt.  Advisory: the request is only
    /// abandoned once it has also timed out.
    pub intr: bool,
    /// The in-flight deadline expired at least once.
    pub timedout: bool,
    /// The request failed locally before or during transmission.
    pub err: bool,
    /// Fail rather than resend after a transport failure.
    pub no_resend: bool,
    /// Fail rather than park when the import cannot send right now.
    pub no_delay: bool,
}

/// Caller-supplied knobs for one request.
pub struct RequestOptions {
    pub timeout: Duration,
    pub no_resend: bool,
    pub no_delay: bool,
    /// Expect a bulk payload in addition to the control reply.
    pub bulk: bool,
    /// Invoked exactly once when the reply is ready (success or failure),
    /// before the waiter is woken.
    pub interpreter: Option<Interpreter>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            timeout: Duration::from_secs(30),
            no_resend: false,
            no_delay: false,
            bulk: false,
            interpreter: None,
        }
    }
}

pub type Interpreter =
    Box<dyn FnOnce(Xid, &Result<Bytes, TalusError>) + Send>;

/// Bulk transfer bookkeeping for one request.
#[derive(Debug, Default)]
pub(crate) struct BulkState {
    pub data: Option<Bytes>,
    /// Registration with the transport; cleared by [`ClientRequest::
    /// unregister`], which must stay idempotent.
    pub registered: bool,
}

/**
 * Couple a request with a notifier for calling code. This uses a single-use
 * channel to send the result of a particular operation, and is meant to be
 * paired with a RequestWaiter.
 */
#[must_use]
#[derive(Debug)]
pub(crate) struct RequestRes {
    sender: mpsc::Sender<Result<Bytes, TalusError>>,
}

impl RequestRes {
    /// Consume this RequestRes and send a result to the receiver.
    pub fn send_result(self, r: Result<Bytes, TalusError>) {
        // The channel holds one slot and this is the only sender, so the
        // only failure mode is a waiter that went away.  That is fine.
        let _ = self.sender.try_send(r);
    }
}

/**
 * When a request is issued, the calling function receives a waiter that it
 * can block on.
 */
#[must_use]
pub struct RequestWaiter {
    recv: mpsc::Receiver<Result<Bytes, TalusError>>,
}

impl RequestWaiter {
    /// Consume this RequestWaiter and wait on the result.
    pub async fn wait(mut self) -> Result<Bytes, TalusError> {
        match self.recv.recv().await {
            Some(v) => v,
            None => Err(TalusError::RecvDisconnected),
        }
    }

    /// Poll for the result without blocking.
    pub fn try_wait(&mut self) -> Option<Result<Bytes, TalusError>> {
        match self.recv.try_recv() {
            Ok(v) => Some(v),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Some(Err(TalusError::RecvDisconnected))
            }
        }
    }
}

pub(crate) fn request_channel() -> (RequestRes, RequestWaiter) {
    let (sender, recv) = mpsc::channel(1);
    (RequestRes { sender }, RequestWaiter { recv })
}

/// One outstanding RPC.
///
/// Owned by the import's active table from creation until it is both
/// complete and off the replay list; the replay list and any request set
/// refer to it by xid only.
pub(crate) struct ClientRequest {
    pub xid: Xid,
    pub opcode: Opcode,
    pub body: Bytes,
    pub flags: RequestFlags,
    phase: Phase,
    /// Assigned by the server on first successful processing; stable across
    /// resends and replays.
    pub transno: Transno,
    /// Import generation stamped at each transmission.
    pub generation: u64,
    pub timeout: Duration,
    pub deadline: Instant,
    pub reply: Option<ReplyHeader>,
    pub reply_body: Option<Bytes>,
    pub bulk: Option<BulkState>,
    /// Reply registration with the transport; cleared by `unregister`.
    pub registered: bool,
    pub send_count: u32,
    interpreter: Option<Interpreter>,
    res: Option<RequestRes>,
}

impl ClientRequest {
    pub fn new(
        xid: Xid,
        opcode: Opcode,
        body: Bytes,
        opts: RequestOptions,
        res: RequestRes,
    ) -> Self {
        ClientRequest {
            xid,
            opcode,
            body,
            flags: RequestFlags {
                no_resend: opts.no_resend,
                no_delay: opts.no_delay,
                ..Default::default()
            },
            phase: Phase::New,
            transno: Transno::NONE,
            generation: 0,
            timeout: opts.timeout,
            deadline: Instant::now() + opts.timeout,
            reply: None,
            reply_body: None,
            bulk: if opts.bulk {
                Some(BulkState::default())
            } else {
                None
            },
            registered: false,
            send_count: 0,
            interpreter: opts.interpreter,
            res: Some(res),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The one place request phases change.
    ///
    /// # Panics
    /// On a transition the lifecycle does not allow.
    pub fn set_phase(&mut self, new: Phase) {
        let ok = match (self.phase, new) {
            (Phase::New, Phase::Rpc) => true,
            // A request rejected before transmission jumps straight to
            // interpretation of its error.
            (Phase::New, Phase::Interpret) => true,
            // Requeue after a connection failure.
            (Phase::Rpc, Phase::New) => true,
            (Phase::Bulk, Phase::New) => true,
            (Phase::Rpc, Phase::Bulk) => true,
            (Phase::Rpc, Phase::Interpret) => true,
            (Phase::Bulk, Phase::Interpret) => true,
            (Phase::Interpret, Phase::Complete) => true,
            // Replay of a retained, completed request.
            (Phase::Complete, Phase::Rpc) => self.flags.replay,
            _ => false,
        };
        assert!(
            ok,
            "request {} illegal phase transition {} -> {}",
            self.xid, self.phase, new
        );
        self.phase = new;
    }

    /// Tear down transport registrations for this request.
    ///
    /// Callable redundantly from timeout, completion, and explicit abort;
    /// repeating it is a no-op.
    pub fn unregister(&mut self) {
        self.registered = false;
        if let Some(bulk) = &mut self.bulk {
            bulk.registered = false;
        }
    }

    /// Whether the control-plane reply for this request has arrived.
    pub fn replied(&self) -> bool {
        self.reply.is_some()
    }

    /// Whether this request still gates on a bulk transfer.
    pub fn bulk_pending(&self) -> bool {
        match &self.bulk {
            Some(b) => b.data.is_none(),
            None => false,
        }
    }

    /// Run the interpreter and wake the waiter, then mark the request
    /// complete.  Idempotent in effect: both the interpreter and the
    /// notifier are single-shot, so a second call on a completed request
    /// would panic in `set_phase` instead of double-delivering.
    pub fn finish(&mut self, result: Result<Bytes, TalusError>) {
        self.unregister();
        if self.phase != Phase::Interpret {
            self.set_phase(Phase::Interpret);
        }
        if let Some(interp) = self.interpreter.take() {
            interp(self.xid, &result);
        }
        if let Some(res) = self.res.take() {
            res.send_result(result);
        }
        self.set_phase(Phase::Complete);
    }
}

impl std::fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRequest")
            .field("xid", &self.xid)
            .field("opcode", &self.opcode)
            .field("phase", &self.phase)
            .field("transno", &self.transno)
            .field("flags", &self.flags)
            .finish()
    }
}

/// `ActiveRequests` tracks this import's requests by xid.
///
/// It exposes an API that roughly matches a `BTreeMap<Xid, ClientRequest>`.
/// Requests are only ever removed through [`ActiveRequests::remove`], so the
/// import can enforce its retention rules (complete, and off the replay
/// list) in one place.
#[derive(Debug, Default)]
pub(crate) struct ActiveRequests {
    requests: BTreeMap<Xid, ClientRequest>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        ActiveRequests {
            requests: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn get(&self, xid: &Xid) -> Option<&ClientRequest> {
        self.requests.get(xid)
    }

    #[inline]
    pub fn get_mut(&mut self, xid: &Xid) -> Option<&mut ClientRequest> {
        self.requests.get_mut(xid)
    }

    #[inline]
    pub fn insert(&mut self, req: ClientRequest) {
        let prev = self.requests.insert(req.xid, req);
        assert!(prev.is_none(), "xid reused in active table");
    }

    #[inline]
    pub fn remove(&mut self, xid: &Xid) -> Option<ClientRequest> {
        self.requests.remove(xid)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    #[inline]
    pub fn keys(&self) -> impl Iterator<Item = Xid> + '_ {
        self.requests.keys().copied()
    }

    /// Applies a function across all requests.
    #[inline]
    pub fn for_each<F: FnMut(&Xid, &mut ClientRequest)>(&mut self, mut f: F) {
        for (xid, req) in self.requests.iter_mut() {
            f(xid, req);
        }
    }
}
