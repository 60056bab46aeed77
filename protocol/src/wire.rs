// Copyright 2025 Oxide Computer Company
//! In-memory message transport.
//!
//! The transport collaborator is an abstract message-passing layer; this
//! module provides the in-process realization used by the core and its
//! tests.  Completion is observed as channel events (a send either enters
//! the peer's receive queue or fails immediately; a receive is an awaited
//! channel read), which removes any need for completion callbacks running
//! in special contexts.
//!
//! Fault injection is part of the interface on purpose: dropping a reply or
//! severing a connection is how the recovery machinery gets exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

use crate::Message;
use talus_common::TalusError;

/// Shared fault state for one wire pair.
///
/// `drop` counts are indexed by direction; a nonzero count makes the next
/// sends in that direction vanish silently, which is how a lost reply is
/// simulated.
#[derive(Debug, Default)]
pub struct WireFaults {
    severed: AtomicBool,
    sever_notify: Notify,
    drop: [AtomicUsize; 2],
}

impl WireFaults {
    /// Kill the connection in both directions.  New sends fail, and
    /// blocked receivers wake up empty-handed.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
        self.sever_notify.notify_waiters();
    }

    pub fn is_severed(&self) -> bool {
        self.severed.load(Ordering::SeqCst)
    }

    /// Silently discard the next `n` messages sent from the first endpoint
    /// of the pair (the client half handed out by [`MemNet::connect`]).
    pub fn drop_next_from_first(&self, n: usize) {
        self.drop[0].fetch_add(n, Ordering::SeqCst);
    }

    /// Silently discard the next `n` messages sent from the second endpoint
    /// (the server half).
    pub fn drop_next_from_second(&self, n: usize) {
        self.drop[1].fetch_add(n, Ordering::SeqCst);
    }

    fn should_drop(&self, dir: usize) -> bool {
        let ctr = &self.drop[dir];
        loop {
            let cur = ctr.load(Ordering::SeqCst);
            if cur == 0 {
                return false;
            }
            if ctr
                .compare_exchange(
                    cur,
                    cur - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// Sending half of a wire endpoint.  Cheap to clone; every holder sends
/// into the same peer queue.
#[derive(Clone, Debug)]
pub struct WireSender {
    tx: mpsc::UnboundedSender<Message>,
    faults: Arc<WireFaults>,
    dir: usize,
}

impl WireSender {
    /// Queue a message for the peer.
    ///
    /// A send on a severed or closed wire fails with `NotConnected`; a send
    /// eaten by fault injection reports success, exactly like a message
    /// lost on a real network.
    pub fn send(&self, m: Message) -> Result<(), TalusError> {
        if self.faults.is_severed() {
            return Err(TalusError::NotConnected);
        }
        if self.faults.should_drop(self.dir) {
            return Ok(());
        }
        self.tx.send(m).map_err(|_| TalusError::NotConnected)
    }

    pub fn faults(&self) -> Arc<WireFaults> {
        Arc::clone(&self.faults)
    }
}

/// Receiving half of a wire endpoint.
#[derive(Debug)]
pub struct WireReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
    faults: Arc<WireFaults>,
}

impl WireReceiver {
    /// Wait for the next message.  Returns `None` once the wire is severed
    /// or the peer's sender is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        let severed = self.faults.sever_notify.notified();
        if self.faults.is_severed() {
            return None;
        }
        tokio::select! {
            m = self.rx.recv() => m,
            _ = severed => None,
        }
    }
}

/// One endpoint of a bidirectional in-memory wire.
#[derive(Debug)]
pub struct Wire {
    pub sender: WireSender,
    pub receiver: WireReceiver,
}

impl Wire {
    pub fn split(self) -> (WireSender, WireReceiver) {
        (self.sender, self.receiver)
    }

    pub fn faults(&self) -> Arc<WireFaults> {
        self.sender.faults()
    }
}

/// Build a connected pair of endpoints sharing one fault state.
pub fn wire_pair() -> (Wire, Wire) {
    let faults = Arc::new(WireFaults::default());
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a = Wire {
        sender: WireSender {
            tx: a_tx,
            faults: Arc::clone(&faults),
            dir: 0,
        },
        receiver: WireReceiver {
            rx: a_rx,
            faults: Arc::clone(&faults),
        },
    };
    let b = Wire {
        sender: WireSender {
            tx: b_tx,
            faults: Arc::clone(&faults),
            dir: 1,
        },
        receiver: WireReceiver {
            rx: b_rx,
            faults,
        },
    };
    (a, b)
}

/// Something that can open a wire to a named target.
///
/// The client's connect path is written against this trait so tests can
/// interpose flaky or refusing transports.
pub trait Connector: Send + Sync {
    fn connect(&self, target: &str) -> Result<Wire, TalusError>;
}

/// Process-local network: a registry of named listeners.
///
/// `connect` builds a wire pair, hands the second endpoint to the listener,
/// and returns the first to the caller.
#[derive(Default)]
pub struct MemNet {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<Wire>>>,
    last_faults: Mutex<Option<Arc<WireFaults>>>,
}

impl MemNet {
    pub fn new() -> Arc<MemNet> {
        Arc::new(MemNet::default())
    }

    /// Register a listener under `name`, returning the stream of accepted
    /// wires.  A second listener under the same name replaces the first.
    pub fn listen(&self, name: &str) -> mpsc::UnboundedReceiver<Wire> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().insert(name.to_string(), tx);
        rx
    }

    /// Drop the listener registered under `name`, making connects fail
    /// until a new listener appears.  Used to simulate a crashed target.
    pub fn unlisten(&self, name: &str) {
        self.listeners.lock().unwrap().remove(name);
    }

    /// Fault handle of the most recently established connection, for tests
    /// that need to lose or sever traffic after connecting.
    pub fn last_faults(&self) -> Option<Arc<WireFaults>> {
        self.last_faults.lock().unwrap().clone()
    }
}

impl Connector for MemNet {
    fn connect(&self, target: &str) -> Result<Wire, TalusError> {
        let listeners = self.listeners.lock().unwrap();
        let Some(accept_tx) = listeners.get(target) else {
            return Err(TalusError::NotConnected);
        };
        let (client, server) = wire_pair();
        *self.last_faults.lock().unwrap() = Some(client.faults());
        accept_tx
            .send(server)
            .map_err(|_| TalusError::NotConnected)?;
        Ok(client)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Xid;

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (a, mut b) = wire_pair();
        a.sender.send(Message::Ping { xid: Xid(1), flags: 0 }).unwrap();
        a.sender.send(Message::Ping { xid: Xid(2), flags: 0 }).unwrap();

        match b.receiver.recv().await.unwrap() {
            Message::Ping { xid, .. } => assert_eq!(xid, Xid(1)),
            m => panic!("unexpected message {:?}", m),
        }
        match b.receiver.recv().await.unwrap() {
            Message::Ping { xid, .. } => assert_eq!(xid, Xid(2)),
            m => panic!("unexpected message {:?}", m),
        }
    }

    #[tokio::test]
    async fn dropped_sends_vanish() {
        let (a, mut b) = wire_pair();
        a.faults().drop_next_from_first(1);
        a.sender.send(Message::Ping { xid: Xid(1), flags: 0 }).unwrap();
        a.sender.send(Message::Ping { xid: Xid(2), flags: 0 }).unwrap();

        // Only the second ping survives.
        match b.receiver.recv().await.unwrap() {
            Message::Ping { xid, .. } => assert_eq!(xid, Xid(2)),
            m => panic!("unexpected message {:?}", m),
        }
    }

    #[tokio::test]
    async fn severed_wire_fails_sends_and_recvs() {
        let (a, mut b) = wire_pair();
        a.faults().sever();
        assert_eq!(
            a.sender.send(Message::Ping { xid: Xid(1), flags: 0 }),
            Err(TalusError::NotConnected)
        );
        assert!(b.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn memnet_connects_to_listener() {
        let net = MemNet::new();
        let mut accepted = net.listen("mds0");

        assert!(net.connect("nope").is_err());

        let client = net.connect("mds0").unwrap();
        let mut server = accepted.recv().await.unwrap();

        client
            .sender
            .send(Message::Ping { xid: Xid(9), flags: 0 })
            .unwrap();
        assert!(matches!(
            server.receiver.recv().await,
            Some(Message::Ping { .. })
        ));
    }
}
