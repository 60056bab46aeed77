// Copyright 2025 Oxide Computer Company

#[cfg(test)]
pub(crate) mod protocol_test {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use slog::Logger;
    use tokio::time::{sleep, timeout, Duration};
    use uuid::Uuid;

    use crate::import::{Import, ImportConfig, ImportState};
    use crate::request::RequestOptions;
    use crate::set::RequestSet;
    use crate::{Pinger, XidAllocator};
    use talus_common::TalusError;
    use talus_protocol::wire::{Connector, MemNet, Wire};
    use talus_protocol::{
        Message, Opcode, ReconnectStatus, ReplyHeader, Transno, Xid,
        MSG_REPLAY, MSG_RESENT, TALUS_MESSAGE_VERSION,
    };

    fn csl() -> Logger {
        talus_common::build_plain_logger()
    }

    /// Scripted stand-in for a metadata server: answers the connect
    /// exchange, pongs pings, and replies to requests with an echo of the
    /// body, deduplicating on xid the way the real ledger does.
    #[derive(Debug)]
    struct DummyMds {
        handle: Uuid,
        next_transno: u64,
        committed: Transno,
        /// What the next connect reply claims about server recovery.
        recovering: bool,
        /// Evict the next reconnecting client instead of recovering it.
        evict_next: bool,
        /// Swallow this many replies before sending any more.
        drop_replies: usize,
        /// Follow every reply with a bulk payload carrying the same bytes.
        send_bulk: bool,
        /// xid -> (transno, reply body); hits skip re-execution.
        executed: HashMap<Xid, (Transno, Bytes)>,
        exec_count: usize,
        seen_flags: Vec<u32>,
    }

    impl DummyMds {
        fn new() -> Arc<Mutex<DummyMds>> {
            Arc::new(Mutex::new(DummyMds {
                handle: Uuid::new_v4(),
                next_transno: 0,
                committed: Transno::NONE,
                recovering: false,
                evict_next: false,
                drop_replies: 0,
                send_bulk: false,
                executed: HashMap::new(),
                exec_count: 0,
                seen_flags: Vec::new(),
            }))
        }
    }

    async fn serve_wire(state: Arc<Mutex<DummyMds>>, wire: Wire) {
        let (tx, mut rx) = wire.split();
        while let Some(m) = rx.recv().await {
            match m {
                Message::Connect { prev_handle, .. } => {
                    let mut st = state.lock().unwrap();
                    let reconnect = if prev_handle.is_nil() {
                        ReconnectStatus::First
                    } else if st.evict_next {
                        st.evict_next = false;
                        st.handle = Uuid::new_v4();
                        ReconnectStatus::Evicted
                    } else {
                        ReconnectStatus::Recovered
                    };
                    let _ = tx.send(Message::ConnectReply {
                        version: TALUS_MESSAGE_VERSION,
                        handle: st.handle,
                        reconnect,
                        recovering: st.recovering,
                        replayable: true,
                        last_committed: st.committed,
                    });
                }
                Message::Ping { xid, flags } => {
                    let st = state.lock().unwrap();
                    let _ = tx.send(Message::Pong {
                        xid,
                        flags,
                        last_committed: st.committed,
                    });
                }
                Message::Request { header, body } => {
                    let mut st = state.lock().unwrap();
                    st.seen_flags.push(header.flags);
                    let (transno, out) = match st.executed.get(&header.xid)
                    {
                        Some(prev) => prev.clone(),
                        None => {
                            st.exec_count += 1;
                            let transno = if header.opcode.is_reint() {
                                if header.transno.is_none() {
                                    st.next_transno += 1;
                                    Transno(st.next_transno)
                                } else {
                                    header.transno
                                }
                            } else {
                                Transno::NONE
                            };
                            let entry = (transno, body.clone());
                            st.executed.insert(header.xid, entry.clone());
                            entry
                        }
                    };
                    if st.drop_replies > 0 {
                        st.drop_replies -= 1;
                        continue;
                    }
                    let _ = tx.send(Message::Reply {
                        header: ReplyHeader {
                            opcode: header.opcode,
                            xid: header.xid,
                            transno,
                            flags: header.flags,
                            status: Ok(()),
                            last_committed: st.committed,
                        },
                        body: out.clone(),
                    });
                    if st.send_bulk {
                        let _ = tx.send(Message::BulkData {
                            xid: header.xid,
                            data: out,
                        });
                    }
                }
                _ => {}
            }
        }
    }

    fn start_dummy_mds(
        net: &Arc<MemNet>,
        state: Arc<Mutex<DummyMds>>,
    ) {
        let mut accepted = net.listen("mds0");
        tokio::spawn(async move {
            while let Some(wire) = accepted.recv().await {
                tokio::spawn(serve_wire(Arc::clone(&state), wire));
            }
        });
    }

    fn fast_config(net: &Arc<MemNet>) -> ImportConfig {
        ImportConfig {
            client_id: Uuid::new_v4(),
            targets: vec!["mds0".to_string()],
            connector: net.clone() as Arc<dyn Connector>,
            request_timeout: Duration::from_millis(300),
            ping_interval: Duration::from_millis(20),
            ping_timeout: Duration::from_millis(200),
            recoverable: true,
            lock_replayer: None,
            on_invalidate: None,
        }
    }

    async fn connected_import(cfg: ImportConfig) -> Arc<Import> {
        let imp = Import::new(cfg, XidAllocator::new(), &csl());
        imp.connect().unwrap();
        timeout(Duration::from_secs(5), imp.wait_for_full())
            .await
            .expect("import should reach Full");
        imp
    }

    #[tokio::test]
    async fn request_round_trip() {
        let net = MemNet::new();
        start_dummy_mds(&net, DummyMds::new());
        let imp = connected_import(fast_config(&net)).await;

        let (xid, waiter) = imp.new_request(
            Opcode::Getattr,
            Bytes::from_static(b"who am i"),
            RequestOptions::default(),
        );
        imp.send_new(xid);
        let reply = timeout(Duration::from_secs(5), waiter.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"who am i"));
    }

    #[tokio::test]
    async fn delayed_request_flushes_after_connect() {
        let net = MemNet::new();
        start_dummy_mds(&net, DummyMds::new());
        let imp = Import::new(fast_config(&net), XidAllocator::new(), &csl());

        // Issued before any connection exists: parks on the delayed list.
        let (xid, waiter) = imp.new_request(
            Opcode::Getattr,
            Bytes::from_static(b"early bird"),
            RequestOptions::default(),
        );
        imp.send_new(xid);
        assert_eq!(imp.state(), ImportState::New);

        imp.connect().unwrap();
        let reply = timeout(Duration::from_secs(5), waiter.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"early bird"));
    }

    #[tokio::test]
    async fn bulk_payload_gates_completion() {
        let net = MemNet::new();
        let state = DummyMds::new();
        start_dummy_mds(&net, Arc::clone(&state));
        state.lock().unwrap().send_bulk = true;
        let imp = connected_import(fast_config(&net)).await;

        // A request expecting a bulk transfer completes only once the
        // bulk payload lands, and the waiter sees the bulk bytes.
        let (xid, waiter) = imp.new_request(
            Opcode::Getattr,
            Bytes::from_static(b"bulk me"),
            RequestOptions {
                bulk: true,
                ..Default::default()
            },
        );
        imp.send_new(xid);
        let data = timeout(Duration::from_secs(5), waiter.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, Bytes::from_static(b"bulk me"));
    }

    #[tokio::test]
    async fn missing_bulk_leaves_request_pending() {
        let net = MemNet::new();
        start_dummy_mds(&net, DummyMds::new());
        let imp = connected_import(fast_config(&net)).await;

        // The control reply arrives but no bulk ever does; the request
        // must not complete on the reply alone.
        let (xid, mut waiter) = imp.new_request(
            Opcode::Getattr,
            Bytes::from_static(b"where is it"),
            RequestOptions {
                bulk: true,
                timeout: Duration::from_secs(30),
                ..Default::default()
            },
        );
        imp.send_new(xid);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(imp.request_phase(xid), Some(crate::Phase::Bulk));
        assert!(waiter.try_wait().is_none());
    }

    #[tokio::test]
    async fn set_of_concurrent_requests_completes() {
        let net = MemNet::new();
        start_dummy_mds(&net, DummyMds::new());
        let imp = connected_import(fast_config(&net)).await;

        let mut set = RequestSet::new(&csl());
        for i in 0..10u8 {
            let (xid, waiter) = imp.new_request(
                Opcode::Getattr,
                Bytes::from(vec![i]),
                RequestOptions::default(),
            );
            set.add(&imp, xid, waiter);
        }
        let results = timeout(Duration::from_secs(5), set.wait())
            .await
            .unwrap();
        assert_eq!(results.len(), 10);
        for r in &results {
            assert!(r.result.is_ok());
        }
    }

    #[tokio::test]
    async fn dropped_reply_is_resent_not_reexecuted() {
        let net = MemNet::new();
        let state = DummyMds::new();
        start_dummy_mds(&net, Arc::clone(&state));
        let imp = connected_import(fast_config(&net)).await;

        let pinger = Pinger::spawn(Duration::from_millis(20), &csl());
        pinger.register(&imp);

        // The server will execute the request but lose the reply.
        state.lock().unwrap().drop_replies = 1;

        let (xid, waiter) = imp.new_request(
            Opcode::ReintCreate,
            Bytes::from_static(b"mkdir /a"),
            RequestOptions::default(),
        );
        imp.send_new(xid);

        // The client times out, reconnects, and resends; the server's
        // dedup hands back the original result without re-executing.
        let reply = timeout(Duration::from_secs(10), waiter.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"mkdir /a"));

        let st = state.lock().unwrap();
        assert_eq!(st.exec_count, 1, "no re-execution on resend");
        assert!(
            st.seen_flags.iter().any(|f| f & MSG_RESENT != 0),
            "resend must carry MSG_RESENT"
        );
        drop(st);
        pinger.shutdown();
    }

    #[tokio::test]
    async fn replay_after_server_recovery() {
        let net = MemNet::new();
        let state = DummyMds::new();
        start_dummy_mds(&net, Arc::clone(&state));
        let imp = connected_import(fast_config(&net)).await;

        let pinger = Pinger::spawn(Duration::from_millis(20), &csl());
        pinger.register(&imp);

        // A mutating request: gets a transno, lands on the replay list
        // because the server has not committed it.
        let (xid, waiter) = imp.new_request(
            Opcode::ReintCreate,
            Bytes::from_static(b"mkdir /b"),
            RequestOptions::default(),
        );
        imp.send_new(xid);
        timeout(Duration::from_secs(5), waiter.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(imp.replay_pending(), 1);

        // Server "crashes": connection dies, and the next connect reply
        // declares the server in recovery.
        state.lock().unwrap().recovering = true;
        net.last_faults().unwrap().sever();

        // The pinger notices, reconnects, and the recovery driver replays
        // the retained request and completes the marker exchange.
        timeout(Duration::from_secs(10), imp.wait_for_full())
            .await
            .expect("recovery should finish");

        let st = state.lock().unwrap();
        assert!(
            st.seen_flags.iter().any(|f| f & MSG_REPLAY != 0),
            "replay must carry MSG_REPLAY"
        );
        assert_eq!(st.exec_count, 1, "replay reconstructs, never re-executes");
        drop(st);

        // Still uncommitted, so still retained for the next crash.
        assert_eq!(imp.replay_pending(), 1);
        pinger.shutdown();
    }

    #[tokio::test]
    async fn eviction_invalidates_outstanding_state() {
        let net = MemNet::new();
        let state = DummyMds::new();
        start_dummy_mds(&net, Arc::clone(&state));

        let invalidated = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let invalidated2 = Arc::clone(&invalidated);
        let mut cfg = fast_config(&net);
        cfg.on_invalidate = Some(Box::new(move || {
            invalidated2.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        let imp = connected_import(cfg).await;

        let pinger = Pinger::spawn(Duration::from_millis(20), &csl());
        pinger.register(&imp);

        // Leave something uncommitted on the replay list.
        let (xid, waiter) = imp.new_request(
            Opcode::ReintCreate,
            Bytes::from_static(b"mkdir /c"),
            RequestOptions::default(),
        );
        imp.send_new(xid);
        timeout(Duration::from_secs(5), waiter.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(imp.replay_pending(), 1);

        let old_handle = imp.remote_handle();
        state.lock().unwrap().evict_next = true;
        net.last_faults().unwrap().sever();

        timeout(Duration::from_secs(10), imp.wait_for_full())
            .await
            .expect("import should come back after eviction");

        assert!(invalidated.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(imp.replay_pending(), 0, "eviction clears the replay list");
        assert_ne!(imp.remote_handle(), old_handle);
        pinger.shutdown();
    }

    #[tokio::test]
    async fn connect_failure_leaves_import_retryable() {
        let net = MemNet::new();
        // No listener yet: connect refuses.
        let imp = Import::new(fast_config(&net), XidAllocator::new(), &csl());
        assert_eq!(imp.connect(), Err(TalusError::NotConnected));
        assert_eq!(imp.state(), ImportState::New);

        // A target appears; the pinger path can now get through.
        start_dummy_mds(&net, DummyMds::new());
        imp.connect().unwrap();
        timeout(Duration::from_secs(5), imp.wait_for_full())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pinger_reconnects_after_outage() {
        let net = MemNet::new();
        let state = DummyMds::new();
        start_dummy_mds(&net, Arc::clone(&state));
        let imp = connected_import(fast_config(&net)).await;

        let pinger = Pinger::spawn(Duration::from_millis(20), &csl());
        pinger.register(&imp);

        net.last_faults().unwrap().sever();

        // Give the pinger a beat to notice the dead wire.
        sleep(Duration::from_millis(100)).await;

        timeout(Duration::from_secs(10), imp.wait_for_full())
            .await
            .expect("pinger should re-establish the connection");
        pinger.shutdown();
    }
}
