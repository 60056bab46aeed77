// Copyright 2025 Oxide Computer Company
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use slog::{o, Logger};
use tokio::time::{sleep_until, Duration, Instant};

use crate::import::Import;
use crate::request::{Phase, RequestWaiter};
use talus_common::TalusError;
use talus_protocol::Xid;

/// Outcome of one member of a request set.
#[derive(Debug)]
pub struct MemberResult {
    pub xid: Xid,
    pub result: Result<Bytes, TalusError>,
}

/// Optional whole-set interpreter, run once after the final member
/// completes; it may remap the aggregate result in place.
pub type SetInterpreter = Box<dyn FnOnce(&mut Vec<MemberResult>) + Send>;

struct Member {
    import: Arc<Import>,
    xid: Xid,
    waiter: RequestWaiter,
    result: Option<Result<Bytes, TalusError>>,
}

/// An unordered collection of in-flight requests sharing one wait loop.
///
/// Completion is always re-evaluated by polling every member: the set wakes
/// on any import event or on the soonest in-flight deadline, never on
/// per-request wakeups, so membership changes cannot race event delivery.
pub struct RequestSet {
    members: Vec<Member>,
    interpreter: Option<SetInterpreter>,
    log: Logger,
}

impl RequestSet {
    pub fn new(log: &Logger) -> RequestSet {
        RequestSet {
            members: Vec::new(),
            interpreter: None,
            log: log.new(o!("" => "request set")),
        }
    }

    pub fn set_interpreter(&mut self, interp: SetInterpreter) {
        self.interpreter = Some(interp);
    }

    /// Add one request (already created on `import`) to the set.
    pub fn add(
        &mut self,
        import: &Arc<Import>,
        xid: Xid,
        waiter: RequestWaiter,
    ) {
        self.members.push(Member {
            import: Arc::clone(import),
            xid,
            waiter,
            result: None,
        });
    }

    /// Members that have not yet completed.
    pub fn remaining(&self) -> usize {
        self.members.iter().filter(|m| m.result.is_none()).count()
    }

    /// One poll pass: drive New members toward the wire, expire deadlines,
    /// and collect results.  Returns true when every member has completed.
    pub fn check_set(&mut self) -> bool {
        let now = Instant::now();
        let mut done = true;
        for m in &mut self.members {
            if m.result.is_some() {
                continue;
            }
            m.import.tick(now);
            if m.import.request_phase(m.xid) == Some(Phase::New) {
                m.import.send_new(m.xid);
            }
            if let Some(r) = m.waiter.try_wait() {
                slog::debug!(
                    self.log,
                    "member {} complete ({})",
                    m.xid,
                    if r.is_ok() { "ok" } else { "err" }
                );
                m.result = Some(r);
            }
            if m.result.is_none() {
                done = false;
            }
        }
        done
    }

    /// The soonest deadline of any in-flight member, if any is in flight.
    fn soonest_deadline(&self) -> Option<Instant> {
        self.members
            .iter()
            .filter(|m| m.result.is_none())
            .filter_map(|m| m.import.request_deadline(m.xid))
            .min()
    }

    /// Wait until every member completes, then hand back the per-member
    /// results (after the whole-set interpreter, if any, has had its say).
    ///
    /// A member that can never complete (for example, delayed on an import
    /// that never reconnects) holds the set open; callers bound their wait
    /// with a timeout if that is a possibility they care about.
    pub async fn wait(mut self) -> Vec<MemberResult> {
        while !self.check_set() {
            // Arm wakeups before re-checking: one future per distinct
            // import, plus the soonest in-flight deadline.  The fallback
            // poll keeps us honest if neither fires.
            let deadline = self
                .soonest_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(1));

            let mut events: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> =
                Vec::new();
            for m in &self.members {
                if m.result.is_none() {
                    let imp = Arc::clone(&m.import);
                    events.push(Box::pin(async move {
                        imp.notified_wait().await;
                    }));
                }
            }

            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = futures::future::select_all(events) => {}
            }
        }

        let mut results: Vec<MemberResult> = self
            .members
            .into_iter()
            .map(|m| MemberResult {
                xid: m.xid,
                result: m.result.unwrap(),
            })
            .collect();
        if let Some(interp) = self.interpreter {
            interp(&mut results);
        }
        results
    }
}

impl Import {
    pub(crate) async fn notified_wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::import::test::test_import;
    use crate::request::RequestOptions;
    use talus_protocol::Opcode;

    #[tokio::test]
    async fn empty_set_is_immediately_done() {
        let log = talus_common::build_plain_logger();
        let set = RequestSet::new(&log);
        assert!(set.wait().await.is_empty());
    }

    #[tokio::test]
    async fn rejected_members_complete_the_set() {
        let log = talus_common::build_plain_logger();
        let imp = test_import();
        let mut set = RequestSet::new(&log);
        for _ in 0..3 {
            let (xid, waiter) = imp.new_request(
                Opcode::Getattr,
                Bytes::new(),
                RequestOptions {
                    no_delay: true,
                    ..Default::default()
                },
            );
            set.add(&imp, xid, waiter);
        }
        let results = set.wait().await;
        assert_eq!(results.len(), 3);
        for r in results {
            assert_eq!(r.result, Err(TalusError::WouldBlock));
        }
    }

    #[tokio::test]
    async fn permanently_delayed_member_prevents_completion() {
        let log = talus_common::build_plain_logger();
        // Never connected, never will be.
        let imp = test_import();
        let mut set = RequestSet::new(&log);
        let (xid, waiter) =
            imp.new_request(Opcode::Getattr, Bytes::new(), Default::default());
        set.add(&imp, xid, waiter);

        let r = tokio::time::timeout(Duration::from_millis(250), set.wait())
            .await;
        assert!(r.is_err(), "set must not complete");
    }

    #[tokio::test]
    async fn interpreter_remaps_aggregate_result() {
        let log = talus_common::build_plain_logger();
        let imp = test_import();
        let mut set = RequestSet::new(&log);
        let (xid, waiter) = imp.new_request(
            Opcode::Getattr,
            Bytes::new(),
            RequestOptions {
                no_delay: true,
                ..Default::default()
            },
        );
        set.add(&imp, xid, waiter);
        set.set_interpreter(Box::new(|results| {
            for r in results.iter_mut() {
                // The set-level view decides a would-block member is fine.
                if r.result == Err(TalusError::WouldBlock) {
                    r.result = Ok(Bytes::new());
                }
            }
        }));
        let results = set.wait().await;
        assert!(results[0].result.is_ok());
    }

    #[tokio::test]
    async fn directly_completed_member_is_collected() {
        let log = talus_common::build_plain_logger();
        let imp = test_import();
        let mut set = RequestSet::new(&log);
        let (xid, waiter) =
            imp.new_request(Opcode::Statfs, Bytes::new(), Default::default());
        set.add(&imp, xid, waiter);

        assert_eq!(set.remaining(), 1);
        assert!(!set.check_set());

        // Complete the request from underneath the set, as a reply would.
        {
            let mut inner = imp.inner.lock().unwrap();
            let req = inner.active.get_mut(&xid).unwrap();
            req.finish(Ok(Bytes::from_static(b"stat")));
        }
        let results = set.wait().await;
        assert_eq!(
            results[0].result,
            Ok(Bytes::from_static(b"stat"))
        );
    }
}
