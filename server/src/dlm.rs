// Copyright 2025 Oxide Computer Company
//! Distributed-lock-manager collaborator.
//!
//! The real lock manager lives elsewhere; this core only dictates the
//! *order* in which resources are locked (see `lock_order`).  The trait
//! here is the slice of the DLM contract the engine consumes: blocking
//! enqueue with modes and policy bits, and reference-counted release.
//! Grant notification is channel-based; there are no callbacks running in
//! special contexts.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;

use talus_common::{FileId, TalusError};

pub use talus_common::{LockMode, PolicyBits};

/// One granted lock reference.  Dropping it does NOT release the lock;
/// every reference is explicitly returned through [`LockManager::decref`]
/// so that holders (reply states, the engine, evicted exports) stay
/// auditable.
#[derive(Debug)]
pub struct LockRef {
    pub resource: FileId,
    pub mode: LockMode,
    pub policy: PolicyBits,
    pub(crate) cookie: u64,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Enqueue a lock request and wait for the grant.
    async fn enqueue(
        &self,
        resource: FileId,
        mode: LockMode,
        policy: PolicyBits,
    ) -> Result<LockRef, TalusError>;

    /// Return one reference.  The last reference on a resource wakes
    /// compatible waiters in FIFO order.
    fn decref(&self, lock: LockRef);

    /// Granted-lock count on a resource, for tests and eviction audits.
    fn granted(&self, resource: FileId) -> usize;
}

struct Waiter {
    cookie: u64,
    mode: LockMode,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct ResState {
    granted: Vec<(u64, LockMode)>,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct MemLockInner {
    resources: HashMap<FileId, ResState>,
    next_cookie: u64,
}

/// In-memory lock manager with FIFO grant order.
#[derive(Default)]
pub struct MemLockManager {
    inner: Mutex<MemLockInner>,
}

impl MemLockManager {
    pub fn new() -> MemLockManager {
        MemLockManager::default()
    }
}

#[async_trait]
impl LockManager for MemLockManager {
    async fn enqueue(
        &self,
        resource: FileId,
        mode: LockMode,
        policy: PolicyBits,
    ) -> Result<LockRef, TalusError> {
        if resource.is_empty() {
            return Err(TalusError::LockFailed(
                "cannot lock the empty resource".to_string(),
            ));
        }
        let (rx, cookie) = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_cookie += 1;
            let cookie = inner.next_cookie;
            let res = inner.resources.entry(resource).or_default();
            // FIFO: a new request must also queue behind existing waiters,
            // or writers would starve.
            if res.waiters.is_empty()
                && res.granted.iter().all(|(_, g)| g.compatible(mode))
            {
                res.granted.push((cookie, mode));
                return Ok(LockRef {
                    resource,
                    mode,
                    policy,
                    cookie,
                });
            }
            let (tx, rx) = oneshot::channel();
            res.waiters.push_back(Waiter { cookie, mode, tx });
            (rx, cookie)
        };
        match rx.await {
            Ok(()) => Ok(LockRef {
                resource,
                mode,
                policy,
                cookie,
            }),
            Err(_) => Err(TalusError::LockFailed(
                "lock manager went away".to_string(),
            )),
        }
    }

    fn decref(&self, lock: LockRef) {
        let mut inner = self.inner.lock().unwrap();
        let Some(res) = inner.resources.get_mut(&lock.resource) else {
            return;
        };
        res.granted.retain(|(c, _)| *c != lock.cookie);

        // Promote waiters in order while they remain compatible with
        // everything granted.
        while let Some(w) = res.waiters.front() {
            if res.granted.iter().all(|(_, g)| g.compatible(w.mode)) {
                let w = res.waiters.pop_front().unwrap();
                res.granted.push((w.cookie, w.mode));
                // A receiver that gave up just forfeits the grant; take
                // the reference back.
                if w.tx.send(()).is_err() {
                    res.granted.retain(|(c, _)| *c != w.cookie);
                }
            } else {
                break;
            }
        }
        if res.granted.is_empty() && res.waiters.is_empty() {
            inner.resources.remove(&lock.resource);
        }
    }

    fn granted(&self, resource: FileId) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .resources
            .get(&resource)
            .map(|r| r.granted.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn compatible_locks_grant_together() {
        let dlm = MemLockManager::new();
        let r = FileId::new(10, 1);
        let a = dlm
            .enqueue(r, LockMode::ProtectedRead, PolicyBits::LOOKUP)
            .await
            .unwrap();
        let b = dlm
            .enqueue(r, LockMode::ProtectedRead, PolicyBits::LOOKUP)
            .await
            .unwrap();
        assert_eq!(dlm.granted(r), 2);
        dlm.decref(a);
        dlm.decref(b);
        assert_eq!(dlm.granted(r), 0);
    }

    #[tokio::test]
    async fn exclusive_waits_for_release() {
        let dlm = Arc::new(MemLockManager::new());
        let r = FileId::new(10, 1);
        let held = dlm
            .enqueue(r, LockMode::ProtectedWrite, PolicyBits::UPDATE)
            .await
            .unwrap();

        let dlm2 = Arc::clone(&dlm);
        let waiter = tokio::spawn(async move {
            dlm2.enqueue(r, LockMode::Exclusive, PolicyBits::FULL).await
        });

        // The exclusive request must not be granted while PW is held.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        dlm.decref(held);
        let got = timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.mode, LockMode::Exclusive);
        dlm.decref(got);
    }

    #[tokio::test]
    async fn empty_resource_is_not_lockable() {
        let dlm = MemLockManager::new();
        let r = FileId::EMPTY;
        assert!(matches!(
            dlm.enqueue(r, LockMode::Exclusive, PolicyBits::FULL).await,
            Err(TalusError::LockFailed(_))
        ));
    }
}
