// Copyright 2025 Oxide Computer Company
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::{Duration, Instant};

pub use talus_common::{TalusError, build_logger};
pub use talus_protocol::*;

mod dummy_server_tests;
mod import;
mod pinger;
mod recover;
mod request;
mod set;

pub use import::{Import, ImportConfig, ImportState, SendDecision};
pub use pinger::Pinger;
pub use recover::LockReplayer;
pub use request::{Phase, RequestFlags, RequestOptions, RequestWaiter};
pub use set::{MemberResult, RequestSet};

/// Process-wide xid allocation.
///
/// Xids must be unique and strictly increasing across every import in the
/// process; this is an explicit handle rather than hidden static state so
/// tests can construct isolated instances.  Clones share the counter.
#[derive(Clone, Debug)]
pub struct XidAllocator {
    next: Arc<AtomicU64>,
}

impl XidAllocator {
    pub fn new() -> Self {
        XidAllocator {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next(&self) -> Xid {
        Xid(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for XidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn deadline_secs(secs: f32) -> Instant {
    Instant::now()
        .checked_add(Duration::from_secs_f32(secs))
        .unwrap()
}
