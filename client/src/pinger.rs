// Copyright 2025 Oxide Computer Company
use std::sync::{Arc, Mutex};

use slog::{info, o, Logger};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::import::Import;

/// Background liveness driver.
///
/// One pinger per process: every registered import gets a beat each
/// interval, which sends pings, expires deadlines, and retries connects for
/// imports sitting in Disconn.  An explicit service object rather than a
/// hidden static, so tests construct isolated instances.
pub struct Pinger {
    imports: Arc<Mutex<Vec<Arc<Import>>>>,
    handle: JoinHandle<()>,
    log: Logger,
}

impl Pinger {
    pub fn spawn(interval: Duration, log: &Logger) -> Pinger {
        let log = log.new(o!("" => "pinger"));
        let imports: Arc<Mutex<Vec<Arc<Import>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let run_imports = Arc::clone(&imports);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                ticker.tick().await;
                let snapshot: Vec<Arc<Import>> =
                    run_imports.lock().unwrap().clone();
                let now = Instant::now();
                for imp in snapshot {
                    imp.pinger_tick(now);
                }
            }
        });

        Pinger {
            imports,
            handle,
            log,
        }
    }

    pub fn register(&self, imp: &Arc<Import>) {
        let mut imports = self.imports.lock().unwrap();
        if !imports.iter().any(|i| Arc::ptr_eq(i, imp)) {
            imports.push(Arc::clone(imp));
        }
    }

    pub fn deregister(&self, imp: &Arc<Import>) {
        self.imports.lock().unwrap().retain(|i| !Arc::ptr_eq(i, imp));
    }

    pub fn registered(&self) -> usize {
        self.imports.lock().unwrap().len()
    }

    /// Stop the beat.  Imports are left as they are.
    pub fn shutdown(self) {
        info!(self.log, "pinger shutting down");
        self.handle.abort();
    }
}
