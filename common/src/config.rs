// Copyright 2025 Oxide Computer Company
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Construction-time configuration for a server-side service.
///
/// Accepted as an opaque struct so callers can build one from whatever
/// configuration source they use; nothing here is re-read after the service
/// starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Receive buffers added per allocation group.
    pub buffers_per_group: usize,

    /// Size of one receive buffer, in bytes.  Each buffer can hold several
    /// back-to-back requests before it is recycled.
    pub buffer_size: usize,

    /// Largest request or reply message the service will accept.
    pub max_message_size: usize,

    /// Logical channel identifier requests arrive on.
    pub request_port: u16,

    /// Logical channel identifier replies are matched against.
    pub reply_port: u16,

    /// A service is unhealthy when its oldest queued request has waited
    /// longer than this.
    pub watchdog_timeout: Duration,

    /// Number of worker tasks servicing the request queue.
    pub thread_count: usize,

    /// How long reconnecting clients have to finish replay after a restart
    /// before recovery is abandoned.
    pub recovery_window: Duration,

    /// Maximum number of client ledger slots, including the reserved
    /// self-record in slot 0.
    pub max_clients: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            buffers_per_group: 8,
            buffer_size: 64 * 1024,
            max_message_size: 16 * 1024,
            request_port: 12,
            reply_port: 13,
            watchdog_timeout: Duration::from_secs(30),
            thread_count: 4,
            recovery_window: Duration::from_secs(60),
            max_clients: 128,
        }
    }
}
