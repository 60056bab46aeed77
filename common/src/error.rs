// Copyright 2025 Oxide Computer Company
use serde::{Deserialize, Serialize};

/// Errors produced by the request/recovery core.
///
/// This enum rides inside reply status fields on the wire, so it must stay
/// serializable and comparable.  Variants fall into the buckets described in
/// the error taxonomy: transport-transient conditions are absorbed by the
/// resend/reconnect machinery and rarely surface; recoverable-state
/// conditions trigger import invalidation; application-level conditions are
/// returned verbatim to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum TalusError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Not connected to the target")]
    NotConnected,

    #[error("A connect attempt is already in flight")]
    AlreadyConnecting,

    #[error("Already connected to the target")]
    AlreadyConnected,

    #[error("Request timed out")]
    TimedOut,

    #[error("Request would block and the caller disallowed waiting")]
    WouldBlock,

    #[error("Request interrupted")]
    Interrupted,

    #[error("Target is recovering, try again")]
    TryAgain,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message version mismatch, expected {expected} got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Session handle mismatch")]
    HandleMismatch,

    #[error("Import generation is stale")]
    StaleGeneration,

    #[error("Import is closed")]
    ImportClosed,

    #[error("Import is administratively invalid")]
    ImportInvalid,

    #[error("Request failed and may not be resent")]
    NoResend,

    #[error("No such object")]
    NotFound,

    #[error("Object already exists")]
    Exists,

    #[error("Object is a directory")]
    IsDirectory,

    #[error("Object is not a directory")]
    NotDirectory,

    #[error("Directory is not empty")]
    NotEmpty,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Filesystem is read-only")]
    ReadOnly,

    #[error("Client ledger has no free slots")]
    LedgerFull,

    #[error("Lock acquisition failed: {0}")]
    LockFailed(String),

    #[error("Receive channel disconnected")]
    RecvDisconnected,
}

impl From<std::io::Error> for TalusError {
    fn from(e: std::io::Error) -> Self {
        TalusError::IoError(e.to_string())
    }
}

impl From<anyhow::Error> for TalusError {
    fn from(e: anyhow::Error) -> Self {
        TalusError::IoError(format!("{:#}", e))
    }
}

impl From<bincode::Error> for TalusError {
    fn from(e: bincode::Error) -> Self {
        TalusError::Protocol(e.to_string())
    }
}

#[macro_export]
macro_rules! talus_bail {
    ($i:ident) => {
        return Err($crate::TalusError::$i)
    };
    ($i:ident, $str:expr) => {
        return Err($crate::TalusError::$i($str.to_string()))
    };
    ($i:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::TalusError::$i(format!($fmt, $($arg)*)))
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_round_trips_through_serde() {
        let e = TalusError::VersionMismatch {
            expected: 3,
            actual: 1,
        };
        let bytes = bincode::serialize(&e).unwrap();
        let back: TalusError = bincode::deserialize(&bytes).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn bail_returns_the_variant() {
        fn fails() -> Result<(), TalusError> {
            talus_bail!(NotConnected);
        }
        assert_eq!(fails(), Err(TalusError::NotConnected));

        fn fails_fmt() -> Result<(), TalusError> {
            talus_bail!(Protocol, "bad opcode {}", 77);
        }
        assert_eq!(
            fails_fmt(),
            Err(TalusError::Protocol("bad opcode 77".to_string()))
        );
    }
}
