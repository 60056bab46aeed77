// Copyright 2025 Oxide Computer Company
use slog::{o, Drain, Logger};

pub mod config;
pub mod error;
pub mod ids;
pub mod lock;

pub use config::ServiceConfig;
pub use error::TalusError;
pub use ids::{FileId, ObjectAttrs, ObjectKind, SetAttrs};
pub use lock::{LockMode, PolicyBits};

/// Build the root logger used by every talus component.
///
/// Components derive children from this with identifying key/value pairs,
/// e.g. `log.new(o!("import" => target.clone()))`.
pub fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    Logger::root(drain, o!())
}

/// Build a plain (synchronous) logger for tests, where the async drain's
/// worker thread outlives the runtime and garbles output ordering.
pub fn build_plain_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}
