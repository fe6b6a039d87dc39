//! Logging macros that set target to "amqpool" for all log calls.
//!
//! Without an explicit target, tracing uses the full module path
//! (e.g., "amqpool::upstream::pool"), creating overly verbose logger names.
//! These macros ensure all logs from this crate use a single "amqpool" target.

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!(target: "amqpool", $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!(target: "amqpool", $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!(target: "amqpool", $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!(target: "amqpool", $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!(target: "amqpool", $($arg)*) };
}
