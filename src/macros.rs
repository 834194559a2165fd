// src/macros.rs

//
// Crate-internal logging macros.
//
// `logging` feature on  → forwarded to `tracing` (visible to `log` consumers
//                         such as env_logger through tracing's `log` feature)
// `logging` feature off → error and warn go to stderr, the rest is compiled out
//
// Lost replies and cancelled consumers are reported at warn level, so warn
// stays visible even without a subscriber.
//

#![allow(unused_macros)]

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => { tracing::error!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => { eprintln!("ERROR queue_rpc: {}", format_args!($($arg)*)) };
}

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => { eprintln!("WARN queue_rpc: {}", format_args!($($arg)*)) };
}

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => { tracing::info!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {};
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
