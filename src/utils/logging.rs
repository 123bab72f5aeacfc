//! Logging macros gated by a per-module `ENABLE_LOGS` constant.
//!
//! ```ignore
//! // Set to true to enable verbose logging in this module
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_debug, log_info, log_warn, log_error};
//!
//! log_warn!("spool holds {} unreadable files", count);
//! ```
//!
//! Cadence, dedup and thermal skips use `log_debug!` so they stay out of
//! the default `info` output.

#[doc(hidden)]
#[macro_export]
macro_rules! __gated_log {
    ($level:ident, $($arg:tt)*) => {
        if ENABLE_LOGS {
            log::$level!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::__gated_log!(debug, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::__gated_log!(info, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::__gated_log!(warn, $($arg)*) };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::__gated_log!(error, $($arg)*) };
}
