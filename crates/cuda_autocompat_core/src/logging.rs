//! A small leveled, indented diagnostic facade.
//!
//! This exists because the audit and preloader `cdylib`s run before any
//! process-wide logging subscriber could safely be installed, and because the
//! indent-by-level formatting is itself a tested property of this crate
//! rather than cosmetic. Emitting to stderr is therefore always `std`-only
//! and safe to call from the earliest moments of the dynamic linker's audit
//! callbacks, with or without a subscriber present.
//!
//! Every message is also re-emitted as a `tracing` event at the nearest
//! matching `tracing::Level`, so that the helper executable's
//! `tracing-subscriber` layer (installed only there; see
//! `cuda_autocompat_search::main`) sees one unified stream instead of two
//! independent ones. This is a no-op allocation-wise when no subscriber is
//! registered, which is the case for the two `cdylib` crates.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::RwLock;

use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Verbose = 4,
    Debug = 5,
    Trace = 6,
}

impl LogLevel {
    const NAMES: [&'static str; 7] = ["OFF", "ERROR", "WARN", "INFO", "VERBOSE", "DEBUG", "TRACE"];

    pub fn name(self) -> &'static str {
        Self::NAMES[self as usize]
    }

    pub fn short_name(self) -> char {
        self.name().chars().next().expect("level names are non-empty")
    }

    /// Clamps a verbosity offset (as read from `CUDA_AUTOCOMPAT_VERBOSE`,
    /// `0`-`6`) relative to the base [`LogLevel::Warn`] level.
    pub fn from_verbose_offset(offset: u8) -> LogLevel {
        let idx = (LogLevel::Warn as u8).saturating_add(offset);
        let idx = idx.min(LogLevel::Trace as u8);
        match idx {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Verbose,
            5 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

struct LoggingState {
    max_level: AtomicU8,
    use_timestamp: AtomicBool,
    use_log_name: AtomicBool,
    use_level_name: AtomicBool,
    long_level_name: AtomicBool,
    log_name: RwLock<String>,
}

static STATE: Lazy<LoggingState> = Lazy::new(|| LoggingState {
    max_level: AtomicU8::new(LogLevel::Warn as u8),
    use_timestamp: AtomicBool::new(true),
    use_log_name: AtomicBool::new(true),
    use_level_name: AtomicBool::new(true),
    long_level_name: AtomicBool::new(false),
    log_name: RwLock::new("main".to_string()),
});

pub fn set_max_level(level: LogLevel) {
    STATE.max_level.store(level as u8, Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    match STATE.max_level.load(Ordering::Relaxed) {
        0 => LogLevel::Off,
        1 => LogLevel::Error,
        2 => LogLevel::Warn,
        3 => LogLevel::Info,
        4 => LogLevel::Verbose,
        5 => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

pub fn set_log_name(name: impl Into<String>) {
    *STATE.log_name.write().expect("logging state poisoned") = name.into();
}

pub fn set_headers(timestamp: bool, log_name: bool, level_name: bool) {
    STATE.use_timestamp.store(timestamp, Ordering::Relaxed);
    STATE.use_log_name.store(log_name, Ordering::Relaxed);
    STATE.use_level_name.store(level_name, Ordering::Relaxed);
}

fn indent_for(level: LogLevel) -> usize {
    let info = LogLevel::Info as usize;
    let level = level as usize;
    level.max(info).saturating_sub(info) * 2
}

#[doc(hidden)]
pub fn log_write(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if level as u8 > STATE.max_level.load(Ordering::Relaxed) {
        return;
    }

    let mut line = String::new();

    if STATE.use_timestamp.load(Ordering::Relaxed) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        line.push_str(&format!("{}.{:03} ", now.as_secs(), now.subsec_millis()));
    }

    if STATE.use_log_name.load(Ordering::Relaxed) {
        line.push_str(&STATE.log_name.read().expect("logging state poisoned"));
        line.push(' ');
    }

    if STATE.use_level_name.load(Ordering::Relaxed) {
        if STATE.long_level_name.load(Ordering::Relaxed) {
            line.push_str(level.name());
        } else {
            line.push(level.short_name());
        }
        line.push(' ');
    }

    for _ in 0..indent_for(level) {
        line.push(' ');
    }

    let message = std::fmt::format(args);
    emit_tracing(level, &message);

    line.push_str(&message);
    eprintln!("{line}");
}

/// Re-emits a facade message as the nearest `tracing::Level`. The facade's
/// seven levels outnumber `tracing`'s five; `Verbose` and `Debug` both land
/// on `tracing::Level::DEBUG` rather than inventing a level `tracing` has no
/// concept of, and `Trace` lands on `tracing::Level::TRACE` as expected.
fn emit_tracing(level: LogLevel, message: &str) {
    match level {
        LogLevel::Off => {}
        LogLevel::Error => tracing::error!("{message}"),
        LogLevel::Warn => tracing::warn!("{message}"),
        LogLevel::Info => tracing::info!("{message}"),
        LogLevel::Verbose | LogLevel::Debug => tracing::debug!("{message}"),
        LogLevel::Trace => tracing::trace!("{message}"),
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_write($crate::logging::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_write($crate::logging::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_write($crate::logging::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_verbose {
    ($($arg:tt)*) => {
        $crate::logging::log_write($crate::logging::LogLevel::Verbose, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_write($crate::logging::LogLevel::Debug, format_args!($($arg)*))
    };
}

/// Compiled out entirely in release builds, matching the original's
/// `#ifndef NDEBUG` guard around trace logging.
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::logging::log_write($crate::logging::LogLevel::Trace, format_args!($($arg)*));
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_and_above_are_not_indented() {
        assert_eq!(indent_for(LogLevel::Error), 0);
        assert_eq!(indent_for(LogLevel::Warn), 0);
        assert_eq!(indent_for(LogLevel::Info), 0);
    }

    #[test]
    fn each_level_below_info_adds_two_spaces() {
        assert_eq!(indent_for(LogLevel::Verbose), 2);
        assert_eq!(indent_for(LogLevel::Debug), 4);
        assert_eq!(indent_for(LogLevel::Trace), 6);
    }

    #[test]
    fn verbose_offset_clamps_at_trace() {
        assert_eq!(LogLevel::from_verbose_offset(0), LogLevel::Warn);
        assert_eq!(LogLevel::from_verbose_offset(1), LogLevel::Info);
        assert_eq!(LogLevel::from_verbose_offset(4), LogLevel::Trace);
        assert_eq!(LogLevel::from_verbose_offset(200), LogLevel::Trace);
    }
}
