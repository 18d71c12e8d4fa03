//! Colored diagnostics with a process-wide level filter.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Warning = 1,
    Error = 2,
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warning as u8);

pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn log_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Debug,
        1 => LogLevel::Warning,
        _ => LogLevel::Error,
    }
}

pub fn enabled(level: LogLevel) -> bool {
    level >= log_level()
}

// ANSI color helpers
pub fn green(s: &str) -> String {
    format!("\x1b[32m{}\x1b[0m", s)
}
pub fn red(s: &str) -> String {
    format!("\x1b[31m{}\x1b[0m", s)
}
pub fn yellow(s: &str) -> String {
    format!("\x1b[33m{}\x1b[0m", s)
}
pub fn cyan(s: &str) -> String {
    format!("\x1b[36m{}\x1b[0m", s)
}
pub fn bold(s: &str) -> String {
    format!("\x1b[1m{}\x1b[0m", s)
}
pub fn gray(s: &str) -> String {
    format!("\x1b[90m{}\x1b[0m", s)
}

#[doc(hidden)]
pub fn emit(level: LogLevel, args: std::fmt::Arguments) {
    if !enabled(level) {
        return;
    }
    let label = match level {
        LogLevel::Debug => gray("debug:"),
        LogLevel::Warning => yellow("warning:"),
        LogLevel::Error => red("error:"),
    };
    eprintln!("{} {}", label, args);
}

#[macro_export]
macro_rules! eth_debug {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! eth_warning {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::LogLevel::Warning, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! eth_error {
    ($($arg:tt)*) => {
        $crate::log::emit($crate::log::LogLevel::Error, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_enabled_respects_filter() {
        set_log_level(LogLevel::Error);
        assert!(!enabled(LogLevel::Warning));
        assert!(enabled(LogLevel::Error));
        set_log_level(LogLevel::Warning);
        assert!(enabled(LogLevel::Warning));
        assert!(!enabled(LogLevel::Debug));
    }
}
