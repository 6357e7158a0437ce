//! The scheduler's only required ambient dependency: a `log(level, message)`
//! sink. No structured-logging crate is pulled in — the trait is deliberately
//! this small.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Sink for scheduler diagnostics (watchdog warnings, init failures, pool
/// exhaustion). Implementations must be cheap to call from any worker thread.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default sink: writes `[LEVEL] message` to stderr.
#[derive(Debug, Default)]
pub struct StderrSink;

impl LogSink for StderrSink {
    fn log(&self, level: LogLevel, message: &str) {
        eprintln!("[{level}] {message}");
    }
}

/// Sink that discards everything, for tests that don't want stderr noise.
#[derive(Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _level: LogLevel, _message: &str) {}
}
