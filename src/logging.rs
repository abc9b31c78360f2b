//! Log levels and the shared level cell.
//!
//! The core emits typed log events `(level, message, category, connection_id)`
//! through a user-supplied sink; nothing here writes to any output by itself.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Severity of a log event emitted by the connection or its transport.
///
/// `None` disables the sink entirely and is never emitted as an event level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    None,
}

impl LogLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warning,
            3 => LogLevel::Error,
            _ => LogLevel::None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::None => "NONE",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("debug") {
            Ok(LogLevel::Debug)
        } else if value.eq_ignore_ascii_case("info") {
            Ok(LogLevel::Info)
        } else if value.eq_ignore_ascii_case("warning") {
            Ok(LogLevel::Warning)
        } else if value.eq_ignore_ascii_case("error") {
            Ok(LogLevel::Error)
        } else {
            Ok(LogLevel::None)
        }
    }
}

/// Minimum-level cell shared between the engine and its transport loop.
///
/// The transport checks the level before formatting a message so that
/// disabled levels cost nothing beyond the atomic load.
#[derive(Debug)]
pub(crate) struct LevelCell(AtomicU8);

pub(crate) type SharedLevel = Arc<LevelCell>;

impl LevelCell {
    pub(crate) fn new(level: LogLevel) -> SharedLevel {
        Arc::new(LevelCell(AtomicU8::new(level as u8)))
    }

    pub(crate) fn get(&self) -> LogLevel {
        LogLevel::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn set(&self, level: LogLevel) {
        self.0.store(level as u8, Ordering::Relaxed);
    }

    pub(crate) fn enabled(&self, level: LogLevel) -> bool {
        level >= self.get() && level != LogLevel::None
    }
}
