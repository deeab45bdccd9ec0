//! Stderr logging for sessions and slave loops
//!
//! Leveled lines carry the level and the name of the emitting thread, so a
//! listener thread and a closer thread can be told apart when they
//! interleave. Frame dumps from the engines go through [`kprintln!`]
//! unprefixed, one frame per line.
//!
//! # Environment Variables
//!
//! - `MBS_LOG_LEVEL=<level>` - `off`, `error`, `warn`, `info`, `debug`, `trace` or `0`..`5`
//! - `MBS_FLUSH_EPRINT=1` - Flush stderr after each line (useful when chasing a hung wait)
//!
//! ```ignore
//! use mbsafe_core::{kdebug, kinfo};
//!
//! kinfo!("Listening on {}", addr);
//! kdebug!("select ready: {:?}", fds);
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};

/// Log levels, least verbose first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    const ALL: [LogLevel; 6] = [
        LogLevel::Off,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    /// Parse a level name or digit. Unknown text falls back to `Info`.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|l| s.eq_ignore_ascii_case(l.name()) || s == (*l as u8).to_string())
            .unwrap_or(LogLevel::Info)
    }

    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    fn tag(self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

// Packed settings: low bits hold the level, FLUSH_BIT the flush flag.
// UNSET until the environment has been read or a level was set.
const UNSET: u8 = 0xFF;
const FLUSH_BIT: u8 = 0x80;
const LEVEL_MASK: u8 = 0x07;

static SETTINGS: AtomicU8 = AtomicU8::new(UNSET);

fn from_env() -> u8 {
    let level = std::env::var("MBS_LOG_LEVEL")
        .map(|v| LogLevel::parse(&v))
        .unwrap_or(LogLevel::Info);
    let flush = std::env::var("MBS_FLUSH_EPRINT")
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);
    level as u8 | if flush { FLUSH_BIT } else { 0 }
}

fn settings() -> u8 {
    let current = SETTINGS.load(Ordering::Acquire);
    if current != UNSET {
        return current;
    }
    let loaded = from_env();
    // a concurrent set_log_level wins over the environment
    match SETTINGS.compare_exchange(UNSET, loaded, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => loaded,
        Err(other) => other,
    }
}

/// Read `MBS_LOG_LEVEL` and `MBS_FLUSH_EPRINT` now instead of on the first
/// log line.
pub fn init() {
    settings();
}

pub fn log_level() -> LogLevel {
    let level = settings() & LEVEL_MASK;
    LogLevel::ALL.get(level as usize).copied().unwrap_or(LogLevel::Trace)
}

/// Set the level programmatically; wins over the environment. The flush
/// setting from the environment is kept.
pub fn set_log_level(level: LogLevel) {
    let flush = settings() & FLUSH_BIT;
    SETTINGS.store(level as u8 | flush, Ordering::Release);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

/// Render bytes as `[01][03][00]...`, the debug framing format.
pub fn hex_frame(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 4);
    for b in bytes {
        let _ = write!(out, "[{:02X}]", b);
    }
    out
}

/// One line to stderr under the stderr lock.
#[doc(hidden)]
pub fn _emit(level: Option<LogLevel>, args: fmt::Arguments<'_>) {
    if let Some(level) = level {
        if !level_enabled(level) {
            return;
        }
    }
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    if let Some(level) = level {
        let current = std::thread::current();
        let _ = write!(out, "{} [{}] ", level.tag(), current.name().unwrap_or("?"));
    }
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if settings() & FLUSH_BIT != 0 {
        let _ = out.flush();
    }
}

/// Unprefixed line to stderr, printed at any level
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint::_emit(None, format_args!(""))
    };
    ($($arg:tt)*) => {
        $crate::kprint::_emit(None, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        $crate::kprint::_emit(Some($crate::kprint::LogLevel::Error), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::kprint::_emit(Some($crate::kprint::LogLevel::Warn), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        $crate::kprint::_emit(Some($crate::kprint::LogLevel::Info), format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        $crate::kprint::_emit(Some($crate::kprint::LogLevel::Debug), format_args!($($arg)*))
    };
}

/// Trace level, also switches engines to frame dumps in the slave loop
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {
        $crate::kprint::_emit(Some($crate::kprint::LogLevel::Trace), format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), LogLevel::Debug);
        assert_eq!(LogLevel::parse(" trace "), LogLevel::Trace);
        assert_eq!(LogLevel::parse("2"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("0"), LogLevel::Off);
        assert_eq!(LogLevel::parse("bogus"), LogLevel::Info);
        assert_eq!(LogLevel::parse("9"), LogLevel::Info);
    }

    #[test]
    fn test_hex_frame() {
        assert_eq!(hex_frame(&[0x01, 0xAB]), "[01][AB]");
        assert_eq!(hex_frame(&[]), "");
    }

    // one test touches the global level so parallel tests do not race on it
    #[test]
    fn test_set_level_gates_macros() {
        set_log_level(LogLevel::Warn);
        assert_eq!(log_level(), LogLevel::Warn);
        assert!(level_enabled(LogLevel::Error));
        assert!(!level_enabled(LogLevel::Info));
        assert!(!level_enabled(LogLevel::Off));

        set_log_level(LogLevel::Off);
        assert!(!level_enabled(LogLevel::Error));
        kerror!("error {}", "msg");
        kwarn!("warn");
        kinfo!("info");
        kdebug!("debug");
        ktrace!("trace");
    }
}
