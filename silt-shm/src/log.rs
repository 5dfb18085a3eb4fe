//! # Logging
//!
//! Leveled logging for the runtime and its substrate. An atomic minimum
//! level gates call sites cheaply; output goes to stderr or to a log file.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SILT_LOG_LEVEL` | `debug`, `info`, `warning`, `error`, `fatal` | `info` |
//! | `SILT_LOG_FILE`  | Log file path; unset means stderr | unset |
//!
//! Fatal is reserved for invariant violations: [`fatal`] logs and aborts the
//! process, because a scheduler that has corrupted its own bookkeeping can
//! silently lose or duplicate tasks if allowed to continue.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug = 0,
    /// Normal operational messages.
    Info = 1,
    /// Something unexpected but recoverable.
    Warning = 2,
    /// An operation failed.
    Error = 3,
    /// An invariant is broken; the process aborts.
    Fatal = 4,
}

impl LogLevel {
    /// Level name for output.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// Parse a level name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" | "warn" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "fatal" => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warning,
            3 => LogLevel::Error,
            _ => LogLevel::Fatal,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Minimum level that is emitted.
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Output sink.
enum Sink {
    Stderr,
    File(std::fs::File),
}

static SINK: OnceLock<Mutex<Sink>> = OnceLock::new();

fn sink() -> &'static Mutex<Sink> {
    SINK.get_or_init(|| Mutex::new(Sink::Stderr))
}

/// Set the minimum emitted level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// The current minimum level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::SeqCst))
}

/// Whether a message at `level` would be emitted.
pub fn would_log(level: LogLevel) -> bool {
    level >= self::level()
}

/// Route output to a file. Appends; creates the file when absent.
pub fn set_log_file(path: &str) -> std::io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    if let Ok(mut guard) = sink().lock() {
        *guard = Sink::File(file);
    }
    Ok(())
}

/// Route output back to stderr.
pub fn set_stderr() {
    if let Ok(mut guard) = sink().lock() {
        *guard = Sink::Stderr;
    }
}

/// Configure the logger from `SILT_LOG_LEVEL` and `SILT_LOG_FILE`.
pub fn init_from_env() {
    if let Ok(value) = std::env::var("SILT_LOG_LEVEL") {
        if let Some(level) = LogLevel::parse(&value) {
            set_level(level);
        }
    }
    if let Ok(path) = std::env::var("SILT_LOG_FILE") {
        if !path.is_empty() {
            let _ = set_log_file(&path);
        }
    }
}

fn format_line(level: LogLevel, msg: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let thread = std::thread::current()
        .name()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "?".into());
    format!(
        "[{}.{:03}] {:<7} ({}) {}",
        now / 1000,
        now % 1000,
        level.as_str(),
        thread,
        msg
    )
}

/// Emit a message at `level`.
pub fn log(level: LogLevel, msg: &str) {
    if !would_log(level) {
        return;
    }
    let line = format_line(level, msg);
    if let Ok(mut guard) = sink().lock() {
        match &mut *guard {
            Sink::Stderr => {
                let _ = writeln!(std::io::stderr(), "{}", line);
            }
            Sink::File(file) => {
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
            }
        }
    }
}

/// Emit a debug message.
pub fn debug(msg: &str) {
    log(LogLevel::Debug, msg);
}

/// Emit an info message.
pub fn info(msg: &str) {
    log(LogLevel::Info, msg);
}

/// Emit a warning.
pub fn warning(msg: &str) {
    log(LogLevel::Warning, msg);
}

/// Emit an error message.
pub fn error(msg: &str) {
    log(LogLevel::Error, msg);
}

/// Report an invariant violation and abort the process.
pub fn fatal(msg: &str) -> ! {
    // Fatal bypasses the level gate.
    let line = format_line(LogLevel::Fatal, msg);
    if let Ok(mut guard) = sink().lock() {
        match &mut *guard {
            Sink::Stderr => {
                let _ = writeln!(std::io::stderr(), "{}", line);
            }
            Sink::File(file) => {
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
            }
        }
    }
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("Error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("fatal"), Some(LogLevel::Fatal));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Fatal);
    }

    #[test]
    fn test_would_log_respects_level() {
        let original = level();
        set_level(LogLevel::Warning);
        assert!(!would_log(LogLevel::Debug));
        assert!(!would_log(LogLevel::Info));
        assert!(would_log(LogLevel::Warning));
        assert!(would_log(LogLevel::Error));
        set_level(original);
    }

    #[test]
    fn test_format_line_contains_parts() {
        let line = format_line(LogLevel::Error, "disk on fire");
        assert!(line.contains("ERROR"));
        assert!(line.contains("disk on fire"));
    }
}
