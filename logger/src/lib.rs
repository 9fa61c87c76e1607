use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

static VERBOSE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

fn timestamp() -> (u64, u64, u64) {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    ((unix / 3600) % 24, (unix / 60) % 60, unix % 60)
}

fn format_line(level: LogLevel, args: fmt::Arguments) -> String {
    let (hours, minutes, seconds) = timestamp();
    format!(
        "[{:02}:{:02}:{:02}] [{}] {}",
        hours, minutes, seconds, level, args
    )
}

fn log(level: LogLevel, args: fmt::Arguments) {
    if level == LogLevel::Debug && !is_verbose() {
        return;
    }

    let line = format_line(level, args);

    match level {
        LogLevel::Debug | LogLevel::Info => println!("{}", line),
        LogLevel::Warn | LogLevel::Error => eprintln!("{}", line),
    }
}

pub fn debug(fmt: impl fmt::Display) {
    log(LogLevel::Debug, format_args!("{}", fmt));
}

pub fn info(fmt: impl fmt::Display) {
    log(LogLevel::Info, format_args!("{}", fmt));
}

pub fn warn(fmt: impl fmt::Display) {
    log(LogLevel::Warn, format_args!("{}", fmt));
}

pub fn error(fmt: impl fmt::Display) {
    log(LogLevel::Error, format_args!("{}", fmt));
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::debug(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::info(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::warn(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::error(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_layout() {
        let line = format_line(LogLevel::Warn, format_args!("handler {} at 0x{:X}", 3, 0x10));

        assert_eq!(&line[0..1], "[");
        assert_eq!(&line[3..4], ":");
        assert!(line.ends_with("[WARN] handler 3 at 0x10"));
    }

    #[test]
    fn test_verbose_toggle() {
        set_verbose(true);
        assert!(is_verbose());
        set_verbose(false);
        assert!(!is_verbose());
    }
}
