//! Leveled stderr logging.
//!
//! The node logs through the `info!`/`warn!`/`error!` macros exported at the
//! crate root, or through a [`Logger`] carrying a component id when several
//! instances (say two nodes in one test process) need distinguishable output.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Log level for filtering messages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Info => write!(f, "INFO"),
            Level::Warn => write!(f, "WARN"),
            Level::Error => write!(f, "ERROR"),
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Sets the minimum level that will be printed.
pub fn init(level: Level) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[inline]
fn enabled(level: Level) -> bool {
    level as u8 >= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Days in each month of a non-leap year.
const MONTH_DAYS: [u64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Converts days since the Unix epoch to a calendar (year, month, day).
fn civil_date(mut days: u64) -> (u64, u64, u64) {
    let mut year = 1970;
    loop {
        let year_days = if is_leap(year) { 366 } else { 365 };
        if days < year_days {
            break;
        }
        days -= year_days;
        year += 1;
    }

    let mut month = 0;
    loop {
        let mut month_days = MONTH_DAYS[month];
        if month == 1 && is_leap(year) {
            month_days += 1;
        }
        if days < month_days {
            break;
        }
        days -= month_days;
        month += 1;
    }

    (year, month as u64 + 1, days + 1)
}

/// Writes one formatted line to stderr if the level is enabled.
pub fn emit(level: Level, id: Option<&str>, message: &str) {
    if !enabled(level) {
        return;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let (year, month, day) = civil_date(secs / 86_400);
    let (hours, mins, s) = ((secs / 3600) % 24, (secs / 60) % 60, secs % 60);
    let millis = now.subsec_millis();

    match id {
        Some(id) => eprintln!(
            "{year:04}-{month:02}-{day:02} {hours:02}:{mins:02}:{s:02}.{millis:03} [{level:5}] [{id}] {message}"
        ),
        None => eprintln!(
            "{year:04}-{month:02}-{day:02} {hours:02}:{mins:02}:{s:02}.{millis:03} [{level:5}] {message}"
        ),
    }
}

/// Clone-able logger with a component id prefixed to every message.
#[derive(Clone)]
pub struct Logger {
    pub id: Arc<str>,
}

impl Logger {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self { id: id.into() }
    }

    pub fn info(&self, message: &str) {
        emit(Level::Info, Some(&self.id), message);
    }

    pub fn warn(&self, message: &str) {
        emit(Level::Warn, Some(&self.id), message);
    }

    pub fn error(&self, message: &str) {
        emit(Level::Error, Some(&self.id), message);
    }
}

/// Logs an info-level message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::utils::log::emit($crate::utils::log::Level::Info, None, &format!($($arg)*))
    };
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::utils::log::emit($crate::utils::log::Level::Warn, None, &format!($($arg)*))
    };
}

/// Logs an error-level message.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::utils::log::emit($crate::utils::log::Level::Error, None, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn civil_date_epoch() {
        assert_eq!(civil_date(0), (1970, 1, 1));
    }

    #[test]
    fn civil_date_known_days() {
        // 2024-01-01 is 19723 days after the epoch; 2024 is a leap year.
        assert_eq!(civil_date(19_723), (2024, 1, 1));
        assert_eq!(civil_date(19_723 + 31 + 28), (2024, 2, 29));
        assert_eq!(civil_date(19_723 + 31 + 29), (2024, 3, 1));
    }

    #[test]
    fn leap_year_rules() {
        assert!(is_leap(2000));
        assert!(is_leap(2024));
        assert!(!is_leap(1900));
        assert!(!is_leap(2023));
    }

    #[test]
    fn logger_carries_its_id() {
        let logger = Logger::new("node-a");
        assert_eq!(&*logger.id, "node-a");
        logger.info("started");
    }

    #[test]
    fn init_filters_lower_levels() {
        init(Level::Error);
        assert!(!enabled(Level::Info));
        assert!(!enabled(Level::Warn));
        assert!(enabled(Level::Error));

        init(Level::Info);
        assert!(enabled(Level::Info));
    }
}
