//! Time source for the daemon.
//!
//! Everything that needs "now" takes a [`Clock`] instead of reading the wall
//! clock, so cycle timing and reconciliation dates can be driven from tests.

use std::sync::Mutex;

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime};

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const FILE_STAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
const MONTH_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]_[month]");

pub trait Clock: Send + Sync {
    /// Current local wall time.
    fn now(&self) -> PrimitiveDateTime;

    fn today(&self) -> Date {
        self.now().date()
    }
}

/// Reads the host clock in the local offset, falling back to UTC when the
/// offset cannot be determined (e.g. multi-threaded processes on some unixes).
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> PrimitiveDateTime {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        PrimitiveDateTime::new(now.date(), now.time())
    }
}

/// Settable clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<PrimitiveDateTime>,
}

impl ManualClock {
    pub fn new(now: PrimitiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: PrimitiveDateTime) {
        *self.now.lock().unwrap_or_else(|poison| poison.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poison| poison.into_inner());
        *guard = guard.saturating_add(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> PrimitiveDateTime {
        *self.now.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// `YYYY-MM-DD`.
pub fn format_date(date: Date) -> String {
    date.format(DATE_FORMAT).unwrap_or_else(|_| date.to_string())
}

/// `YYYY-MM-DDTHH:MM:SS`, second precision.
pub fn format_timestamp(at: PrimitiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT)
        .unwrap_or_else(|_| at.to_string())
}

/// Filesystem-safe stamp used in cycle log names.
pub fn format_file_stamp(at: PrimitiveDateTime) -> String {
    at.format(FILE_STAMP_FORMAT)
        .unwrap_or_else(|_| at.to_string())
}

/// `YYYY_MM`, the suffix of monthly history files.
pub fn format_month(date: Date) -> String {
    date.format(MONTH_FORMAT)
        .unwrap_or_else(|_| format!("{}_{:02}", date.year(), u8::from(date.month())))
}

pub fn parse_date(raw: &str) -> Result<Date, time::error::Parse> {
    Date::parse(raw.trim(), DATE_FORMAT)
}

pub fn parse_timestamp(raw: &str) -> Result<PrimitiveDateTime, time::error::Parse> {
    PrimitiveDateTime::parse(raw.trim(), TIMESTAMP_FORMAT)
}
