//! Reminder records and the parsers used while setting one up.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDateTime, NaiveTime, Timelike, Utc, Weekday};
use regex::Regex;

static HHMM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{2}):(\d{2})$").unwrap());

/// Which days a reminder fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaysMode {
    /// Monday to Friday.
    Weekdays,
    Daily,
}

impl DaysMode {
    pub fn matches(self, weekday: Weekday) -> bool {
        match self {
            DaysMode::Daily => true,
            DaysMode::Weekdays => !matches!(weekday, Weekday::Sat | Weekday::Sun),
        }
    }

    /// Stored form, also used as inline button callback data.
    pub fn as_str(self) -> &'static str {
        match self {
            DaysMode::Weekdays => "weekdays",
            DaysMode::Daily => "daily",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DaysMode::Weekdays => "Weekdays",
            DaysMode::Daily => "Everyday",
        }
    }
}

impl FromStr for DaysMode {
    type Err = String;

    /// Maps a user reply onto a days mode using a fixed keyword set.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "weekdays" | "weekday" | "wd" | "mon-fri" | "monday-friday" | "workdays" => {
                Ok(DaysMode::Weekdays)
            }
            "daily" | "everyday" | "every day" | "all" | "all days" => {
                Ok(DaysMode::Daily)
            }
            _ => Err(format!("Unknown days option '{}'", input.trim())),
        }
    }
}

/// Time of day a reminder fires, minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TriggerTime {
    hour: u8,
    minute: u8,
}

impl TriggerTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }

    /// True if `at` falls within this trigger's minute.
    pub fn matches(self, at: NaiveTime) -> bool {
        at.hour() == u32::from(self.hour) && at.minute() == u32::from(self.minute)
    }
}

impl fmt::Display for TriggerTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Parse a strict 24-hour "HH:MM" time. "9:05" and "24:00" are rejected.
pub fn parse_trigger_time(input: &str) -> Result<TriggerTime, String> {
    let input = input.trim();
    let caps = HHMM
        .captures(input)
        .ok_or_else(|| format!("Invalid time format: '{}'. Use HH:MM", input))?;

    let hour: u8 = caps[1]
        .parse()
        .map_err(|_| format!("Invalid hour in '{}'", input))?;
    let minute: u8 = caps[2]
        .parse()
        .map_err(|_| format!("Invalid minute in '{}'", input))?;

    TriggerTime::new(hour, minute).ok_or_else(|| format!("'{}' is not a real time", input))
}

/// Fields collected by a finished conversation, before the store assigns ids.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReminder {
    pub owner_id: i64,
    pub service_no: String,
    pub stop_code: String,
    pub stop_name: String,
    pub days: DaysMode,
    pub time: TriggerTime,
}

/// A reminder stored in the database.
#[derive(Debug, Clone, PartialEq)]
pub struct Reminder {
    /// Store-wide row id, never reused.
    pub id: i64,
    pub owner_id: i64,
    /// Per-owner number shown in `/list` and used by `/deletereminder`.
    pub seq: i64,
    pub service_no: String,
    pub stop_code: String,
    pub stop_name: String,
    pub days: DaysMode,
    pub time: TriggerTime,
    pub created_at: DateTime<Utc>,
}

impl Reminder {
    /// True if the reminder is scheduled for the given local minute.
    pub fn is_due_at(&self, local: NaiveDateTime) -> bool {
        self.days.matches(local.weekday()) && self.time.matches(local.time())
    }
}
