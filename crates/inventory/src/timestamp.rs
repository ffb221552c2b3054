//! Read-time promotion of ERP dates.
//!
//! The ERP keeps the document date and the time of day in separate columns.
//! They are combined when a ledger entry is built, never when the mirror is
//! written, and every result is UTC.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the time part of a promoted timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSource {
    /// Parsed from the time-of-day column.
    TimeOfDay,
    /// No time-of-day was recorded; midnight used.
    Missing,
    /// The time-of-day string could not be parsed; midnight used.
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotedTimestamp {
    pub at: DateTime<Utc>,
    pub source: TimeSource,
}

impl PromotedTimestamp {
    pub fn is_fallback(&self) -> bool {
        !matches!(self.source, TimeSource::TimeOfDay)
    }
}

/// Combine the calendar date of `document_date` with an `HH:MM:SS` string.
///
/// A blank or malformed string yields midnight UTC of the same day.
pub fn promote(document_date: DateTime<Utc>, time_of_day: Option<&str>) -> PromotedTimestamp {
    let date = document_date.date_naive();
    let midnight = date.and_time(NaiveTime::MIN).and_utc();

    let Some(raw) = time_of_day.map(str::trim).filter(|s| !s.is_empty()) else {
        return PromotedTimestamp {
            at: midnight,
            source: TimeSource::Missing,
        };
    };

    match NaiveTime::parse_from_str(raw, "%H:%M:%S") {
        Ok(time) => PromotedTimestamp {
            at: date.and_time(time).and_utc(),
            source: TimeSource::TimeOfDay,
        },
        Err(_) => PromotedTimestamp {
            at: midnight,
            source: TimeSource::Malformed,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn combines_date_and_time() {
        let p = promote(day(), Some("10:15:30"));
        assert_eq!(p.at, Utc.with_ymd_and_hms(2025, 9, 1, 10, 15, 30).unwrap());
        assert!(!p.is_fallback());
    }

    #[test]
    fn time_part_of_the_date_is_discarded() {
        let with_time = Utc.with_ymd_and_hms(2025, 9, 1, 23, 0, 0).unwrap();
        assert_eq!(
            promote(with_time, Some("08:00:00")).at,
            Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn malformed_time_falls_back_to_midnight() {
        let p = promote(day(), Some("25:99"));
        assert_eq!(p.at, day());
        assert_eq!(p.source, TimeSource::Malformed);
    }

    #[test]
    fn missing_time_is_midnight() {
        let p = promote(day(), Some("   "));
        assert_eq!(p.at, day());
        assert_eq!(p.source, TimeSource::Missing);
    }
}
