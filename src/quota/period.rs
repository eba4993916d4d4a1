//! Usage period buckets.
//!
//! All boundaries are UTC so bucket membership is a pure function of the
//! timestamp:
//! - HOURLY: top of the hour
//! - DAILY: midnight
//! - WEEKLY: Monday midnight
//! - MONTHLY: first of the calendar month

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Error, Result};

/// Granularity of a usage bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl PeriodType {
    pub const ALL: [PeriodType; 4] = [
        PeriodType::Hourly,
        PeriodType::Daily,
        PeriodType::Weekly,
        PeriodType::Monthly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Hourly => "hourly",
            PeriodType::Daily => "daily",
            PeriodType::Weekly => "weekly",
            PeriodType::Monthly => "monthly",
        }
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = Utc.from_utc_datetime(&ts.date_naive().and_time(NaiveTime::MIN));
        match self {
            PeriodType::Hourly => midnight + Duration::hours(i64::from(ts.hour())),
            PeriodType::Daily => midnight,
            PeriodType::Weekly => {
                midnight - Duration::days(i64::from(ts.weekday().num_days_from_monday()))
            }
            PeriodType::Monthly => midnight - Duration::days(i64::from(ts.day0())),
        }
    }

    /// Exclusive end of the bucket that starts at (or contains) `ts`.
    pub fn bucket_end(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.bucket_start(ts);
        match self {
            PeriodType::Hourly => start + Duration::hours(1),
            PeriodType::Daily => start + Duration::days(1),
            PeriodType::Weekly => start + Duration::weeks(1),
            // 32 days past the 1st always lands in the next month.
            PeriodType::Monthly => self.bucket_start(start + Duration::days(32)),
        }
    }

    /// Start of the bucket immediately before the one containing `ts`.
    pub fn previous_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.bucket_start(self.bucket_start(ts) - Duration::seconds(1))
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Ok(PeriodType::Hourly),
            "daily" => Ok(PeriodType::Daily),
            "weekly" => Ok(PeriodType::Weekly),
            "monthly" => Ok(PeriodType::Monthly),
            _ => Err(Error::validation(format!("unknown period type: {s}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_hourly_and_daily_boundaries() {
        let ts = at("2026-03-18T14:37:12Z");
        assert_eq!(PeriodType::Hourly.bucket_start(ts), at("2026-03-18T14:00:00Z"));
        assert_eq!(PeriodType::Hourly.bucket_end(ts), at("2026-03-18T15:00:00Z"));
        assert_eq!(PeriodType::Daily.bucket_start(ts), at("2026-03-18T00:00:00Z"));
        assert_eq!(PeriodType::Daily.bucket_end(ts), at("2026-03-19T00:00:00Z"));
    }

    #[test]
    fn test_weekly_aligns_to_monday() {
        // 2026-03-18 is a Wednesday.
        let ts = at("2026-03-18T14:37:12Z");
        assert_eq!(PeriodType::Weekly.bucket_start(ts), at("2026-03-16T00:00:00Z"));
        assert_eq!(PeriodType::Weekly.bucket_end(ts), at("2026-03-23T00:00:00Z"));

        let monday = at("2026-03-16T00:00:00Z");
        assert_eq!(PeriodType::Weekly.bucket_start(monday), monday);
    }

    #[test]
    fn test_monthly_boundaries() {
        let ts = at("2026-02-28T23:59:59Z");
        assert_eq!(PeriodType::Monthly.bucket_start(ts), at("2026-02-01T00:00:00Z"));
        assert_eq!(PeriodType::Monthly.bucket_end(ts), at("2026-03-01T00:00:00Z"));

        let dec = at("2026-12-31T10:00:00Z");
        assert_eq!(PeriodType::Monthly.bucket_end(dec), at("2027-01-01T00:00:00Z"));
    }

    #[test]
    fn test_previous_start() {
        let ts = at("2026-03-01T05:00:00Z");
        assert_eq!(PeriodType::Monthly.previous_start(ts), at("2026-02-01T00:00:00Z"));
        assert_eq!(PeriodType::Daily.previous_start(ts), at("2026-02-28T00:00:00Z"));
        assert_eq!(PeriodType::Hourly.previous_start(ts), at("2026-03-01T04:00:00Z"));
    }

    #[test]
    fn test_bucket_start_is_idempotent() {
        let ts = at("2026-07-09T08:15:00Z");
        for period in PeriodType::ALL {
            let start = period.bucket_start(ts);
            assert_eq!(period.bucket_start(start), start);
            assert!(start <= ts && ts < period.bucket_end(ts));
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!("DAILY".parse::<PeriodType>().unwrap(), PeriodType::Daily);
        assert!("yearly".parse::<PeriodType>().is_err());
    }
}
