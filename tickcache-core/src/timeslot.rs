//! Intraday timeslot codec.
//!
//! A session starts at 04:00 US/Eastern and runs sixteen hours through the
//! end of extended trading. A timeslot is the integer index of a fixed-width
//! bucket inside that session:
//!
//! `slot = floor((timestamp - session_start) / (period_minutes * 60s))`
//!
//! All arithmetic is on whole seconds, so slot numbers are exact and stable.

use crate::calendar::MARKET_TZ;
use chrono::{DateTime, Duration, NaiveDate, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wall-clock hour at which the extended session opens.
pub const SESSION_START_HOUR: u32 = 4;

/// Length of the extended session in minutes (04:00 to 20:00).
pub const SESSION_MINUTES: u32 = 16 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeslotError {
    #[error("invalid bar period: {0} minutes (expected one of 1, 5, 30)")]
    InvalidPeriod(u32),

    #[error("invalid sample period: {0} minutes")]
    InvalidSamplePeriod(u32),
}

/// Bar periods the upstream can deliver natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Period {
    One,
    Five,
    Thirty,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::One, Period::Five, Period::Thirty];

    pub fn minutes(self) -> u32 {
        match self {
            Period::One => 1,
            Period::Five => 5,
            Period::Thirty => 30,
        }
    }

    /// 960 for one-minute bars, 192 for five, 32 for thirty.
    pub fn slots_per_day(self) -> u32 {
        SESSION_MINUTES / self.minutes()
    }

    pub fn from_minutes(minutes: u32) -> Result<Self, TimeslotError> {
        match minutes {
            1 => Ok(Period::One),
            5 => Ok(Period::Five),
            30 => Ok(Period::Thirty),
            other => Err(TimeslotError::InvalidPeriod(other)),
        }
    }

    /// Native period a derived sample period is resampled from.
    ///
    /// 30 if divisible by 30, else 5 if divisible by 5, else 1.
    pub fn source_for(sample_minutes: u32) -> Result<Self, TimeslotError> {
        if sample_minutes == 0 || sample_minutes > SESSION_MINUTES {
            return Err(TimeslotError::InvalidSamplePeriod(sample_minutes));
        }
        Ok(if sample_minutes % 30 == 0 {
            Period::Thirty
        } else if sample_minutes % 5 == 0 {
            Period::Five
        } else {
            Period::One
        })
    }
}

impl TryFrom<u32> for Period {
    type Error = TimeslotError;

    fn try_from(minutes: u32) -> Result<Self, Self::Error> {
        Period::from_minutes(minutes)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.minutes())
    }
}

/// Number of slots per session for any positive period in minutes.
pub fn slots_per_day(period_minutes: u32) -> u32 {
    SESSION_MINUTES.div_ceil(period_minutes.max(1))
}

/// 04:00 US/Eastern on `date`.
pub fn session_start(date: NaiveDate) -> DateTime<Tz> {
    let naive = date
        .and_hms_opt(SESSION_START_HOUR, 0, 0)
        .expect("valid literal time");
    // 04:00 never falls in a DST gap or fold in New York.
    MARKET_TZ
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| MARKET_TZ.from_utc_datetime(&naive))
}

/// Slot index of a market-local timestamp within its own session date.
///
/// Timestamps before 04:00 give negative slots, timestamps at or after 20:00
/// give slots past the end of the session; callers that need an in-session
/// slot use [`session_slot`].
pub fn timestamp_to_timeslot(timestamp: &DateTime<Tz>, period_minutes: u32) -> i64 {
    let start = session_start(timestamp.date_naive());
    let elapsed = timestamp.signed_duration_since(start).num_seconds();
    elapsed.div_euclid(i64::from(period_minutes.max(1)) * 60)
}

/// In-session slot, or `None` when the timestamp is outside 04:00..20:00.
pub fn session_slot(timestamp: &DateTime<Tz>, period_minutes: u32) -> Option<u32> {
    let slot = timestamp_to_timeslot(timestamp, period_minutes);
    (0..i64::from(slots_per_day(period_minutes)))
        .contains(&slot)
        .then_some(slot as u32)
}

/// Start of `slot` on `date`: `session_start + slot * period`.
pub fn timeslot_to_timestamp(slot: i64, period_minutes: u32, date: NaiveDate) -> DateTime<Tz> {
    session_start(date) + Duration::minutes(slot * i64::from(period_minutes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn slot_counts() {
        assert_eq!(Period::One.slots_per_day(), 960);
        assert_eq!(Period::Five.slots_per_day(), 192);
        assert_eq!(Period::Thirty.slots_per_day(), 32);
        assert_eq!(slots_per_day(15), 64);
        assert_eq!(slots_per_day(7), 138);
    }

    #[test]
    fn regular_open_is_slot_330_for_one_minute() {
        let ts = MARKET_TZ.with_ymd_and_hms(2024, 3, 5, 9, 30, 0).unwrap();
        assert_eq!(timestamp_to_timeslot(&ts, 1), 330);
        assert_eq!(timestamp_to_timeslot(&ts, 5), 66);
        assert_eq!(timestamp_to_timeslot(&ts, 30), 11);
    }

    #[test]
    fn floor_division_within_bucket() {
        let ts = MARKET_TZ.with_ymd_and_hms(2024, 3, 5, 4, 4, 59).unwrap();
        assert_eq!(timestamp_to_timeslot(&ts, 5), 0);
        let ts = MARKET_TZ.with_ymd_and_hms(2024, 3, 5, 4, 5, 0).unwrap();
        assert_eq!(timestamp_to_timeslot(&ts, 5), 1);
    }

    #[test]
    fn outside_session_has_no_session_slot() {
        let early = MARKET_TZ.with_ymd_and_hms(2024, 3, 5, 3, 59, 0).unwrap();
        let late = MARKET_TZ.with_ymd_and_hms(2024, 3, 5, 20, 0, 0).unwrap();
        assert_eq!(timestamp_to_timeslot(&early, 1), -1);
        assert_eq!(session_slot(&early, 1), None);
        assert_eq!(session_slot(&late, 1), None);
        let last = MARKET_TZ.with_ymd_and_hms(2024, 3, 5, 19, 59, 0).unwrap();
        assert_eq!(session_slot(&last, 1), Some(959));
    }

    #[test]
    fn dst_transition_days_keep_sixteen_hour_sessions() {
        // 2024-03-10 spring forward, 2024-11-03 fall back (both Sundays, but
        // the codec itself is calendar-agnostic).
        for date in [d(2024, 3, 10), d(2024, 11, 3)] {
            let last = timeslot_to_timestamp(959, 1, date);
            assert_eq!(timestamp_to_timeslot(&last, 1), 959);
        }
    }

    #[test]
    fn source_period_selection() {
        assert_eq!(Period::source_for(60).unwrap(), Period::Thirty);
        assert_eq!(Period::source_for(15).unwrap(), Period::Five);
        assert_eq!(Period::source_for(3).unwrap(), Period::One);
        assert!(Period::source_for(0).is_err());
        assert!(Period::from_minutes(15).is_err());
    }
}
