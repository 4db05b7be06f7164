//! Session clock and 5-minute window calculator
//!
//! Windows are anchored at the local session open and generated by
//! stepping forward in fixed intervals, so a window start is always one of
//! the session's wall-clock marks (09:15, 09:20, ... 15:25). Lookups search
//! the precomputed boundary list; nothing is derived from minute-of-hour
//! arithmetic on an unadjusted clock.

use super::types::MarketTime;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use thiserror::Error;

pub const CANDLE_INTERVAL_MINUTES: i64 = 5;

/// India Standard Time, UTC+05:30 with no daylight saving
pub const IST_OFFSET_SECONDS: i32 = 19_800;

#[derive(Debug, Error, PartialEq)]
pub enum ClockError {
    #[error("invalid UTC offset: {0} seconds")]
    InvalidOffset(i32),
    #[error("session open {open} must be before close {close}")]
    InvalidSession { open: NaiveTime, close: NaiveTime },
    #[error("local time {0} cannot be represented")]
    UnrepresentableTime(NaiveDateTime),
    #[error("{ts} is before session open {open}")]
    BeforeOpen { ts: MarketTime, open: MarketTime },
    #[error("{ts} is at or after session close {close}")]
    AfterClose { ts: MarketTime, close: MarketTime },
}

/// Parse `HH:MM` into a time of day
pub fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl SessionHours {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Result<Self, ClockError> {
        if open >= close {
            return Err(ClockError::InvalidSession { open, close });
        }
        Ok(Self { open, close })
    }
}

/// Window starts for one trading day
#[derive(Debug, Clone)]
pub struct DayWindows {
    date: NaiveDate,
    open: MarketTime,
    close: MarketTime,
    starts: Vec<MarketTime>,
}

impl DayWindows {
    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn open(&self) -> MarketTime {
        self.open
    }

    pub fn close(&self) -> MarketTime {
        self.close
    }

    pub fn starts(&self) -> &[MarketTime] {
        &self.starts
    }

    /// Enclosing window start for a local timestamp. Open is inclusive,
    /// close is exclusive.
    pub fn locate(&self, local: &MarketTime) -> Result<MarketTime, ClockError> {
        if *local < self.open {
            return Err(ClockError::BeforeOpen { ts: *local, open: self.open });
        }
        if *local >= self.close {
            return Err(ClockError::AfterClose { ts: *local, close: self.close });
        }
        let idx = self.starts.partition_point(|start| start <= local);
        // idx >= 1 because starts[0] == open <= local
        Ok(self.starts[idx - 1])
    }
}

#[derive(Debug, Clone)]
pub struct SessionClock {
    offset: FixedOffset,
    hours: SessionHours,
    interval: Duration,
}

impl SessionClock {
    pub fn new(utc_offset_seconds: i32, hours: SessionHours) -> Result<Self, ClockError> {
        let offset = FixedOffset::east_opt(utc_offset_seconds)
            .ok_or(ClockError::InvalidOffset(utc_offset_seconds))?;
        Ok(Self {
            offset,
            hours,
            interval: Duration::minutes(CANDLE_INTERVAL_MINUTES),
        })
    }

    /// Same timezone and interval with different session hours (special sessions)
    pub fn with_hours(&self, hours: SessionHours) -> Self {
        Self {
            offset: self.offset,
            hours,
            interval: self.interval,
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn hours(&self) -> SessionHours {
        self.hours
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn to_local(&self, ts: DateTime<Utc>) -> MarketTime {
        ts.with_timezone(&self.offset)
    }

    /// Local calendar date of a UTC instant
    pub fn local_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        self.to_local(ts).date_naive()
    }

    pub fn local_datetime(&self, date: NaiveDate, time: NaiveTime) -> Result<MarketTime, ClockError> {
        let naive = date.and_time(time);
        self.offset
            .from_local_datetime(&naive)
            .single()
            .ok_or(ClockError::UnrepresentableTime(naive))
    }

    pub fn session_bounds(&self, date: NaiveDate) -> Result<(MarketTime, MarketTime), ClockError> {
        Ok((
            self.local_datetime(date, self.hours.open)?,
            self.local_datetime(date, self.hours.close)?,
        ))
    }

    pub fn day_windows(&self, date: NaiveDate) -> Result<DayWindows, ClockError> {
        let (open, close) = self.session_bounds(date)?;
        let mut starts = Vec::new();
        let mut cursor = open;
        while cursor < close {
            starts.push(cursor);
            cursor += self.interval;
        }
        Ok(DayWindows { date, open, close, starts })
    }

    /// Every boundary mark of the session, open through close inclusive
    pub fn boundaries(&self, date: NaiveDate) -> Result<Vec<MarketTime>, ClockError> {
        let day = self.day_windows(date)?;
        let mut marks = day.starts;
        marks.push(day.close);
        Ok(marks)
    }

    /// `(window_start, fires_at)` for each window; the last window fires at close
    pub fn finalization_times(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<(MarketTime, MarketTime)>, ClockError> {
        let day = self.day_windows(date)?;
        Ok(day
            .starts
            .iter()
            .map(|start| (*start, (*start + self.interval).min(day.close)))
            .collect())
    }

    pub fn window_for(&self, ts: DateTime<Utc>) -> Result<MarketTime, ClockError> {
        let local = self.to_local(ts);
        self.day_windows(local.date_naive())?.locate(&local)
    }

    pub fn is_market_hours(&self, ts: DateTime<Utc>) -> bool {
        self.window_for(ts).is_ok()
    }

    /// First boundary strictly after `ts` within that day's session
    pub fn next_boundary(&self, ts: DateTime<Utc>) -> Result<Option<MarketTime>, ClockError> {
        let local = self.to_local(ts);
        let marks = self.boundaries(local.date_naive())?;
        Ok(marks.into_iter().find(|mark| *mark > local))
    }
}
