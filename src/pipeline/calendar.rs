//! Trading calendar: weekends, exchange holidays and special sessions
//!
//! Holiday files live in the calendar directory as `holidays_YYYY.json`:
//!
//! ```json
//! {
//!   "holidays": [{ "date": "2024-03-25", "name": "Holi" }],
//!   "special_sessions": [{ "date": "2024-11-01", "name": "Muhurat", "open": "18:00", "close": "19:00" }]
//! }
//! ```

use super::clock::{parse_hhmm, SessionHours};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How far ahead `next_trading_day` searches before giving up
pub const MAX_CALENDAR_LOOKAHEAD_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("failed to read calendar file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse calendar file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid session time '{value}' for {date}")]
    InvalidTime { date: NaiveDate, value: String },
    #[error("no trading day within {days} days after {from}")]
    NoTradingDay { from: NaiveDate, days: i64 },
}

#[derive(Debug, Deserialize)]
struct CalendarFile {
    #[serde(default)]
    holidays: Vec<HolidayEntry>,
    #[serde(default)]
    special_sessions: Vec<SpecialSessionEntry>,
}

#[derive(Debug, Deserialize)]
struct HolidayEntry {
    date: NaiveDate,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpecialSessionEntry {
    date: NaiveDate,
    #[serde(default)]
    name: String,
    open: String,
    close: String,
}

/// Where a loaded calendar came from, so it can be loaded again
#[derive(Debug, Clone)]
struct CalendarSource {
    dir: PathBuf,
    years: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct TradingCalendar {
    default_hours: SessionHours,
    holidays: HashMap<NaiveDate, String>,
    special_sessions: HashMap<NaiveDate, (String, SessionHours)>,
    source: Option<CalendarSource>,
}

impl TradingCalendar {
    /// Calendar that only knows about weekends
    pub fn new(default_hours: SessionHours) -> Self {
        Self {
            default_hours,
            holidays: HashMap::new(),
            special_sessions: HashMap::new(),
            source: None,
        }
    }

    /// Load `holidays_YYYY.json` for each requested year. A missing file is
    /// a warning, not an error: the calendar falls back to weekends only.
    pub fn load(
        dir: impl AsRef<Path>,
        default_hours: SessionHours,
        years: impl IntoIterator<Item = i32>,
    ) -> Result<Self, CalendarError> {
        let mut calendar = Self::new(default_hours);
        let years: Vec<i32> = years.into_iter().collect();
        for &year in &years {
            let path = dir.as_ref().join(format!("holidays_{}.json", year));
            if !path.exists() {
                log::warn!(
                    "⚠️  No holiday calendar for {} ({}), assuming weekends only",
                    year,
                    path.display()
                );
                continue;
            }
            calendar.load_file(&path)?;
        }
        calendar.source = Some(CalendarSource {
            dir: dir.as_ref().to_path_buf(),
            years,
        });
        Ok(calendar)
    }

    /// Years requested from the calendar directory; empty when built in code
    pub fn loaded_years(&self) -> &[i32] {
        self.source.as_ref().map(|s| s.years.as_slice()).unwrap_or_default()
    }

    /// Load the same directory again for `year` and the year after.
    /// `Ok(None)` when `year` is already the first loaded year or the
    /// calendar was built in code.
    pub fn reload_for_year(&self, year: i32) -> Result<Option<Self>, CalendarError> {
        let Some(source) = &self.source else {
            return Ok(None);
        };
        if source.years.first() == Some(&year) {
            return Ok(None);
        }
        Self::load(&source.dir, self.default_hours, [year, year + 1]).map(Some)
    }

    fn load_file(&mut self, path: &Path) -> Result<(), CalendarError> {
        let raw = fs::read_to_string(path).map_err(|source| CalendarError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: CalendarFile = serde_json::from_str(&raw).map_err(|source| CalendarError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        for holiday in file.holidays {
            self.add_holiday(holiday.date, &holiday.name);
        }
        for special in file.special_sessions {
            let open = parse_hhmm(&special.open).ok_or_else(|| CalendarError::InvalidTime {
                date: special.date,
                value: special.open.clone(),
            })?;
            let close = parse_hhmm(&special.close).ok_or_else(|| CalendarError::InvalidTime {
                date: special.date,
                value: special.close.clone(),
            })?;
            let hours = SessionHours::new(open, close).map_err(|_| CalendarError::InvalidTime {
                date: special.date,
                value: format!("{}-{}", special.open, special.close),
            })?;
            self.add_special_session(special.date, &special.name, hours);
        }

        log::info!(
            "📅 Loaded calendar {} ({} holidays, {} special sessions)",
            path.display(),
            self.holidays.len(),
            self.special_sessions.len()
        );
        Ok(())
    }

    pub fn add_holiday(&mut self, date: NaiveDate, name: &str) {
        self.holidays.insert(date, name.to_string());
    }

    pub fn add_special_session(&mut self, date: NaiveDate, name: &str, hours: SessionHours) {
        self.special_sessions.insert(date, (name.to_string(), hours));
    }

    pub fn holiday_name(&self, date: NaiveDate) -> Option<&str> {
        self.holidays.get(&date).map(String::as_str)
    }

    /// Special sessions trade even on weekends and holidays
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        if self.special_sessions.contains_key(&date) {
            return true;
        }
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        !self.holidays.contains_key(&date)
    }

    /// Session hours for a trading day, `None` when the market is closed
    pub fn session_hours(&self, date: NaiveDate) -> Option<SessionHours> {
        if let Some((_, hours)) = self.special_sessions.get(&date) {
            return Some(*hours);
        }
        self.is_trading_day(date).then_some(self.default_hours)
    }

    /// First trading day strictly after `date`
    pub fn next_trading_day(&self, date: NaiveDate) -> Result<NaiveDate, CalendarError> {
        (1..=MAX_CALENDAR_LOOKAHEAD_DAYS)
            .map(|offset| date + Duration::days(offset))
            .find(|candidate| self.is_trading_day(*candidate))
            .ok_or(CalendarError::NoTradingDay {
                from: date,
                days: MAX_CALENDAR_LOOKAHEAD_DAYS,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hours() -> SessionHours {
        SessionHours::new(parse_hhmm("09:15").unwrap(), parse_hhmm("15:30").unwrap()).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_weekends_closed() {
        let calendar = TradingCalendar::new(hours());
        assert!(calendar.is_trading_day(d(2024, 3, 15))); // Friday
        assert!(!calendar.is_trading_day(d(2024, 3, 16))); // Saturday
        assert!(!calendar.is_trading_day(d(2024, 3, 17))); // Sunday
        assert_eq!(calendar.next_trading_day(d(2024, 3, 15)).unwrap(), d(2024, 3, 18));
        assert!(calendar.session_hours(d(2024, 3, 16)).is_none());
    }

    #[test]
    fn test_load_holidays_and_special_sessions() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("holidays_2024.json"),
            r#"{
                "holidays": [{ "date": "2024-03-25", "name": "Holi" }],
                "special_sessions": [
                    { "date": "2024-11-01", "name": "Muhurat", "open": "18:00", "close": "19:00" }
                ]
            }"#,
        )
        .unwrap();

        let calendar = TradingCalendar::load(dir.path(), hours(), [2024, 2025]).unwrap();

        assert!(!calendar.is_trading_day(d(2024, 3, 25)));
        assert_eq!(calendar.holiday_name(d(2024, 3, 25)), Some("Holi"));
        // Friday before Holi Monday -> next trading day is Tuesday
        assert_eq!(calendar.next_trading_day(d(2024, 3, 22)).unwrap(), d(2024, 3, 26));

        let special = calendar.session_hours(d(2024, 11, 1)).unwrap();
        assert_eq!(special.open, parse_hhmm("18:00").unwrap());
        assert_eq!(special.close, parse_hhmm("19:00").unwrap());
        assert_eq!(calendar.session_hours(d(2024, 3, 15)), Some(hours()));
    }

    #[test]
    fn test_malformed_calendar_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("holidays_2024.json"), "{ not json").unwrap();
        assert!(matches!(
            TradingCalendar::load(dir.path(), hours(), [2024]),
            Err(CalendarError::Parse { .. })
        ));
    }

    #[test]
    fn test_reload_moves_to_the_new_year() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("holidays_2025.json"),
            r#"{ "holidays": [{ "date": "2025-12-25", "name": "Christmas" }] }"#,
        )
        .unwrap();

        let calendar = TradingCalendar::load(dir.path(), hours(), [2024, 2025]).unwrap();
        assert_eq!(calendar.loaded_years(), &[2024, 2025]);
        assert!(calendar.reload_for_year(2024).unwrap().is_none());
        assert!(TradingCalendar::new(hours()).reload_for_year(2025).unwrap().is_none());

        // Published after startup
        fs::write(
            dir.path().join("holidays_2026.json"),
            r#"{ "holidays": [{ "date": "2026-01-26", "name": "Republic Day" }] }"#,
        )
        .unwrap();
        assert!(calendar.is_trading_day(d(2026, 1, 26)));

        let reloaded = calendar.reload_for_year(2025).unwrap().unwrap();
        assert_eq!(reloaded.loaded_years(), &[2025, 2026]);
        assert!(!reloaded.is_trading_day(d(2025, 12, 25)));
        assert!(!reloaded.is_trading_day(d(2026, 1, 26)));
        assert_eq!(reloaded.holiday_name(d(2026, 1, 26)), Some("Republic Day"));
    }
}
