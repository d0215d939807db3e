// Copyright 2025 Quartzite Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::meta::trigger::{TimeOfDay, cron::cron_next_after};

/// A named, chainable inclusion predicate. Triggers referencing a calendar
/// skip any candidate fire time the calendar excludes. When `base` is set the
/// effective predicate is the conjunction of both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Box<Calendar>>,
    /// Zone used to resolve instants to local dates and times-of-day.
    #[serde(default = "default_time_zone")]
    pub time_zone: Tz,
    pub detail: CalendarDetail,
}

fn default_time_zone() -> Tz {
    Tz::UTC
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalendarDetail {
    /// Excludes a set of (month, day) pairs, every year.
    Annual { excluded_days: Vec<(u32, u32)> },
    /// Excludes a set of days of the month.
    Monthly { excluded_days: Vec<u32> },
    /// Excludes a set of weekdays.
    Weekly { excluded_days: Vec<Weekday> },
    /// Excludes the daily time window `[range_start, range_end]`, or
    /// everything outside it when `invert` is set.
    Daily {
        range_start: TimeOfDay,
        range_end: TimeOfDay,
        #[serde(default)]
        invert: bool,
    },
    /// Excludes every instant matched by the cron expression.
    Cron { expression: String },
    /// Excludes an explicit set of dates.
    Holiday { excluded_dates: Vec<NaiveDate> },
}

impl Calendar {
    pub fn new(detail: CalendarDetail) -> Self {
        Self {
            description: None,
            base: None,
            time_zone: Tz::UTC,
            detail,
        }
    }

    pub fn with_base(mut self, base: Calendar) -> Self {
        self.base = Some(Box::new(base));
        self
    }

    pub fn with_time_zone(mut self, tz: Tz) -> Self {
        self.time_zone = tz;
        self
    }

    pub fn is_time_included(&self, t: DateTime<Utc>) -> bool {
        if let Some(base) = &self.base
            && !base.is_time_included(t)
        {
            return false;
        }
        let local = t.with_timezone(&self.time_zone);
        match &self.detail {
            CalendarDetail::Annual { excluded_days } => {
                !excluded_days.contains(&(local.month(), local.day()))
            }
            CalendarDetail::Monthly { excluded_days } => !excluded_days.contains(&local.day()),
            CalendarDetail::Weekly { excluded_days } => !excluded_days.contains(&local.weekday()),
            CalendarDetail::Daily {
                range_start,
                range_end,
                invert,
            } => {
                let tod = TimeOfDay::new(local.hour(), local.minute(), local.second());
                let in_range = *range_start <= tod && tod <= *range_end;
                if *invert { in_range } else { !in_range }
            }
            CalendarDetail::Cron { expression } => {
                // excluded when the instant itself is a firing point of the
                // expression, at second granularity
                let probe = t - chrono::Duration::milliseconds(1);
                match cron_next_after(expression, self.time_zone, probe) {
                    Some(next) => next.timestamp() != t.timestamp(),
                    None => true,
                }
            }
            CalendarDetail::Holiday { excluded_dates } => {
                !excluded_dates.contains(&local.date_naive())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_annual_calendar() {
        let cal = Calendar::new(CalendarDetail::Annual {
            excluded_days: vec![(12, 25), (1, 1)],
        });
        assert!(!cal.is_time_included(at(2024, 12, 25, 9, 0, 0)));
        assert!(!cal.is_time_included(at(2025, 1, 1, 0, 0, 0)));
        assert!(cal.is_time_included(at(2024, 12, 24, 9, 0, 0)));
    }

    #[test]
    fn test_monthly_calendar() {
        let cal = Calendar::new(CalendarDetail::Monthly {
            excluded_days: vec![1, 15],
        });
        assert!(!cal.is_time_included(at(2024, 7, 15, 12, 0, 0)));
        assert!(cal.is_time_included(at(2024, 7, 16, 12, 0, 0)));
    }

    #[test]
    fn test_weekly_calendar() {
        let cal = Calendar::new(CalendarDetail::Weekly {
            excluded_days: vec![Weekday::Sat, Weekday::Sun],
        });
        // 2024-07-13 is a Saturday
        assert!(!cal.is_time_included(at(2024, 7, 13, 12, 0, 0)));
        assert!(cal.is_time_included(at(2024, 7, 15, 12, 0, 0)));
    }

    #[test]
    fn test_daily_calendar_window() {
        let cal = Calendar::new(CalendarDetail::Daily {
            range_start: TimeOfDay::new(22, 0, 0),
            range_end: TimeOfDay::new(23, 59, 59),
            invert: false,
        });
        assert!(!cal.is_time_included(at(2024, 7, 15, 22, 30, 0)));
        assert!(cal.is_time_included(at(2024, 7, 15, 12, 0, 0)));

        let inverted = Calendar::new(CalendarDetail::Daily {
            range_start: TimeOfDay::new(9, 0, 0),
            range_end: TimeOfDay::new(17, 0, 0),
            invert: true,
        });
        assert!(inverted.is_time_included(at(2024, 7, 15, 12, 0, 0)));
        assert!(!inverted.is_time_included(at(2024, 7, 15, 8, 0, 0)));
    }

    #[test]
    fn test_holiday_calendar() {
        let cal = Calendar::new(CalendarDetail::Holiday {
            excluded_dates: vec![NaiveDate::from_ymd_opt(2024, 7, 4).unwrap()],
        });
        assert!(!cal.is_time_included(at(2024, 7, 4, 10, 0, 0)));
        assert!(cal.is_time_included(at(2024, 7, 5, 10, 0, 0)));
    }

    #[test]
    fn test_cron_calendar() {
        // excludes the top of every hour
        let cal = Calendar::new(CalendarDetail::Cron {
            expression: "0 0 * * * ?".to_string(),
        });
        assert!(!cal.is_time_included(at(2024, 7, 15, 14, 0, 0)));
        assert!(cal.is_time_included(at(2024, 7, 15, 14, 0, 1)));
    }

    #[test]
    fn test_chained_base_calendar() {
        let weekends = Calendar::new(CalendarDetail::Weekly {
            excluded_days: vec![Weekday::Sat, Weekday::Sun],
        });
        let holidays = Calendar::new(CalendarDetail::Holiday {
            excluded_dates: vec![NaiveDate::from_ymd_opt(2024, 7, 15).unwrap()],
        })
        .with_base(weekends);
        // Monday, but a holiday
        assert!(!holidays.is_time_included(at(2024, 7, 15, 9, 0, 0)));
        // Saturday, excluded by the base
        assert!(!holidays.is_time_included(at(2024, 7, 13, 9, 0, 0)));
        // plain Tuesday
        assert!(holidays.is_time_included(at(2024, 7, 16, 9, 0, 0)));
    }
}
