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

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::{
    IntervalUnit, OnceMisfirePolicy, REPEAT_INDEFINITELY, Schedule, TimeOfDay, ValidationError,
    YEAR_TO_GIVE_UP_SCHEDULING_AT,
};

/// Fires every `repeat_interval` seconds/minutes/hours inside the daily
/// window `[start_time_of_day, end_time_of_day]`, on the configured days of
/// the week, then advances to the next included day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DailyTimeIntervalSchedule {
    pub repeat_interval: i32,
    pub repeat_interval_unit: IntervalUnit,
    pub days_of_week: Vec<Weekday>,
    pub start_time_of_day: TimeOfDay,
    pub end_time_of_day: TimeOfDay,
    /// Total number of firings after the first; -1 repeats indefinitely.
    #[serde(default = "default_repeat_count")]
    pub repeat_count: i32,
    #[serde(default)]
    pub times_triggered: i32,
    pub time_zone: Tz,
    #[serde(default)]
    pub misfire_policy: OnceMisfirePolicy,
}

fn default_repeat_count() -> i32 {
    REPEAT_INDEFINITELY
}

pub const ALL_DAYS_OF_WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

impl DailyTimeIntervalSchedule {
    pub fn builder() -> DailyTimeIntervalScheduleBuilder {
        DailyTimeIntervalScheduleBuilder::new()
    }

    pub fn schedule_builder(&self) -> DailyTimeIntervalScheduleBuilder {
        DailyTimeIntervalScheduleBuilder {
            repeat_interval: self.repeat_interval,
            repeat_interval_unit: self.repeat_interval_unit,
            days_of_week: self.days_of_week.clone(),
            start_time_of_day: self.start_time_of_day,
            end_time_of_day: self.end_time_of_day,
            repeat_count: self.repeat_count,
            time_zone: self.time_zone,
            misfire_policy: self.misfire_policy,
        }
    }

    fn interval_millis(&self) -> i64 {
        let unit_ms = match self.repeat_interval_unit {
            IntervalUnit::Second => 1000,
            IntervalUnit::Minute => 60 * 1000,
            IntervalUnit::Hour => 3600 * 1000,
            _ => 0,
        };
        self.repeat_interval as i64 * unit_ms
    }

    pub(crate) fn fire_time_after(
        &self,
        after: DateTime<Utc>,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        if self.repeat_count != REPEAT_INDEFINITELY && self.times_triggered > self.repeat_count {
            return None;
        }
        let interval_ms = self.interval_millis();
        if interval_ms < 1 {
            return None;
        }
        let bounded = |t: DateTime<Utc>| match end {
            Some(end) if t > end => None,
            _ => Some(t),
        };
        let after = after.max(start - Duration::milliseconds(1));
        let mut date = after.with_timezone(&self.time_zone).date_naive();
        // scan forward at most a year of days; an empty weekday set is
        // rejected by validate()
        for _ in 0..400 {
            if date.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                return None;
            }
            if self.days_of_week.contains(&date.weekday())
                && let Some(cand) = self.candidate_in_window(date, after, interval_ms)
            {
                return bounded(cand);
            }
            date = date.succ_opt()?;
        }
        None
    }

    fn candidate_in_window(
        &self,
        date: NaiveDate,
        after: DateTime<Utc>,
        interval_ms: i64,
    ) -> Option<DateTime<Utc>> {
        let window_start = self.resolve_local(date, self.start_time_of_day)?;
        let window_end = self.resolve_local(date, self.end_time_of_day)?;
        let cand = if after < window_start {
            window_start
        } else {
            let elapsed = (after - window_start).num_milliseconds();
            let k = elapsed / interval_ms + 1;
            window_start + Duration::milliseconds(k * interval_ms)
        };
        (cand <= window_end).then_some(cand)
    }

    fn resolve_local(&self, date: NaiveDate, tod: TimeOfDay) -> Option<DateTime<Utc>> {
        let naive = date.and_time(tod.to_naive_time());
        match self.time_zone.from_local_datetime(&naive) {
            chrono::LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
            chrono::LocalResult::Ambiguous(t, _) => Some(t.with_timezone(&Utc)),
            chrono::LocalResult::None => self
                .time_zone
                .from_local_datetime(&(naive + Duration::hours(1)))
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        if !matches!(
            self.repeat_interval_unit,
            IntervalUnit::Second | IntervalUnit::Minute | IntervalUnit::Hour
        ) {
            return Err(ValidationError::Invalid(format!(
                "daily time interval unit must be SECOND, MINUTE or HOUR, got {}",
                self.repeat_interval_unit.as_str()
            )));
        }
        if self.repeat_interval < 1 {
            return Err(ValidationError::Invalid(
                "daily time interval must be at least 1".to_string(),
            ));
        }
        if self.repeat_count < REPEAT_INDEFINITELY {
            return Err(ValidationError::Invalid(format!(
                "repeat count cannot be {}",
                self.repeat_count
            )));
        }
        if self.days_of_week.is_empty() {
            return Err(ValidationError::Invalid(
                "at least one day of week is required".to_string(),
            ));
        }
        if !self.start_time_of_day.is_valid() || !self.end_time_of_day.is_valid() {
            return Err(ValidationError::Invalid(
                "time of day out of range".to_string(),
            ));
        }
        if self.end_time_of_day < self.start_time_of_day {
            return Err(ValidationError::Invalid(
                "end time of day cannot precede start time of day".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<DailyTimeIntervalSchedule> for Schedule {
    fn from(s: DailyTimeIntervalSchedule) -> Self {
        Schedule::DailyTimeInterval(s)
    }
}

#[derive(Debug, Clone)]
pub struct DailyTimeIntervalScheduleBuilder {
    repeat_interval: i32,
    repeat_interval_unit: IntervalUnit,
    days_of_week: Vec<Weekday>,
    start_time_of_day: TimeOfDay,
    end_time_of_day: TimeOfDay,
    repeat_count: i32,
    time_zone: Tz,
    misfire_policy: OnceMisfirePolicy,
}

impl Default for DailyTimeIntervalScheduleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DailyTimeIntervalScheduleBuilder {
    pub fn new() -> Self {
        Self {
            repeat_interval: 1,
            repeat_interval_unit: IntervalUnit::Minute,
            days_of_week: ALL_DAYS_OF_WEEK.to_vec(),
            start_time_of_day: TimeOfDay::new(0, 0, 0),
            end_time_of_day: TimeOfDay::new(23, 59, 59),
            repeat_count: REPEAT_INDEFINITELY,
            time_zone: Tz::UTC,
            misfire_policy: OnceMisfirePolicy::default(),
        }
    }

    pub fn with_interval(mut self, interval: i32, unit: IntervalUnit) -> Self {
        self.repeat_interval = interval;
        self.repeat_interval_unit = unit;
        self
    }

    pub fn on_days_of_week(mut self, days: &[Weekday]) -> Self {
        self.days_of_week = days.to_vec();
        self
    }

    pub fn on_monday_through_friday(mut self) -> Self {
        self.days_of_week = vec![
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ];
        self
    }

    pub fn on_saturday_and_sunday(mut self) -> Self {
        self.days_of_week = vec![Weekday::Sat, Weekday::Sun];
        self
    }

    pub fn starting_daily_at(mut self, tod: TimeOfDay) -> Self {
        self.start_time_of_day = tod;
        self
    }

    pub fn ending_daily_at(mut self, tod: TimeOfDay) -> Self {
        self.end_time_of_day = tod;
        self
    }

    pub fn with_repeat_count(mut self, count: i32) -> Self {
        self.repeat_count = count;
        self
    }

    pub fn in_time_zone(mut self, tz: Tz) -> Self {
        self.time_zone = tz;
        self
    }

    pub fn with_misfire_handling_instruction_ignore_misfires(mut self) -> Self {
        self.misfire_policy = OnceMisfirePolicy::IgnoreMisfires;
        self
    }

    pub fn with_misfire_handling_instruction_fire_and_proceed(mut self) -> Self {
        self.misfire_policy = OnceMisfirePolicy::FireOnceNow;
        self
    }

    pub fn with_misfire_handling_instruction_do_nothing(mut self) -> Self {
        self.misfire_policy = OnceMisfirePolicy::DoNothing;
        self
    }

    pub fn build(self) -> DailyTimeIntervalSchedule {
        DailyTimeIntervalSchedule {
            repeat_interval: self.repeat_interval,
            repeat_interval_unit: self.repeat_interval_unit,
            days_of_week: self.days_of_week,
            start_time_of_day: self.start_time_of_day,
            end_time_of_day: self.end_time_of_day,
            repeat_count: self.repeat_count,
            times_triggered: 0,
            time_zone: self.time_zone,
            misfire_policy: self.misfire_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn nine_to_five_every_2h() -> DailyTimeIntervalSchedule {
        DailyTimeIntervalScheduleBuilder::new()
            .with_interval(2, IntervalUnit::Hour)
            .starting_daily_at(TimeOfDay::new(9, 0, 0))
            .ending_daily_at(TimeOfDay::new(17, 0, 0))
            .on_monday_through_friday()
            .build()
    }

    #[test]
    fn test_advances_within_window() {
        let s = nine_to_five_every_2h();
        let start = at(2024, 7, 15, 0, 0, 0); // Monday
        let f1 = s.fire_time_after(start, start, None).unwrap();
        assert_eq!(f1, at(2024, 7, 15, 9, 0, 0));
        let f2 = s.fire_time_after(f1, start, None).unwrap();
        assert_eq!(f2, at(2024, 7, 15, 11, 0, 0));
        let last = s.fire_time_after(at(2024, 7, 15, 15, 30, 0), start, None).unwrap();
        assert_eq!(last, at(2024, 7, 15, 17, 0, 0));
    }

    #[test]
    fn test_advances_to_next_included_day() {
        let s = nine_to_five_every_2h();
        let start = at(2024, 7, 15, 0, 0, 0);
        // after the Friday window closes, the next fire is Monday 09:00
        let next = s
            .fire_time_after(at(2024, 7, 19, 17, 0, 0), start, None)
            .unwrap();
        assert_eq!(next, at(2024, 7, 22, 9, 0, 0));
    }

    #[test]
    fn test_weekend_days_selection() {
        let s = DailyTimeIntervalScheduleBuilder::new()
            .with_interval(30, IntervalUnit::Minute)
            .starting_daily_at(TimeOfDay::new(8, 0, 0))
            .ending_daily_at(TimeOfDay::new(10, 0, 0))
            .on_saturday_and_sunday()
            .build();
        let start = at(2024, 7, 15, 0, 0, 0); // Monday
        let next = s.fire_time_after(start, start, None).unwrap();
        // first Saturday after the start
        assert_eq!(next, at(2024, 7, 20, 8, 0, 0));
    }

    #[test]
    fn test_time_zone_window() {
        let tz: Tz = "America/Chicago".parse().unwrap();
        let s = DailyTimeIntervalScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Hour)
            .starting_daily_at(TimeOfDay::new(9, 0, 0))
            .ending_daily_at(TimeOfDay::new(17, 0, 0))
            .in_time_zone(tz)
            .build();
        let start = at(2024, 7, 15, 0, 0, 0);
        // 09:00 Chicago in July is 14:00Z
        assert_eq!(
            s.fire_time_after(start, start, None),
            Some(at(2024, 7, 15, 14, 0, 0))
        );
    }

    #[test]
    fn test_repeat_count_exhaustion() {
        let mut s = DailyTimeIntervalScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Hour)
            .with_repeat_count(2)
            .build();
        s.times_triggered = 3;
        let start = at(2024, 7, 15, 0, 0, 0);
        assert_eq!(s.fire_time_after(start, start, None), None);
    }

    #[test]
    fn test_end_time_bound() {
        let s = nine_to_five_every_2h();
        let start = at(2024, 7, 15, 0, 0, 0);
        assert_eq!(
            s.fire_time_after(at(2024, 7, 15, 10, 0, 0), start, Some(at(2024, 7, 15, 10, 30, 0))),
            None
        );
    }

    #[test]
    fn test_validate() {
        assert!(nine_to_five_every_2h().validate().is_ok());
        let bad_unit = DailyTimeIntervalScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Day)
            .build();
        assert!(bad_unit.validate().is_err());
        let empty_days = DailyTimeIntervalScheduleBuilder::new().on_days_of_week(&[]).build();
        assert!(empty_days.validate().is_err());
        let inverted = DailyTimeIntervalScheduleBuilder::new()
            .starting_daily_at(TimeOfDay::new(17, 0, 0))
            .ending_daily_at(TimeOfDay::new(9, 0, 0))
            .build();
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_schedule_builder_round_trip() {
        let s = nine_to_five_every_2h();
        assert_eq!(s.schedule_builder().build(), s);
    }
}
