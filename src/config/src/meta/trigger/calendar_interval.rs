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

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::{
    IntervalUnit, OnceMisfirePolicy, Schedule, ValidationError, YEAR_TO_GIVE_UP_SCHEDULING_AT,
};

/// Fires every `repeat_interval` calendar units from the start time. Second
/// through Hour intervals are exact durations; Day and Week intervals are
/// exact durations unless `preserve_hour_of_day_across_daylight_savings` pins
/// the local wall time; Month and Year intervals always follow calendar
/// rules, clamping to the end of shorter months.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CalendarIntervalSchedule {
    pub repeat_interval: i32,
    pub repeat_interval_unit: IntervalUnit,
    pub time_zone: Tz,
    #[serde(default)]
    pub preserve_hour_of_day_across_daylight_savings: bool,
    /// When the pinned wall time does not exist on a candidate day (spring
    /// DST gap), skip the day entirely instead of shifting forward.
    #[serde(default)]
    pub skip_day_if_hour_does_not_exist: bool,
    #[serde(default)]
    pub times_triggered: i32,
    #[serde(default)]
    pub misfire_policy: OnceMisfirePolicy,
}

impl CalendarIntervalSchedule {
    pub fn builder() -> CalendarIntervalScheduleBuilder {
        CalendarIntervalScheduleBuilder::new()
    }

    pub fn schedule_builder(&self) -> CalendarIntervalScheduleBuilder {
        CalendarIntervalScheduleBuilder {
            repeat_interval: self.repeat_interval,
            repeat_interval_unit: self.repeat_interval_unit,
            time_zone: self.time_zone,
            preserve_hour_of_day_across_daylight_savings: self
                .preserve_hour_of_day_across_daylight_savings,
            skip_day_if_hour_does_not_exist: self.skip_day_if_hour_does_not_exist,
            misfire_policy: self.misfire_policy,
        }
    }

    pub(crate) fn fire_time_after(
        &self,
        after: DateTime<Utc>,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        if self.repeat_interval < 1 {
            return None;
        }
        let bounded = |t: DateTime<Utc>| match end {
            Some(end) if t > end => None,
            _ => Some(t),
        };
        if after < start {
            return bounded(start);
        }
        let interval = self.repeat_interval as i64;
        match self.repeat_interval_unit {
            IntervalUnit::Second => self.duration_step(after, start, interval * 1000).and_then(bounded),
            IntervalUnit::Minute => self
                .duration_step(after, start, interval * 60 * 1000)
                .and_then(bounded),
            IntervalUnit::Hour => self
                .duration_step(after, start, interval * 3600 * 1000)
                .and_then(bounded),
            IntervalUnit::Day | IntervalUnit::Week => {
                let step_days = if self.repeat_interval_unit == IntervalUnit::Week {
                    interval * 7
                } else {
                    interval
                };
                if self.preserve_hour_of_day_across_daylight_savings {
                    self.local_day_step(after, start, step_days).and_then(bounded)
                } else {
                    self.duration_step(after, start, step_days * 24 * 3600 * 1000)
                        .and_then(bounded)
                }
            }
            IntervalUnit::Month => self.local_month_step(after, start, interval).and_then(bounded),
            IntervalUnit::Year => self
                .local_month_step(after, start, interval * 12)
                .and_then(bounded),
        }
    }

    fn duration_step(
        &self,
        after: DateTime<Utc>,
        start: DateTime<Utc>,
        interval_ms: i64,
    ) -> Option<DateTime<Utc>> {
        let elapsed = (after - start).num_milliseconds();
        let k = elapsed / interval_ms + 1;
        Some(start + Duration::milliseconds(k * interval_ms))
    }

    /// Walks whole day-steps from the start date, keeping the start's local
    /// wall time.
    fn local_day_step(
        &self,
        after: DateTime<Utc>,
        start: DateTime<Utc>,
        step_days: i64,
    ) -> Option<DateTime<Utc>> {
        let tz = self.time_zone;
        let local_start = start.with_timezone(&tz);
        let start_date = local_start.date_naive();
        let wall = local_start.time();
        let after_date = after.with_timezone(&tz).date_naive();
        let mut k = (((after_date - start_date).num_days() / step_days) - 1).max(0);
        loop {
            let date = start_date + Duration::days(k * step_days);
            if date.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                return None;
            }
            if let Some(cand) = self.resolve_local(date, wall)
                && cand > after
            {
                return Some(cand);
            }
            k += 1;
        }
    }

    /// Walks whole month-steps from the start date, clamping the
    /// day-of-month where the target month is shorter.
    fn local_month_step(
        &self,
        after: DateTime<Utc>,
        start: DateTime<Utc>,
        step_months: i64,
    ) -> Option<DateTime<Utc>> {
        let tz = self.time_zone;
        let local_start = start.with_timezone(&tz);
        let start_date = local_start.date_naive();
        let wall = local_start.time();
        let after_local = after.with_timezone(&tz);
        let months_elapsed = (after_local.year() as i64 - start_date.year() as i64) * 12
            + after_local.month() as i64
            - start_date.month() as i64;
        let mut k = ((months_elapsed / step_months) - 1).max(0);
        loop {
            let date = start_date.checked_add_months(Months::new((k * step_months) as u32))?;
            if date.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                return None;
            }
            if let Some(cand) = self.resolve_local(date, wall)
                && cand > after
            {
                return Some(cand);
            }
            k += 1;
        }
    }

    fn resolve_local(&self, date: NaiveDate, wall: NaiveTime) -> Option<DateTime<Utc>> {
        let naive = date.and_time(wall);
        match self.time_zone.from_local_datetime(&naive) {
            chrono::LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
            // fall DST overlap, take the first occurrence
            chrono::LocalResult::Ambiguous(t, _) => Some(t.with_timezone(&Utc)),
            chrono::LocalResult::None => {
                if self.skip_day_if_hour_does_not_exist {
                    return None;
                }
                // spring DST gap, shift forward an hour at a time
                for hours in 1..=3 {
                    if let Some(t) = self
                        .time_zone
                        .from_local_datetime(&(naive + Duration::hours(hours)))
                        .earliest()
                    {
                        return Some(t.with_timezone(&Utc));
                    }
                }
                None
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        if self.repeat_interval < 1 {
            return Err(ValidationError::Invalid(
                "calendar interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<CalendarIntervalSchedule> for Schedule {
    fn from(s: CalendarIntervalSchedule) -> Self {
        Schedule::CalendarInterval(s)
    }
}

#[derive(Debug, Clone)]
pub struct CalendarIntervalScheduleBuilder {
    repeat_interval: i32,
    repeat_interval_unit: IntervalUnit,
    time_zone: Tz,
    preserve_hour_of_day_across_daylight_savings: bool,
    skip_day_if_hour_does_not_exist: bool,
    misfire_policy: OnceMisfirePolicy,
}

impl Default for CalendarIntervalScheduleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CalendarIntervalScheduleBuilder {
    pub fn new() -> Self {
        Self {
            repeat_interval: 1,
            repeat_interval_unit: IntervalUnit::Day,
            time_zone: Tz::UTC,
            preserve_hour_of_day_across_daylight_savings: false,
            skip_day_if_hour_does_not_exist: false,
            misfire_policy: OnceMisfirePolicy::default(),
        }
    }

    pub fn with_interval(mut self, interval: i32, unit: IntervalUnit) -> Self {
        self.repeat_interval = interval;
        self.repeat_interval_unit = unit;
        self
    }

    pub fn in_time_zone(mut self, tz: Tz) -> Self {
        self.time_zone = tz;
        self
    }

    pub fn preserve_hour_of_day_across_daylight_savings(mut self, preserve: bool) -> Self {
        self.preserve_hour_of_day_across_daylight_savings = preserve;
        self
    }

    pub fn skip_day_if_hour_does_not_exist(mut self, skip: bool) -> Self {
        self.skip_day_if_hour_does_not_exist = skip;
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

    pub fn build(self) -> CalendarIntervalSchedule {
        CalendarIntervalSchedule {
            repeat_interval: self.repeat_interval,
            repeat_interval_unit: self.repeat_interval_unit,
            time_zone: self.time_zone,
            preserve_hour_of_day_across_daylight_savings: self
                .preserve_hour_of_day_across_daylight_savings,
            skip_day_if_hour_does_not_exist: self.skip_day_if_hour_does_not_exist,
            times_triggered: 0,
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

    fn ny() -> Tz {
        "America/New_York".parse().unwrap()
    }

    #[test]
    fn test_hourly_interval() {
        let s = CalendarIntervalScheduleBuilder::new()
            .with_interval(6, IntervalUnit::Hour)
            .build();
        let start = at(2024, 7, 15, 0, 0, 0);
        assert_eq!(
            s.fire_time_after(start, start, None),
            Some(at(2024, 7, 15, 6, 0, 0))
        );
        assert_eq!(
            s.fire_time_after(at(2024, 7, 15, 6, 0, 0), start, None),
            Some(at(2024, 7, 15, 12, 0, 0))
        );
    }

    #[test]
    fn test_monthly_end_of_month_clamping() {
        let s = CalendarIntervalScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Month)
            .build();
        let start = at(2024, 1, 31, 10, 0, 0);
        let feb = s.fire_time_after(start, start, None).unwrap();
        assert_eq!(feb, at(2024, 2, 29, 10, 0, 0));
        let mar = s.fire_time_after(feb, start, None).unwrap();
        // steps are anchored at the start date, so March recovers the 31st
        assert_eq!(mar, at(2024, 3, 31, 10, 0, 0));
        let apr = s.fire_time_after(mar, start, None).unwrap();
        assert_eq!(apr, at(2024, 4, 30, 10, 0, 0));
    }

    #[test]
    fn test_yearly_leap_day_clamping() {
        let s = CalendarIntervalScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Year)
            .build();
        let start = at(2024, 2, 29, 8, 0, 0);
        assert_eq!(
            s.fire_time_after(start, start, None),
            Some(at(2025, 2, 28, 8, 0, 0))
        );
    }

    #[test]
    fn test_daily_preserve_hour_across_dst() {
        let s = CalendarIntervalScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Day)
            .in_time_zone(ny())
            .preserve_hour_of_day_across_daylight_savings(true)
            .build();
        // 2024-03-09 01:30 EST == 06:30Z; DST starts on the 10th
        let start = at(2024, 3, 9, 6, 30, 0);
        let d1 = s.fire_time_after(start, start, None).unwrap();
        // still EST on the 10th at 01:30
        assert_eq!(d1, at(2024, 3, 10, 6, 30, 0));
        let d2 = s.fire_time_after(d1, start, None).unwrap();
        // EDT from the 11th, wall clock preserved
        assert_eq!(d2, at(2024, 3, 11, 5, 30, 0));
    }

    #[test]
    fn test_daily_without_preserve_shifts_wall_clock() {
        let s = CalendarIntervalScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Day)
            .in_time_zone(ny())
            .build();
        let start = at(2024, 3, 9, 6, 30, 0);
        let d1 = s.fire_time_after(start, start, None).unwrap();
        assert_eq!(d1, at(2024, 3, 10, 6, 30, 0));
        let d2 = s.fire_time_after(d1, start, None).unwrap();
        // exact 24h steps: same instant, local wall clock drifts to 02:30
        assert_eq!(d2, at(2024, 3, 11, 6, 30, 0));
    }

    #[test]
    fn test_dst_gap_skip_day() {
        // 02:30 local does not exist on 2024-03-10 in New York
        let start = at(2024, 3, 8, 7, 30, 0); // 02:30 EST
        let skip = CalendarIntervalScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Day)
            .in_time_zone(ny())
            .preserve_hour_of_day_across_daylight_savings(true)
            .skip_day_if_hour_does_not_exist(true)
            .build();
        let d1 = skip.fire_time_after(start, start, None).unwrap();
        assert_eq!(d1, at(2024, 3, 9, 7, 30, 0));
        let d2 = skip.fire_time_after(d1, start, None).unwrap();
        // the 10th is skipped entirely; 02:30 EDT on the 11th == 06:30Z
        assert_eq!(d2, at(2024, 3, 11, 6, 30, 0));

        let shift = CalendarIntervalScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Day)
            .in_time_zone(ny())
            .preserve_hour_of_day_across_daylight_savings(true)
            .skip_day_if_hour_does_not_exist(false)
            .build();
        let d2 = shift.fire_time_after(d1, start, None).unwrap();
        // shifted one hour forward past the gap: 03:30 EDT == 07:30Z
        assert_eq!(d2, at(2024, 3, 10, 7, 30, 0));
    }

    #[test]
    fn test_weekly_interval() {
        let s = CalendarIntervalScheduleBuilder::new()
            .with_interval(2, IntervalUnit::Week)
            .build();
        let start = at(2024, 7, 1, 9, 0, 0);
        assert_eq!(
            s.fire_time_after(at(2024, 7, 20, 0, 0, 0), start, None),
            Some(at(2024, 7, 29, 9, 0, 0))
        );
    }

    #[test]
    fn test_validate() {
        let mut s = CalendarIntervalScheduleBuilder::new()
            .with_interval(0, IntervalUnit::Day)
            .build();
        assert!(s.validate().is_err());
        s.repeat_interval = 1;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_schedule_builder_round_trip() {
        let s = CalendarIntervalScheduleBuilder::new()
            .with_interval(3, IntervalUnit::Month)
            .in_time_zone(ny())
            .preserve_hour_of_day_across_daylight_savings(true)
            .with_misfire_handling_instruction_do_nothing()
            .build();
        assert_eq!(s.schedule_builder().build(), s);
    }
}
