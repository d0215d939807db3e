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

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_PRIORITY,
    meta::{
        calendar::Calendar,
        job::JobDataMap,
        key::{JobKey, TriggerKey},
    },
    utils::time,
};

pub mod calendar_interval;
pub mod cron;
pub mod custom_calendar;
pub mod daily_time_interval;
pub mod simple;

pub use calendar_interval::CalendarIntervalSchedule;
pub use cron::CronSchedule;
pub use custom_calendar::CustomCalendarSchedule;
pub use daily_time_interval::DailyTimeIntervalSchedule;
pub use simple::SimpleSchedule;

/// Candidate fire times past this year abandon the search instead of looping
/// forever on a schedule a calendar can never satisfy.
pub const YEAR_TO_GIVE_UP_SCHEDULING_AT: i32 = 2299;

pub const REPEAT_INDEFINITELY: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TriggerState {
    #[default]
    Waiting,
    Acquired,
    Executing,
    Complete,
    Paused,
    Blocked,
    PausedBlocked,
    Error,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Acquired => "ACQUIRED",
            Self::Executing => "EXECUTING",
            Self::Complete => "COMPLETE",
            Self::Paused => "PAUSED",
            Self::Blocked => "BLOCKED",
            Self::PausedBlocked => "PAUSED_BLOCKED",
            Self::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ACQUIRED" => Self::Acquired,
            "EXECUTING" => Self::Executing,
            "COMPLETE" => Self::Complete,
            "PAUSED" => Self::Paused,
            "BLOCKED" => Self::Blocked,
            "PAUSED_BLOCKED" => Self::PausedBlocked,
            "ERROR" => Self::Error,
            _ => Self::Waiting,
        }
    }
}

/// Interval units shared by the calendar-interval, daily-time-interval and
/// custom-calendar schedules. Each schedule validates the subset it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
    #[default]
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Second => "SECOND",
            Self::Minute => "MINUTE",
            Self::Hour => "HOUR",
            Self::Day => "DAY",
            Self::Week => "WEEK",
            Self::Month => "MONTH",
            Self::Year => "YEAR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SECOND" => Some(Self::Second),
            "MINUTE" => Some(Self::Minute),
            "HOUR" => Some(Self::Hour),
            "DAY" => Some(Self::Day),
            "WEEK" => Some(Self::Week),
            "MONTH" => Some(Self::Month),
            "YEAR" => Some(Self::Year),
            _ => None,
        }
    }
}

/// Zone-local wall time, ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32, second: u32) -> Self {
        Self {
            hour,
            minute,
            second,
        }
    }

    pub fn seconds_of_day(&self) -> u32 {
        self.hour * 3600 + self.minute * 60 + self.second
    }

    pub fn to_naive_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, self.second).unwrap_or_default()
    }

    pub fn is_valid(&self) -> bool {
        self.hour < 24 && self.minute < 60 && self.second < 60
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{},{},{}", self.hour, self.minute, self.second)
    }
}

/// Misfire handling for the simple schedule. Stored as a small integer in
/// the `misfire_instr` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SimpleMisfirePolicy {
    IgnoreMisfires,
    #[default]
    Smart,
    FireNow,
    RescheduleNowWithExistingRepeatCount,
    RescheduleNowWithRemainingRepeatCount,
    RescheduleNextWithRemainingCount,
    RescheduleNextWithExistingCount,
}

impl SimpleMisfirePolicy {
    pub fn to_code(self) -> i16 {
        match self {
            Self::IgnoreMisfires => -1,
            Self::Smart => 0,
            Self::FireNow => 1,
            Self::RescheduleNowWithExistingRepeatCount => 2,
            Self::RescheduleNowWithRemainingRepeatCount => 3,
            Self::RescheduleNextWithRemainingCount => 4,
            Self::RescheduleNextWithExistingCount => 5,
        }
    }

    pub fn from_code(code: i16) -> Self {
        match code {
            -1 => Self::IgnoreMisfires,
            1 => Self::FireNow,
            2 => Self::RescheduleNowWithExistingRepeatCount,
            3 => Self::RescheduleNowWithRemainingRepeatCount,
            4 => Self::RescheduleNextWithRemainingCount,
            5 => Self::RescheduleNextWithExistingCount,
            _ => Self::Smart,
        }
    }
}

/// Misfire handling shared by the cron, calendar-interval, daily-interval and
/// custom-calendar schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OnceMisfirePolicy {
    IgnoreMisfires,
    #[default]
    Smart,
    FireOnceNow,
    DoNothing,
}

impl OnceMisfirePolicy {
    pub fn to_code(self) -> i16 {
        match self {
            Self::IgnoreMisfires => -1,
            Self::Smart => 0,
            Self::FireOnceNow => 1,
            Self::DoNothing => 2,
        }
    }

    pub fn from_code(code: i16) -> Self {
        match code {
            -1 => Self::IgnoreMisfires,
            1 => Self::FireOnceNow,
            2 => Self::DoNothing,
            _ => Self::Smart,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("trigger name cannot be empty")]
    EmptyName,
    #[error("trigger must reference a job")]
    MissingJob,
    #[error("end time cannot precede start time")]
    EndBeforeStart,
    #[error("{0}")]
    Invalid(String),
}

/// Schedule-specific state, tagged the way the persistent store and the JSON
/// serialisation discriminate trigger subtypes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum Schedule {
    #[serde(rename = "SIMPLE")]
    Simple(SimpleSchedule),
    #[serde(rename = "CRON")]
    Cron(CronSchedule),
    #[serde(rename = "CAL_INT")]
    CalendarInterval(CalendarIntervalSchedule),
    #[serde(rename = "DAILY_I")]
    DailyTimeInterval(DailyTimeIntervalSchedule),
    #[serde(rename = "CUSTOM_CAL")]
    CustomCalendar(CustomCalendarSchedule),
}

impl Schedule {
    pub fn trigger_type(&self) -> &'static str {
        match self {
            Self::Simple(_) => "SIMPLE",
            Self::Cron(_) => "CRON",
            Self::CalendarInterval(_) => "CAL_INT",
            Self::DailyTimeInterval(_) => "DAILY_I",
            Self::CustomCalendar(_) => "CUSTOM_CAL",
        }
    }

    /// Next valid instant strictly greater than `after`, honoring the
    /// trigger's start/end bounds. Pure with respect to the schedule state.
    pub fn fire_time_after(
        &self,
        after: DateTime<Utc>,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Self::Simple(s) => s.fire_time_after(after, start, end),
            Self::Cron(s) => s.fire_time_after(after, start, end),
            Self::CalendarInterval(s) => s.fire_time_after(after, start, end),
            Self::DailyTimeInterval(s) => s.fire_time_after(after, start, end),
            Self::CustomCalendar(s) => s.fire_time_after(after, start, end),
        }
    }

    fn record_fired(&mut self) {
        match self {
            Self::Simple(s) => s.times_triggered += 1,
            Self::Cron(_) => {}
            Self::CalendarInterval(s) => s.times_triggered += 1,
            Self::DailyTimeInterval(s) => s.times_triggered += 1,
            Self::CustomCalendar(s) => s.times_triggered += 1,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Simple(s) => s.validate(),
            Self::Cron(s) => s.validate(),
            Self::CalendarInterval(s) => s.validate(),
            Self::DailyTimeInterval(s) => s.validate(),
            Self::CustomCalendar(s) => s.validate(),
        }
    }

    pub fn misfire_code(&self) -> i16 {
        match self {
            Self::Simple(s) => s.misfire_policy.to_code(),
            Self::Cron(s) => s.misfire_policy.to_code(),
            Self::CalendarInterval(s) => s.misfire_policy.to_code(),
            Self::DailyTimeInterval(s) => s.misfire_policy.to_code(),
            Self::CustomCalendar(s) => s.misfire_policy.to_code(),
        }
    }

    pub fn set_misfire_code(&mut self, code: i16) {
        match self {
            Self::Simple(s) => s.misfire_policy = SimpleMisfirePolicy::from_code(code),
            Self::Cron(s) => s.misfire_policy = OnceMisfirePolicy::from_code(code),
            Self::CalendarInterval(s) => s.misfire_policy = OnceMisfirePolicy::from_code(code),
            Self::DailyTimeInterval(s) => s.misfire_policy = OnceMisfirePolicy::from_code(code),
            Self::CustomCalendar(s) => s.misfire_policy = OnceMisfirePolicy::from_code(code),
        }
    }

    fn once_misfire_policy(&self) -> Option<OnceMisfirePolicy> {
        match self {
            Self::Simple(_) => None,
            Self::Cron(s) => Some(s.misfire_policy),
            Self::CalendarInterval(s) => Some(s.misfire_policy),
            Self::DailyTimeInterval(s) => Some(s.misfire_policy),
            Self::CustomCalendar(s) => Some(s.misfire_policy),
        }
    }
}

/// A declarative schedule plus mutable firing state. The store owns the
/// canonical copy; anything handed to callers is a clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_name: Option<String>,
    #[serde(default)]
    pub state: TriggerState,
    #[serde(default)]
    pub job_data: JobDataMap,
    /// Fired-record entry id carried while this clone is between acquisition
    /// and completion; never persisted on the trigger row itself.
    #[serde(skip)]
    pub fired_entry_id: Option<String>,
    pub schedule: Schedule,
}

impl Trigger {
    pub fn builder() -> TriggerBuilder {
        TriggerBuilder::new()
    }

    /// Must be called exactly once before the trigger is first stored; sets
    /// and returns the initial `next_fire_time`.
    pub fn compute_first_fire_time(
        &mut self,
        calendar: Option<&Calendar>,
    ) -> Option<DateTime<Utc>> {
        let probe = self.start_time - Duration::milliseconds(1);
        let first = self
            .schedule
            .fire_time_after(probe, self.start_time, self.end_time);
        let first = self.skip_excluded(first, calendar);
        self.next_fire_time = first;
        first
    }

    /// Next valid instant strictly greater than `after` (`None` means now),
    /// or `None` when the schedule is exhausted.
    pub fn fire_time_after(&self, after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        self.fire_time_after_with_calendar(after, None)
    }

    pub fn fire_time_after_with_calendar(
        &self,
        after: Option<DateTime<Utc>>,
        calendar: Option<&Calendar>,
    ) -> Option<DateTime<Utc>> {
        let after = after.unwrap_or_else(time::now);
        let candidate = self
            .schedule
            .fire_time_after(after, self.start_time, self.end_time);
        self.skip_excluded(candidate, calendar)
    }

    fn skip_excluded(
        &self,
        mut candidate: Option<DateTime<Utc>>,
        calendar: Option<&Calendar>,
    ) -> Option<DateTime<Utc>> {
        while let Some(t) = candidate {
            if t.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                return None;
            }
            match calendar {
                Some(cal) if !cal.is_time_included(t) => {
                    candidate = self
                        .schedule
                        .fire_time_after(t, self.start_time, self.end_time);
                }
                _ => return Some(t),
            }
        }
        None
    }

    /// Called on fire: advances `previous_fire_time`, computes the next
    /// `next_fire_time` skipping excluded instants, and bumps the
    /// schedule-specific counters.
    pub fn triggered(&mut self, calendar: Option<&Calendar>) {
        self.schedule.record_fired();
        self.previous_fire_time = self.next_fire_time;
        self.next_fire_time = match self.previous_fire_time {
            Some(prev) => self.fire_time_after_with_calendar(Some(prev), calendar),
            None => None,
        };
    }

    /// Interprets the misfire instruction against the current clock.
    pub fn update_after_misfire(&mut self, calendar: Option<&Calendar>) {
        self.update_after_misfire_at(calendar, time::now());
    }

    pub fn update_after_misfire_at(
        &mut self,
        calendar: Option<&Calendar>,
        now: DateTime<Utc>,
    ) {
        if matches!(self.schedule, Schedule::Simple(_)) {
            simple::update_after_misfire(self, calendar, now);
            return;
        }
        let policy = match self.schedule.once_misfire_policy() {
            Some(OnceMisfirePolicy::Smart) => OnceMisfirePolicy::FireOnceNow,
            Some(p) => p,
            None => return,
        };
        match policy {
            OnceMisfirePolicy::IgnoreMisfires => {}
            OnceMisfirePolicy::FireOnceNow => self.next_fire_time = Some(now),
            OnceMisfirePolicy::DoNothing => {
                self.next_fire_time = self.fire_time_after_with_calendar(Some(now), calendar);
            }
            OnceMisfirePolicy::Smart => unreachable!(),
        }
    }

    /// Recomputes `next_fire_time` from `previous_fire_time` under a changed
    /// calendar; instants the new calendar excludes are skipped, and a next
    /// fire that fell further than `misfire_threshold` into the past is
    /// re-planned from now.
    pub fn update_with_new_calendar(&mut self, calendar: &Calendar, misfire_threshold: Duration) {
        self.update_with_new_calendar_at(calendar, misfire_threshold, time::now());
    }

    pub fn update_with_new_calendar_at(
        &mut self,
        calendar: &Calendar,
        misfire_threshold: Duration,
        now: DateTime<Utc>,
    ) {
        let from = self.previous_fire_time;
        let mut next = self.fire_time_after_with_calendar(from, Some(calendar));
        if let Some(t) = next
            && t < now
            && now - t >= misfire_threshold
        {
            next = self.fire_time_after_with_calendar(Some(now), Some(calendar));
        }
        self.next_fire_time = next;
    }

    /// Rejects nonsensical parameterisations before the trigger is stored.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key.name.is_empty() || self.key.group.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.job_key.name.is_empty() {
            return Err(ValidationError::MissingJob);
        }
        if let Some(end) = self.end_time
            && end < self.start_time
        {
            return Err(ValidationError::EndBeforeStart);
        }
        self.schedule.validate()
    }
}

/// Fluent construction of a `Trigger`:
///
/// ```
/// use config::meta::{key::JobKey, trigger::{TriggerBuilder, simple::SimpleScheduleBuilder}};
///
/// let trigger = TriggerBuilder::new()
///     .with_identity("every-minute", "etl")
///     .for_job(JobKey::new("sync", "etl"))
///     .with_schedule(
///         SimpleScheduleBuilder::new()
///             .with_interval_millis(60_000)
///             .repeat_forever()
///             .build(),
///     )
///     .build();
/// assert_eq!(trigger.priority, 5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TriggerBuilder {
    key: Option<TriggerKey>,
    job_key: Option<JobKey>,
    description: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    priority: Option<i32>,
    calendar_name: Option<String>,
    job_data: JobDataMap,
    schedule: Option<Schedule>,
}

impl TriggerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, name: &str, group: &str) -> Self {
        self.key = Some(TriggerKey::new(name, group));
        self
    }

    pub fn with_key(mut self, key: TriggerKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn for_job(mut self, job_key: JobKey) -> Self {
        self.job_key = Some(job_key);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn start_at(mut self, t: DateTime<Utc>) -> Self {
        self.start_time = Some(t);
        self
    }

    pub fn start_now(mut self) -> Self {
        self.start_time = Some(time::now());
        self
    }

    pub fn end_at(mut self, t: DateTime<Utc>) -> Self {
        self.end_time = Some(t);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn modified_by_calendar(mut self, calendar_name: &str) -> Self {
        self.calendar_name = Some(calendar_name.to_string());
        self
    }

    pub fn using_job_data<V: Into<crate::utils::json::Value>>(mut self, key: &str, value: V) -> Self {
        self.job_data.put(key, value);
        self
    }

    pub fn with_schedule<S: Into<Schedule>>(mut self, schedule: S) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn build(self) -> Trigger {
        let key = self
            .key
            .unwrap_or_else(|| TriggerKey::new(&crate::ider::generate(), crate::DEFAULT_GROUP));
        let job_key = self.job_key.unwrap_or_else(|| JobKey::new("", ""));
        // a builder with no schedule produces a one-shot at the start time
        let schedule = self
            .schedule
            .unwrap_or_else(|| Schedule::Simple(SimpleSchedule::one_shot()));
        Trigger {
            key,
            job_key,
            description: self.description,
            start_time: self.start_time.unwrap_or_else(time::now),
            end_time: self.end_time,
            next_fire_time: None,
            previous_fire_time: None,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            calendar_name: self.calendar_name,
            state: TriggerState::default(),
            job_data: self.job_data,
            fired_entry_id: None,
            schedule,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::meta::calendar::{Calendar, CalendarDetail};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn minutely(start: DateTime<Utc>) -> Trigger {
        TriggerBuilder::new()
            .with_identity("t", "g")
            .for_job(JobKey::new("j", "g"))
            .start_at(start)
            .with_schedule(
                simple::SimpleScheduleBuilder::new()
                    .with_interval_millis(60_000)
                    .repeat_forever()
                    .build(),
            )
            .build()
    }

    #[test]
    fn test_compute_first_fire_time_is_start() {
        let start = at(2024, 7, 15, 5, 0, 0);
        let mut t = minutely(start);
        assert_eq!(t.compute_first_fire_time(None), Some(start));
        assert_eq!(t.next_fire_time, Some(start));
    }

    #[test]
    fn test_fire_time_sequence_monotonic() {
        let start = at(2024, 7, 15, 5, 0, 0);
        let t = minutely(start);
        let mut prev = start - Duration::milliseconds(1);
        for _ in 0..100 {
            let next = t.fire_time_after(Some(prev)).unwrap();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_triggered_advances_state() {
        let start = at(2024, 7, 15, 5, 0, 0);
        let mut t = minutely(start);
        t.compute_first_fire_time(None);
        t.triggered(None);
        assert_eq!(t.previous_fire_time, Some(start));
        assert_eq!(t.next_fire_time, Some(at(2024, 7, 15, 5, 1, 0)));
        assert!(t.next_fire_time > t.previous_fire_time);
    }

    #[test]
    fn test_calendar_skips_excluded_instants() {
        let start = at(2024, 7, 12, 12, 0, 0); // Friday noon
        let mut t = TriggerBuilder::new()
            .with_identity("t", "g")
            .for_job(JobKey::new("j", "g"))
            .start_at(start)
            .with_schedule(
                simple::SimpleScheduleBuilder::new()
                    .with_interval_millis(24 * 3600 * 1000)
                    .repeat_forever()
                    .build(),
            )
            .build();
        let weekends = Calendar::new(CalendarDetail::Weekly {
            excluded_days: vec![chrono::Weekday::Sat, chrono::Weekday::Sun],
        });
        t.compute_first_fire_time(Some(&weekends));
        assert_eq!(t.next_fire_time, Some(start));
        t.triggered(Some(&weekends));
        // Saturday and Sunday are excluded, lands on Monday
        assert_eq!(t.next_fire_time, Some(at(2024, 7, 15, 12, 0, 0)));
        let next = t.next_fire_time.unwrap();
        assert!(weekends.is_time_included(next));
    }

    #[test]
    fn test_update_with_new_calendar() {
        let start = at(2024, 7, 12, 12, 0, 0);
        let mut t = minutely(start);
        t.compute_first_fire_time(None);
        t.triggered(None);
        let cal = Calendar::new(CalendarDetail::Holiday {
            excluded_dates: vec![chrono::NaiveDate::from_ymd_opt(2024, 7, 12).unwrap()],
        });
        t.update_with_new_calendar_at(&cal, Duration::seconds(60), at(2024, 7, 12, 12, 0, 30));
        // everything on the 12th is excluded now
        let next = t.next_fire_time.unwrap();
        assert!(cal.is_time_included(next));
        assert_eq!(next, at(2024, 7, 13, 0, 0, 0));
    }

    #[test]
    fn test_validate_rejects_end_before_start() {
        let mut t = minutely(at(2024, 7, 15, 5, 0, 0));
        t.end_time = Some(at(2024, 7, 14, 5, 0, 0));
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_trigger_state_codes() {
        for state in [
            TriggerState::Waiting,
            TriggerState::Acquired,
            TriggerState::Executing,
            TriggerState::Complete,
            TriggerState::Paused,
            TriggerState::Blocked,
            TriggerState::PausedBlocked,
            TriggerState::Error,
        ] {
            assert_eq!(TriggerState::from_str(state.as_str()), state);
        }
    }

    #[test]
    fn test_trigger_serde_round_trip_all_variants() {
        let start = at(2024, 7, 15, 5, 0, 0);
        let schedules: Vec<Schedule> = vec![
            simple::SimpleScheduleBuilder::new()
                .with_interval_seconds(30)
                .with_repeat_count(5)
                .build()
                .into(),
            cron::CronSchedule::builder("0 15 10 L * ?").build().into(),
            calendar_interval::CalendarIntervalScheduleBuilder::new()
                .with_interval(2, IntervalUnit::Week)
                .build()
                .into(),
            daily_time_interval::DailyTimeIntervalScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Hour)
                .starting_daily_at(TimeOfDay::new(8, 0, 0))
                .ending_daily_at(TimeOfDay::new(18, 0, 0))
                .build()
                .into(),
            custom_calendar::CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Month)
                .by_month_day("31")
                .build()
                .into(),
        ];
        for schedule in schedules {
            let trigger = TriggerBuilder::new()
                .with_identity("t", "g")
                .for_job(JobKey::new("j", "g"))
                .start_at(start)
                .with_priority(7)
                .with_schedule(schedule)
                .build();
            let text = crate::utils::json::to_string(&trigger).unwrap();
            let back: Trigger = crate::utils::json::from_str(&text).unwrap();
            assert_eq!(back.schedule, trigger.schedule);
            assert_eq!(back.key, trigger.key);
            assert_eq!(back.priority, 7);
            // the wire form carries the subtype discriminator
            assert!(text.contains(&format!(
                r#""Type":"{}""#,
                trigger.schedule.trigger_type()
            )));
        }
    }

    #[test]
    fn test_misfire_codes_round_trip() {
        for p in [
            SimpleMisfirePolicy::IgnoreMisfires,
            SimpleMisfirePolicy::Smart,
            SimpleMisfirePolicy::FireNow,
            SimpleMisfirePolicy::RescheduleNowWithExistingRepeatCount,
            SimpleMisfirePolicy::RescheduleNowWithRemainingRepeatCount,
            SimpleMisfirePolicy::RescheduleNextWithRemainingCount,
            SimpleMisfirePolicy::RescheduleNextWithExistingCount,
        ] {
            assert_eq!(SimpleMisfirePolicy::from_code(p.to_code()), p);
        }
        for p in [
            OnceMisfirePolicy::IgnoreMisfires,
            OnceMisfirePolicy::Smart,
            OnceMisfirePolicy::FireOnceNow,
            OnceMisfirePolicy::DoNothing,
        ] {
            assert_eq!(OnceMisfirePolicy::from_code(p.to_code()), p);
        }
    }
}
