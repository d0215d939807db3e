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

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{REPEAT_INDEFINITELY, Schedule, SimpleMisfirePolicy, Trigger, ValidationError};
use crate::meta::calendar::Calendar;

/// Fires at `start_time + k * repeat_interval` for `k = 0..=repeat_count`
/// (`repeat_count == -1` repeats indefinitely).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SimpleSchedule {
    /// Interval between firings, in milliseconds.
    pub repeat_interval: i64,
    pub repeat_count: i32,
    #[serde(default)]
    pub times_triggered: i32,
    #[serde(default)]
    pub misfire_policy: SimpleMisfirePolicy,
}

impl SimpleSchedule {
    pub fn builder() -> SimpleScheduleBuilder {
        SimpleScheduleBuilder::new()
    }

    /// A single firing at the trigger's start time.
    pub fn one_shot() -> Self {
        Self {
            repeat_interval: 0,
            repeat_count: 0,
            times_triggered: 0,
            misfire_policy: SimpleMisfirePolicy::default(),
        }
    }

    pub fn schedule_builder(&self) -> SimpleScheduleBuilder {
        SimpleScheduleBuilder {
            repeat_interval: self.repeat_interval,
            repeat_count: self.repeat_count,
            misfire_policy: self.misfire_policy,
        }
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
        let bounded = |t: DateTime<Utc>| match end {
            Some(end) if t > end => None,
            _ => Some(t),
        };
        if after < start {
            return bounded(start);
        }
        if self.repeat_count == 0 || self.repeat_interval <= 0 {
            // one-shot, already past
            return None;
        }
        let elapsed = (after - start).num_milliseconds();
        let k = elapsed / self.repeat_interval + 1;
        if self.repeat_count != REPEAT_INDEFINITELY && k > self.repeat_count as i64 {
            return None;
        }
        bounded(start + Duration::milliseconds(k * self.repeat_interval))
    }

    /// Number of scheduled firings in the half-open interval `(from, to]`.
    pub(crate) fn times_fired_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        if self.repeat_interval <= 0 || to <= from {
            return 0;
        }
        (to - from).num_milliseconds() / self.repeat_interval
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        if self.repeat_count < REPEAT_INDEFINITELY {
            return Err(ValidationError::Invalid(format!(
                "repeat count cannot be {}",
                self.repeat_count
            )));
        }
        if self.repeat_count != 0 && self.repeat_interval < 1 {
            return Err(ValidationError::Invalid(
                "repeat interval must be at least 1 millisecond".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<SimpleSchedule> for Schedule {
    fn from(s: SimpleSchedule) -> Self {
        Schedule::Simple(s)
    }
}

pub(crate) fn update_after_misfire(
    trigger: &mut Trigger,
    calendar: Option<&Calendar>,
    now: DateTime<Utc>,
) {
    let Schedule::Simple(s) = &trigger.schedule else {
        return;
    };
    let mut policy = s.misfire_policy;
    if policy == SimpleMisfirePolicy::Smart {
        policy = if s.repeat_count == 0 {
            SimpleMisfirePolicy::FireNow
        } else {
            SimpleMisfirePolicy::RescheduleNowWithRemainingRepeatCount
        };
    }
    match policy {
        SimpleMisfirePolicy::IgnoreMisfires => {}
        SimpleMisfirePolicy::Smart => unreachable!(),
        SimpleMisfirePolicy::FireNow => {
            trigger.next_fire_time = Some(now);
        }
        SimpleMisfirePolicy::RescheduleNextWithExistingCount => {
            trigger.next_fire_time = trigger.fire_time_after_with_calendar(Some(now), calendar);
        }
        SimpleMisfirePolicy::RescheduleNextWithRemainingCount => {
            let missed = match (trigger.next_fire_time, &trigger.schedule) {
                (Some(next), Schedule::Simple(s)) => s.times_fired_between(next, now),
                _ => 0,
            };
            trigger.next_fire_time = trigger.fire_time_after_with_calendar(Some(now), calendar);
            if let Schedule::Simple(s) = &mut trigger.schedule
                && s.repeat_count != REPEAT_INDEFINITELY
                && s.repeat_count != 0
            {
                let remaining = (s.repeat_count as i64 - s.times_triggered as i64 - missed).max(0);
                s.repeat_count = remaining as i32;
                s.times_triggered = 0;
            }
        }
        SimpleMisfirePolicy::RescheduleNowWithExistingRepeatCount => {
            reschedule_now(trigger, now, 0);
        }
        SimpleMisfirePolicy::RescheduleNowWithRemainingRepeatCount => {
            let missed = match (trigger.next_fire_time, &trigger.schedule) {
                (Some(next), Schedule::Simple(s)) => s.times_fired_between(next, now),
                _ => 0,
            };
            reschedule_now(trigger, now, missed);
        }
    }
}

/// Re-anchors the schedule at `now`, folding fired (and optionally missed)
/// occurrences into a reduced repeat count.
fn reschedule_now(trigger: &mut Trigger, now: DateTime<Utc>, missed: i64) {
    let past_end = matches!(trigger.end_time, Some(end) if end < now);
    if let Schedule::Simple(s) = &mut trigger.schedule {
        if s.repeat_count != REPEAT_INDEFINITELY && s.repeat_count != 0 {
            let remaining = (s.repeat_count as i64 - s.times_triggered as i64 - missed).max(0);
            s.repeat_count = remaining as i32;
            s.times_triggered = 0;
        }
    }
    if past_end {
        trigger.next_fire_time = None;
    } else {
        trigger.start_time = now;
        trigger.next_fire_time = Some(now);
    }
}

/// Typed setters plus the standard misfire helpers.
#[derive(Debug, Clone, Default)]
pub struct SimpleScheduleBuilder {
    repeat_interval: i64,
    repeat_count: i32,
    misfire_policy: SimpleMisfirePolicy,
}

impl SimpleScheduleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval_millis(mut self, millis: i64) -> Self {
        self.repeat_interval = millis;
        self
    }

    pub fn with_interval_seconds(mut self, seconds: i64) -> Self {
        self.repeat_interval = seconds * 1000;
        self
    }

    pub fn with_interval_minutes(mut self, minutes: i64) -> Self {
        self.repeat_interval = minutes * 60 * 1000;
        self
    }

    pub fn with_interval_hours(mut self, hours: i64) -> Self {
        self.repeat_interval = hours * 3600 * 1000;
        self
    }

    pub fn with_repeat_count(mut self, count: i32) -> Self {
        self.repeat_count = count;
        self
    }

    pub fn repeat_forever(mut self) -> Self {
        self.repeat_count = REPEAT_INDEFINITELY;
        self
    }

    pub fn with_misfire_handling_instruction_ignore_misfires(mut self) -> Self {
        self.misfire_policy = SimpleMisfirePolicy::IgnoreMisfires;
        self
    }

    pub fn with_misfire_handling_instruction_fire_now(mut self) -> Self {
        self.misfire_policy = SimpleMisfirePolicy::FireNow;
        self
    }

    pub fn with_misfire_handling_instruction_next_with_remaining_count(mut self) -> Self {
        self.misfire_policy = SimpleMisfirePolicy::RescheduleNextWithRemainingCount;
        self
    }

    pub fn with_misfire_handling_instruction_next_with_existing_count(mut self) -> Self {
        self.misfire_policy = SimpleMisfirePolicy::RescheduleNextWithExistingCount;
        self
    }

    pub fn with_misfire_handling_instruction_now_with_remaining_count(mut self) -> Self {
        self.misfire_policy = SimpleMisfirePolicy::RescheduleNowWithRemainingRepeatCount;
        self
    }

    pub fn with_misfire_handling_instruction_now_with_existing_count(mut self) -> Self {
        self.misfire_policy = SimpleMisfirePolicy::RescheduleNowWithExistingRepeatCount;
        self
    }

    pub fn build(self) -> SimpleSchedule {
        SimpleSchedule {
            repeat_interval: self.repeat_interval,
            repeat_count: self.repeat_count,
            times_triggered: 0,
            misfire_policy: self.misfire_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::meta::{key::JobKey, trigger::TriggerBuilder};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn trigger_with(schedule: SimpleSchedule, start: DateTime<Utc>) -> Trigger {
        TriggerBuilder::new()
            .with_identity("t", "g")
            .for_job(JobKey::new("j", "g"))
            .start_at(start)
            .with_schedule(schedule)
            .build()
    }

    #[test]
    fn test_fire_sequence_length_matches_repeat_count() {
        let start = at(2024, 7, 15, 5, 0, 0);
        let t = trigger_with(
            SimpleScheduleBuilder::new()
                .with_interval_seconds(10)
                .with_repeat_count(3)
                .build(),
            start,
        );
        let mut fires = vec![];
        let mut probe = start - Duration::milliseconds(1);
        while let Some(next) = t.fire_time_after(Some(probe)) {
            fires.push(next);
            probe = next;
        }
        // repeat_count + 1 total firings
        assert_eq!(fires.len(), 4);
        assert_eq!(fires[0], start);
        assert_eq!(fires[3], start + Duration::seconds(30));
    }

    #[test]
    fn test_one_shot_already_past_returns_none() {
        // repeat_count = 0 with a start time in the deep past
        let start = DateTime::<Utc>::MIN_UTC;
        let t = trigger_with(SimpleSchedule::one_shot(), start);
        assert_eq!(t.fire_time_after(Some(at(2024, 7, 15, 5, 0, 0))), None);
    }

    #[test]
    fn test_end_time_bounds_sequence() {
        let start = at(2024, 7, 15, 5, 0, 0);
        let mut t = trigger_with(
            SimpleScheduleBuilder::new()
                .with_interval_seconds(10)
                .repeat_forever()
                .build(),
            start,
        );
        t.end_time = Some(start + Duration::seconds(25));
        let second = t.fire_time_after(Some(start)).unwrap();
        assert_eq!(second, start + Duration::seconds(10));
        assert_eq!(t.fire_time_after(Some(start + Duration::seconds(20))), None);
    }

    #[test]
    fn test_misfire_fire_now_one_shot() {
        let start = at(2024, 7, 15, 5, 0, 0);
        let mut t = trigger_with(
            SimpleScheduleBuilder::new()
                .with_misfire_handling_instruction_fire_now()
                .build(),
            start,
        );
        t.next_fire_time = Some(start);
        let now = at(2024, 7, 15, 7, 0, 0);
        t.update_after_misfire_at(None, now);
        assert_eq!(t.next_fire_time, Some(now));
    }

    #[test]
    fn test_misfire_fire_now_repeating_keeps_schedule_state() {
        let start = at(2024, 7, 15, 5, 0, 0);
        let mut t = trigger_with(
            SimpleScheduleBuilder::new()
                .with_interval_minutes(1)
                .with_repeat_count(10)
                .with_misfire_handling_instruction_fire_now()
                .build(),
            start,
        );
        t.compute_first_fire_time(None);
        if let Schedule::Simple(s) = &mut t.schedule {
            s.times_triggered = 5;
        }
        t.next_fire_time = Some(start + Duration::minutes(5));
        let now = start + Duration::minutes(8);
        t.update_after_misfire_at(None, now);
        // an explicit FireNow only moves the next fire, nothing else
        assert_eq!(t.next_fire_time, Some(now));
        assert_eq!(t.start_time, start);
        if let Schedule::Simple(s) = &t.schedule {
            assert_eq!(s.repeat_count, 10);
            assert_eq!(s.times_triggered, 5);
        }
    }

    #[test]
    fn test_misfire_now_with_remaining_count() {
        let start = at(2024, 7, 15, 5, 0, 0);
        let mut t = trigger_with(
            SimpleScheduleBuilder::new()
                .with_interval_minutes(1)
                .with_repeat_count(10)
                .with_misfire_handling_instruction_now_with_remaining_count()
                .build(),
            start,
        );
        t.compute_first_fire_time(None);
        // five fires happened, then the scheduler stalled for 3 minutes
        if let Schedule::Simple(s) = &mut t.schedule {
            s.times_triggered = 5;
        }
        t.next_fire_time = Some(start + Duration::minutes(5));
        let now = start + Duration::minutes(8);
        t.update_after_misfire_at(None, now);
        assert_eq!(t.next_fire_time, Some(now));
        assert_eq!(t.start_time, now);
        if let Schedule::Simple(s) = &t.schedule {
            // 10 - 5 fired - 3 missed
            assert_eq!(s.repeat_count, 2);
            assert_eq!(s.times_triggered, 0);
        }
    }

    #[test]
    fn test_misfire_next_with_existing_count() {
        let start = at(2024, 7, 15, 5, 0, 0);
        let mut t = trigger_with(
            SimpleScheduleBuilder::new()
                .with_interval_minutes(1)
                .repeat_forever()
                .with_misfire_handling_instruction_next_with_existing_count()
                .build(),
            start,
        );
        t.compute_first_fire_time(None);
        t.next_fire_time = Some(start + Duration::minutes(5));
        let now = start + Duration::minutes(8) + Duration::seconds(30);
        t.update_after_misfire_at(None, now);
        // next on-schedule instant strictly after now
        assert_eq!(t.next_fire_time, Some(start + Duration::minutes(9)));
    }

    #[test]
    fn test_smart_policy_resolution() {
        let start = at(2024, 7, 15, 5, 0, 0);
        // repeat_count == 0 resolves to FireNow
        let mut one_shot = trigger_with(SimpleSchedule::one_shot(), start);
        one_shot.next_fire_time = Some(start);
        let now = at(2024, 7, 15, 6, 0, 0);
        one_shot.update_after_misfire_at(None, now);
        assert_eq!(one_shot.next_fire_time, Some(now));

        // repeating resolves to RescheduleNowWithRemainingRepeatCount
        let mut repeating = trigger_with(
            SimpleScheduleBuilder::new()
                .with_interval_minutes(1)
                .with_repeat_count(10)
                .build(),
            start,
        );
        repeating.compute_first_fire_time(None);
        repeating.update_after_misfire_at(None, now);
        assert_eq!(repeating.next_fire_time, Some(now));
        assert_eq!(repeating.start_time, now);
    }

    #[test]
    fn test_validate() {
        assert!(SimpleSchedule::one_shot().validate().is_ok());
        assert!(
            SimpleScheduleBuilder::new()
                .with_repeat_count(5)
                .build()
                .validate()
                .is_err()
        );
        assert!(
            SimpleScheduleBuilder::new()
                .with_repeat_count(-2)
                .build()
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_schedule_builder_round_trip() {
        let s = SimpleScheduleBuilder::new()
            .with_interval_seconds(30)
            .with_repeat_count(7)
            .with_misfire_handling_instruction_next_with_remaining_count()
            .build();
        let rebuilt = s.schedule_builder().build();
        assert_eq!(rebuilt, s);
    }
}
