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

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;
use serde::{Deserialize, Serialize};

use super::{IntervalUnit, OnceMisfirePolicy, Schedule, ValidationError};

/// Hard cap on the number of occurrences the RRULE evaluator expands per
/// query. The advanced start keeps the window small, so this is a safety
/// bound rather than a correctness bound.
pub const RRULE_EVAL_CAP: u16 = 500;

const REPEAT_INDEFINITELY: i64 = -1;

const BY_DAY_CODES: [&str; 7] = ["SU", "MO", "TU", "WE", "TH", "FR", "SA"];

/// Calendar-recurrence schedule built on RFC-5545 `RRULE` semantics: the
/// fields are rendered into a pattern such as
/// `FREQ=MONTHLY;INTERVAL=2;BYDAY=WE,FR` and expanded in the trigger's time
/// zone. The time zone is fixed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomCalendarSchedule {
    #[serde(rename = "RepeatInterval")]
    pub repeat_interval: i32,
    #[serde(rename = "RepeatIntervalUnit")]
    pub repeat_interval_unit: IntervalUnit,
    /// 1-12; required for the Year unit.
    #[serde(rename = "ByMonth", default, skip_serializing_if = "Option::is_none")]
    pub by_month: Option<u32>,
    /// Comma-separated day-of-month list, e.g. `"1,15,31"` or `"-1"`. Kept
    /// as a string end to end; parsed only while rendering the pattern.
    #[serde(rename = "ByMonthDay", default, skip_serializing_if = "Option::is_none")]
    pub by_month_day: Option<String>,
    /// Comma-separated weekday list with optional ordinals, e.g.
    /// `"MO,WE"` or `"2WE,-1FR"`.
    #[serde(rename = "ByDay", default, skip_serializing_if = "Option::is_none")]
    pub by_day: Option<String>,
    /// -1 repeats indefinitely.
    #[serde(rename = "RepeatCount", default = "default_repeat_count")]
    pub repeat_count: i64,
    #[serde(rename = "TimesTriggered", default)]
    pub times_triggered: i32,
    #[serde(rename = "TimeZone")]
    pub time_zone: Tz,
    #[serde(rename = "MisfirePolicy", default)]
    pub misfire_policy: OnceMisfirePolicy,
}

fn default_repeat_count() -> i64 {
    REPEAT_INDEFINITELY
}

impl CustomCalendarSchedule {
    pub fn builder() -> CustomCalendarScheduleBuilder {
        CustomCalendarScheduleBuilder::new()
    }

    pub fn schedule_builder(&self) -> CustomCalendarScheduleBuilder {
        CustomCalendarScheduleBuilder {
            repeat_interval: self.repeat_interval,
            repeat_interval_unit: self.repeat_interval_unit,
            by_month: self.by_month,
            by_month_day: self.by_month_day.clone(),
            by_day: self.by_day.clone(),
            repeat_count: self.repeat_count,
            time_zone: self.time_zone,
            misfire_policy: self.misfire_policy,
        }
    }

    pub(crate) fn fire_time_after(
        &self,
        after: DateTime<Utc>,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        if self.repeat_count != REPEAT_INDEFINITELY
            && self.times_triggered as i64 > self.repeat_count
        {
            return None;
        }
        if self.repeat_interval < 1 {
            return None;
        }
        let after = after.max(start - Duration::milliseconds(1));
        if let Some(end) = end
            && after >= end
        {
            return None;
        }
        let advanced = self.advanced_start(start, after);
        let pattern = self.rrule_pattern(advanced);
        let set: RRuleSet = pattern.parse().ok()?;
        for d in set.all(RRULE_EVAL_CAP).dates {
            let d = d.with_timezone(&Utc);
            if d > after {
                return match end {
                    Some(end) if d > end => None,
                    _ => Some(d),
                };
            }
        }
        None
    }

    /// Advances the effective start by whole interval-sized periods so it is
    /// as close to `after` as possible without exceeding it, bounding the
    /// evaluator's work.
    fn advanced_start(&self, start: DateTime<Utc>, after: DateTime<Utc>) -> DateTime<Utc> {
        if after <= start {
            return start;
        }
        let tz = self.time_zone;
        let local_start = start.with_timezone(&tz);
        let start_date = local_start.date_naive();
        let wall = local_start.time();
        let after_local = after.with_timezone(&tz);
        let interval = self.repeat_interval as i64;
        let local = match self.repeat_interval_unit {
            IntervalUnit::Day | IntervalUnit::Week => {
                let step = if self.repeat_interval_unit == IntervalUnit::Week {
                    interval * 7
                } else {
                    interval
                };
                let days = (after_local.date_naive() - start_date).num_days();
                let periods = (days / step - 1).max(0);
                Some(start_date + Duration::days(periods * step))
            }
            IntervalUnit::Month | IntervalUnit::Year => {
                let step = if self.repeat_interval_unit == IntervalUnit::Year {
                    interval * 12
                } else {
                    interval
                };
                let months = (after_local.year() as i64 - start_date.year() as i64) * 12
                    + after_local.month() as i64
                    - start_date.month() as i64;
                let periods = (months / step - 1).max(0);
                start_date.checked_add_months(Months::new((periods * step) as u32))
            }
            _ => None,
        };
        let Some(date) = local else { return start };
        match tz.from_local_datetime(&date.and_time(wall)) {
            chrono::LocalResult::Single(t) => t.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
            chrono::LocalResult::None => start,
        }
    }

    fn rrule_pattern(&self, effective_start: DateTime<Utc>) -> String {
        let freq = match self.repeat_interval_unit {
            IntervalUnit::Week => "WEEKLY",
            IntervalUnit::Month => "MONTHLY",
            IntervalUnit::Year => "YEARLY",
            _ => "DAILY",
        };
        let mut rule = format!("FREQ={freq};INTERVAL={}", self.repeat_interval);
        if let Some(month) = self.by_month {
            rule.push_str(&format!(";BYMONTH={month}"));
        }
        if let Some(month_days) = normalized(&self.by_month_day) {
            rule.push_str(&format!(";BYMONTHDAY={month_days}"));
        }
        if let Some(days) = normalized(&self.by_day) {
            rule.push_str(&format!(";BYDAY={days}"));
        }
        rule.push_str(&format!(";COUNT={RRULE_EVAL_CAP}"));
        let local = effective_start.with_timezone(&self.time_zone);
        if self.time_zone == Tz::UTC {
            format!("DTSTART:{}\nRRULE:{rule}", local.format("%Y%m%dT%H%M%SZ"))
        } else {
            format!(
                "DTSTART;TZID={}:{}\nRRULE:{rule}",
                self.time_zone.name(),
                local.format("%Y%m%dT%H%M%S")
            )
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        if self.repeat_interval < 1 {
            return Err(ValidationError::Invalid(
                "recurrence interval must be at least 1".to_string(),
            ));
        }
        if self.repeat_count < REPEAT_INDEFINITELY {
            return Err(ValidationError::Invalid(format!(
                "repeat count cannot be {}",
                self.repeat_count
            )));
        }
        let has_by_day = normalized(&self.by_day).is_some();
        let has_by_month_day = normalized(&self.by_month_day).is_some();
        match self.repeat_interval_unit {
            IntervalUnit::Year => {
                if self.by_month.is_none() {
                    return Err(ValidationError::Invalid(
                        "yearly recurrence requires a month".to_string(),
                    ));
                }
                if !has_by_day && !has_by_month_day {
                    return Err(ValidationError::Invalid(
                        "yearly recurrence requires days of week or days of month".to_string(),
                    ));
                }
            }
            IntervalUnit::Month => {
                if !has_by_day && !has_by_month_day {
                    return Err(ValidationError::Invalid(
                        "monthly recurrence requires days of week or days of month".to_string(),
                    ));
                }
            }
            IntervalUnit::Week => {
                if !has_by_day {
                    return Err(ValidationError::Invalid(
                        "weekly recurrence requires days of week".to_string(),
                    ));
                }
            }
            IntervalUnit::Day => {}
            unit => {
                return Err(ValidationError::Invalid(format!(
                    "recurrence unit must be DAY, WEEK, MONTH or YEAR, got {}",
                    unit.as_str()
                )));
            }
        }
        if let Some(month) = self.by_month
            && !(1..=12).contains(&month)
        {
            return Err(ValidationError::Invalid(format!(
                "month must be 1-12, got {month}"
            )));
        }
        if let Some(month_days) = normalized(&self.by_month_day) {
            for item in month_days.split(',') {
                match item.parse::<i32>() {
                    Ok(d) if d != 0 && (-31..=31).contains(&d) => {}
                    _ => {
                        return Err(ValidationError::Invalid(format!(
                            "invalid day of month {item:?}"
                        )));
                    }
                }
            }
        }
        if let Some(days) = normalized(&self.by_day) {
            for item in days.split(',') {
                validate_by_day_item(item)?;
            }
        }
        Ok(())
    }
}

fn normalized(field: &Option<String>) -> Option<String> {
    let v = field.as_ref()?.replace(' ', "");
    if v.is_empty() { None } else { Some(v) }
}

/// `MO` | `1MO` | `-1FR`: optional non-zero ordinal -5..=5, then a weekday code.
fn validate_by_day_item(item: &str) -> Result<(), ValidationError> {
    if !item.is_ascii() {
        return Err(ValidationError::Invalid(format!(
            "invalid day of week {item:?}"
        )));
    }
    let code_at = item.len().checked_sub(2).unwrap_or_default();
    let (ordinal, code) = item.split_at(code_at);
    if !BY_DAY_CODES.contains(&code) {
        return Err(ValidationError::Invalid(format!(
            "invalid day of week {item:?}"
        )));
    }
    if !ordinal.is_empty() {
        match ordinal.parse::<i32>() {
            Ok(n) if n != 0 && (-5..=5).contains(&n) => {}
            _ => {
                return Err(ValidationError::Invalid(format!(
                    "invalid day of week ordinal {item:?}"
                )));
            }
        }
    }
    Ok(())
}

impl From<CustomCalendarSchedule> for Schedule {
    fn from(s: CustomCalendarSchedule) -> Self {
        Schedule::CustomCalendar(s)
    }
}

#[derive(Debug, Clone)]
pub struct CustomCalendarScheduleBuilder {
    repeat_interval: i32,
    repeat_interval_unit: IntervalUnit,
    by_month: Option<u32>,
    by_month_day: Option<String>,
    by_day: Option<String>,
    repeat_count: i64,
    time_zone: Tz,
    misfire_policy: OnceMisfirePolicy,
}

impl Default for CustomCalendarScheduleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CustomCalendarScheduleBuilder {
    pub fn new() -> Self {
        Self {
            repeat_interval: 1,
            repeat_interval_unit: IntervalUnit::Day,
            by_month: None,
            by_month_day: None,
            by_day: None,
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

    pub fn by_month(mut self, month: u32) -> Self {
        self.by_month = Some(month);
        self
    }

    pub fn by_month_day(mut self, days: &str) -> Self {
        self.by_month_day = Some(days.to_string());
        self
    }

    pub fn by_day(mut self, days: &str) -> Self {
        self.by_day = Some(days.to_string());
        self
    }

    pub fn with_repeat_count(mut self, count: i64) -> Self {
        self.repeat_count = count;
        self
    }

    pub fn repeat_forever(mut self) -> Self {
        self.repeat_count = REPEAT_INDEFINITELY;
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

    pub fn build(self) -> CustomCalendarSchedule {
        CustomCalendarSchedule {
            repeat_interval: self.repeat_interval,
            repeat_interval_unit: self.repeat_interval_unit,
            by_month: self.by_month,
            by_month_day: self.by_month_day,
            by_day: self.by_day,
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
    use crate::{
        meta::{key::JobKey, trigger::TriggerBuilder},
        utils::json,
    };

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn sequence(
        s: &CustomCalendarSchedule,
        start: DateTime<Utc>,
        n: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut out = vec![];
        let mut probe = start - Duration::milliseconds(1);
        for _ in 0..n {
            match s.fire_time_after(probe, start, None) {
                Some(t) => {
                    probe = t;
                    out.push(t);
                }
                None => break,
            }
        }
        out
    }

    #[test]
    fn test_weekly_by_day_sequence() {
        let s = CustomCalendarScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Week)
            .by_day("SU,WE,TH,SA")
            .with_repeat_count(2)
            .build();
        let start = at(2024, 7, 15, 5, 0, 0);
        assert_eq!(
            sequence(&s, start, 5),
            vec![
                at(2024, 7, 17, 5, 0, 0),
                at(2024, 7, 18, 5, 0, 0),
                at(2024, 7, 20, 5, 0, 0),
                at(2024, 7, 21, 5, 0, 0),
                at(2024, 7, 24, 5, 0, 0),
            ]
        );
    }

    #[test]
    fn test_monthly_by_month_day_skips_short_months() {
        let s = CustomCalendarScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Month)
            .by_month_day("31")
            .build();
        let start = at(2024, 7, 15, 10, 0, 0);
        assert_eq!(
            sequence(&s, start, 3),
            vec![
                at(2024, 7, 31, 10, 0, 0),
                at(2024, 8, 31, 10, 0, 0),
                // September has no 31st
                at(2024, 10, 31, 10, 0, 0),
            ]
        );
    }

    #[test]
    fn test_yearly_by_day_ordinals() {
        let s = CustomCalendarScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Year)
            .by_month(5)
            .by_day("2WE,3FR,5SU,-1MO")
            .build();
        let start = at(2024, 4, 15, 5, 0, 0);
        // second Wednesday, third Friday, last Monday; May 2024 has no fifth
        // Sunday
        assert_eq!(
            sequence(&s, start, 3),
            vec![
                at(2024, 5, 8, 5, 0, 0),
                at(2024, 5, 17, 5, 0, 0),
                at(2024, 5, 27, 5, 0, 0),
            ]
        );
    }

    #[test]
    fn test_interval_phase_preserved_when_advancing() {
        let s = CustomCalendarScheduleBuilder::new()
            .with_interval(2, IntervalUnit::Week)
            .by_day("MO")
            .build();
        let start = at(2024, 1, 1, 9, 0, 0); // Monday
        // far from the start, the evaluator still lands on the right parity
        let next = s.fire_time_after(at(2024, 7, 10, 0, 0, 0), start, None).unwrap();
        let weeks = (next - start).num_weeks();
        assert_eq!(weeks % 2, 0);
        assert_eq!(next, at(2024, 7, 15, 9, 0, 0));
    }

    #[test]
    fn test_repeat_count_terminal() {
        let mut s = CustomCalendarScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Day)
            .with_repeat_count(2)
            .build();
        let start = at(2024, 7, 15, 5, 0, 0);
        s.times_triggered = 3;
        assert_eq!(s.fire_time_after(start, start, None), None);
    }

    #[test]
    fn test_end_time_terminal() {
        let s = CustomCalendarScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Day)
            .build();
        let start = at(2024, 7, 15, 5, 0, 0);
        let end = at(2024, 7, 17, 5, 0, 0);
        assert_eq!(s.fire_time_after(end, start, Some(end)), None);
        assert_eq!(
            s.fire_time_after(start, start, Some(end)),
            Some(at(2024, 7, 16, 5, 0, 0))
        );
    }

    #[test]
    fn test_misfire_do_nothing_moves_strictly_past_now() {
        let s = CustomCalendarScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Day)
            .with_misfire_handling_instruction_do_nothing()
            .build();
        let start = at(2024, 7, 15, 5, 0, 0);
        let mut t = TriggerBuilder::new()
            .with_identity("t", "g")
            .for_job(JobKey::new("j", "g"))
            .start_at(start)
            .with_schedule(s)
            .build();
        t.compute_first_fire_time(None);
        // the trigger is two hours late
        let now = at(2024, 7, 15, 7, 0, 0);
        t.update_after_misfire_at(None, now);
        let next = t.next_fire_time.unwrap();
        assert!(next > now);
        assert_eq!(next, at(2024, 7, 16, 5, 0, 0));
    }

    #[test]
    fn test_validate_unit_requirements() {
        // Year requires by_month and one of by_day / by_month_day
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Year)
                .build()
                .validate()
                .is_err()
        );
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Year)
                .by_month(5)
                .build()
                .validate()
                .is_err()
        );
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Year)
                .by_month(5)
                .by_day("MO")
                .build()
                .validate()
                .is_ok()
        );
        // Month requires one of by_day / by_month_day
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Month)
                .build()
                .validate()
                .is_err()
        );
        // Week requires by_day
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Week)
                .build()
                .validate()
                .is_err()
        );
        // Day requires nothing extra
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Day)
                .build()
                .validate()
                .is_ok()
        );
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(0, IntervalUnit::Day)
                .build()
                .validate()
                .is_err()
        );
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Hour)
                .build()
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_validate_field_contents() {
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Month)
                .by_month_day("1,15,-1")
                .build()
                .validate()
                .is_ok()
        );
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Month)
                .by_month_day("0")
                .build()
                .validate()
                .is_err()
        );
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Week)
                .by_day("MO, 1MO, -1FR, SU")
                .build()
                .validate()
                .is_ok()
        );
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Week)
                .by_day("XX")
                .build()
                .validate()
                .is_err()
        );
        assert!(
            CustomCalendarScheduleBuilder::new()
                .with_interval(1, IntervalUnit::Year)
                .by_month(13)
                .by_day("MO")
                .build()
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_by_month_day_string_survives_serde() {
        // comma lists stay strings end to end
        let s = CustomCalendarScheduleBuilder::new()
            .with_interval(1, IntervalUnit::Month)
            .by_month_day("1,15,31")
            .build();
        let text = json::to_string(&s).unwrap();
        assert!(text.contains(r#""ByMonthDay":"1,15,31""#));
        let back: CustomCalendarSchedule = json::from_str(&text).unwrap();
        assert_eq!(back.by_month_day.as_deref(), Some("1,15,31"));
    }

    #[test]
    fn test_json_member_names() {
        let s = CustomCalendarScheduleBuilder::new()
            .with_interval(2, IntervalUnit::Month)
            .by_month(5)
            .by_day("WE,FR")
            .with_repeat_count(10)
            .build();
        let value = json::to_value(&s).unwrap();
        assert_eq!(value["RepeatInterval"], json::json!(2));
        assert_eq!(value["RepeatIntervalUnit"], json::json!("Month"));
        assert_eq!(value["ByMonth"], json::json!(5));
        assert_eq!(value["ByDay"], json::json!("WE,FR"));
        assert_eq!(value["RepeatCount"], json::json!(10));
        assert_eq!(value["TimeZone"], json::json!("UTC"));
    }

    #[test]
    fn test_schedule_builder_round_trip() {
        let s = CustomCalendarScheduleBuilder::new()
            .with_interval(2, IntervalUnit::Month)
            .by_month(5)
            .by_day("WE,FR")
            .with_repeat_count(10)
            .build();
        assert_eq!(s.schedule_builder().build(), s);
    }
}
