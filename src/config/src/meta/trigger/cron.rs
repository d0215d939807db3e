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

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::{OnceMisfirePolicy, Schedule, ValidationError, YEAR_TO_GIVE_UP_SCHEDULING_AT};

/// Cron-expression schedule: 7 fields (seconds through optional year) in the
/// trigger's time zone. The standard grammar (ranges, steps, lists, name
/// aliases, `?`) is evaluated by the `cron` crate; the day terms `L`, `W` and
/// `#` are resolved by a day filter layered over a relaxed base expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CronSchedule {
    pub cron_expression: String,
    pub time_zone: Tz,
    #[serde(default)]
    pub misfire_policy: OnceMisfirePolicy,
}

impl CronSchedule {
    pub fn builder(expression: &str) -> CronScheduleBuilder {
        CronScheduleBuilder::new(expression)
    }

    pub fn schedule_builder(&self) -> CronScheduleBuilder {
        CronScheduleBuilder {
            cron_expression: self.cron_expression.clone(),
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
        let from = after.max(start - Duration::milliseconds(1));
        let next = cron_next_after(&self.cron_expression, self.time_zone, from)?;
        match end {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        QuartzCron::parse(&self.cron_expression).map(|_| ())
    }
}

impl From<CronSchedule> for Schedule {
    fn from(s: CronSchedule) -> Self {
        Schedule::Cron(s)
    }
}

#[derive(Debug, Clone)]
pub struct CronScheduleBuilder {
    cron_expression: String,
    time_zone: Tz,
    misfire_policy: OnceMisfirePolicy,
}

impl CronScheduleBuilder {
    pub fn new(expression: &str) -> Self {
        Self {
            cron_expression: expression.to_string(),
            time_zone: Tz::UTC,
            misfire_policy: OnceMisfirePolicy::default(),
        }
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

    pub fn build(self) -> CronSchedule {
        CronSchedule {
            cron_expression: self.cron_expression,
            time_zone: self.time_zone,
            misfire_policy: self.misfire_policy,
        }
    }
}

/// Next firing point of `expr` strictly after `after`, or `None` when the
/// expression never matches again.
pub fn cron_next_after(expr: &str, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let compiled = QuartzCron::parse(expr).ok()?;
    compiled.next_after(tz, after)
}

/// Day-of-month terms Quartz accepts beyond the standard grammar.
#[derive(Debug, Clone, PartialEq)]
enum DomTerm {
    /// `L` / `L-n`: last day of the month, minus an offset
    Last { offset: u32 },
    /// `LW`: last weekday of the month
    LastWeekday,
    /// `nW`: weekday nearest to day n, within the same month
    NearestWeekday(u32),
}

/// Day-of-week terms: `6L` / `FRIL` (last Friday), `MON#2` (second Monday).
#[derive(Debug, Clone, PartialEq)]
enum DowTerm {
    Last(Weekday),
    Nth(Weekday, u32),
}

#[derive(Debug, Clone)]
struct DayFilter {
    dom: Option<DomTerm>,
    dow: Option<DowTerm>,
}

#[derive(Debug, Clone)]
pub(crate) struct QuartzCron {
    base: cron::Schedule,
    day_filter: Option<DayFilter>,
}

impl QuartzCron {
    pub(crate) fn parse(expr: &str) -> Result<Self, ValidationError> {
        let mut fields: Vec<String> = expr
            .split_whitespace()
            .map(|f| if f == "?" { "*".to_string() } else { f.to_string() })
            .collect();
        if fields.len() < 6 || fields.len() > 7 {
            return Err(ValidationError::Invalid(format!(
                "cron expression {expr:?} must have 6 or 7 fields"
            )));
        }
        // bare "L" in the day-of-week field is an alias for Saturday
        if fields[5].eq_ignore_ascii_case("l") {
            fields[5] = "SAT".to_string();
        }
        let dom = parse_dom_term(&fields[3], expr)?;
        let dow = parse_dow_term(&fields[5], expr)?;
        if dom.is_some() {
            fields[3] = "*".to_string();
        }
        if dow.is_some() {
            fields[5] = "*".to_string();
        }
        let base = cron::Schedule::from_str(&fields.join(" ")).map_err(|e| {
            ValidationError::Invalid(format!("invalid cron expression {expr:?}: {e}"))
        })?;
        let day_filter = if dom.is_some() || dow.is_some() {
            Some(DayFilter { dom, dow })
        } else {
            None
        };
        Ok(Self { base, day_filter })
    }

    pub(crate) fn next_after(&self, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz);
        let Some(filter) = &self.day_filter else {
            return self.base.after(&local).next().map(|t| t.with_timezone(&Utc));
        };
        let mut probe = local;
        // the base fires at least once per matching day, so probing day by
        // day is bounded; give up once the far-future guard is crossed
        loop {
            let cand = self.base.after(&probe).next()?;
            if cand.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                return None;
            }
            if filter.matches(cand.date_naive()) {
                return Some(cand.with_timezone(&Utc));
            }
            let next_day = cand.date_naive().succ_opt()?;
            probe = local_start_of_day(tz, next_day)? - Duration::milliseconds(1);
        }
    }
}

impl DayFilter {
    fn matches(&self, date: NaiveDate) -> bool {
        let dom_ok = self.dom.as_ref().is_none_or(|t| t.matches(date));
        let dow_ok = self.dow.as_ref().is_none_or(|t| t.matches(date));
        dom_ok && dow_ok
    }
}

impl DomTerm {
    fn matches(&self, date: NaiveDate) -> bool {
        let last = last_day_of_month(date.year(), date.month());
        match self {
            Self::Last { offset } => date.day() + offset == last,
            Self::LastWeekday => {
                let mut d = last;
                while is_weekend(date.year(), date.month(), d) {
                    d -= 1;
                }
                date.day() == d
            }
            Self::NearestWeekday(n) => {
                let target = (*n).min(last);
                date == nearest_weekday(date.year(), date.month(), target)
            }
        }
    }
}

impl DowTerm {
    fn matches(&self, date: NaiveDate) -> bool {
        match self {
            Self::Last(wd) => {
                date.weekday() == *wd
                    && date.day() + 7 > last_day_of_month(date.year(), date.month())
            }
            Self::Nth(wd, n) => date.weekday() == *wd && (date.day() - 1) / 7 + 1 == *n,
        }
    }
}

fn parse_dom_term(field: &str, expr: &str) -> Result<Option<DomTerm>, ValidationError> {
    let f = field.to_ascii_uppercase();
    if !f.contains('L') && !f.contains('W') {
        return Ok(None);
    }
    if f == "L" {
        return Ok(Some(DomTerm::Last { offset: 0 }));
    }
    if f == "LW" {
        return Ok(Some(DomTerm::LastWeekday));
    }
    if let Some(rest) = f.strip_prefix("L-")
        && let Ok(offset) = rest.parse::<u32>()
        && offset < 31
    {
        return Ok(Some(DomTerm::Last { offset }));
    }
    if let Some(day) = f.strip_suffix('W')
        && let Ok(day) = day.parse::<u32>()
        && (1..=31).contains(&day)
    {
        return Ok(Some(DomTerm::NearestWeekday(day)));
    }
    Err(ValidationError::Invalid(format!(
        "invalid day-of-month term {field:?} in cron expression {expr:?}"
    )))
}

fn parse_dow_term(field: &str, expr: &str) -> Result<Option<DowTerm>, ValidationError> {
    let f = field.to_ascii_uppercase();
    if !f.contains('L') && !f.contains('#') {
        return Ok(None);
    }
    if let Some((day, nth)) = f.split_once('#')
        && let Some(wd) = weekday_from(day)
        && let Ok(nth) = nth.parse::<u32>()
        && (1..=5).contains(&nth)
    {
        return Ok(Some(DowTerm::Nth(wd, nth)));
    }
    if let Some(day) = f.strip_suffix('L')
        && let Some(wd) = weekday_from(day)
    {
        return Ok(Some(DowTerm::Last(wd)));
    }
    Err(ValidationError::Invalid(format!(
        "invalid day-of-week term {field:?} in cron expression {expr:?}"
    )))
}

/// Quartz numbering: 1 = Sunday through 7 = Saturday, or 3-letter names.
fn weekday_from(s: &str) -> Option<Weekday> {
    match s {
        "1" | "SUN" => Some(Weekday::Sun),
        "2" | "MON" => Some(Weekday::Mon),
        "3" | "TUE" => Some(Weekday::Tue),
        "4" | "WED" => Some(Weekday::Wed),
        "5" | "THU" => Some(Weekday::Thu),
        "6" | "FRI" => Some(Weekday::Fri),
        "7" | "SAT" => Some(Weekday::Sat),
        _ => None,
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn is_weekend(year: i32, month: u32, day: u32) -> bool {
    NaiveDate::from_ymd_opt(year, month, day)
        .map(|d| matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
        .unwrap_or(false)
}

/// The weekday closest to `day`, never leaving the month.
fn nearest_weekday(year: i32, month: u32, day: u32) -> NaiveDate {
    let date = NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default();
    match date.weekday() {
        Weekday::Sat => {
            if day == 1 {
                date + Duration::days(2)
            } else {
                date - Duration::days(1)
            }
        }
        Weekday::Sun => {
            if day == last_day_of_month(year, month) {
                date - Duration::days(2)
            } else {
                date + Duration::days(1)
            }
        }
        _ => date,
    }
}

fn local_start_of_day(tz: Tz, date: NaiveDate) -> Option<DateTime<Tz>> {
    use chrono::TimeZone;
    let naive = date.and_hms_opt(0, 0, 0)?;
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(t) => Some(t),
        chrono::LocalResult::Ambiguous(t, _) => Some(t),
        // midnight skipped by a DST transition, take the first valid hour
        chrono::LocalResult::None => tz.from_local_datetime(&(naive + Duration::hours(1))).earliest(),
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
    fn test_standard_expression() {
        // every day at 10:15:00
        let next = cron_next_after("0 15 10 * * ?", Tz::UTC, at(2024, 7, 15, 5, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 7, 15, 10, 15, 0));
        let next = cron_next_after("0 15 10 * * ?", Tz::UTC, next).unwrap();
        assert_eq!(next, at(2024, 7, 16, 10, 15, 0));
    }

    #[test]
    fn test_ranges_steps_and_names() {
        // every 15 minutes during business hours on weekdays
        let next =
            cron_next_after("0 0/15 9-17 ? * MON-FRI", Tz::UTC, at(2024, 7, 13, 12, 0, 0))
                .unwrap();
        // 2024-07-13 is Saturday, first match is Monday 09:00
        assert_eq!(next, at(2024, 7, 15, 9, 0, 0));
    }

    #[test]
    fn test_last_day_of_month() {
        let next = cron_next_after("0 0 12 L * ?", Tz::UTC, at(2024, 7, 15, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 7, 31, 12, 0, 0));
        let next = cron_next_after("0 0 12 L * ?", Tz::UTC, next).unwrap();
        assert_eq!(next, at(2024, 8, 31, 12, 0, 0));
        // February in a leap year
        let next = cron_next_after("0 0 12 L * ?", Tz::UTC, at(2024, 2, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 2, 29, 12, 0, 0));
    }

    #[test]
    fn test_last_day_with_offset() {
        let next = cron_next_after("0 0 12 L-2 * ?", Tz::UTC, at(2024, 7, 15, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 7, 29, 12, 0, 0));
    }

    #[test]
    fn test_nearest_weekday() {
        // 2024-09-15 is a Sunday, nearest weekday is Monday the 16th
        let next = cron_next_after("0 0 9 15W * ?", Tz::UTC, at(2024, 9, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 9, 16, 9, 0, 0));
        // 2024-06-15 is a Saturday, nearest weekday is Friday the 14th
        let next = cron_next_after("0 0 9 15W * ?", Tz::UTC, at(2024, 6, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 6, 14, 9, 0, 0));
    }

    #[test]
    fn test_last_weekday_of_month() {
        // 2024-06-30 is a Sunday, last weekday is Friday the 28th
        let next = cron_next_after("0 0 9 LW * ?", Tz::UTC, at(2024, 6, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 6, 28, 9, 0, 0));
    }

    #[test]
    fn test_nth_weekday() {
        // third Friday of July 2024 is the 19th; 6 = Friday in Quartz numbering
        let next = cron_next_after("0 15 10 ? * 6#3", Tz::UTC, at(2024, 7, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 7, 19, 10, 15, 0));
        let next = cron_next_after("0 15 10 ? * FRI#3", Tz::UTC, at(2024, 7, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 7, 19, 10, 15, 0));
    }

    #[test]
    fn test_last_weekday_term() {
        // last Friday of July 2024 is the 26th
        let next = cron_next_after("0 0 8 ? * FRIL", Tz::UTC, at(2024, 7, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 7, 26, 8, 0, 0));
        let next = cron_next_after("0 0 8 ? * 6L", Tz::UTC, at(2024, 7, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 7, 26, 8, 0, 0));
    }

    #[test]
    fn test_year_field() {
        let next =
            cron_next_after("0 0 0 1 1 ? 2030", Tz::UTC, at(2024, 7, 15, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2030, 1, 1, 0, 0, 0));
        assert_eq!(cron_next_after("0 0 0 1 1 ? 2030", Tz::UTC, next), None);
    }

    #[test]
    fn test_time_zone_evaluation() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 08:00 New York in July is 12:00 UTC (EDT)
        let next = cron_next_after("0 0 8 * * ?", tz, at(2024, 7, 15, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 7, 15, 12, 0, 0));
        // and 13:00 UTC in January (EST)
        let next = cron_next_after("0 0 8 * * ?", tz, at(2024, 1, 15, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 15, 13, 0, 0));
    }

    #[test]
    fn test_validate() {
        assert!(QuartzCron::parse("0 15 10 * * ?").is_ok());
        assert!(QuartzCron::parse("0 15 10 L * ?").is_ok());
        assert!(QuartzCron::parse("not a cron").is_err());
        assert!(QuartzCron::parse("0 15 10 XW * ?").is_err());
        assert!(QuartzCron::parse("0 15 10 ? * MON#9").is_err());
    }

    #[test]
    fn test_schedule_builder_round_trip() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let s = CronSchedule::builder("0 30 7 ? * MON-FRI")
            .in_time_zone(tz)
            .with_misfire_handling_instruction_do_nothing()
            .build();
        assert_eq!(s.schedule_builder().build(), s);
    }

    #[test]
    fn test_fire_time_after_respects_bounds() {
        let s = CronSchedule::builder("0 0 12 * * ?").build();
        let start = at(2024, 7, 15, 0, 0, 0);
        let next = s
            .fire_time_after(at(2024, 7, 1, 0, 0, 0), start, None)
            .unwrap();
        // candidates before the start time are not produced
        assert_eq!(next, at(2024, 7, 15, 12, 0, 0));
        assert_eq!(
            s.fire_time_after(at(2024, 7, 15, 13, 0, 0), start, Some(at(2024, 7, 16, 0, 0, 0))),
            None
        );
    }
}
