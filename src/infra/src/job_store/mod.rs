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

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc, Weekday};
use chrono_tz::Tz;
use config::{
    RECOVERING_JOBS_GROUP,
    meta::{
        calendar::Calendar,
        job::JobDetail,
        key::{GroupMatcher, JobKey, TriggerKey},
        trigger::{
            IntervalUnit, Schedule, TimeOfDay, Trigger, TriggerState,
            calendar_interval::CalendarIntervalSchedule,
            custom_calendar::CustomCalendarSchedule,
            daily_time_interval::DailyTimeIntervalSchedule, simple::SimpleScheduleBuilder,
        },
    },
    utils::time,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

pub mod memory;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

/// Guards all trigger/job/fired-trigger mutation.
pub const LOCK_TRIGGER_ACCESS: &str = "TRIGGER_ACCESS";
/// Guards cluster state and recovery.
pub const LOCK_STATE_ACCESS: &str = "STATE_ACCESS";

/// Marker row in the paused-groups table meaning every group is paused.
pub const ALL_GROUPS_PAUSED: &str = "_$_ALL_GROUPS_PAUSED_$_";

/// Data-map keys a recovery trigger carries into the recovered job.
pub const KEY_RECOVERING_TRIGGER_NAME: &str = "qrtz_recovering_trigger_name";
pub const KEY_RECOVERING_TRIGGER_GROUP: &str = "qrtz_recovering_trigger_group";
pub const KEY_RECOVERING_FIRED_TIME: &str = "qrtz_fired_time";
pub const KEY_RECOVERING_SCHEDULED_TIME: &str = "qrtz_scheduled_fire_time";

static CLIENT: Lazy<Arc<dyn JobStore>> = Lazy::new(connect);

pub fn connect() -> Arc<dyn JobStore> {
    let cfg = config::get_config();
    match cfg.data_source.driver.as_str() {
        "postgres" => Arc::new(postgres::PostgresJobStore::new()),
        "mysql" => Arc::new(mysql::MySqlJobStore::new()),
        "sqlite" => Arc::new(sqlite::SqliteJobStore::new()),
        _ => Arc::new(memory::MemoryJobStore::new()),
    }
}

/// The process-default store selected by `quartz.dataSource.driver`.
/// Constructors accept any other `Arc<dyn JobStore>` for tests.
pub fn default_store() -> Arc<dyn JobStore> {
    CLIENT.clone()
}

/// Initializes the default store - creates tables and indices
pub async fn init() -> Result<()> {
    CLIENT.create_table().await?;
    CLIENT.create_table_index().await?;
    Ok(())
}

/// Execution state of a fired-trigger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FiredState {
    #[default]
    Acquired,
    Executing,
}

impl FiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquired => "ACQUIRED",
            Self::Executing => "EXECUTING",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "EXECUTING" => Self::Executing,
            _ => Self::Acquired,
        }
    }
}

/// Inserted on acquire, removed on completion; a record that survives a
/// crash drives recovery of the owning instance's in-flight work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    pub entry_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    pub instance_name: String,
    pub fired_time: i64,
    pub scheduled_time: i64,
    pub priority: i32,
    pub state: FiredState,
    pub is_nonconcurrent: bool,
    pub requests_recovery: bool,
}

/// One row per live scheduler instance; stale rows drive failover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStateRecord {
    pub instance_name: String,
    pub last_checkin_time: i64,
    pub checkin_interval: i64,
}

/// Everything the execution shell needs for one firing.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub trigger: Trigger,
    pub job: JobDetail,
    pub calendar: Option<Calendar>,
    pub recovering: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub prev_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum TriggerFiredResult {
    Fired(Box<TriggerFiredBundle>),
    Skipped {
        trigger_key: TriggerKey,
        reason: String,
    },
}

/// Post-execution instruction applied by `triggered_job_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedExecutionInstruction {
    NoInstruction,
    DeleteTrigger,
    SetTriggerComplete,
    SetTriggerError,
    SetAllJobTriggersError,
    SetAllJobTriggersComplete,
}

/// Outcome of one misfire scan pass. `has_more` means the batch cap was hit
/// and the caller should run another pass immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct MisfireScan {
    pub handled: usize,
    pub has_more: bool,
    pub earliest_new_time: Option<i64>,
}

/// Contract every store implements. Implementations are safe for concurrent
/// access from one scheduler instance; the persistent variants additionally
/// coordinate multiple cluster instances through named row locks.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn create_table(&self) -> Result<()>;
    async fn create_table_index(&self) -> Result<()>;

    async fn store_job_and_trigger(&self, job: &JobDetail, trigger: &Trigger) -> Result<()>;
    async fn store_job(&self, job: &JobDetail, replace_existing: bool) -> Result<()>;
    async fn store_trigger(&self, trigger: &Trigger, replace_existing: bool) -> Result<()>;
    async fn remove_job(&self, key: &JobKey) -> Result<bool>;
    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool>;
    /// Swaps a trigger for a new one keeping the job linkage.
    async fn replace_trigger(&self, key: &TriggerKey, new_trigger: &Trigger) -> Result<bool>;
    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>>;
    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>>;
    /// Writes back a mutated job data map.
    async fn update_job_data(&self, job: &JobDetail) -> Result<()>;
    async fn job_exists(&self, key: &JobKey) -> Result<bool>;
    async fn trigger_exists(&self, key: &TriggerKey) -> Result<bool>;
    async fn calendar_exists(&self, name: &str) -> Result<bool>;
    async fn get_job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>>;
    async fn get_trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>>;
    async fn get_job_group_names(&self) -> Result<Vec<String>>;
    async fn get_trigger_group_names(&self) -> Result<Vec<String>>;
    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>>;
    async fn get_trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>>;
    async fn get_number_of_jobs(&self) -> Result<usize>;
    async fn get_number_of_triggers(&self) -> Result<usize>;

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<()>;
    async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>>;
    async fn pause_job(&self, key: &JobKey) -> Result<()>;
    async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>>;
    async fn resume_trigger(&self, key: &TriggerKey) -> Result<()>;
    async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>>;
    async fn resume_job(&self, key: &JobKey) -> Result<()>;
    async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>>;
    async fn pause_all(&self) -> Result<()>;
    async fn resume_all(&self) -> Result<()>;
    async fn get_paused_trigger_groups(&self) -> Result<Vec<String>>;

    async fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> Result<()>;
    async fn remove_calendar(&self, name: &str) -> Result<bool>;
    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>>;
    async fn get_calendar_names(&self) -> Result<Vec<String>>;

    /// Atomically transitions up to `max_count` WAITING triggers whose
    /// `next_fire_time <= no_later_than + time_window` (millis) to ACQUIRED,
    /// ordered by `(next_fire_time ASC, priority DESC)`, writing fired
    /// records. Misfired candidates get their misfire instruction applied
    /// on the way.
    async fn acquire_next_triggers(
        &self,
        no_later_than: i64,
        max_count: usize,
        time_window: i64,
    ) -> Result<Vec<Trigger>>;
    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<()>;
    async fn triggers_fired(&self, triggers: &[Trigger]) -> Result<Vec<TriggerFiredResult>>;
    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()>;

    /// One bounded misfire scan pass.
    async fn recover_misfired_triggers(&self) -> Result<MisfireScan>;
    /// Refreshes this instance's checkin row and returns peers that stopped
    /// checking in.
    async fn cluster_checkin(&self) -> Result<Vec<SchedulerStateRecord>>;
    /// Takes over the in-flight work of failed instances.
    async fn cluster_recover(&self, failed: &[SchedulerStateRecord]) -> Result<()>;
    /// Prunes COMPLETE triggers and the non-durable jobs they orphaned.
    async fn clean_completed_triggers(&self) -> Result<usize>;
}

/// One-shot trigger that re-fires a recovered job, scheduled at the failed
/// instance's original fired time with the original fire data in the job's
/// data map.
pub(crate) fn build_recovery_trigger(
    fired: &FiredTriggerRecord,
    job: &JobDetail,
) -> Trigger {
    let mut trigger = Trigger::builder()
        .with_identity(
            &format!("recover_{}_{}", fired.instance_name, fired.entry_id),
            RECOVERING_JOBS_GROUP,
        )
        .for_job(job.key.clone())
        .with_priority(fired.priority)
        .start_at(time::from_millis(fired.fired_time))
        .with_schedule(
            SimpleScheduleBuilder::new()
                .with_misfire_handling_instruction_ignore_misfires()
                .build(),
        )
        .build();
    trigger.job_data = job.job_data.clone();
    trigger
        .job_data
        .put(KEY_RECOVERING_TRIGGER_NAME, fired.trigger_key.name.clone());
    trigger.job_data.put(
        KEY_RECOVERING_TRIGGER_GROUP,
        fired.trigger_key.group.clone(),
    );
    trigger
        .job_data
        .put(KEY_RECOVERING_FIRED_TIME, fired.fired_time);
    trigger
        .job_data
        .put(KEY_RECOVERING_SCHEDULED_TIME, fired.scheduled_time);
    trigger.next_fire_time = Some(time::from_millis(fired.fired_time));
    trigger
}

/// Generic property row backing `qrtz_simprop_triggers`; the calendar-
/// interval, daily-interval and custom-calendar variants all persist through
/// it. The dec columns are reserved and stay NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SimpropRow {
    pub str1: Option<String>,
    pub str2: Option<String>,
    pub str3: Option<String>,
    pub int1: Option<i32>,
    pub int2: Option<i32>,
    pub long1: Option<i64>,
    pub long2: Option<i64>,
    pub bool1: Option<bool>,
    pub bool2: Option<bool>,
    pub time_zone_id: Option<String>,
}

pub(crate) fn simprop_from_schedule(schedule: &Schedule) -> Option<SimpropRow> {
    match schedule {
        Schedule::CalendarInterval(s) => Some(SimpropRow {
            str1: Some(s.repeat_interval_unit.as_str().to_string()),
            int1: Some(s.repeat_interval),
            int2: Some(s.times_triggered),
            bool1: Some(s.preserve_hour_of_day_across_daylight_savings),
            bool2: Some(s.skip_day_if_hour_does_not_exist),
            time_zone_id: Some(s.time_zone.name().to_string()),
            ..Default::default()
        }),
        Schedule::DailyTimeInterval(s) => Some(SimpropRow {
            str1: Some(s.repeat_interval_unit.as_str().to_string()),
            str2: Some(weekdays_to_csv(&s.days_of_week)),
            str3: Some(time_of_day_range_to_str(
                &s.start_time_of_day,
                &s.end_time_of_day,
            )),
            int1: Some(s.repeat_interval),
            int2: Some(s.times_triggered),
            long1: Some(s.repeat_count as i64),
            time_zone_id: Some(s.time_zone.name().to_string()),
            ..Default::default()
        }),
        Schedule::CustomCalendar(s) => Some(SimpropRow {
            str1: Some(s.repeat_interval_unit.as_str().to_string()),
            // comma lists are persisted and retrieved as strings unchanged
            str2: s.by_month_day.clone(),
            str3: s.by_day.clone(),
            int1: Some(s.repeat_interval),
            int2: Some(s.times_triggered),
            long1: Some(s.repeat_count),
            long2: s.by_month.map(|m| m as i64),
            time_zone_id: Some(s.time_zone.name().to_string()),
            ..Default::default()
        }),
        _ => None,
    }
}

pub(crate) fn schedule_from_simprop(trigger_type: &str, row: SimpropRow) -> Option<Schedule> {
    let unit = IntervalUnit::from_str(row.str1.as_deref().unwrap_or_default())?;
    let tz = tz_from_str(row.time_zone_id.as_deref().unwrap_or("UTC"));
    match trigger_type {
        "CAL_INT" => Some(Schedule::CalendarInterval(CalendarIntervalSchedule {
            repeat_interval: row.int1.unwrap_or(1),
            repeat_interval_unit: unit,
            time_zone: tz,
            preserve_hour_of_day_across_daylight_savings: row.bool1.unwrap_or_default(),
            skip_day_if_hour_does_not_exist: row.bool2.unwrap_or_default(),
            times_triggered: row.int2.unwrap_or_default(),
            misfire_policy: Default::default(),
        })),
        "DAILY_I" => {
            let (start_tod, end_tod) =
                time_of_day_range_from_str(row.str3.as_deref().unwrap_or_default());
            Some(Schedule::DailyTimeInterval(DailyTimeIntervalSchedule {
                repeat_interval: row.int1.unwrap_or(1),
                repeat_interval_unit: unit,
                days_of_week: weekdays_from_csv(row.str2.as_deref().unwrap_or_default()),
                start_time_of_day: start_tod,
                end_time_of_day: end_tod,
                repeat_count: row.long1.unwrap_or(-1) as i32,
                times_triggered: row.int2.unwrap_or_default(),
                time_zone: tz,
                misfire_policy: Default::default(),
            }))
        }
        "CUSTOM_CAL" => Some(Schedule::CustomCalendar(CustomCalendarSchedule {
            repeat_interval: row.int1.unwrap_or(1),
            repeat_interval_unit: unit,
            by_month: row.long2.map(|m| m as u32),
            by_month_day: row.str2,
            by_day: row.str3,
            repeat_count: row.long1.unwrap_or(-1),
            times_triggered: row.int2.unwrap_or_default(),
            time_zone: tz,
            misfire_policy: Default::default(),
        })),
        _ => None,
    }
}

// csv helpers shared by the persistent stores

pub(crate) fn weekdays_to_csv(days: &[Weekday]) -> String {
    days.iter()
        .map(weekday_to_str)
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn weekdays_from_csv(s: &str) -> Vec<Weekday> {
    s.split(',').filter_map(|d| weekday_from_str(d.trim())).collect()
}

fn weekday_to_str(d: &Weekday) -> &'static str {
    match d {
        Weekday::Mon => "MON",
        Weekday::Tue => "TUE",
        Weekday::Wed => "WED",
        Weekday::Thu => "THU",
        Weekday::Fri => "FRI",
        Weekday::Sat => "SAT",
        Weekday::Sun => "SUN",
    }
}

fn weekday_from_str(s: &str) -> Option<Weekday> {
    match s {
        "MON" => Some(Weekday::Mon),
        "TUE" => Some(Weekday::Tue),
        "WED" => Some(Weekday::Wed),
        "THU" => Some(Weekday::Thu),
        "FRI" => Some(Weekday::Fri),
        "SAT" => Some(Weekday::Sat),
        "SUN" => Some(Weekday::Sun),
        _ => None,
    }
}

/// `"9,0,0,17,30,0"` - start and end time of day as six comma fields.
pub(crate) fn time_of_day_range_to_str(start: &TimeOfDay, end: &TimeOfDay) -> String {
    format!("{start},{end}")
}

pub(crate) fn time_of_day_range_from_str(s: &str) -> (TimeOfDay, TimeOfDay) {
    let parts: Vec<u32> = s.split(',').filter_map(|p| p.trim().parse().ok()).collect();
    if parts.len() != 6 {
        return (TimeOfDay::new(0, 0, 0), TimeOfDay::new(23, 59, 59));
    }
    (
        TimeOfDay::new(parts[0], parts[1], parts[2]),
        TimeOfDay::new(parts[3], parts[4], parts[5]),
    )
}

pub(crate) fn tz_from_str(s: &str) -> Tz {
    s.parse().unwrap_or(Tz::UTC)
}

#[cfg(test)]
mod tests {
    use config::meta::job::JobBuilder;

    use super::*;

    #[test]
    fn test_weekday_csv_round_trip() {
        let days = vec![Weekday::Mon, Weekday::Wed, Weekday::Fri];
        let csv = weekdays_to_csv(&days);
        assert_eq!(csv, "MON,WED,FRI");
        assert_eq!(weekdays_from_csv(&csv), days);
    }

    #[test]
    fn test_time_of_day_range_round_trip() {
        let start = TimeOfDay::new(9, 0, 0);
        let end = TimeOfDay::new(17, 30, 0);
        let s = time_of_day_range_to_str(&start, &end);
        assert_eq!(s, "9,0,0,17,30,0");
        assert_eq!(time_of_day_range_from_str(&s), (start, end));
    }

    #[test]
    fn test_simprop_round_trip() {
        use config::meta::trigger::{
            IntervalUnit, OnceMisfirePolicy,
            calendar_interval::CalendarIntervalScheduleBuilder,
            custom_calendar::CustomCalendarScheduleBuilder,
            daily_time_interval::DailyTimeIntervalScheduleBuilder,
        };

        let schedules = vec![
            Schedule::CalendarInterval(
                CalendarIntervalScheduleBuilder::new()
                    .with_interval(3, IntervalUnit::Month)
                    .preserve_hour_of_day_across_daylight_savings(true)
                    .build(),
            ),
            Schedule::DailyTimeInterval(
                DailyTimeIntervalScheduleBuilder::new()
                    .with_interval(30, IntervalUnit::Minute)
                    .starting_daily_at(TimeOfDay::new(9, 0, 0))
                    .ending_daily_at(TimeOfDay::new(17, 0, 0))
                    .on_monday_through_friday()
                    .with_repeat_count(12)
                    .build(),
            ),
            Schedule::CustomCalendar(
                CustomCalendarScheduleBuilder::new()
                    .with_interval(2, IntervalUnit::Month)
                    .by_month(5)
                    .by_month_day("1,15,31")
                    .by_day("2WE,-1FR")
                    .with_repeat_count(10)
                    .build(),
            ),
        ];
        for schedule in schedules {
            let row = simprop_from_schedule(&schedule).unwrap();
            let back = schedule_from_simprop(schedule.trigger_type(), row).unwrap();
            // the misfire policy travels on the trigger row, not simprop
            let mut back = back;
            back.set_misfire_code(OnceMisfirePolicy::Smart.to_code());
            assert_eq!(back, schedule);
        }
    }

    #[test]
    fn test_build_recovery_trigger() {
        let job = JobBuilder::new()
            .of_type("examples::Recoverable")
            .with_identity("j", "g")
            .request_recovery()
            .using_job_data("input", "payload")
            .build();
        let fired = FiredTriggerRecord {
            entry_id: "entry1".to_string(),
            trigger_key: TriggerKey::new("t", "g"),
            job_key: job.key.clone(),
            instance_name: "node-a".to_string(),
            fired_time: 1_721_000_000_000,
            scheduled_time: 1_720_999_999_000,
            priority: 7,
            state: FiredState::Executing,
            is_nonconcurrent: false,
            requests_recovery: true,
        };
        let trigger = build_recovery_trigger(&fired, &job);
        assert_eq!(trigger.key.group, RECOVERING_JOBS_GROUP);
        assert_eq!(trigger.job_key, job.key);
        assert_eq!(trigger.priority, 7);
        // scheduled at the failed instance's original fired time
        assert_eq!(
            trigger.next_fire_time,
            Some(time::from_millis(fired.fired_time))
        );
        assert_eq!(
            trigger.job_data.get_i64(KEY_RECOVERING_FIRED_TIME),
            Some(fired.fired_time)
        );
        assert_eq!(
            trigger.job_data.get_str(KEY_RECOVERING_TRIGGER_NAME),
            Some("t")
        );
        // the original payload is preserved
        assert_eq!(trigger.job_data.get_str("input"), Some("payload"));
    }
}
