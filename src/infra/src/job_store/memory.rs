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

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use config::{
    RECOVERING_JOBS_GROUP, ider,
    meta::{
        calendar::Calendar,
        job::JobDetail,
        key::{GroupMatcher, JobKey, TriggerKey},
        trigger::{Trigger, TriggerState},
    },
    utils::time,
};
use hashbrown::{HashMap, HashSet};
use tokio::sync::RwLock;

use super::{
    ALL_GROUPS_PAUSED, CompletedExecutionInstruction, FiredState, FiredTriggerRecord, JobStore,
    MisfireScan, SchedulerStateRecord, TriggerFiredBundle, TriggerFiredResult,
};
use crate::errors::{Error, Result};

/// Non-durable store: everything lives behind one async RwLock, which plays
/// the role the TRIGGER_ACCESS row lock plays in the persistent stores.
pub struct MemoryJobStore {
    instance_name: String,
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobKey, JobDetail>,
    triggers: HashMap<TriggerKey, Trigger>,
    calendars: HashMap<String, Calendar>,
    paused_trigger_groups: HashSet<String>,
    fired: HashMap<String, FiredTriggerRecord>,
}

impl MemoryState {
    fn calendar_for(&self, trigger: &Trigger) -> Option<Calendar> {
        trigger
            .calendar_name
            .as_ref()
            .and_then(|name| self.calendars.get(name).cloned())
    }

    fn group_paused(&self, group: &str) -> bool {
        self.paused_trigger_groups.contains(group)
            || self.paused_trigger_groups.contains(ALL_GROUPS_PAUSED)
    }

    fn initial_trigger_state(&self, trigger: &Trigger, job: &JobDetail) -> TriggerState {
        let paused = self.group_paused(&trigger.key.group);
        let blocked = job.concurrent_execution_disallowed
            && self.triggers.values().any(|o| {
                o.job_key == trigger.job_key
                    && o.key != trigger.key
                    && matches!(
                        o.state,
                        TriggerState::Executing
                            | TriggerState::Blocked
                            | TriggerState::PausedBlocked
                    )
            });
        match (paused, blocked) {
            (true, true) => TriggerState::PausedBlocked,
            (true, false) => TriggerState::Paused,
            (false, true) => TriggerState::Blocked,
            (false, false) => TriggerState::Waiting,
        }
    }

    /// Removes a job that is not durable and no longer referenced.
    fn drop_job_if_orphaned(&mut self, key: &JobKey) {
        let referenced = self.triggers.values().any(|t| &t.job_key == key);
        if !referenced
            && let Some(job) = self.jobs.get(key)
            && !job.durable
        {
            self.jobs.remove(key);
        }
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            instance_name: ider::instance_id().to_string(),
            state: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies the misfire instruction when the next fire fell further than the
/// threshold into the past. Returns false when the schedule is exhausted.
fn apply_misfire(
    trigger: &mut Trigger,
    calendar: Option<&Calendar>,
    threshold_ms: i64,
    now: DateTime<Utc>,
) -> bool {
    let Some(next) = trigger.next_fire_time else {
        return false;
    };
    if time::to_millis(now) - time::to_millis(next) <= threshold_ms {
        return true;
    }
    if trigger.schedule.misfire_code() == -1 {
        // fire all missed instants as fast as possible
        return true;
    }
    trigger.update_after_misfire_at(calendar, now);
    trigger.next_fire_time.is_some()
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_table(&self) -> Result<()> {
        Ok(())
    }

    async fn create_table_index(&self) -> Result<()> {
        Ok(())
    }

    async fn store_job_and_trigger(&self, job: &JobDetail, trigger: &Trigger) -> Result<()> {
        self.store_job(job, false).await?;
        self.store_trigger(trigger, false).await
    }

    async fn store_job(&self, job: &JobDetail, replace_existing: bool) -> Result<()> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.key) && !replace_existing {
            return Err(Error::ObjectAlreadyExists(job.key.to_string()));
        }
        state.jobs.insert(job.key.clone(), job.clone());
        Ok(())
    }

    async fn store_trigger(&self, trigger: &Trigger, replace_existing: bool) -> Result<()> {
        let mut state = self.state.write().await;
        if state.triggers.contains_key(&trigger.key) && !replace_existing {
            return Err(Error::ObjectAlreadyExists(trigger.key.to_string()));
        }
        let Some(job) = state.jobs.get(&trigger.job_key) else {
            return Err(Error::JobPersistence(format!(
                "trigger {} references missing job {}",
                trigger.key, trigger.job_key
            )));
        };
        let mut stored = trigger.clone();
        stored.fired_entry_id = None;
        stored.state = state.initial_trigger_state(trigger, job);
        state.triggers.insert(stored.key.clone(), stored);
        Ok(())
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool> {
        let mut state = self.state.write().await;
        state.triggers.retain(|_, t| &t.job_key != key);
        Ok(state.jobs.remove(key).is_some())
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(removed) = state.triggers.remove(key) else {
            return Ok(false);
        };
        state.drop_job_if_orphaned(&removed.job_key);
        Ok(true)
    }

    async fn replace_trigger(&self, key: &TriggerKey, new_trigger: &Trigger) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(old) = state.triggers.get(key) else {
            return Ok(false);
        };
        if old.job_key != new_trigger.job_key {
            return Err(Error::JobPersistence(
                "new trigger must reference the same job as the one it replaces".to_string(),
            ));
        }
        let Some(job) = state.jobs.get(&new_trigger.job_key) else {
            return Err(Error::JobPersistence(format!(
                "trigger {} references missing job {}",
                new_trigger.key, new_trigger.job_key
            )));
        };
        let mut stored = new_trigger.clone();
        stored.fired_entry_id = None;
        stored.state = state.initial_trigger_state(new_trigger, job);
        state.triggers.remove(key);
        state.triggers.insert(stored.key.clone(), stored);
        Ok(true)
    }

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        Ok(self.state.read().await.jobs.get(key).cloned())
    }

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        Ok(self.state.read().await.triggers.get(key).cloned())
    }

    async fn update_job_data(&self, job: &JobDetail) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(stored) = state.jobs.get_mut(&job.key) {
            stored.job_data = job.job_data.clone();
        }
        Ok(())
    }

    async fn job_exists(&self, key: &JobKey) -> Result<bool> {
        Ok(self.state.read().await.jobs.contains_key(key))
    }

    async fn trigger_exists(&self, key: &TriggerKey) -> Result<bool> {
        Ok(self.state.read().await.triggers.contains_key(key))
    }

    async fn calendar_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.read().await.calendars.contains_key(name))
    }

    async fn get_job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>> {
        let state = self.state.read().await;
        let mut keys: Vec<JobKey> = state
            .jobs
            .keys()
            .filter(|k| matcher.matches(&k.group))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>> {
        let state = self.state.read().await;
        let mut keys: Vec<TriggerKey> = state
            .triggers
            .keys()
            .filter(|k| matcher.matches(&k.group))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_job_group_names(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut groups: Vec<String> = state
            .jobs
            .keys()
            .map(|k| k.group.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        groups.sort();
        Ok(groups)
    }

    async fn get_trigger_group_names(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut groups: Vec<String> = state
            .triggers
            .keys()
            .map(|k| k.group.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        groups.sort();
        Ok(groups)
    }

    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        let state = self.state.read().await;
        let mut triggers: Vec<Trigger> = state
            .triggers
            .values()
            .filter(|t| &t.job_key == key)
            .cloned()
            .collect();
        triggers.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(triggers)
    }

    async fn get_trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>> {
        Ok(self.state.read().await.triggers.get(key).map(|t| t.state))
    }

    async fn get_number_of_jobs(&self) -> Result<usize> {
        Ok(self.state.read().await.jobs.len())
    }

    async fn get_number_of_triggers(&self) -> Result<usize> {
        Ok(self.state.read().await.triggers.len())
    }

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(t) = state.triggers.get_mut(key) {
            t.state = match t.state {
                TriggerState::Complete => TriggerState::Complete,
                TriggerState::Blocked | TriggerState::PausedBlocked => TriggerState::PausedBlocked,
                _ => TriggerState::Paused,
            };
        }
        Ok(())
    }

    async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let mut state = self.state.write().await;
        let mut groups: HashSet<String> = state
            .triggers
            .keys()
            .filter(|k| matcher.matches(&k.group))
            .map(|k| k.group.clone())
            .collect();
        // an exact-name matcher also pauses triggers stored later
        if let GroupMatcher::Equals(group) = matcher {
            groups.insert(group.clone());
        }
        for group in &groups {
            state.paused_trigger_groups.insert(group.clone());
        }
        let keys: Vec<TriggerKey> = state
            .triggers
            .keys()
            .filter(|k| groups.contains(&k.group))
            .cloned()
            .collect();
        for key in keys {
            if let Some(t) = state.triggers.get_mut(&key) {
                t.state = match t.state {
                    TriggerState::Complete => TriggerState::Complete,
                    TriggerState::Blocked | TriggerState::PausedBlocked => {
                        TriggerState::PausedBlocked
                    }
                    _ => TriggerState::Paused,
                };
            }
        }
        let mut groups: Vec<String> = groups.into_iter().collect();
        groups.sort();
        Ok(groups)
    }

    async fn pause_job(&self, key: &JobKey) -> Result<()> {
        let keys: Vec<TriggerKey> = {
            let state = self.state.read().await;
            state
                .triggers
                .values()
                .filter(|t| &t.job_key == key)
                .map(|t| t.key.clone())
                .collect()
        };
        for key in keys {
            self.pause_trigger(&key).await?;
        }
        Ok(())
    }

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let (keys, mut groups): (Vec<JobKey>, HashSet<String>) = {
            let state = self.state.read().await;
            let keys: Vec<JobKey> = state
                .jobs
                .keys()
                .filter(|k| matcher.matches(&k.group))
                .cloned()
                .collect();
            let groups = keys.iter().map(|k| k.group.clone()).collect();
            (keys, groups)
        };
        if let GroupMatcher::Equals(group) = matcher {
            groups.insert(group.clone());
        }
        for key in keys {
            self.pause_job(&key).await?;
        }
        let mut groups: Vec<String> = groups.into_iter().collect();
        groups.sort();
        Ok(groups)
    }

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        let now = time::now();
        let threshold = config::get_config().job_store.misfire_threshold;
        let mut state = self.state.write().await;
        let cal = state.triggers.get(key).and_then(|t| state.calendar_for(t));
        if let Some(t) = state.triggers.get_mut(key) {
            match t.state {
                TriggerState::Paused => {
                    t.state = TriggerState::Waiting;
                    if !apply_misfire(t, cal.as_ref(), threshold, now) {
                        t.state = TriggerState::Complete;
                    }
                }
                TriggerState::PausedBlocked => t.state = TriggerState::Blocked,
                _ => {}
            }
        }
        Ok(())
    }

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let (keys, groups) = {
            let mut state = self.state.write().await;
            let groups: Vec<String> = state
                .paused_trigger_groups
                .iter()
                .filter(|g| matcher.matches(g))
                .cloned()
                .collect();
            for group in &groups {
                state.paused_trigger_groups.remove(group);
            }
            let keys: Vec<TriggerKey> = state
                .triggers
                .keys()
                .filter(|k| matcher.matches(&k.group))
                .cloned()
                .collect();
            (keys, groups)
        };
        for key in keys {
            self.resume_trigger(&key).await?;
        }
        Ok(groups)
    }

    async fn resume_job(&self, key: &JobKey) -> Result<()> {
        let keys: Vec<TriggerKey> = {
            let state = self.state.read().await;
            state
                .triggers
                .values()
                .filter(|t| &t.job_key == key)
                .map(|t| t.key.clone())
                .collect()
        };
        for key in keys {
            self.resume_trigger(&key).await?;
        }
        Ok(())
    }

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let keys: Vec<JobKey> = {
            let state = self.state.read().await;
            state
                .jobs
                .keys()
                .filter(|k| matcher.matches(&k.group))
                .cloned()
                .collect()
        };
        let mut groups: HashSet<String> = HashSet::new();
        for key in keys {
            groups.insert(key.group.clone());
            self.resume_job(&key).await?;
        }
        let mut groups: Vec<String> = groups.into_iter().collect();
        groups.sort();
        Ok(groups)
    }

    async fn pause_all(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.paused_trigger_groups.insert(ALL_GROUPS_PAUSED.to_string());
        }
        self.pause_triggers(&GroupMatcher::Any).await?;
        Ok(())
    }

    async fn resume_all(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            state.paused_trigger_groups.clear();
        }
        self.resume_triggers(&GroupMatcher::Any).await?;
        Ok(())
    }

    async fn get_paused_trigger_groups(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut groups: Vec<String> = state.paused_trigger_groups.iter().cloned().collect();
        groups.sort();
        Ok(groups)
    }

    async fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> Result<()> {
        let threshold = chrono::Duration::milliseconds(
            config::get_config().job_store.misfire_threshold,
        );
        let mut state = self.state.write().await;
        if state.calendars.contains_key(name) && !replace_existing {
            return Err(Error::ObjectAlreadyExists(name.to_string()));
        }
        state.calendars.insert(name.to_string(), calendar.clone());
        if update_triggers {
            for t in state.triggers.values_mut() {
                if t.calendar_name.as_deref() == Some(name) {
                    t.update_with_new_calendar(calendar, threshold);
                    if t.next_fire_time.is_none() && t.state == TriggerState::Waiting {
                        t.state = TriggerState::Complete;
                    }
                }
            }
        }
        Ok(())
    }

    async fn remove_calendar(&self, name: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let referenced = state
            .triggers
            .values()
            .any(|t| t.calendar_name.as_deref() == Some(name));
        if referenced {
            return Err(Error::JobPersistence(format!(
                "calendar {name} is referenced by triggers and cannot be removed"
            )));
        }
        Ok(state.calendars.remove(name).is_some())
    }

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        Ok(self.state.read().await.calendars.get(name).cloned())
    }

    async fn get_calendar_names(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state.calendars.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn acquire_next_triggers(
        &self,
        no_later_than: i64,
        max_count: usize,
        time_window: i64,
    ) -> Result<Vec<Trigger>> {
        let now = time::now();
        let threshold = config::get_config().job_store.misfire_threshold;
        let mut state = self.state.write().await;
        let bound = no_later_than + time_window;
        let mut candidates: Vec<(i64, i32, TriggerKey)> = state
            .triggers
            .values()
            .filter(|t| t.state == TriggerState::Waiting)
            .filter_map(|t| {
                t.next_fire_time
                    .map(|n| (time::to_millis(n), t.priority, t.key.clone()))
            })
            .filter(|(n, _, _)| *n <= bound)
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

        let mut acquired: Vec<Trigger> = Vec::new();
        let mut jobs_in_batch: HashSet<JobKey> = HashSet::new();
        let mut batch_end = bound;
        for (_, _, key) in candidates {
            if acquired.len() >= max_count {
                break;
            }
            let st = &mut *state;
            let Some(t) = st.triggers.get(&key) else {
                continue;
            };
            if t.state != TriggerState::Waiting {
                continue;
            }
            let calendar = t
                .calendar_name
                .as_ref()
                .and_then(|n| st.calendars.get(n).cloned());
            let Some(job) = st.jobs.get(&t.job_key).cloned() else {
                continue;
            };
            let t = st.triggers.get_mut(&key).unwrap();
            if !apply_misfire(t, calendar.as_ref(), threshold, now) {
                t.state = TriggerState::Complete;
                continue;
            }
            let next = t.next_fire_time.unwrap();
            let next_ms = time::to_millis(next);
            if next_ms > batch_end {
                break;
            }
            if job.concurrent_execution_disallowed && jobs_in_batch.contains(&job.key) {
                continue;
            }
            if acquired.is_empty() {
                batch_end = next_ms.max(no_later_than) + time_window;
            }
            t.state = TriggerState::Acquired;
            let entry_id = ider::generate();
            let mut clone = t.clone();
            clone.fired_entry_id = Some(entry_id.clone());
            st.fired.insert(
                entry_id.clone(),
                FiredTriggerRecord {
                    entry_id,
                    trigger_key: key.clone(),
                    job_key: job.key.clone(),
                    instance_name: self.instance_name.clone(),
                    fired_time: time::to_millis(now),
                    scheduled_time: next_ms,
                    priority: clone.priority,
                    state: FiredState::Acquired,
                    is_nonconcurrent: job.concurrent_execution_disallowed,
                    requests_recovery: job.request_recovery,
                },
            );
            if job.concurrent_execution_disallowed {
                jobs_in_batch.insert(job.key.clone());
            }
            acquired.push(clone);
        }
        Ok(acquired)
    }

    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(t) = state.triggers.get_mut(&trigger.key)
            && t.state == TriggerState::Acquired
        {
            t.state = TriggerState::Waiting;
        }
        if let Some(entry_id) = &trigger.fired_entry_id {
            state.fired.remove(entry_id);
        }
        Ok(())
    }

    async fn triggers_fired(&self, triggers: &[Trigger]) -> Result<Vec<TriggerFiredResult>> {
        let now = time::now();
        let mut state = self.state.write().await;
        let mut results = Vec::with_capacity(triggers.len());
        for fired in triggers {
            let key = fired.key.clone();
            let skipped = |reason: &str| TriggerFiredResult::Skipped {
                trigger_key: key.clone(),
                reason: reason.to_string(),
            };
            let st = &mut *state;
            let Some(stored) = st.triggers.get(&key) else {
                results.push(skipped("trigger no longer exists"));
                continue;
            };
            if stored.state != TriggerState::Acquired {
                results.push(skipped("trigger is no longer in the acquired state"));
                continue;
            }
            let Some(entry_id) = fired.fired_entry_id.clone() else {
                results.push(skipped("trigger carries no fired entry id"));
                continue;
            };
            if !st.fired.contains_key(&entry_id) {
                results.push(skipped("fired record is gone"));
                continue;
            }
            let Some(job) = st.jobs.get(&stored.job_key).cloned() else {
                results.push(skipped("job no longer exists"));
                continue;
            };
            let calendar = st
                .triggers
                .get(&key)
                .and_then(|t| t.calendar_name.as_ref())
                .and_then(|n| st.calendars.get(n).cloned());

            let stored = st.triggers.get_mut(&key).unwrap();
            let prev_fire_time = stored.previous_fire_time;
            stored.triggered(calendar.as_ref());
            stored.state = if stored.next_fire_time.is_none() {
                TriggerState::Complete
            } else {
                TriggerState::Executing
            };
            let mut trigger = stored.clone();
            trigger.fired_entry_id = Some(entry_id.clone());
            let next_fire_time = trigger.next_fire_time;

            if job.concurrent_execution_disallowed {
                for (k, other) in st.triggers.iter_mut() {
                    if other.job_key == job.key && k != &key {
                        other.state = match other.state {
                            TriggerState::Waiting | TriggerState::Acquired => TriggerState::Blocked,
                            TriggerState::Paused => TriggerState::PausedBlocked,
                            s => s,
                        };
                    }
                }
            }

            let record = st.fired.get_mut(&entry_id).unwrap();
            record.state = FiredState::Executing;
            let scheduled_fire_time = time::from_millis(record.scheduled_time);

            results.push(TriggerFiredResult::Fired(Box::new(TriggerFiredBundle {
                recovering: trigger.key.group == RECOVERING_JOBS_GROUP,
                trigger,
                job,
                calendar,
                fire_time: now,
                scheduled_fire_time,
                prev_fire_time,
                next_fire_time,
            })));
        }
        Ok(results)
    }

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let st = &mut *state;
        match instruction {
            CompletedExecutionInstruction::NoInstruction => {
                if let Some(t) = st.triggers.get_mut(&trigger.key)
                    && t.state == TriggerState::Executing
                {
                    t.state = if t.next_fire_time.is_none() {
                        TriggerState::Complete
                    } else {
                        TriggerState::Waiting
                    };
                }
            }
            CompletedExecutionInstruction::DeleteTrigger => {
                // don't delete a trigger that was rescheduled while the job ran
                let reschedule_safe = st
                    .triggers
                    .get(&trigger.key)
                    .map(|t| t.next_fire_time.is_none() || t.next_fire_time == trigger.next_fire_time)
                    .unwrap_or(false);
                if reschedule_safe {
                    st.triggers.remove(&trigger.key);
                    st.drop_job_if_orphaned(&trigger.job_key);
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                if let Some(t) = st.triggers.get_mut(&trigger.key) {
                    t.state = TriggerState::Complete;
                }
            }
            CompletedExecutionInstruction::SetTriggerError => {
                if let Some(t) = st.triggers.get_mut(&trigger.key) {
                    t.state = TriggerState::Error;
                }
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                for t in st.triggers.values_mut() {
                    if t.job_key == job.key {
                        t.state = TriggerState::Complete;
                    }
                }
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                for t in st.triggers.values_mut() {
                    if t.job_key == job.key {
                        t.state = TriggerState::Error;
                    }
                }
            }
        }

        if job.concurrent_execution_disallowed {
            for t in st.triggers.values_mut() {
                if t.job_key == job.key {
                    t.state = match t.state {
                        TriggerState::Blocked => TriggerState::Waiting,
                        TriggerState::PausedBlocked => TriggerState::Paused,
                        s => s,
                    };
                }
            }
        }

        if job.persist_job_data_after_execution
            && let Some(stored) = st.jobs.get_mut(&job.key)
        {
            stored.job_data = job.job_data.clone();
        }

        if let Some(entry_id) = &trigger.fired_entry_id {
            st.fired.remove(entry_id);
        }
        Ok(())
    }

    async fn recover_misfired_triggers(&self) -> Result<MisfireScan> {
        let now = time::now();
        let cfg = config::get_config();
        let threshold = cfg.job_store.misfire_threshold;
        let batch = cfg.job_store.max_misfires_to_handle_at_a_time.max(1);
        let misfire_before = time::to_millis(now) - threshold;

        let mut state = self.state.write().await;
        let mut candidates: Vec<(i64, i32, TriggerKey)> = state
            .triggers
            .values()
            .filter(|t| t.state == TriggerState::Waiting)
            .filter(|t| t.schedule.misfire_code() != -1)
            .filter_map(|t| {
                t.next_fire_time
                    .map(|n| (time::to_millis(n), t.priority, t.key.clone()))
            })
            .filter(|(n, _, _)| *n < misfire_before)
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        let has_more = candidates.len() > batch;
        candidates.truncate(batch);

        let mut scan = MisfireScan {
            has_more,
            ..Default::default()
        };
        for (_, _, key) in candidates {
            let st = &mut *state;
            let calendar = st
                .triggers
                .get(&key)
                .and_then(|t| t.calendar_name.as_ref())
                .and_then(|n| st.calendars.get(n).cloned());
            let Some(t) = st.triggers.get_mut(&key) else {
                continue;
            };
            t.update_after_misfire_at(calendar.as_ref(), now);
            match t.next_fire_time {
                Some(next) => {
                    let ms = time::to_millis(next);
                    scan.earliest_new_time =
                        Some(scan.earliest_new_time.map_or(ms, |e: i64| e.min(ms)));
                }
                None => t.state = TriggerState::Complete,
            }
            scan.handled += 1;
        }
        Ok(scan)
    }

    async fn cluster_checkin(&self) -> Result<Vec<SchedulerStateRecord>> {
        // single-instance store, nothing to check in against
        Ok(vec![])
    }

    async fn cluster_recover(&self, _failed: &[SchedulerStateRecord]) -> Result<()> {
        Ok(())
    }

    async fn clean_completed_triggers(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        let complete: Vec<TriggerKey> = state
            .triggers
            .values()
            .filter(|t| t.state == TriggerState::Complete)
            .map(|t| t.key.clone())
            .collect();
        for key in &complete {
            if let Some(removed) = state.triggers.remove(key) {
                state.drop_job_if_orphaned(&removed.job_key);
            }
        }
        Ok(complete.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use config::meta::{
        calendar::CalendarDetail,
        job::JobBuilder,
        trigger::{TriggerBuilder, simple::SimpleScheduleBuilder},
    };

    use super::*;

    fn job(name: &str) -> JobDetail {
        JobBuilder::new()
            .of_type("examples::Noop")
            .with_identity(name, "g")
            .build()
    }

    fn repeating(name: &str, job: &JobDetail, start: DateTime<Utc>) -> Trigger {
        let mut t = TriggerBuilder::new()
            .with_identity(name, "g")
            .for_job(job.key.clone())
            .start_at(start)
            .with_schedule(
                SimpleScheduleBuilder::new()
                    .with_interval_seconds(1)
                    .repeat_forever()
                    .build(),
            )
            .build();
        t.compute_first_fire_time(None);
        t
    }

    #[tokio::test]
    async fn test_store_and_retrieve_round_trip() {
        let store = MemoryJobStore::new();
        let j = job("j1");
        let t = repeating("t1", &j, time::now());
        store.store_job_and_trigger(&j, &t).await.unwrap();

        let got = store.retrieve_job(&j.key).await.unwrap().unwrap();
        assert_eq!(got, j);
        let got = store.retrieve_trigger(&t.key).await.unwrap().unwrap();
        assert_eq!(got.schedule, t.schedule);
        assert_eq!(got.state, TriggerState::Waiting);
        assert!(store.job_exists(&j.key).await.unwrap());
        assert_eq!(store.get_number_of_triggers().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_rejects_duplicates_without_replace() {
        let store = MemoryJobStore::new();
        let j = job("j1");
        store.store_job(&j, false).await.unwrap();
        let err = store.store_job(&j, false).await.unwrap_err();
        assert!(matches!(err, Error::ObjectAlreadyExists(_)));
        store.store_job(&j, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_trigger_requires_job() {
        let store = MemoryJobStore::new();
        let j = job("ghost");
        let t = repeating("t1", &j, time::now());
        let err = store.store_trigger(&t, false).await.unwrap_err();
        assert!(matches!(err, Error::JobPersistence(_)));
    }

    #[tokio::test]
    async fn test_acquire_orders_by_fire_time_then_priority() {
        let store = MemoryJobStore::new();
        let j = job("j1");
        store.store_job(&j, false).await.unwrap();
        let now = time::now();
        let mut low = repeating("low", &j, now - Duration::seconds(5));
        low.priority = 1;
        let mut high = repeating("high", &j, now - Duration::seconds(5));
        high.priority = 9;
        // same fire times, priority breaks the tie
        low.next_fire_time = Some(now);
        high.next_fire_time = Some(now);
        store.store_trigger(&low, false).await.unwrap();
        store.store_trigger(&high, false).await.unwrap();

        let acquired = store
            .acquire_next_triggers(time::to_millis(now) + 1000, 2, 0)
            .await
            .unwrap();
        assert_eq!(acquired.len(), 2);
        assert_eq!(acquired[0].key.name, "high");
        assert_eq!(acquired[1].key.name, "low");
        for t in &acquired {
            assert!(t.fired_entry_id.is_some());
            assert_eq!(
                store.get_trigger_state(&t.key).await.unwrap(),
                Some(TriggerState::Acquired)
            );
        }
    }

    #[tokio::test]
    async fn test_acquire_skips_paused_and_respects_max_count() {
        let store = MemoryJobStore::new();
        let j = job("j1");
        store.store_job(&j, false).await.unwrap();
        let now = time::now();
        for name in ["a", "b", "c"] {
            let mut t = repeating(name, &j, now - Duration::seconds(1));
            t.next_fire_time = Some(now);
            store.store_trigger(&t, false).await.unwrap();
        }
        store
            .pause_trigger(&TriggerKey::new("a", "g"))
            .await
            .unwrap();

        let acquired = store
            .acquire_next_triggers(time::to_millis(now) + 1000, 1, 0)
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1);
        assert_ne!(acquired[0].key.name, "a");
    }

    #[tokio::test]
    async fn test_fired_flow_blocks_nonconcurrent_siblings() {
        let store = MemoryJobStore::new();
        let j = JobBuilder::new()
            .of_type("examples::Serial")
            .with_identity("serial", "g")
            .disallow_concurrent_execution()
            .build();
        store.store_job(&j, false).await.unwrap();
        let now = time::now();
        let mut t1 = repeating("t1", &j, now - Duration::seconds(1));
        t1.next_fire_time = Some(now);
        let mut t2 = repeating("t2", &j, now - Duration::seconds(1));
        t2.next_fire_time = Some(now + Duration::seconds(1));
        store.store_trigger(&t1, false).await.unwrap();
        store.store_trigger(&t2, false).await.unwrap();

        let acquired = store
            .acquire_next_triggers(time::to_millis(now) + 5000, 2, 0)
            .await
            .unwrap();
        // the second trigger of the same nonconcurrent job stays behind
        assert_eq!(acquired.len(), 1);

        let results = store.triggers_fired(&acquired).await.unwrap();
        assert_eq!(results.len(), 1);
        let bundle = match &results[0] {
            TriggerFiredResult::Fired(b) => b,
            TriggerFiredResult::Skipped { reason, .. } => panic!("skipped: {reason}"),
        };
        assert_eq!(bundle.trigger.key, t1.key);
        assert_eq!(
            store.get_trigger_state(&t1.key).await.unwrap(),
            Some(TriggerState::Executing)
        );
        assert_eq!(
            store.get_trigger_state(&t2.key).await.unwrap(),
            Some(TriggerState::Blocked)
        );

        store
            .triggered_job_complete(
                &bundle.trigger,
                &bundle.job,
                CompletedExecutionInstruction::NoInstruction,
            )
            .await
            .unwrap();
        assert_eq!(
            store.get_trigger_state(&t1.key).await.unwrap(),
            Some(TriggerState::Waiting)
        );
        assert_eq!(
            store.get_trigger_state(&t2.key).await.unwrap(),
            Some(TriggerState::Waiting)
        );
    }

    #[tokio::test]
    async fn test_triggers_fired_skips_released_trigger() {
        let store = MemoryJobStore::new();
        let j = job("j1");
        store.store_job(&j, false).await.unwrap();
        let now = time::now();
        let mut t = repeating("t1", &j, now - Duration::seconds(1));
        t.next_fire_time = Some(now);
        store.store_trigger(&t, false).await.unwrap();

        let acquired = store
            .acquire_next_triggers(time::to_millis(now) + 1000, 1, 0)
            .await
            .unwrap();
        store.release_acquired_trigger(&acquired[0]).await.unwrap();

        let results = store.triggers_fired(&acquired).await.unwrap();
        assert!(matches!(results[0], TriggerFiredResult::Skipped { .. }));
        assert_eq!(
            store.get_trigger_state(&t.key).await.unwrap(),
            Some(TriggerState::Waiting)
        );
    }

    #[tokio::test]
    async fn test_complete_persists_mutated_job_data() {
        let store = MemoryJobStore::new();
        let j = JobBuilder::new()
            .of_type("examples::Counter")
            .with_identity("counter", "g")
            .persist_job_data_after_execution()
            .using_job_data("count", 0)
            .build();
        store.store_job(&j, false).await.unwrap();
        let now = time::now();
        let mut t = repeating("t1", &j, now - Duration::seconds(1));
        t.next_fire_time = Some(now);
        store.store_trigger(&t, false).await.unwrap();

        let acquired = store
            .acquire_next_triggers(time::to_millis(now) + 1000, 1, 0)
            .await
            .unwrap();
        let results = store.triggers_fired(&acquired).await.unwrap();
        let bundle = match &results[0] {
            TriggerFiredResult::Fired(b) => b.clone(),
            _ => panic!("expected fired"),
        };
        let mut job = bundle.job.clone();
        job.job_data.put("count", 42);
        store
            .triggered_job_complete(
                &bundle.trigger,
                &job,
                CompletedExecutionInstruction::NoInstruction,
            )
            .await
            .unwrap();
        let stored = store.retrieve_job(&j.key).await.unwrap().unwrap();
        assert_eq!(stored.job_data.get_i64("count"), Some(42));
    }

    #[tokio::test]
    async fn test_delete_trigger_instruction_drops_orphan_job() {
        let store = MemoryJobStore::new();
        let j = job("j1"); // not durable
        store.store_job(&j, false).await.unwrap();
        let now = time::now();
        let mut t = repeating("t1", &j, now - Duration::seconds(1));
        t.next_fire_time = Some(now);
        store.store_trigger(&t, false).await.unwrap();

        let acquired = store
            .acquire_next_triggers(time::to_millis(now) + 1000, 1, 0)
            .await
            .unwrap();
        let results = store.triggers_fired(&acquired).await.unwrap();
        let bundle = match &results[0] {
            TriggerFiredResult::Fired(b) => b.clone(),
            _ => panic!("expected fired"),
        };
        store
            .triggered_job_complete(
                &bundle.trigger,
                &bundle.job,
                CompletedExecutionInstruction::DeleteTrigger,
            )
            .await
            .unwrap();
        assert!(!store.trigger_exists(&t.key).await.unwrap());
        assert!(!store.job_exists(&j.key).await.unwrap());
    }

    #[tokio::test]
    async fn test_misfire_scan_replans_stale_triggers() {
        let store = MemoryJobStore::new();
        let j = job("j1");
        store.store_job(&j, false).await.unwrap();
        let now = time::now();
        // a trigger two hours in the past with DoNothing semantics would be
        // caught here; the default smart policy re-anchors at now
        let mut t = repeating("stale", &j, now - Duration::hours(3));
        t.next_fire_time = Some(now - Duration::hours(2));
        store.store_trigger(&t, false).await.unwrap();

        let scan = store.recover_misfired_triggers().await.unwrap();
        assert_eq!(scan.handled, 1);
        assert!(!scan.has_more);
        let stored = store.retrieve_trigger(&t.key).await.unwrap().unwrap();
        assert!(stored.next_fire_time.unwrap() >= now - Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_pause_and_resume_groups() {
        let store = MemoryJobStore::new();
        let j = job("j1");
        store.store_job(&j, false).await.unwrap();
        let t = repeating("t1", &j, time::now() + Duration::hours(1));
        store.store_trigger(&t, false).await.unwrap();

        let paused = store
            .pause_triggers(&GroupMatcher::group_equals("g"))
            .await
            .unwrap();
        assert_eq!(paused, vec!["g".to_string()]);
        assert_eq!(
            store.get_trigger_state(&t.key).await.unwrap(),
            Some(TriggerState::Paused)
        );
        // triggers stored into a paused group start paused
        let t2 = repeating("t2", &j, time::now() + Duration::hours(1));
        store.store_trigger(&t2, false).await.unwrap();
        assert_eq!(
            store.get_trigger_state(&t2.key).await.unwrap(),
            Some(TriggerState::Paused)
        );

        store
            .resume_triggers(&GroupMatcher::group_equals("g"))
            .await
            .unwrap();
        assert_eq!(
            store.get_trigger_state(&t.key).await.unwrap(),
            Some(TriggerState::Waiting)
        );
        assert!(store.get_paused_trigger_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_all_and_resume_all() {
        let store = MemoryJobStore::new();
        let j = job("j1");
        store.store_job(&j, false).await.unwrap();
        let t = repeating("t1", &j, time::now() + Duration::hours(1));
        store.store_trigger(&t, false).await.unwrap();
        store.pause_all().await.unwrap();
        assert!(
            store
                .get_paused_trigger_groups()
                .await
                .unwrap()
                .contains(&ALL_GROUPS_PAUSED.to_string())
        );
        assert_eq!(
            store.get_trigger_state(&t.key).await.unwrap(),
            Some(TriggerState::Paused)
        );
        store.resume_all().await.unwrap();
        assert_eq!(
            store.get_trigger_state(&t.key).await.unwrap(),
            Some(TriggerState::Waiting)
        );
    }

    #[tokio::test]
    async fn test_calendar_update_replans_referencing_triggers() {
        let store = MemoryJobStore::new();
        let j = job("j1");
        store.store_job(&j, false).await.unwrap();
        let base = Utc.with_ymd_and_hms(2030, 7, 12, 12, 0, 0).unwrap(); // Friday
        let mut t = TriggerBuilder::new()
            .with_identity("t1", "g")
            .for_job(j.key.clone())
            .start_at(base)
            .modified_by_calendar("workdays")
            .with_schedule(
                SimpleScheduleBuilder::new()
                    .with_interval_hours(24)
                    .repeat_forever()
                    .build(),
            )
            .build();
        let all_days = Calendar::new(CalendarDetail::Weekly { excluded_days: vec![] });
        store
            .store_calendar("workdays", &all_days, false, false)
            .await
            .unwrap();
        t.compute_first_fire_time(Some(&all_days));
        store.store_trigger(&t, false).await.unwrap();

        // now exclude weekends and require every referencing trigger to obey
        let weekends_off = Calendar::new(CalendarDetail::Weekly {
            excluded_days: vec![chrono::Weekday::Sat, chrono::Weekday::Sun],
        });
        store
            .store_calendar("workdays", &weekends_off, true, true)
            .await
            .unwrap();
        let stored = store.retrieve_trigger(&t.key).await.unwrap().unwrap();
        let next = stored.next_fire_time.unwrap();
        assert!(weekends_off.is_time_included(next));
    }

    #[tokio::test]
    async fn test_remove_calendar_in_use_fails() {
        let store = MemoryJobStore::new();
        let j = job("j1");
        store.store_job(&j, false).await.unwrap();
        let cal = Calendar::new(CalendarDetail::Weekly { excluded_days: vec![] });
        store.store_calendar("cal", &cal, false, false).await.unwrap();
        let mut t = repeating("t1", &j, time::now());
        t.calendar_name = Some("cal".to_string());
        store.store_trigger(&t, false).await.unwrap();
        assert!(store.remove_calendar("cal").await.is_err());
        store.remove_trigger(&t.key).await.unwrap();
        assert!(store.remove_calendar("cal").await.unwrap());
    }

    #[tokio::test]
    async fn test_enumeration_operations() {
        let store = MemoryJobStore::new();
        let j1 = job("j1");
        let mut j2 = JobBuilder::new()
            .of_type("examples::Noop")
            .with_identity("j2", "other")
            .build();
        j2.durable = true;
        store.store_job(&j1, false).await.unwrap();
        store.store_job(&j2, false).await.unwrap();
        let t = repeating("t1", &j1, time::now());
        store.store_trigger(&t, false).await.unwrap();

        assert_eq!(
            store.get_job_group_names().await.unwrap(),
            vec!["g".to_string(), "other".to_string()]
        );
        assert_eq!(
            store
                .get_job_keys(&GroupMatcher::group_equals("other"))
                .await
                .unwrap(),
            vec![j2.key.clone()]
        );
        assert_eq!(
            store.get_trigger_group_names().await.unwrap(),
            vec!["g".to_string()]
        );
        assert_eq!(
            store.get_triggers_for_job(&j1.key).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_clean_completed_triggers() {
        let store = MemoryJobStore::new();
        let j = job("j1");
        store.store_job(&j, false).await.unwrap();
        let now = time::now();
        let mut t = TriggerBuilder::new()
            .with_identity("once", "g")
            .for_job(j.key.clone())
            .start_at(now - Duration::seconds(1))
            .build();
        t.compute_first_fire_time(None);
        store.store_trigger(&t, false).await.unwrap();

        let acquired = store
            .acquire_next_triggers(time::to_millis(now) + 1000, 1, 0)
            .await
            .unwrap();
        let results = store.triggers_fired(&acquired).await.unwrap();
        let bundle = match &results[0] {
            TriggerFiredResult::Fired(b) => b.clone(),
            _ => panic!("expected fired"),
        };
        // one-shot: no next fire, the trigger completes
        assert_eq!(bundle.next_fire_time, None);
        store
            .triggered_job_complete(
                &bundle.trigger,
                &bundle.job,
                CompletedExecutionInstruction::NoInstruction,
            )
            .await
            .unwrap();
        assert_eq!(
            store.get_trigger_state(&t.key).await.unwrap(),
            Some(TriggerState::Complete)
        );
        assert_eq!(store.clean_completed_triggers().await.unwrap(), 1);
        assert!(!store.trigger_exists(&t.key).await.unwrap());
        assert!(!store.job_exists(&j.key).await.unwrap());
    }
}
