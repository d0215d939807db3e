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

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use chrono::{DateTime, Utc};
use config::{
    ider,
    meta::{
        calendar::Calendar,
        job::{JobDataMap, JobDetail},
        key::{GroupMatcher, JobKey, TriggerKey},
        trigger::{Trigger, TriggerBuilder, TriggerState},
    },
    utils::time,
};
use hashbrown::HashMap;
use infra::{
    errors::{Error, Result},
    job_store::{JobStore, default_store},
};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub mod exec;
pub mod listener;
pub mod main_loop;
pub mod pool;

use exec::{JobFactory, RegistryJobFactory};
use listener::ListenerManager;
use pool::WorkerPool;

const STATE_INIT: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_STANDBY: u8 = 2;
const STATE_SHUTDOWN: u8 = 3;

/// Group used by `trigger_job` one-shots.
const MANUAL_TRIGGERS_GROUP: &str = "MANUAL_TRIGGER";

/// Wakes the scheduler loop when something scheduled an earlier fire than
/// the one it is currently sleeping towards.
#[derive(Default)]
pub struct SchedulerSignaler {
    notify: Notify,
    earliest_candidate: Mutex<Option<i64>>,
}

impl SchedulerSignaler {
    pub fn signal_scheduling_change(&self, candidate_ms: Option<i64>) {
        if let Some(candidate) = candidate_ms {
            let mut earliest = self.earliest_candidate.lock();
            *earliest = Some(earliest.map_or(candidate, |e| e.min(candidate)));
        }
        self.notify.notify_one();
    }

    pub(crate) fn take_candidate(&self) -> Option<i64> {
        self.earliest_candidate.lock().take()
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}

pub(crate) struct ExecutingJob {
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub fire_time: DateTime<Utc>,
    pub cancellation: CancellationToken,
}

/// What `get_currently_executing_jobs` reports.
#[derive(Debug, Clone)]
pub struct ExecutingJobInfo {
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub fire_time: DateTime<Utc>,
}

pub(crate) struct SchedulerInner {
    pub instance_name: String,
    pub instance_id: String,
    pub store: Arc<dyn JobStore>,
    pub pool: WorkerPool,
    pub listeners: ListenerManager,
    pub signaler: Arc<SchedulerSignaler>,
    registry: Arc<RegistryJobFactory>,
    job_factory: RwLock<Arc<dyn JobFactory>>,
    executing: Mutex<HashMap<String, ExecutingJob>>,
    state: AtomicU8,
}

impl SchedulerInner {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_SHUTDOWN
    }

    pub(crate) fn is_standby(&self) -> bool {
        self.state.load(Ordering::SeqCst) != STATE_STARTED
    }

    pub(crate) fn job_factory(&self) -> Arc<dyn JobFactory> {
        self.job_factory.read().clone()
    }

    pub(crate) fn register_executing(
        &self,
        entry_id: &str,
        job_key: JobKey,
        trigger_key: TriggerKey,
        fire_time: DateTime<Utc>,
        cancellation: CancellationToken,
    ) {
        self.executing.lock().insert(
            entry_id.to_string(),
            ExecutingJob {
                job_key,
                trigger_key,
                fire_time,
                cancellation,
            },
        );
    }

    pub(crate) fn unregister_executing(&self, entry_id: &str) {
        self.executing.lock().remove(entry_id);
    }
}

/// The engine facade: one instance per scheduler, safe to clone and share.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Builds a scheduler on the store selected by configuration.
    pub fn new() -> Self {
        Self::with_store(default_store())
    }

    /// Builds a scheduler on an explicit store; tests hand in a memory
    /// store, embedders may share one store across facades.
    pub fn with_store(store: Arc<dyn JobStore>) -> Self {
        let cfg = config::get_config();
        let registry = Arc::new(RegistryJobFactory::new());
        Self {
            inner: Arc::new(SchedulerInner {
                instance_name: cfg.scheduler.instance_name.clone(),
                instance_id: ider::instance_id().to_string(),
                store,
                pool: WorkerPool::new(cfg.thread_pool.thread_count),
                listeners: ListenerManager::new(),
                signaler: Arc::new(SchedulerSignaler::default()),
                job_factory: RwLock::new(registry.clone()),
                registry,
                executing: Mutex::new(HashMap::new()),
                state: AtomicU8::new(STATE_INIT),
            }),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.inner.instance_name
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.inner.store.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_STARTED
    }

    pub fn set_job_factory(&self, factory: Arc<dyn JobFactory>) {
        *self.inner.job_factory.write() = factory;
    }

    /// Registers a constructor on the built-in registry factory. Has no
    /// effect on dispatch after `set_job_factory` replaced the factory.
    pub fn register_job_type<F>(&self, job_type: &str, constructor: F)
    where
        F: Fn(&JobDetail) -> Arc<dyn exec::Job> + Send + Sync + 'static,
    {
        self.inner.registry.register(job_type, constructor);
    }

    pub fn add_scheduler_listener(&self, listener: Arc<dyn listener::SchedulerListener>) {
        self.inner.listeners.add_scheduler_listener(listener);
    }

    pub fn add_job_listener(&self, listener: Arc<dyn listener::JobListener>) {
        self.inner.listeners.add_job_listener(listener);
    }

    pub fn add_trigger_listener(&self, listener: Arc<dyn listener::TriggerListener>) {
        self.inner.listeners.add_trigger_listener(listener);
    }

    /// Starts (or resumes from standby) the scheduling loop.
    pub async fn start(&self) {
        let prev = self.inner.state.swap(STATE_STARTED, Ordering::SeqCst);
        if prev == STATE_INIT {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                main_loop::run(inner).await;
            });
        }
        self.inner.signaler.signal_scheduling_change(None);
        self.inner.listeners.scheduler_started().await;
        repository::bind(self.clone());
        log::info!(
            "[SCHEDULER] {} ({}) started",
            self.inner.instance_name,
            self.inner.instance_id
        );
    }

    /// Pauses acquisition without releasing anything already firing.
    pub async fn standby(&self) {
        self.inner.state.store(STATE_STANDBY, Ordering::SeqCst);
        self.inner.listeners.scheduler_in_standby_mode().await;
        log::info!("[SCHEDULER] {} in standby", self.inner.instance_name);
    }

    /// Stops acquisition and either drains the worker pool or cancels the
    /// executing jobs' tokens.
    pub async fn shutdown(&self, wait_for_jobs_to_complete: bool) {
        self.inner.listeners.scheduler_shutting_down().await;
        self.inner.state.store(STATE_SHUTDOWN, Ordering::SeqCst);
        self.inner.signaler.signal_scheduling_change(None);
        if !wait_for_jobs_to_complete {
            for executing in self.inner.executing.lock().values() {
                executing.cancellation.cancel();
            }
        }
        self.inner.pool.shutdown(wait_for_jobs_to_complete).await;
        self.inner.listeners.scheduler_shutdown().await;
        repository::remove(&self.inner.instance_name);
        log::info!("[SCHEDULER] {} shut down", self.inner.instance_name);
    }

    /// Stores the job and its trigger and returns the first fire time.
    pub async fn schedule_job(
        &self,
        job: &JobDetail,
        mut trigger: Trigger,
    ) -> Result<DateTime<Utc>> {
        if trigger.job_key.name.is_empty() {
            trigger.job_key = job.key.clone();
        }
        if trigger.job_key != job.key {
            return Err(Error::SchedulerError(format!(
                "trigger {} references job {}, not {}",
                trigger.key, trigger.job_key, job.key
            )));
        }
        trigger.validate()?;
        let calendar = self.resolve_calendar(&trigger).await?;
        let Some(first) = trigger.compute_first_fire_time(calendar.as_ref()) else {
            return Err(Error::SchedulerError(format!(
                "trigger {} will never fire",
                trigger.key
            )));
        };
        self.inner.store.store_job_and_trigger(job, &trigger).await?;
        self.inner.listeners.job_scheduled(&trigger).await;
        self.inner
            .signaler
            .signal_scheduling_change(Some(time::to_millis(first)));
        Ok(first)
    }

    /// Schedules an additional trigger for an already-stored job.
    pub async fn schedule_trigger(&self, mut trigger: Trigger) -> Result<DateTime<Utc>> {
        trigger.validate()?;
        let calendar = self.resolve_calendar(&trigger).await?;
        let Some(first) = trigger.compute_first_fire_time(calendar.as_ref()) else {
            return Err(Error::SchedulerError(format!(
                "trigger {} will never fire",
                trigger.key
            )));
        };
        self.inner.store.store_trigger(&trigger, false).await?;
        self.inner.listeners.job_scheduled(&trigger).await;
        self.inner
            .signaler
            .signal_scheduling_change(Some(time::to_millis(first)));
        Ok(first)
    }

    /// Adds (or replaces) a job with no trigger; the job must be durable.
    pub async fn add_job(&self, job: &JobDetail, replace_existing: bool) -> Result<()> {
        if !job.durable {
            return Err(Error::SchedulerError(format!(
                "job {} is not durable and would be orphaned",
                job.key
            )));
        }
        self.inner.store.store_job(job, replace_existing).await
    }

    pub async fn unschedule_job(&self, trigger_key: &TriggerKey) -> Result<bool> {
        let removed = self.inner.store.remove_trigger(trigger_key).await?;
        if removed {
            self.inner.listeners.job_unscheduled(trigger_key).await;
        }
        Ok(removed)
    }

    /// Replaces a trigger, keeping the job linkage; returns the new first
    /// fire time, or None when the old trigger did not exist.
    pub async fn reschedule_job(
        &self,
        trigger_key: &TriggerKey,
        mut new_trigger: Trigger,
    ) -> Result<Option<DateTime<Utc>>> {
        new_trigger.validate()?;
        let calendar = self.resolve_calendar(&new_trigger).await?;
        let Some(first) = new_trigger.compute_first_fire_time(calendar.as_ref()) else {
            return Err(Error::SchedulerError(format!(
                "trigger {} will never fire",
                new_trigger.key
            )));
        };
        if !self
            .inner
            .store
            .replace_trigger(trigger_key, &new_trigger)
            .await?
        {
            return Ok(None);
        }
        self.inner
            .signaler
            .signal_scheduling_change(Some(time::to_millis(first)));
        Ok(Some(first))
    }

    pub async fn delete_job(&self, job_key: &JobKey) -> Result<bool> {
        self.inner.store.remove_job(job_key).await
    }

    /// Fires the job once, now.
    pub async fn trigger_job(&self, job_key: &JobKey, data: Option<JobDataMap>) -> Result<()> {
        if !self.inner.store.job_exists(job_key).await? {
            return Err(Error::SchedulerError(format!("job {job_key} not found")));
        }
        let mut builder = TriggerBuilder::new()
            .with_identity(&ider::generate(), MANUAL_TRIGGERS_GROUP)
            .for_job(job_key.clone())
            .start_now();
        if let Some(data) = data {
            for (k, v) in data.0.iter() {
                builder = builder.using_job_data(k, v.clone());
            }
        }
        let mut trigger = builder.build();
        let first = trigger.compute_first_fire_time(None);
        self.inner.store.store_trigger(&trigger, false).await?;
        self.inner
            .signaler
            .signal_scheduling_change(time::option_to_millis(first));
        Ok(())
    }

    pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        self.inner.store.pause_trigger(key).await?;
        self.inner.listeners.trigger_paused(key).await;
        Ok(())
    }

    pub async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        self.inner.store.pause_triggers(matcher).await
    }

    pub async fn pause_job(&self, key: &JobKey) -> Result<()> {
        self.inner.store.pause_job(key).await
    }

    pub async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        self.inner.store.pause_jobs(matcher).await
    }

    pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        self.inner.store.resume_trigger(key).await?;
        self.inner.listeners.trigger_resumed(key).await;
        self.inner.signaler.signal_scheduling_change(None);
        Ok(())
    }

    pub async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let groups = self.inner.store.resume_triggers(matcher).await?;
        self.inner.signaler.signal_scheduling_change(None);
        Ok(groups)
    }

    pub async fn resume_job(&self, key: &JobKey) -> Result<()> {
        self.inner.store.resume_job(key).await?;
        self.inner.signaler.signal_scheduling_change(None);
        Ok(())
    }

    pub async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let groups = self.inner.store.resume_jobs(matcher).await?;
        self.inner.signaler.signal_scheduling_change(None);
        Ok(groups)
    }

    pub async fn pause_all(&self) -> Result<()> {
        self.inner.store.pause_all().await
    }

    pub async fn resume_all(&self) -> Result<()> {
        self.inner.store.resume_all().await?;
        self.inner.signaler.signal_scheduling_change(None);
        Ok(())
    }

    pub async fn add_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> Result<()> {
        self.inner
            .store
            .store_calendar(name, calendar, replace_existing, update_triggers)
            .await?;
        if update_triggers {
            self.inner.signaler.signal_scheduling_change(None);
        }
        Ok(())
    }

    pub async fn delete_calendar(&self, name: &str) -> Result<bool> {
        self.inner.store.remove_calendar(name).await
    }

    pub async fn get_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        self.inner.store.retrieve_calendar(name).await
    }

    pub async fn get_calendar_names(&self) -> Result<Vec<String>> {
        self.inner.store.get_calendar_names().await
    }

    pub async fn get_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        self.inner.store.retrieve_job(key).await
    }

    pub async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        self.inner.store.retrieve_trigger(key).await
    }

    pub async fn get_trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>> {
        self.inner.store.get_trigger_state(key).await
    }

    pub async fn check_job_exists(&self, key: &JobKey) -> Result<bool> {
        self.inner.store.job_exists(key).await
    }

    pub async fn check_trigger_exists(&self, key: &TriggerKey) -> Result<bool> {
        self.inner.store.trigger_exists(key).await
    }

    pub async fn get_job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>> {
        self.inner.store.get_job_keys(matcher).await
    }

    pub async fn get_trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>> {
        self.inner.store.get_trigger_keys(matcher).await
    }

    pub async fn get_triggers_of_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        self.inner.store.get_triggers_for_job(key).await
    }

    pub fn get_currently_executing_jobs(&self) -> Vec<ExecutingJobInfo> {
        self.inner
            .executing
            .lock()
            .values()
            .map(|e| ExecutingJobInfo {
                job_key: e.job_key.clone(),
                trigger_key: e.trigger_key.clone(),
                fire_time: e.fire_time,
            })
            .collect()
    }

    /// Cancels the tokens of every executing instance of the job on this
    /// node; cross-node interrupt is not supported. Returns true when at
    /// least one execution was signalled.
    pub fn interrupt(&self, job_key: &JobKey) -> bool {
        let mut interrupted = false;
        for executing in self.inner.executing.lock().values() {
            if &executing.job_key == job_key {
                executing.cancellation.cancel();
                interrupted = true;
            }
        }
        interrupted
    }

    async fn resolve_calendar(&self, trigger: &Trigger) -> Result<Option<Calendar>> {
        match &trigger.calendar_name {
            Some(name) => {
                let calendar = self.inner.store.retrieve_calendar(name).await?;
                if calendar.is_none() {
                    return Err(Error::SchedulerError(format!(
                        "trigger {} references missing calendar {name}",
                        trigger.key
                    )));
                }
                Ok(calendar)
            }
            None => Ok(None),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry of running schedulers, keyed by instance name.
pub mod repository {
    use super::*;

    static REPOSITORY: Lazy<RwLock<HashMap<String, Scheduler>>> =
        Lazy::new(|| RwLock::new(HashMap::new()));

    pub fn bind(scheduler: Scheduler) {
        REPOSITORY
            .write()
            .insert(scheduler.instance_name().to_string(), scheduler);
    }

    pub fn lookup(instance_name: &str) -> Option<Scheduler> {
        REPOSITORY.read().get(instance_name).cloned()
    }

    pub fn remove(instance_name: &str) -> Option<Scheduler> {
        REPOSITORY.write().remove(instance_name)
    }

    pub fn all() -> Vec<Scheduler> {
        REPOSITORY.read().values().cloned().collect()
    }

    /// Pokes every registered scheduler's planner, e.g. after a misfire
    /// scan moved fire times around.
    pub fn signal_all(candidate_ms: Option<i64>) {
        for scheduler in all() {
            scheduler
                .inner
                .signaler
                .signal_scheduling_change(candidate_ms);
        }
    }
}
