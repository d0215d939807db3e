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
use chrono::{DateTime, Utc};
use config::{
    meta::{
        job::{JobDataMap, JobDetail},
        trigger::Trigger,
    },
    utils::{json, time},
};
use hashbrown::HashMap;
use infra::{
    errors::{Error, Result},
    job_store::{CompletedExecutionInstruction, TriggerFiredBundle},
};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::SchedulerInner;

/// Raised by user jobs. The flags steer what happens to the firing trigger.
#[derive(Debug, Clone, Default, thiserror::Error)]
#[error("{message}")]
pub struct JobExecutionError {
    pub message: String,
    /// Re-enter the execution shell for the same trigger immediately.
    pub refire_immediately: bool,
    /// Remove the trigger that fired this execution.
    pub unschedule_firing_trigger: bool,
    /// Put every trigger of this job into the error state.
    pub unschedule_all_triggers: bool,
}

impl JobExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_refire_immediately(mut self) -> Self {
        self.refire_immediately = true;
        self
    }

    pub fn with_unschedule_firing_trigger(mut self) -> Self {
        self.unschedule_firing_trigger = true;
        self
    }

    pub fn with_unschedule_all_triggers(mut self) -> Self {
        self.unschedule_all_triggers = true;
        self
    }
}

/// User code invoked when a trigger fires. Long-running jobs should observe
/// `ctx.cancellation_token()` to support `interrupt` and aborted shutdown.
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(
        &self,
        ctx: &mut JobExecutionContext,
    ) -> std::result::Result<(), JobExecutionError>;
}

/// Maps a job-type descriptor to an executable instance.
pub trait JobFactory: Send + Sync {
    fn new_job(&self, detail: &JobDetail) -> Result<Arc<dyn Job>>;
}

type JobConstructor = Arc<dyn Fn(&JobDetail) -> Arc<dyn Job> + Send + Sync>;

/// Default factory: a registry of constructors keyed by job-type descriptor.
#[derive(Default)]
pub struct RegistryJobFactory {
    registry: RwLock<HashMap<String, JobConstructor>>,
}

impl RegistryJobFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, job_type: &str, constructor: F)
    where
        F: Fn(&JobDetail) -> Arc<dyn Job> + Send + Sync + 'static,
    {
        self.registry
            .write()
            .insert(job_type.to_string(), Arc::new(constructor));
    }
}

impl JobFactory for RegistryJobFactory {
    fn new_job(&self, detail: &JobDetail) -> Result<Arc<dyn Job>> {
        match self.registry.read().get(&detail.job_type) {
            Some(ctor) => Ok(ctor(detail)),
            None => Err(Error::SchedulerError(format!(
                "no job registered for type {:?}",
                detail.job_type
            ))),
        }
    }
}

/// Everything one firing exposes to the job and the listeners. The job data
/// map under `job_detail` is a snapshot unless the job disallows concurrent
/// execution; mutations are written back only when the job detail carries
/// `persist_job_data_after_execution`.
pub struct JobExecutionContext {
    pub scheduler_instance_id: String,
    pub trigger: Trigger,
    pub job_detail: JobDetail,
    /// Trigger data overlaid on job data.
    pub merged_data: JobDataMap,
    pub recovering: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub prev_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub refire_count: u32,
    pub job_run_time: Option<chrono::Duration>,
    pub result: Option<json::Value>,
    cancellation: CancellationToken,
}

impl JobExecutionContext {
    pub(crate) fn from_bundle(
        instance_id: &str,
        bundle: TriggerFiredBundle,
        cancellation: CancellationToken,
    ) -> Self {
        let mut merged_data = bundle.job.job_data.clone();
        merged_data.merge(&bundle.trigger.job_data);
        Self {
            scheduler_instance_id: instance_id.to_string(),
            merged_data,
            recovering: bundle.recovering,
            fire_time: bundle.fire_time,
            scheduled_fire_time: bundle.scheduled_fire_time,
            prev_fire_time: bundle.prev_fire_time,
            next_fire_time: bundle.next_fire_time,
            trigger: bundle.trigger,
            job_detail: bundle.job,
            refire_count: 0,
            job_run_time: None,
            result: None,
            cancellation,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn is_interrupt_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Runs one firing end to end: veto check, listener ordering, execution,
/// refire handling, data persistence, store completion.
pub(crate) async fn run_job_shell(
    inner: Arc<SchedulerInner>,
    bundle: TriggerFiredBundle,
    job: Arc<dyn Job>,
    cancellation: CancellationToken,
) {
    let entry_id = bundle.trigger.fired_entry_id.clone().unwrap_or_default();
    let mut ctx =
        JobExecutionContext::from_bundle(&inner.instance_id, bundle, cancellation.clone());

    if inner.listeners.trigger_fired(&ctx).await {
        log::debug!("[SCHEDULER] execution of {} vetoed", ctx.trigger.key);
        if let Err(e) = inner
            .store
            .triggered_job_complete(
                &ctx.trigger,
                &ctx.job_detail,
                CompletedExecutionInstruction::SetTriggerComplete,
            )
            .await
        {
            log::error!("[SCHEDULER] completing vetoed trigger {} error: {e}", ctx.trigger.key);
        }
        inner
            .listeners
            .trigger_complete(&ctx, CompletedExecutionInstruction::SetTriggerComplete)
            .await;
        inner.unregister_executing(&entry_id);
        return;
    }

    let mut instruction;
    loop {
        inner.listeners.job_to_be_executed(&ctx).await;
        let started = time::now();
        let result = job.execute(&mut ctx).await;
        ctx.job_run_time = Some(time::now() - started);

        instruction = match &result {
            Ok(()) => CompletedExecutionInstruction::NoInstruction,
            Err(e) if e.unschedule_all_triggers => {
                CompletedExecutionInstruction::SetAllJobTriggersError
            }
            Err(e) if e.unschedule_firing_trigger => CompletedExecutionInstruction::DeleteTrigger,
            Err(e) => {
                log::error!("[SCHEDULER] job {} failed: {e}", ctx.job_detail.key);
                CompletedExecutionInstruction::NoInstruction
            }
        };

        // mutated data is committed before job_was_executed observers run
        if ctx.job_detail.persist_job_data_after_execution
            && let Err(e) = inner.store.update_job_data(&ctx.job_detail).await
        {
            log::error!("[SCHEDULER] persisting data of job {} error: {e}", ctx.job_detail.key);
        }
        inner
            .listeners
            .job_was_executed(&ctx, result.as_ref().err())
            .await;

        if let Err(e) = &result
            && e.refire_immediately
            && !cancellation.is_cancelled()
        {
            ctx.refire_count += 1;
            log::warn!(
                "[SCHEDULER] refiring trigger {} immediately (attempt {})",
                ctx.trigger.key,
                ctx.refire_count
            );
            continue;
        }
        break;
    }

    if let Err(e) = inner
        .store
        .triggered_job_complete(&ctx.trigger, &ctx.job_detail, instruction)
        .await
    {
        log::error!("[SCHEDULER] completing trigger {} error: {e}", ctx.trigger.key);
    }
    inner.listeners.trigger_complete(&ctx, instruction).await;
    inner.unregister_executing(&entry_id);
    // wake the planner; the next fire of this trigger may be earlier than
    // what it is currently sleeping towards
    inner
        .signaler
        .signal_scheduling_change(ctx.next_fire_time.map(time::to_millis));
}
