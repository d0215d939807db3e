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

use config::{meta::trigger::Trigger, utils::time};
use infra::job_store::{CompletedExecutionInstruction, TriggerFiredResult};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use super::{SchedulerInner, exec};

/// How far before its fire time an acquired trigger is released to the
/// workers, covering dispatch latency.
const FIRE_AHEAD_MS: i64 = 2;

/// One dedicated planning loop per scheduler instance: acquire a batch,
/// sleep until the first fire time (preempted only by an earlier-trigger
/// signal), fire, dispatch to the worker pool.
pub(crate) async fn run(inner: Arc<SchedulerInner>) {
    log::info!("[SCHEDULER] scheduling loop started");
    'main: loop {
        if inner.is_shutdown() {
            break;
        }
        if inner.is_standby() {
            tokio::select! {
                _ = inner.signaler.notified() => {}
                _ = sleep(Duration::from_secs(1)) => {}
            }
            continue;
        }

        let available = inner.pool.block_for_available_threads().await;
        if available == 0 || inner.is_shutdown() {
            break;
        }

        let cfg = config::get_config();
        let idle_wait = cfg.scheduler.idle_wait_time;
        let max_batch = available.min(cfg.scheduler.batch_trigger_acquisition_max_count);
        let time_window = cfg.scheduler.batch_trigger_acquisition_fire_ahead_time_window;
        let no_later_than = time::now_millis() + idle_wait;

        let triggers = match inner
            .store
            .acquire_next_triggers(no_later_than, max_batch, time_window)
            .await
        {
            Ok(triggers) => triggers,
            Err(e) => {
                log::error!("[SCHEDULER] acquiring triggers error: {e}");
                inner
                    .listeners
                    .scheduler_error(&format!("acquiring triggers error: {e}"))
                    .await;
                // the store is unreachable; hold off until it recovers
                sleep(Duration::from_millis(
                    cfg.job_store.db_failure_retry_interval.max(1000) as u64,
                ))
                .await;
                continue;
            }
        };

        if triggers.is_empty() {
            inner.signaler.take_candidate();
            tokio::select! {
                _ = inner.signaler.notified() => {}
                _ = sleep(Duration::from_millis(idle_wait.max(1) as u64)) => {}
            }
            continue;
        }

        let first_fire = triggers
            .iter()
            .filter_map(|t| t.next_fire_time)
            .map(time::to_millis)
            .min()
            .unwrap_or_else(time::now_millis);

        // wait for the fire time, abandoning the batch only when something
        // earlier shows up or the scheduler stops
        loop {
            if inner.is_shutdown() {
                release_all(&inner, &triggers).await;
                break 'main;
            }
            let wait = first_fire - time::now_millis() - FIRE_AHEAD_MS;
            if wait <= 0 {
                break;
            }
            tokio::select! {
                _ = sleep(Duration::from_millis(wait as u64)) => {}
                _ = inner.signaler.notified() => {
                    if let Some(candidate) = inner.signaler.take_candidate()
                        && candidate < first_fire - FIRE_AHEAD_MS
                    {
                        release_all(&inner, &triggers).await;
                        continue 'main;
                    }
                }
            }
        }

        let results = match inner.store.triggers_fired(&triggers).await {
            Ok(results) => results,
            Err(e) => {
                log::error!("[SCHEDULER] firing triggers error: {e}");
                release_all(&inner, &triggers).await;
                continue;
            }
        };

        for result in results {
            match result {
                TriggerFiredResult::Fired(bundle) => {
                    let job = match inner.job_factory().new_job(&bundle.job) {
                        Ok(job) => job,
                        Err(e) => {
                            log::error!(
                                "[SCHEDULER] instantiating job {} error: {e}",
                                bundle.job.key
                            );
                            if let Err(e) = inner
                                .store
                                .triggered_job_complete(
                                    &bundle.trigger,
                                    &bundle.job,
                                    CompletedExecutionInstruction::SetAllJobTriggersError,
                                )
                                .await
                            {
                                log::error!(
                                    "[SCHEDULER] completing unbuildable job {} error: {e}",
                                    bundle.job.key
                                );
                            }
                            continue;
                        }
                    };
                    let entry_id = bundle.trigger.fired_entry_id.clone().unwrap_or_default();
                    let cancellation = CancellationToken::new();
                    inner.register_executing(
                        &entry_id,
                        bundle.job.key.clone(),
                        bundle.trigger.key.clone(),
                        bundle.fire_time,
                        cancellation.clone(),
                    );
                    let shell_inner = inner.clone();
                    let dispatched = inner.pool.run_in_thread(async move {
                        exec::run_job_shell(shell_inner, *bundle, job, cancellation).await;
                    });
                    if !dispatched {
                        inner.unregister_executing(&entry_id);
                        break 'main;
                    }
                }
                TriggerFiredResult::Skipped {
                    trigger_key,
                    reason,
                } => {
                    log::debug!("[SCHEDULER] trigger {trigger_key} skipped: {reason}");
                    if let Some(trigger) = triggers.iter().find(|t| t.key == trigger_key) {
                        release(&inner, trigger).await;
                    }
                }
            }
        }
    }
    log::info!("[SCHEDULER] scheduling loop exited");
}

async fn release(inner: &Arc<SchedulerInner>, trigger: &Trigger) {
    if let Err(e) = inner.store.release_acquired_trigger(trigger).await {
        log::error!("[SCHEDULER] releasing trigger {} error: {e}", trigger.key);
    }
}

async fn release_all(inner: &Arc<SchedulerInner>, triggers: &[Trigger]) {
    for trigger in triggers {
        release(inner, trigger).await;
    }
}
