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
use config::meta::{key::TriggerKey, trigger::Trigger};
use infra::job_store::CompletedExecutionInstruction;
use parking_lot::RwLock;

use super::exec::{JobExecutionContext, JobExecutionError};

/// Scheduler lifecycle events. All methods default to no-ops so listeners
/// implement only what they care about.
#[async_trait]
pub trait SchedulerListener: Send + Sync {
    async fn scheduler_started(&self) {}
    async fn scheduler_in_standby_mode(&self) {}
    async fn scheduler_shutting_down(&self) {}
    async fn scheduler_shutdown(&self) {}
    async fn job_scheduled(&self, _trigger: &Trigger) {}
    async fn job_unscheduled(&self, _key: &TriggerKey) {}
    async fn trigger_paused(&self, _key: &TriggerKey) {}
    async fn trigger_resumed(&self, _key: &TriggerKey) {}
    async fn scheduler_error(&self, _msg: &str) {}
}

#[async_trait]
pub trait JobListener: Send + Sync {
    fn name(&self) -> &str;
    async fn job_to_be_executed(&self, _ctx: &JobExecutionContext) {}
    async fn job_was_executed(
        &self,
        _ctx: &JobExecutionContext,
        _error: Option<&JobExecutionError>,
    ) {
    }
}

#[async_trait]
pub trait TriggerListener: Send + Sync {
    fn name(&self) -> &str;
    /// Returning true vetoes the execution; the trigger completes without
    /// the job running.
    async fn trigger_fired(&self, _ctx: &JobExecutionContext) -> bool {
        false
    }
    async fn trigger_complete(
        &self,
        _ctx: &JobExecutionContext,
        _instruction: CompletedExecutionInstruction,
    ) {
    }
}

/// Fan-out of lifecycle events, in registration order.
#[derive(Default)]
pub struct ListenerManager {
    scheduler: RwLock<Vec<Arc<dyn SchedulerListener>>>,
    job: RwLock<Vec<Arc<dyn JobListener>>>,
    trigger: RwLock<Vec<Arc<dyn TriggerListener>>>,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
        self.scheduler.write().push(listener);
    }

    pub fn add_job_listener(&self, listener: Arc<dyn JobListener>) {
        self.job.write().push(listener);
    }

    pub fn add_trigger_listener(&self, listener: Arc<dyn TriggerListener>) {
        self.trigger.write().push(listener);
    }

    pub fn remove_job_listener(&self, name: &str) {
        self.job.write().retain(|l| l.name() != name);
    }

    pub fn remove_trigger_listener(&self, name: &str) {
        self.trigger.write().retain(|l| l.name() != name);
    }

    fn scheduler_listeners(&self) -> Vec<Arc<dyn SchedulerListener>> {
        self.scheduler.read().clone()
    }

    fn job_listeners(&self) -> Vec<Arc<dyn JobListener>> {
        self.job.read().clone()
    }

    fn trigger_listeners(&self) -> Vec<Arc<dyn TriggerListener>> {
        self.trigger.read().clone()
    }

    /// Invokes every trigger listener; the execution is vetoed when any of
    /// them votes to veto, but all of them still observe the firing.
    pub(crate) async fn trigger_fired(&self, ctx: &JobExecutionContext) -> bool {
        let mut veto = false;
        for listener in self.trigger_listeners() {
            if listener.trigger_fired(ctx).await {
                veto = true;
            }
        }
        veto
    }

    pub(crate) async fn trigger_complete(
        &self,
        ctx: &JobExecutionContext,
        instruction: CompletedExecutionInstruction,
    ) {
        for listener in self.trigger_listeners() {
            listener.trigger_complete(ctx, instruction).await;
        }
    }

    pub(crate) async fn job_to_be_executed(&self, ctx: &JobExecutionContext) {
        for listener in self.job_listeners() {
            listener.job_to_be_executed(ctx).await;
        }
    }

    pub(crate) async fn job_was_executed(
        &self,
        ctx: &JobExecutionContext,
        error: Option<&JobExecutionError>,
    ) {
        for listener in self.job_listeners() {
            listener.job_was_executed(ctx, error).await;
        }
    }

    pub(crate) async fn scheduler_started(&self) {
        for listener in self.scheduler_listeners() {
            listener.scheduler_started().await;
        }
    }

    pub(crate) async fn scheduler_in_standby_mode(&self) {
        for listener in self.scheduler_listeners() {
            listener.scheduler_in_standby_mode().await;
        }
    }

    pub(crate) async fn scheduler_shutting_down(&self) {
        for listener in self.scheduler_listeners() {
            listener.scheduler_shutting_down().await;
        }
    }

    pub(crate) async fn scheduler_shutdown(&self) {
        for listener in self.scheduler_listeners() {
            listener.scheduler_shutdown().await;
        }
    }

    pub(crate) async fn job_scheduled(&self, trigger: &Trigger) {
        for listener in self.scheduler_listeners() {
            listener.job_scheduled(trigger).await;
        }
    }

    pub(crate) async fn job_unscheduled(&self, key: &TriggerKey) {
        for listener in self.scheduler_listeners() {
            listener.job_unscheduled(key).await;
        }
    }

    pub(crate) async fn trigger_paused(&self, key: &TriggerKey) {
        for listener in self.scheduler_listeners() {
            listener.trigger_paused(key).await;
        }
    }

    pub(crate) async fn trigger_resumed(&self, key: &TriggerKey) {
        for listener in self.scheduler_listeners() {
            listener.trigger_resumed(key).await;
        }
    }

    pub(crate) async fn scheduler_error(&self, msg: &str) {
        for listener in self.scheduler_listeners() {
            listener.scheduler_error(msg).await;
        }
    }
}
