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

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use config::meta::{
        job::{JobBuilder, JobDetail},
        key::JobKey,
        trigger::{TriggerBuilder, TriggerState, simple::SimpleScheduleBuilder},
    };
    use infra::job_store::memory::MemoryJobStore;
    use quartzite::{
        Job, JobExecutionContext, JobExecutionError, Scheduler,
        scheduler::listener::TriggerListener,
    };
    use tokio::time::{Duration, sleep};

    struct CountingJob {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn execute(
            &self,
            _ctx: &mut JobExecutionContext,
        ) -> Result<(), JobExecutionError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SlowJob {
        running: Arc<AtomicUsize>,
        overlapped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Job for SlowJob {
        async fn execute(
            &self,
            _ctx: &mut JobExecutionContext,
        ) -> Result<(), JobExecutionError> {
            if self.running.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            sleep(Duration::from_millis(120)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct DataBumpJob;

    #[async_trait]
    impl Job for DataBumpJob {
        async fn execute(
            &self,
            ctx: &mut JobExecutionContext,
        ) -> Result<(), JobExecutionError> {
            let n = ctx.job_detail.job_data.get_i64("count").unwrap_or(0);
            ctx.job_detail.job_data.put("count", n + 1);
            Ok(())
        }
    }

    struct VetoAll {
        vetoed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TriggerListener for VetoAll {
        fn name(&self) -> &str {
            "veto-all"
        }

        async fn trigger_fired(&self, _ctx: &JobExecutionContext) -> bool {
            self.vetoed.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn scheduler_on_memory() -> Scheduler {
        Scheduler::with_store(Arc::new(MemoryJobStore::new()))
    }

    fn register_counting_job(scheduler: &Scheduler, count: &Arc<AtomicUsize>) {
        let count = count.clone();
        scheduler.register_job_type("tests::CountingJob", move |_detail: &JobDetail| {
            Arc::new(CountingJob {
                count: count.clone(),
            }) as Arc<dyn Job>
        });
    }

    #[tokio::test]
    async fn test_repeating_trigger_fires_exact_count() {
        let scheduler = scheduler_on_memory();
        let count = Arc::new(AtomicUsize::new(0));
        register_counting_job(&scheduler, &count);

        let job = JobBuilder::new()
            .of_type("tests::CountingJob")
            .with_identity("counting", "it")
            .build();
        let trigger = TriggerBuilder::new()
            .with_identity("counting-trigger", "it")
            .for_job(job.key.clone())
            .start_now()
            .with_schedule(
                SimpleScheduleBuilder::new()
                    .with_interval_millis(200)
                    .with_repeat_count(3)
                    .build(),
            )
            .build();

        scheduler.start().await;
        scheduler.schedule_job(&job, trigger).await.unwrap();
        sleep(Duration::from_millis(1500)).await;
        scheduler.shutdown(true).await;

        // repeat_count + 1 firings, none dropped, none doubled
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_concurrent_disallowed_never_overlaps() {
        let scheduler = scheduler_on_memory();
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        {
            let running = running.clone();
            let overlapped = overlapped.clone();
            scheduler.register_job_type("tests::SlowJob", move |_detail: &JobDetail| {
                Arc::new(SlowJob {
                    running: running.clone(),
                    overlapped: overlapped.clone(),
                }) as Arc<dyn Job>
            });
        }

        let job = JobBuilder::new()
            .of_type("tests::SlowJob")
            .with_identity("serial", "it")
            .disallow_concurrent_execution()
            .build();
        let t1 = TriggerBuilder::new()
            .with_identity("serial-a", "it")
            .for_job(job.key.clone())
            .start_now()
            .with_schedule(
                SimpleScheduleBuilder::new()
                    .with_interval_millis(150)
                    .with_repeat_count(3)
                    .build(),
            )
            .build();
        let t2 = TriggerBuilder::new()
            .with_identity("serial-b", "it")
            .for_job(job.key.clone())
            .start_now()
            .with_schedule(
                SimpleScheduleBuilder::new()
                    .with_interval_millis(150)
                    .with_repeat_count(3)
                    .build(),
            )
            .build();

        scheduler.start().await;
        scheduler.schedule_job(&job, t1).await.unwrap();
        scheduler.schedule_trigger(t2).await.unwrap();
        sleep(Duration::from_millis(2500)).await;
        scheduler.shutdown(true).await;

        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_vetoed_execution_completes_without_running() {
        let scheduler = scheduler_on_memory();
        let count = Arc::new(AtomicUsize::new(0));
        register_counting_job(&scheduler, &count);
        let vetoed = Arc::new(AtomicUsize::new(0));
        scheduler.add_trigger_listener(Arc::new(VetoAll {
            vetoed: vetoed.clone(),
        }));

        let job = JobBuilder::new()
            .of_type("tests::CountingJob")
            .with_identity("vetoed", "it")
            .build();
        let trigger = TriggerBuilder::new()
            .with_identity("vetoed-trigger", "it")
            .for_job(job.key.clone())
            .start_now()
            .build();

        scheduler.start().await;
        scheduler.schedule_job(&job, trigger).await.unwrap();
        sleep(Duration::from_millis(600)).await;

        assert_eq!(vetoed.load(Ordering::SeqCst), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        let state = scheduler
            .get_trigger_state(&config::meta::key::TriggerKey::new("vetoed-trigger", "it"))
            .await
            .unwrap();
        assert_eq!(state, Some(TriggerState::Complete));
        scheduler.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_job_data_persisted_across_firings() {
        let scheduler = scheduler_on_memory();
        scheduler.register_job_type("tests::DataBumpJob", |_detail: &JobDetail| {
            Arc::new(DataBumpJob) as Arc<dyn Job>
        });

        let job = JobBuilder::new()
            .of_type("tests::DataBumpJob")
            .with_identity("bump", "it")
            .persist_job_data_after_execution()
            .using_job_data("count", 0)
            .build();
        let trigger = TriggerBuilder::new()
            .with_identity("bump-trigger", "it")
            .for_job(job.key.clone())
            .start_now()
            .with_schedule(
                SimpleScheduleBuilder::new()
                    .with_interval_millis(200)
                    .with_repeat_count(2)
                    .build(),
            )
            .build();

        scheduler.start().await;
        scheduler.schedule_job(&job, trigger).await.unwrap();
        sleep(Duration::from_millis(1200)).await;
        scheduler.shutdown(true).await;

        let stored = scheduler
            .get_job(&JobKey::new("bump", "it"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.job_data.get_i64("count"), Some(3));
    }

    #[tokio::test]
    async fn test_two_instances_share_store_without_double_firing() {
        // two facades over one store: every scheduled instant fires on
        // exactly one of them
        let store = Arc::new(MemoryJobStore::new());
        let a = Scheduler::with_store(store.clone());
        let b = Scheduler::with_store(store.clone());
        let count = Arc::new(AtomicUsize::new(0));
        register_counting_job(&a, &count);
        register_counting_job(&b, &count);

        let job = JobBuilder::new()
            .of_type("tests::CountingJob")
            .with_identity("shared", "it")
            .build();
        let trigger = TriggerBuilder::new()
            .with_identity("shared-trigger", "it")
            .for_job(job.key.clone())
            .start_now()
            .with_schedule(
                SimpleScheduleBuilder::new()
                    .with_interval_millis(100)
                    .with_repeat_count(5)
                    .build(),
            )
            .build();

        a.start().await;
        b.start().await;
        a.schedule_job(&job, trigger).await.unwrap();
        sleep(Duration::from_millis(1500)).await;
        a.shutdown(true).await;
        b.shutdown(true).await;

        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_unschedule_stops_firing() {
        let scheduler = scheduler_on_memory();
        let count = Arc::new(AtomicUsize::new(0));
        register_counting_job(&scheduler, &count);

        let job = JobBuilder::new()
            .of_type("tests::CountingJob")
            .with_identity("stopme", "it")
            .build();
        let trigger = TriggerBuilder::new()
            .with_identity("stopme-trigger", "it")
            .for_job(job.key.clone())
            .start_at(config::utils::time::now() + chrono::Duration::milliseconds(400))
            .with_schedule(
                SimpleScheduleBuilder::new()
                    .with_interval_millis(100)
                    .repeat_forever()
                    .build(),
            )
            .build();

        scheduler.start().await;
        scheduler.schedule_job(&job, trigger).await.unwrap();
        let removed = scheduler
            .unschedule_job(&config::meta::key::TriggerKey::new("stopme-trigger", "it"))
            .await
            .unwrap();
        assert!(removed);
        sleep(Duration::from_millis(800)).await;
        scheduler.shutdown(true).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_completion_instruction_delete_trigger() {
        let scheduler = scheduler_on_memory();
        struct FailingJob;
        #[async_trait]
        impl Job for FailingJob {
            async fn execute(
                &self,
                _ctx: &mut JobExecutionContext,
            ) -> Result<(), JobExecutionError> {
                Err(JobExecutionError::new("broken input").with_unschedule_firing_trigger())
            }
        }
        scheduler.register_job_type("tests::FailingJob", |_detail: &JobDetail| {
            Arc::new(FailingJob) as Arc<dyn Job>
        });

        let job = JobBuilder::new()
            .of_type("tests::FailingJob")
            .with_identity("failing", "it")
            .store_durably()
            .build();
        let trigger = TriggerBuilder::new()
            .with_identity("failing-trigger", "it")
            .for_job(job.key.clone())
            .start_now()
            .with_schedule(
                SimpleScheduleBuilder::new()
                    .with_interval_millis(100)
                    .repeat_forever()
                    .build(),
            )
            .build();

        scheduler.start().await;
        scheduler.schedule_job(&job, trigger).await.unwrap();
        sleep(Duration::from_millis(700)).await;
        scheduler.shutdown(true).await;

        // the failing execution unscheduled its own trigger
        assert!(
            !scheduler
                .check_trigger_exists(&config::meta::key::TriggerKey::new("failing-trigger", "it"))
                .await
                .unwrap()
        );
        // the durable job survives
        assert!(scheduler.check_job_exists(&job.key).await.unwrap());
    }
}
