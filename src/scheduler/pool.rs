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

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::Semaphore;

/// Bounded worker pool. The scheduler loop sizes its acquisition batches
/// from `block_for_available_threads` and hands each firing to
/// `run_in_thread`; a semaphore permit is held for the lifetime of the task.
#[derive(Clone)]
pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Returns the number of currently idle workers, waiting until at least
    /// one exists. Returns 0 only after shutdown.
    pub async fn block_for_available_threads(&self) -> usize {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return 0;
            }
            let available = self.semaphore.available_permits();
            if available > 0 {
                return available;
            }
            match self.semaphore.acquire().await {
                // a worker came back; release and report the fresh count
                Ok(permit) => drop(permit),
                Err(_) => return 0,
            }
        }
    }

    /// Hands a task to an idle worker. Returns false only when the pool has
    /// shut down.
    pub fn run_in_thread<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    let _permit = permit;
                    task.await;
                });
                true
            }
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                // callers size batches from block_for_available_threads, so
                // this is a rare race; queue behind the busy workers
                let semaphore = self.semaphore.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    task.await;
                });
                true
            }
            Err(tokio::sync::TryAcquireError::Closed) => false,
        }
    }

    /// Graceful shutdown waits for every worker to come back; aborted
    /// shutdown just closes the pool and leaves running tasks to observe
    /// their cancellation tokens.
    pub async fn shutdown(&self, wait_for_jobs_to_complete: bool) {
        self.shutdown.store(true, Ordering::SeqCst);
        if wait_for_jobs_to_complete {
            if let Ok(permits) = self.semaphore.acquire_many(self.size as u32).await {
                drop(permits);
            }
        }
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::time::{Duration, sleep};

    use super::*;

    #[tokio::test]
    async fn test_reports_available_workers() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.block_for_available_threads().await, 3);
    }

    #[tokio::test]
    async fn test_blocks_until_worker_free() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        assert!(pool.run_in_thread(async move {
            sleep(Duration::from_millis(50)).await;
            c.fetch_add(1, Ordering::SeqCst);
        }));
        // the single worker is busy; this waits until it finishes
        let available = pool.block_for_available_threads().await;
        assert_eq!(available, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            pool.run_in_thread(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        pool.shutdown(true).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_jobs() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        pool.run_in_thread(async move {
            sleep(Duration::from_millis(40)).await;
            d.store(true, Ordering::SeqCst);
        });
        pool.shutdown(true).await;
        assert!(done.load(Ordering::SeqCst));
        assert!(!pool.run_in_thread(async {}));
        assert_eq!(pool.block_for_available_threads().await, 0);
    }
}
