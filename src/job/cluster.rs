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

use tokio::time;

use crate::scheduler::{Scheduler, repository};

const MAX_RETRIES: u32 = 3;

/// Cluster heartbeat: refreshes this instance's checkin row every interval
/// and takes over the in-flight work of peers that stopped checking in.
pub async fn run(scheduler: Scheduler) -> Result<(), anyhow::Error> {
    let cfg = config::get_config();
    if !cfg.job_store.clustered {
        return Ok(());
    }
    let mut interval = time::interval(time::Duration::from_millis(
        cfg.job_store.cluster_checkin_interval.max(1000) as u64,
    ));
    interval.tick().await; // trigger the first run
    loop {
        interval.tick().await;
        if scheduler.is_shutdown() {
            break;
        }
        let failed = match checkin_with_retry(&scheduler).await {
            Ok(failed) => failed,
            Err(e) => {
                log::error!("[CLUSTER] checkin error: {e}");
                continue;
            }
        };
        if failed.is_empty() {
            continue;
        }
        for instance in &failed {
            log::warn!(
                "[CLUSTER] instance {} missed its checkin, taking over its work",
                instance.instance_name
            );
        }
        match scheduler.store().cluster_recover(&failed).await {
            Ok(()) => {
                // recovered triggers are due immediately
                repository::signal_all(None);
            }
            Err(e) => log::error!("[CLUSTER] recovery error: {e}"),
        }
    }
    Ok(())
}

async fn checkin_with_retry(
    scheduler: &Scheduler,
) -> infra::errors::Result<Vec<infra::job_store::SchedulerStateRecord>> {
    let mut retries = 0;
    loop {
        match scheduler.store().cluster_checkin().await {
            Ok(failed) => return Ok(failed),
            Err(e) if e.is_retryable() && retries < MAX_RETRIES => {
                retries += 1;
                log::warn!("[CLUSTER] checkin retry {retries} after: {e}");
                time::sleep(time::Duration::from_millis(200 * retries as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
