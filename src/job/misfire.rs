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

/// Periodic misfire scan: loads stale triggers in bounded batches, applies
/// their misfire instructions, and keeps going while a pass reports more
/// pending.
pub async fn run(scheduler: Scheduler) -> Result<(), anyhow::Error> {
    let cfg = config::get_config();
    let mut interval = time::interval(time::Duration::from_millis(
        cfg.job_store.misfire_scan_interval.max(1000) as u64,
    ));
    interval.tick().await; // trigger the first run
    loop {
        interval.tick().await;
        if scheduler.is_shutdown() {
            break;
        }
        let mut retries = 0;
        loop {
            match scheduler.store().recover_misfired_triggers().await {
                Ok(scan) => {
                    retries = 0;
                    if let Some(earliest) = scan.earliest_new_time {
                        repository::signal_all(Some(earliest));
                    }
                    if !scan.has_more {
                        break;
                    }
                }
                Err(e) if e.is_retryable() && retries < MAX_RETRIES => {
                    retries += 1;
                    log::warn!("[MISFIRE] scan retry {retries} after: {e}");
                    time::sleep(time::Duration::from_millis(200 * retries as u64)).await;
                }
                Err(e) => {
                    log::error!("[MISFIRE] scan error: {e}");
                    break;
                }
            }
        }
    }
    Ok(())
}
