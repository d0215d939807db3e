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

use crate::scheduler::Scheduler;

const CLEAN_INTERVAL_SECS: u64 = 30;

/// Prunes COMPLETE triggers and the non-durable jobs they orphaned.
pub async fn run(scheduler: Scheduler) -> Result<(), anyhow::Error> {
    let mut interval = time::interval(time::Duration::from_secs(CLEAN_INTERVAL_SECS));
    interval.tick().await; // trigger the first run
    loop {
        interval.tick().await;
        if scheduler.is_shutdown() {
            break;
        }
        match scheduler.store().clean_completed_triggers().await {
            Ok(0) => {}
            Ok(n) => log::debug!("[CLEAN] removed {n} completed trigger(s)"),
            Err(e) => log::error!("[CLEAN] error: {e}"),
        }
    }
    Ok(())
}
