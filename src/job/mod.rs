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

use crate::scheduler::Scheduler;

pub mod clean;
pub mod cluster;
pub mod misfire;

/// Spawns the maintenance loops that accompany a running scheduler: the
/// misfire scanner, the cluster checkin/recovery watcher and the
/// completed-trigger cleaner.
pub async fn init(scheduler: &Scheduler) -> Result<(), anyhow::Error> {
    tokio::task::spawn(misfire::run(scheduler.clone()));
    tokio::task::spawn(cluster::run(scheduler.clone()));
    tokio::task::spawn(clean::run(scheduler.clone()));
    Ok(())
}
