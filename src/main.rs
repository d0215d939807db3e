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

use quartzite::{Scheduler, job};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cfg = config::get_config();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&cfg.log.level));
    log::info!(
        "starting quartzite, instance {} / {}",
        cfg.scheduler.instance_name,
        cfg.scheduler.instance_id
    );

    config::init()?;
    infra::init().await?;

    let scheduler = Scheduler::new();
    scheduler.start().await;
    job::init(&scheduler).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("received ctrl-c, shutting down");
    scheduler.shutdown(true).await;
    Ok(())
}
