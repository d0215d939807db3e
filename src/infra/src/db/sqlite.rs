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

use std::{str::FromStr, sync::Arc, time::Duration};

use once_cell::sync::Lazy;
use sqlx::{
    Pool, Sqlite,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions,
        SqliteSynchronous,
    },
};
use tokio::sync::Mutex;

/// Single-writer pool; mutating store operations serialize on the mutex,
/// which stands in for the row locks the server dialects use.
pub static CLIENT_RW: Lazy<Arc<Mutex<Pool<Sqlite>>>> =
    Lazy::new(|| Arc::new(Mutex::new(connect_rw())));
pub static CLIENT_RO: Lazy<Pool<Sqlite>> = Lazy::new(connect_ro);

fn db_url() -> String {
    let cfg = config::get_config();
    if let Err(e) = std::fs::create_dir_all(&cfg.data_source.sqlite_path) {
        log::error!("[SQLITE] create data dir error: {e}");
    }
    format!("{}{}", cfg.data_source.sqlite_path, "quartzite.sqlite")
}

fn connect_rw() -> Pool<Sqlite> {
    let db_opts = SqliteConnectOptions::from_str(&db_url())
        .expect("sqlite connect options create failed")
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .locking_mode(SqliteLockingMode::Normal)
        .busy_timeout(Duration::from_secs(30))
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect_lazy_with(db_opts)
}

fn connect_ro() -> Pool<Sqlite> {
    let db_opts = SqliteConnectOptions::from_str(&db_url())
        .expect("sqlite connect options create failed")
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .locking_mode(SqliteLockingMode::Normal)
        .busy_timeout(Duration::from_secs(30))
        .read_only(true);

    let cfg = config::get_config();
    SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(cfg.data_source.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_lazy_with(db_opts)
}
