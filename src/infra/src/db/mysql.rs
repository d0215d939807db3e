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

use std::str::FromStr;

use once_cell::sync::Lazy;
use sqlx::{
    ConnectOptions, MySql, Pool,
    mysql::{MySqlConnectOptions, MySqlPoolOptions},
};

pub static CLIENT: Lazy<Pool<MySql>> = Lazy::new(connect);

fn connect() -> Pool<MySql> {
    let cfg = config::get_config();
    let db_opts = MySqlConnectOptions::from_str(&cfg.data_source.mysql_dsn)
        .expect("mysql connect options create failed")
        .disable_statement_logging();

    MySqlPoolOptions::new()
        .min_connections(cfg.data_source.min_connections)
        .max_connections(cfg.data_source.max_connections)
        .connect_lazy_with(db_opts)
}
