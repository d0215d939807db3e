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

use async_trait::async_trait;
use config::{
    RECOVERING_JOBS_GROUP, ider,
    meta::{
        calendar::Calendar,
        job::{JobDataMap, JobDetail},
        key::{GroupMatcher, JobKey, TriggerKey},
        trigger::{
            CronSchedule, Schedule, SimpleSchedule, Trigger, TriggerState,
        },
    },
    utils::{json, time},
};
use sqlx::{Row, Sqlite, SqliteConnection, Transaction, sqlite::SqliteRow};

use super::{
    ALL_GROUPS_PAUSED, CompletedExecutionInstruction, FiredState, FiredTriggerRecord, JobStore,
    LOCK_STATE_ACCESS, LOCK_TRIGGER_ACCESS, MisfireScan, SchedulerStateRecord, SimpropRow,
    TriggerFiredBundle, TriggerFiredResult, build_recovery_trigger, schedule_from_simprop,
    simprop_from_schedule, tz_from_str,
};
use crate::{
    db::sqlite::{CLIENT_RO, CLIENT_RW},
    errors::{Error, Result},
};

/// Sqlite has no row locks; every mutating operation serializes on the
/// CLIENT_RW mutex, which gives the same single-writer discipline the
/// TRIGGER_ACCESS/STATE_ACCESS rows give the server dialects. The lock rows
/// are still created for schema parity.
pub struct SqliteJobStore {
    sched_name: String,
    instance_name: String,
}

impl SqliteJobStore {
    pub fn new() -> Self {
        let cfg = config::get_config();
        Self {
            sched_name: cfg.scheduler.instance_name.clone(),
            instance_name: ider::instance_id().to_string(),
        }
    }

    async fn commit(&self, tx: Transaction<'static, Sqlite>, op: &str) -> Result<()> {
        if let Err(e) = tx.commit().await {
            log::error!("[SQLITE] commit {op} error: {e}");
            return Err(e.into());
        }
        Ok(())
    }
}

impl Default for SqliteJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_table(&self) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let pool = locked.clone();
        let queries = vec![
            r#"
CREATE TABLE IF NOT EXISTS qrtz_job_details
(
    sched_name        VARCHAR(120) not null,
    job_group         VARCHAR(150) not null,
    job_name          VARCHAR(150) not null,
    description       VARCHAR(250),
    job_type          VARCHAR(250) not null,
    is_durable        BOOLEAN default false not null,
    is_nonconcurrent  BOOLEAN default false not null,
    is_update_data    BOOLEAN default false not null,
    requests_recovery BOOLEAN default false not null,
    job_data          TEXT,
    PRIMARY KEY (sched_name, job_group, job_name)
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS qrtz_triggers
(
    sched_name     VARCHAR(120) not null,
    trigger_group  VARCHAR(150) not null,
    trigger_name   VARCHAR(150) not null,
    job_group      VARCHAR(150) not null,
    job_name       VARCHAR(150) not null,
    description    VARCHAR(250),
    next_fire_time BIGINT,
    prev_fire_time BIGINT,
    priority       INT default 5 not null,
    trigger_state  VARCHAR(16) not null,
    trigger_type   VARCHAR(10) not null,
    start_time     BIGINT not null,
    end_time       BIGINT,
    calendar_name  VARCHAR(190),
    misfire_instr  SMALLINT default 0 not null,
    job_data       TEXT,
    PRIMARY KEY (sched_name, trigger_group, trigger_name),
    FOREIGN KEY (sched_name, job_group, job_name)
        REFERENCES qrtz_job_details (sched_name, job_group, job_name)
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS qrtz_simple_triggers
(
    sched_name      VARCHAR(120) not null,
    trigger_group   VARCHAR(150) not null,
    trigger_name    VARCHAR(150) not null,
    repeat_count    BIGINT not null,
    repeat_interval BIGINT not null,
    times_triggered BIGINT not null,
    PRIMARY KEY (sched_name, trigger_group, trigger_name),
    FOREIGN KEY (sched_name, trigger_group, trigger_name)
        REFERENCES qrtz_triggers (sched_name, trigger_group, trigger_name) ON DELETE CASCADE
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS qrtz_cron_triggers
(
    sched_name      VARCHAR(120) not null,
    trigger_group   VARCHAR(150) not null,
    trigger_name    VARCHAR(150) not null,
    cron_expression VARCHAR(250) not null,
    time_zone_id    VARCHAR(80),
    PRIMARY KEY (sched_name, trigger_group, trigger_name),
    FOREIGN KEY (sched_name, trigger_group, trigger_name)
        REFERENCES qrtz_triggers (sched_name, trigger_group, trigger_name) ON DELETE CASCADE
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS qrtz_simprop_triggers
(
    sched_name    VARCHAR(120) not null,
    trigger_group VARCHAR(150) not null,
    trigger_name  VARCHAR(150) not null,
    str_prop_1    VARCHAR(512),
    str_prop_2    VARCHAR(512),
    str_prop_3    VARCHAR(512),
    int_prop_1    INT,
    int_prop_2    INT,
    long_prop_1   BIGINT,
    long_prop_2   BIGINT,
    dec_prop_1    NUMERIC(13,4),
    dec_prop_2    NUMERIC(13,4),
    bool_prop_1   BOOLEAN,
    bool_prop_2   BOOLEAN,
    time_zone_id  VARCHAR(80),
    PRIMARY KEY (sched_name, trigger_group, trigger_name),
    FOREIGN KEY (sched_name, trigger_group, trigger_name)
        REFERENCES qrtz_triggers (sched_name, trigger_group, trigger_name) ON DELETE CASCADE
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS qrtz_blob_triggers
(
    sched_name    VARCHAR(120) not null,
    trigger_group VARCHAR(150) not null,
    trigger_name  VARCHAR(150) not null,
    blob_data     BLOB,
    PRIMARY KEY (sched_name, trigger_group, trigger_name),
    FOREIGN KEY (sched_name, trigger_group, trigger_name)
        REFERENCES qrtz_triggers (sched_name, trigger_group, trigger_name) ON DELETE CASCADE
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS qrtz_calendars
(
    sched_name    VARCHAR(120) not null,
    calendar_name VARCHAR(190) not null,
    calendar      TEXT not null,
    PRIMARY KEY (sched_name, calendar_name)
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS qrtz_paused_trigger_grps
(
    sched_name    VARCHAR(120) not null,
    trigger_group VARCHAR(150) not null,
    PRIMARY KEY (sched_name, trigger_group)
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS qrtz_fired_triggers
(
    sched_name        VARCHAR(120) not null,
    entry_id          VARCHAR(95) not null,
    trigger_group     VARCHAR(150) not null,
    trigger_name      VARCHAR(150) not null,
    job_group         VARCHAR(150) not null,
    job_name          VARCHAR(150) not null,
    instance_name     VARCHAR(190) not null,
    fired_time        BIGINT not null,
    sched_time        BIGINT not null,
    priority          INT not null,
    state             VARCHAR(16) not null,
    is_nonconcurrent  BOOLEAN default false not null,
    requests_recovery BOOLEAN default false not null,
    PRIMARY KEY (sched_name, entry_id)
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS qrtz_scheduler_state
(
    sched_name        VARCHAR(120) not null,
    instance_name     VARCHAR(190) not null,
    last_checkin_time BIGINT not null,
    checkin_interval  BIGINT not null,
    PRIMARY KEY (sched_name, instance_name)
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS qrtz_locks
(
    sched_name VARCHAR(120) not null,
    lock_name  VARCHAR(40) not null,
    PRIMARY KEY (sched_name, lock_name)
);
            "#,
        ];
        for query in queries {
            if let Err(e) = sqlx::query(query).execute(&pool).await {
                log::error!("[SQLITE] create table error: {e}");
                return Err(e.into());
            }
        }
        // the two named locks are created up front so lock acquisition never
        // races on first insert
        for lock in [LOCK_TRIGGER_ACCESS, LOCK_STATE_ACCESS] {
            sqlx::query(
                r#"INSERT INTO qrtz_locks (sched_name, lock_name) VALUES (?, ?) ON CONFLICT DO NOTHING;"#,
            )
            .bind(&self.sched_name)
            .bind(lock)
            .execute(&pool)
            .await?;
        }
        Ok(())
    }

    async fn create_table_index(&self) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let pool = locked.clone();
        let queries = vec![
            "CREATE INDEX IF NOT EXISTS qrtz_triggers_next_fire_idx on qrtz_triggers (sched_name, trigger_state, next_fire_time);",
            "CREATE INDEX IF NOT EXISTS qrtz_triggers_job_idx on qrtz_triggers (sched_name, job_group, job_name);",
            "CREATE INDEX IF NOT EXISTS qrtz_triggers_calendar_idx on qrtz_triggers (sched_name, calendar_name);",
            "CREATE INDEX IF NOT EXISTS qrtz_fired_triggers_instance_idx on qrtz_fired_triggers (sched_name, instance_name);",
            "CREATE INDEX IF NOT EXISTS qrtz_fired_triggers_trigger_idx on qrtz_fired_triggers (sched_name, trigger_group, trigger_name);",
        ];
        for query in queries {
            if let Err(e) = sqlx::query(query).execute(&pool).await {
                log::error!("[SQLITE] create index error: {e}");
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn store_job_and_trigger(&self, job: &JobDetail, trigger: &Trigger) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        if job_exists_in(&mut *tx, &self.sched_name, &job.key).await? {
            return Err(Error::ObjectAlreadyExists(job.key.to_string()));
        }
        insert_job(&mut *tx, &self.sched_name, job).await?;
        store_trigger_in(&mut *tx, &self.sched_name, trigger, false).await?;
        self.commit(tx, "store_job_and_trigger").await
    }

    async fn store_job(&self, job: &JobDetail, replace_existing: bool) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        let exists = job_exists_in(&mut *tx, &self.sched_name, &job.key).await?;
        if exists && !replace_existing {
            return Err(Error::ObjectAlreadyExists(job.key.to_string()));
        }
        if exists {
            update_job(&mut *tx, &self.sched_name, job).await?;
        } else {
            insert_job(&mut *tx, &self.sched_name, job).await?;
        }
        self.commit(tx, "store_job").await
    }

    async fn store_trigger(&self, trigger: &Trigger, replace_existing: bool) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        store_trigger_in(&mut *tx, &self.sched_name, trigger, replace_existing).await?;
        self.commit(tx, "store_trigger").await
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        sqlx::query(
            r#"DELETE FROM qrtz_triggers WHERE sched_name = ? AND job_group = ? AND job_name = ?;"#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .execute(&mut *tx)
        .await?;
        let deleted = sqlx::query(
            r#"DELETE FROM qrtz_job_details WHERE sched_name = ? AND job_group = ? AND job_name = ?;"#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        self.commit(tx, "remove_job").await?;
        Ok(deleted > 0)
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        let removed = remove_trigger_in(&mut *tx, &self.sched_name, key).await?;
        self.commit(tx, "remove_trigger").await?;
        Ok(removed)
    }

    async fn replace_trigger(&self, key: &TriggerKey, new_trigger: &Trigger) -> Result<bool> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        let Some(old) = load_trigger(&mut *tx, &self.sched_name, key).await? else {
            return Ok(false);
        };
        if old.job_key != new_trigger.job_key {
            return Err(Error::JobPersistence(
                "new trigger must reference the same job as the one it replaces".to_string(),
            ));
        }
        delete_trigger_rows(&mut *tx, &self.sched_name, key).await?;
        store_trigger_in(&mut *tx, &self.sched_name, new_trigger, false).await?;
        self.commit(tx, "replace_trigger").await?;
        Ok(true)
    }

    async fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        let pool = CLIENT_RO.clone();
        let mut conn = pool.acquire().await?;
        load_job(&mut *conn, &self.sched_name, key).await
    }

    async fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        let pool = CLIENT_RO.clone();
        let mut conn = pool.acquire().await?;
        load_trigger(&mut *conn, &self.sched_name, key).await
    }

    async fn update_job_data(&self, job: &JobDetail) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let pool = locked.clone();
        sqlx::query(
            r#"UPDATE qrtz_job_details SET job_data = ? WHERE sched_name = ? AND job_group = ? AND job_name = ?;"#,
        )
        .bind(json::to_string(&job.job_data)?)
        .bind(&self.sched_name)
        .bind(&job.key.group)
        .bind(&job.key.name)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn job_exists(&self, key: &JobKey) -> Result<bool> {
        let pool = CLIENT_RO.clone();
        let row = sqlx::query(
            r#"SELECT 1 AS one FROM qrtz_job_details WHERE sched_name = ? AND job_group = ? AND job_name = ?;"#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&pool)
        .await?;
        Ok(row.is_some())
    }

    async fn trigger_exists(&self, key: &TriggerKey) -> Result<bool> {
        let pool = CLIENT_RO.clone();
        let row = sqlx::query(
            r#"SELECT 1 AS one FROM qrtz_triggers WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?;"#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&pool)
        .await?;
        Ok(row.is_some())
    }

    async fn calendar_exists(&self, name: &str) -> Result<bool> {
        let pool = CLIENT_RO.clone();
        let row = sqlx::query(
            r#"SELECT 1 AS one FROM qrtz_calendars WHERE sched_name = ? AND calendar_name = ?;"#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_optional(&pool)
        .await?;
        Ok(row.is_some())
    }

    async fn get_job_keys(&self, matcher: &GroupMatcher) -> Result<Vec<JobKey>> {
        let pool = CLIENT_RO.clone();
        let rows = sqlx::query(
            r#"SELECT job_group, job_name FROM qrtz_job_details WHERE sched_name = ? ORDER BY job_group, job_name;"#,
        )
        .bind(&self.sched_name)
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                let group: String = r.try_get("job_group").ok()?;
                let name: String = r.try_get("job_name").ok()?;
                matcher.matches(&group).then(|| JobKey::new(&name, &group))
            })
            .collect())
    }

    async fn get_trigger_keys(&self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>> {
        let pool = CLIENT_RO.clone();
        let rows = sqlx::query(
            r#"SELECT trigger_group, trigger_name FROM qrtz_triggers WHERE sched_name = ? ORDER BY trigger_group, trigger_name;"#,
        )
        .bind(&self.sched_name)
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                let group: String = r.try_get("trigger_group").ok()?;
                let name: String = r.try_get("trigger_name").ok()?;
                matcher
                    .matches(&group)
                    .then(|| TriggerKey::new(&name, &group))
            })
            .collect())
    }

    async fn get_job_group_names(&self) -> Result<Vec<String>> {
        let pool = CLIENT_RO.clone();
        let rows = sqlx::query(
            r#"SELECT DISTINCT job_group FROM qrtz_job_details WHERE sched_name = ? ORDER BY job_group;"#,
        )
        .bind(&self.sched_name)
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get("job_group").ok())
            .collect())
    }

    async fn get_trigger_group_names(&self) -> Result<Vec<String>> {
        let pool = CLIENT_RO.clone();
        let rows = sqlx::query(
            r#"SELECT DISTINCT trigger_group FROM qrtz_triggers WHERE sched_name = ? ORDER BY trigger_group;"#,
        )
        .bind(&self.sched_name)
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get("trigger_group").ok())
            .collect())
    }

    async fn get_triggers_for_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        let pool = CLIENT_RO.clone();
        let mut conn = pool.acquire().await?;
        let rows = sqlx::query(
            r#"SELECT trigger_group, trigger_name FROM qrtz_triggers
WHERE sched_name = ? AND job_group = ? AND job_name = ? ORDER BY trigger_group, trigger_name;"#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_all(&mut *conn)
        .await?;
        let mut triggers = Vec::with_capacity(rows.len());
        for row in rows {
            let group: String = row.try_get("trigger_group")?;
            let name: String = row.try_get("trigger_name")?;
            if let Some(t) =
                load_trigger(&mut *conn, &self.sched_name, &TriggerKey::new(&name, &group)).await?
            {
                triggers.push(t);
            }
        }
        Ok(triggers)
    }

    async fn get_trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>> {
        let pool = CLIENT_RO.clone();
        let row = sqlx::query(
            r#"SELECT trigger_state FROM qrtz_triggers WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?;"#,
        )
        .bind(&self.sched_name)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&pool)
        .await?;
        Ok(row.map(|r| {
            TriggerState::from_str(r.try_get::<String, _>("trigger_state").unwrap_or_default().as_str())
        }))
    }

    async fn get_number_of_jobs(&self) -> Result<usize> {
        let pool = CLIENT_RO.clone();
        let count: i64 =
            sqlx::query_scalar(r#"SELECT COUNT(*) FROM qrtz_job_details WHERE sched_name = ?;"#)
                .bind(&self.sched_name)
                .fetch_one(&pool)
                .await?;
        Ok(count as usize)
    }

    async fn get_number_of_triggers(&self) -> Result<usize> {
        let pool = CLIENT_RO.clone();
        let count: i64 =
            sqlx::query_scalar(r#"SELECT COUNT(*) FROM qrtz_triggers WHERE sched_name = ?;"#)
                .bind(&self.sched_name)
                .fetch_one(&pool)
                .await?;
        Ok(count as usize)
    }

    async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        pause_trigger_in(&mut *tx, &self.sched_name, key).await?;
        self.commit(tx, "pause_trigger").await
    }

    async fn pause_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        let rows = sqlx::query(
            r#"SELECT DISTINCT trigger_group FROM qrtz_triggers WHERE sched_name = ?;"#,
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *tx)
        .await?;
        let mut groups: Vec<String> = rows
            .iter()
            .filter_map(|r| r.try_get::<String, _>("trigger_group").ok())
            .filter(|g| matcher.matches(g))
            .collect();
        if let GroupMatcher::Equals(group) = matcher
            && !groups.contains(group)
        {
            groups.push(group.clone());
        }
        for group in &groups {
            sqlx::query(
                r#"INSERT INTO qrtz_paused_trigger_grps (sched_name, trigger_group) VALUES (?, ?) ON CONFLICT DO NOTHING;"#,
            )
            .bind(&self.sched_name)
            .bind(group)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r#"UPDATE qrtz_triggers SET trigger_state = 'PAUSED'
WHERE sched_name = ? AND trigger_group = ? AND trigger_state IN ('WAITING', 'ACQUIRED', 'EXECUTING');"#,
            )
            .bind(&self.sched_name)
            .bind(group)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r#"UPDATE qrtz_triggers SET trigger_state = 'PAUSED_BLOCKED'
WHERE sched_name = ? AND trigger_group = ? AND trigger_state = 'BLOCKED';"#,
            )
            .bind(&self.sched_name)
            .bind(group)
            .execute(&mut *tx)
            .await?;
        }
        self.commit(tx, "pause_triggers").await?;
        groups.sort();
        Ok(groups)
    }

    async fn pause_job(&self, key: &JobKey) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        pause_job_in(&mut *tx, &self.sched_name, key).await?;
        self.commit(tx, "pause_job").await
    }

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let keys = self.get_job_keys(matcher).await?;
        let mut groups: Vec<String> = Vec::new();
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        for key in keys {
            if !groups.contains(&key.group) {
                groups.push(key.group.clone());
            }
            pause_job_in(&mut *tx, &self.sched_name, &key).await?;
        }
        self.commit(tx, "pause_jobs").await?;
        groups.sort();
        Ok(groups)
    }

    async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        resume_trigger_in(&mut *tx, &self.sched_name, key).await?;
        self.commit(tx, "resume_trigger").await
    }

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        let rows = sqlx::query(
            r#"SELECT trigger_group FROM qrtz_paused_trigger_grps WHERE sched_name = ?;"#,
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *tx)
        .await?;
        let groups: Vec<String> = rows
            .iter()
            .filter_map(|r| r.try_get::<String, _>("trigger_group").ok())
            .filter(|g| matcher.matches(g))
            .collect();
        for group in &groups {
            sqlx::query(
                r#"DELETE FROM qrtz_paused_trigger_grps WHERE sched_name = ? AND trigger_group = ?;"#,
            )
            .bind(&self.sched_name)
            .bind(group)
            .execute(&mut *tx)
            .await?;
        }
        let rows = sqlx::query(
            r#"SELECT trigger_group, trigger_name FROM qrtz_triggers
WHERE sched_name = ? AND trigger_state IN ('PAUSED', 'PAUSED_BLOCKED');"#,
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *tx)
        .await?;
        for row in rows {
            let group: String = row.try_get("trigger_group")?;
            let name: String = row.try_get("trigger_name")?;
            if matcher.matches(&group) {
                resume_trigger_in(&mut *tx, &self.sched_name, &TriggerKey::new(&name, &group))
                    .await?;
            }
        }
        self.commit(tx, "resume_triggers").await?;
        Ok(groups)
    }

    async fn resume_job(&self, key: &JobKey) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        resume_job_in(&mut *tx, &self.sched_name, key).await?;
        self.commit(tx, "resume_job").await
    }

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let keys = self.get_job_keys(matcher).await?;
        let mut groups: Vec<String> = Vec::new();
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        for key in keys {
            if !groups.contains(&key.group) {
                groups.push(key.group.clone());
            }
            resume_job_in(&mut *tx, &self.sched_name, &key).await?;
        }
        self.commit(tx, "resume_jobs").await?;
        groups.sort();
        Ok(groups)
    }

    async fn pause_all(&self) -> Result<()> {
        self.pause_triggers(&GroupMatcher::Any).await?;
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let pool = locked.clone();
        sqlx::query(
            r#"INSERT INTO qrtz_paused_trigger_grps (sched_name, trigger_group) VALUES (?, ?) ON CONFLICT DO NOTHING;"#,
        )
        .bind(&self.sched_name)
        .bind(ALL_GROUPS_PAUSED)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn resume_all(&self) -> Result<()> {
        {
            let client = CLIENT_RW.clone();
            let locked = client.lock().await;
            let pool = locked.clone();
            sqlx::query(r#"DELETE FROM qrtz_paused_trigger_grps WHERE sched_name = ?;"#)
                .bind(&self.sched_name)
                .execute(&pool)
                .await?;
        }
        self.resume_triggers(&GroupMatcher::Any).await?;
        Ok(())
    }

    async fn get_paused_trigger_groups(&self) -> Result<Vec<String>> {
        let pool = CLIENT_RO.clone();
        let rows = sqlx::query(
            r#"SELECT trigger_group FROM qrtz_paused_trigger_grps WHERE sched_name = ? ORDER BY trigger_group;"#,
        )
        .bind(&self.sched_name)
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get("trigger_group").ok())
            .collect())
    }

    async fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        let exists = sqlx::query(
            r#"SELECT 1 AS one FROM qrtz_calendars WHERE sched_name = ? AND calendar_name = ?;"#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?
        .is_some();
        if exists && !replace_existing {
            return Err(Error::ObjectAlreadyExists(name.to_string()));
        }
        sqlx::query(
            r#"INSERT INTO qrtz_calendars (sched_name, calendar_name, calendar) VALUES (?, ?, ?)
ON CONFLICT (sched_name, calendar_name) DO UPDATE SET calendar = excluded.calendar;"#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .bind(json::to_string(calendar)?)
        .execute(&mut *tx)
        .await?;

        if update_triggers {
            let threshold =
                chrono::Duration::milliseconds(config::get_config().job_store.misfire_threshold);
            let rows = sqlx::query(
                r#"SELECT trigger_group, trigger_name FROM qrtz_triggers WHERE sched_name = ? AND calendar_name = ?;"#,
            )
            .bind(&self.sched_name)
            .bind(name)
            .fetch_all(&mut *tx)
            .await?;
            for row in rows {
                let group: String = row.try_get("trigger_group")?;
                let tname: String = row.try_get("trigger_name")?;
                let key = TriggerKey::new(&tname, &group);
                if let Some(mut t) = load_trigger(&mut *tx, &self.sched_name, &key).await? {
                    t.update_with_new_calendar(calendar, threshold);
                    if t.next_fire_time.is_none() && t.state == TriggerState::Waiting {
                        t.state = TriggerState::Complete;
                    }
                    update_trigger(&mut *tx, &self.sched_name, &t).await?;
                }
            }
        }
        self.commit(tx, "store_calendar").await
    }

    async fn remove_calendar(&self, name: &str) -> Result<bool> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        let referenced: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM qrtz_triggers WHERE sched_name = ? AND calendar_name = ?;"#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;
        if referenced > 0 {
            return Err(Error::JobPersistence(format!(
                "calendar {name} is referenced by triggers and cannot be removed"
            )));
        }
        let deleted = sqlx::query(
            r#"DELETE FROM qrtz_calendars WHERE sched_name = ? AND calendar_name = ?;"#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        self.commit(tx, "remove_calendar").await?;
        Ok(deleted > 0)
    }

    async fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        let pool = CLIENT_RO.clone();
        let mut conn = pool.acquire().await?;
        load_calendar(&mut *conn, &self.sched_name, name).await
    }

    async fn get_calendar_names(&self) -> Result<Vec<String>> {
        let pool = CLIENT_RO.clone();
        let rows = sqlx::query(
            r#"SELECT calendar_name FROM qrtz_calendars WHERE sched_name = ? ORDER BY calendar_name;"#,
        )
        .bind(&self.sched_name)
        .fetch_all(&pool)
        .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.try_get("calendar_name").ok())
            .collect())
    }

    /// Candidates are read ordered by `(next_fire_time ASC, priority DESC)`
    /// under the single-writer mutex, misfire-checked, then flipped to
    /// ACQUIRED with a fired record each. The batch may reach past
    /// `no_later_than` only up to `time_window`.
    async fn acquire_next_triggers(
        &self,
        no_later_than: i64,
        max_count: usize,
        time_window: i64,
    ) -> Result<Vec<Trigger>> {
        let now = time::now();
        let cfg = config::get_config();
        let threshold = cfg.job_store.misfire_threshold;
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        let bound = no_later_than + time_window;
        let rows = sqlx::query(
            r#"SELECT trigger_group, trigger_name FROM qrtz_triggers
WHERE sched_name = ? AND trigger_state = 'WAITING' AND next_fire_time <= ?
ORDER BY next_fire_time ASC, priority DESC
LIMIT ?;"#,
        )
        .bind(&self.sched_name)
        .bind(bound)
        .bind((max_count * 2 + 5) as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut acquired: Vec<Trigger> = Vec::new();
        let mut jobs_in_batch: Vec<JobKey> = Vec::new();
        let mut batch_end = bound;
        for row in rows {
            if acquired.len() >= max_count {
                break;
            }
            let group: String = row.try_get("trigger_group")?;
            let name: String = row.try_get("trigger_name")?;
            let key = TriggerKey::new(&name, &group);
            let Some(mut trigger) = load_trigger(&mut *tx, &self.sched_name, &key).await? else {
                continue;
            };
            if trigger.state != TriggerState::Waiting {
                continue;
            }
            let Some(job) = load_job(&mut *tx, &self.sched_name, &trigger.job_key).await? else {
                continue;
            };
            let calendar = match &trigger.calendar_name {
                Some(cal) => load_calendar(&mut *tx, &self.sched_name, cal).await?,
                None => None,
            };
            // apply the misfire instruction to stale candidates on the way
            let Some(next) = trigger.next_fire_time else {
                continue;
            };
            if time::to_millis(now) - time::to_millis(next) > threshold
                && trigger.schedule.misfire_code() != -1
            {
                trigger.update_after_misfire_at(calendar.as_ref(), now);
                if trigger.next_fire_time.is_none() {
                    trigger.state = TriggerState::Complete;
                }
                update_trigger(&mut *tx, &self.sched_name, &trigger).await?;
                let Some(new_next) = trigger.next_fire_time else {
                    continue;
                };
                if time::to_millis(new_next) > bound {
                    continue;
                }
            }
            let next_ms = time::to_millis(trigger.next_fire_time.unwrap());
            if next_ms > batch_end {
                break;
            }
            if job.concurrent_execution_disallowed && jobs_in_batch.contains(&job.key) {
                continue;
            }
            let updated = sqlx::query(
                r#"UPDATE qrtz_triggers SET trigger_state = 'ACQUIRED'
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ? AND trigger_state = 'WAITING';"#,
            )
            .bind(&self.sched_name)
            .bind(&key.group)
            .bind(&key.name)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                continue;
            }
            if acquired.is_empty() {
                batch_end = next_ms.max(no_later_than) + time_window;
            }
            let entry_id = ider::generate();
            sqlx::query(
                r#"INSERT INTO qrtz_fired_triggers
(sched_name, entry_id, trigger_group, trigger_name, job_group, job_name, instance_name, fired_time, sched_time, priority, state, is_nonconcurrent, requests_recovery)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'ACQUIRED', ?, ?);"#,
            )
            .bind(&self.sched_name)
            .bind(&entry_id)
            .bind(&key.group)
            .bind(&key.name)
            .bind(&trigger.job_key.group)
            .bind(&trigger.job_key.name)
            .bind(&self.instance_name)
            .bind(time::to_millis(now))
            .bind(next_ms)
            .bind(trigger.priority)
            .bind(job.concurrent_execution_disallowed)
            .bind(job.request_recovery)
            .execute(&mut *tx)
            .await?;
            trigger.state = TriggerState::Acquired;
            trigger.fired_entry_id = Some(entry_id);
            if job.concurrent_execution_disallowed {
                jobs_in_batch.push(job.key.clone());
            }
            acquired.push(trigger);
        }
        self.commit(tx, "acquire_next_triggers").await?;
        Ok(acquired)
    }

    async fn release_acquired_trigger(&self, trigger: &Trigger) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        sqlx::query(
            r#"UPDATE qrtz_triggers SET trigger_state = 'WAITING'
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ? AND trigger_state = 'ACQUIRED';"#,
        )
        .bind(&self.sched_name)
        .bind(&trigger.key.group)
        .bind(&trigger.key.name)
        .execute(&mut *tx)
        .await?;
        if let Some(entry_id) = &trigger.fired_entry_id {
            sqlx::query(
                r#"DELETE FROM qrtz_fired_triggers WHERE sched_name = ? AND entry_id = ?;"#,
            )
            .bind(&self.sched_name)
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        }
        self.commit(tx, "release_acquired_trigger").await
    }

    async fn triggers_fired(&self, triggers: &[Trigger]) -> Result<Vec<TriggerFiredResult>> {
        let now = time::now();
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        let mut results = Vec::with_capacity(triggers.len());
        for fired in triggers {
            let key = fired.key.clone();
            let Some(mut trigger) = load_trigger(&mut *tx, &self.sched_name, &key).await? else {
                results.push(TriggerFiredResult::Skipped {
                    trigger_key: key,
                    reason: "trigger no longer exists".to_string(),
                });
                continue;
            };
            if trigger.state != TriggerState::Acquired {
                results.push(TriggerFiredResult::Skipped {
                    trigger_key: key,
                    reason: "trigger is no longer in the acquired state".to_string(),
                });
                continue;
            }
            let Some(entry_id) = fired.fired_entry_id.clone() else {
                results.push(TriggerFiredResult::Skipped {
                    trigger_key: key,
                    reason: "trigger carries no fired entry id".to_string(),
                });
                continue;
            };
            let Some(fired_row) = sqlx::query(
                r#"SELECT sched_time FROM qrtz_fired_triggers WHERE sched_name = ? AND entry_id = ?;"#,
            )
            .bind(&self.sched_name)
            .bind(&entry_id)
            .fetch_optional(&mut *tx)
            .await?
            else {
                results.push(TriggerFiredResult::Skipped {
                    trigger_key: key,
                    reason: "fired record is gone".to_string(),
                });
                continue;
            };
            let scheduled_ms: i64 = fired_row.try_get("sched_time")?;
            let Some(job) = load_job(&mut *tx, &self.sched_name, &trigger.job_key).await? else {
                results.push(TriggerFiredResult::Skipped {
                    trigger_key: key,
                    reason: "job no longer exists".to_string(),
                });
                continue;
            };
            let calendar = match &trigger.calendar_name {
                Some(cal) => load_calendar(&mut *tx, &self.sched_name, cal).await?,
                None => None,
            };

            sqlx::query(
                r#"UPDATE qrtz_fired_triggers SET state = 'EXECUTING' WHERE sched_name = ? AND entry_id = ?;"#,
            )
            .bind(&self.sched_name)
            .bind(&entry_id)
            .execute(&mut *tx)
            .await?;

            let prev_fire_time = trigger.previous_fire_time;
            trigger.triggered(calendar.as_ref());
            trigger.state = if trigger.next_fire_time.is_none() {
                TriggerState::Complete
            } else {
                TriggerState::Executing
            };
            update_trigger(&mut *tx, &self.sched_name, &trigger).await?;

            if job.concurrent_execution_disallowed {
                sqlx::query(
                    r#"UPDATE qrtz_triggers SET trigger_state = 'BLOCKED'
WHERE sched_name = ? AND job_group = ? AND job_name = ?
  AND trigger_state IN ('WAITING', 'ACQUIRED')
  AND NOT (trigger_group = ? AND trigger_name = ?);"#,
                )
                .bind(&self.sched_name)
                .bind(&job.key.group)
                .bind(&job.key.name)
                .bind(&key.group)
                .bind(&key.name)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    r#"UPDATE qrtz_triggers SET trigger_state = 'PAUSED_BLOCKED'
WHERE sched_name = ? AND job_group = ? AND job_name = ?
  AND trigger_state = 'PAUSED'
  AND NOT (trigger_group = ? AND trigger_name = ?);"#,
                )
                .bind(&self.sched_name)
                .bind(&job.key.group)
                .bind(&job.key.name)
                .bind(&key.group)
                .bind(&key.name)
                .execute(&mut *tx)
                .await?;
            }

            trigger.fired_entry_id = Some(entry_id);
            let next_fire_time = trigger.next_fire_time;
            results.push(TriggerFiredResult::Fired(Box::new(TriggerFiredBundle {
                recovering: trigger.key.group == RECOVERING_JOBS_GROUP,
                trigger,
                job,
                calendar,
                fire_time: now,
                scheduled_fire_time: time::from_millis(scheduled_ms),
                prev_fire_time,
                next_fire_time,
            })));
        }
        self.commit(tx, "triggers_fired").await?;
        Ok(results)
    }

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        match instruction {
            CompletedExecutionInstruction::NoInstruction => {
                sqlx::query(
                    r#"UPDATE qrtz_triggers
SET trigger_state = CASE WHEN next_fire_time IS NULL THEN 'COMPLETE' ELSE 'WAITING' END
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ? AND trigger_state = 'EXECUTING';"#,
                )
                .bind(&self.sched_name)
                .bind(&trigger.key.group)
                .bind(&trigger.key.name)
                .execute(&mut *tx)
                .await?;
            }
            CompletedExecutionInstruction::DeleteTrigger => {
                // don't delete a trigger that was rescheduled while the job ran
                let stored: Option<Option<i64>> = sqlx::query_scalar(
                    r#"SELECT next_fire_time FROM qrtz_triggers WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?;"#,
                )
                .bind(&self.sched_name)
                .bind(&trigger.key.group)
                .bind(&trigger.key.name)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(stored_next) = stored {
                    let passed_next = time::option_to_millis(trigger.next_fire_time);
                    if stored_next.is_none() || stored_next == passed_next {
                        remove_trigger_in(&mut *tx, &self.sched_name, &trigger.key).await?;
                    }
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                set_trigger_state(&mut *tx, &self.sched_name, &trigger.key, "COMPLETE").await?;
            }
            CompletedExecutionInstruction::SetTriggerError => {
                log::warn!(
                    "[SQLITE] trigger {} completed with the error instruction",
                    trigger.key
                );
                set_trigger_state(&mut *tx, &self.sched_name, &trigger.key, "ERROR").await?;
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                set_job_trigger_states(&mut *tx, &self.sched_name, &job.key, "COMPLETE").await?;
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                log::warn!(
                    "[SQLITE] all triggers of job {} set to the error state",
                    job.key
                );
                set_job_trigger_states(&mut *tx, &self.sched_name, &job.key, "ERROR").await?;
            }
        }

        if job.concurrent_execution_disallowed {
            unblock_job_triggers(&mut *tx, &self.sched_name, &job.key).await?;
        }
        if job.persist_job_data_after_execution {
            sqlx::query(
                r#"UPDATE qrtz_job_details SET job_data = ? WHERE sched_name = ? AND job_group = ? AND job_name = ?;"#,
            )
            .bind(json::to_string(&job.job_data)?)
            .bind(&self.sched_name)
            .bind(&job.key.group)
            .bind(&job.key.name)
            .execute(&mut *tx)
            .await?;
        }
        if let Some(entry_id) = &trigger.fired_entry_id {
            sqlx::query(
                r#"DELETE FROM qrtz_fired_triggers WHERE sched_name = ? AND entry_id = ?;"#,
            )
            .bind(&self.sched_name)
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        }
        self.commit(tx, "triggered_job_complete").await
    }

    async fn recover_misfired_triggers(&self) -> Result<MisfireScan> {
        let now = time::now();
        let cfg = config::get_config();
        let batch = cfg.job_store.max_misfires_to_handle_at_a_time.max(1);
        let misfire_before = time::to_millis(now) - cfg.job_store.misfire_threshold;
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        let rows = sqlx::query(
            r#"SELECT trigger_group, trigger_name FROM qrtz_triggers
WHERE sched_name = ? AND trigger_state = 'WAITING' AND next_fire_time < ? AND misfire_instr <> -1
ORDER BY next_fire_time ASC, priority DESC
LIMIT ?;"#,
        )
        .bind(&self.sched_name)
        .bind(misfire_before)
        .bind((batch + 1) as i64)
        .fetch_all(&mut *tx)
        .await?;
        let has_more = rows.len() > batch;
        let mut scan = MisfireScan {
            has_more,
            ..Default::default()
        };
        for row in rows.iter().take(batch) {
            let group: String = row.try_get("trigger_group")?;
            let name: String = row.try_get("trigger_name")?;
            let key = TriggerKey::new(&name, &group);
            let Some(mut trigger) = load_trigger(&mut *tx, &self.sched_name, &key).await? else {
                continue;
            };
            let calendar = match &trigger.calendar_name {
                Some(cal) => load_calendar(&mut *tx, &self.sched_name, cal).await?,
                None => None,
            };
            trigger.update_after_misfire_at(calendar.as_ref(), now);
            match trigger.next_fire_time {
                Some(next) => {
                    let ms = time::to_millis(next);
                    scan.earliest_new_time =
                        Some(scan.earliest_new_time.map_or(ms, |e: i64| e.min(ms)));
                }
                None => trigger.state = TriggerState::Complete,
            }
            update_trigger(&mut *tx, &self.sched_name, &trigger).await?;
            scan.handled += 1;
        }
        self.commit(tx, "recover_misfired_triggers").await?;
        if scan.handled > 0 {
            log::info!(
                "[SQLITE] handled {} misfired trigger(s){}",
                scan.handled,
                if scan.has_more { ", more pending" } else { "" }
            );
        }
        Ok(scan)
    }

    async fn cluster_checkin(&self) -> Result<Vec<SchedulerStateRecord>> {
        let cfg = config::get_config();
        let now_ms = time::now_millis();
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        sqlx::query(
            r#"INSERT INTO qrtz_scheduler_state (sched_name, instance_name, last_checkin_time, checkin_interval)
VALUES (?, ?, ?, ?)
ON CONFLICT (sched_name, instance_name)
DO UPDATE SET last_checkin_time = excluded.last_checkin_time, checkin_interval = excluded.checkin_interval;"#,
        )
        .bind(&self.sched_name)
        .bind(&self.instance_name)
        .bind(now_ms)
        .bind(cfg.job_store.cluster_checkin_interval)
        .execute(&mut *tx)
        .await?;
        let rows = sqlx::query(
            r#"SELECT instance_name, last_checkin_time, checkin_interval
FROM qrtz_scheduler_state WHERE sched_name = ? AND instance_name <> ?;"#,
        )
        .bind(&self.sched_name)
        .bind(&self.instance_name)
        .fetch_all(&mut *tx)
        .await?;
        self.commit(tx, "cluster_checkin").await?;

        let mut failed = Vec::new();
        for row in rows {
            let record = SchedulerStateRecord {
                instance_name: row.try_get("instance_name")?,
                last_checkin_time: row.try_get("last_checkin_time")?,
                checkin_interval: row.try_get("checkin_interval")?,
            };
            if record.last_checkin_time + record.checkin_interval + cfg.job_store.clock_skew_allowance
                < now_ms
            {
                failed.push(record);
            }
        }
        Ok(failed)
    }

    async fn cluster_recover(&self, failed: &[SchedulerStateRecord]) -> Result<()> {
        for instance in failed {
            let client = CLIENT_RW.clone();
            let locked = client.lock().await;
            let mut tx = locked.begin().await?;
            let rows = sqlx::query(
                r#"SELECT entry_id, trigger_group, trigger_name, job_group, job_name, instance_name,
       fired_time, sched_time, priority, state, is_nonconcurrent, requests_recovery
FROM qrtz_fired_triggers WHERE sched_name = ? AND instance_name = ?;"#,
            )
            .bind(&self.sched_name)
            .bind(&instance.instance_name)
            .fetch_all(&mut *tx)
            .await?;
            let mut recovered = 0usize;
            for row in &rows {
                let record = fired_record_from_row(row)?;
                match record.state {
                    FiredState::Acquired => {
                        sqlx::query(
                            r#"UPDATE qrtz_triggers SET trigger_state = 'WAITING'
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ? AND trigger_state = 'ACQUIRED';"#,
                        )
                        .bind(&self.sched_name)
                        .bind(&record.trigger_key.group)
                        .bind(&record.trigger_key.name)
                        .execute(&mut *tx)
                        .await?;
                    }
                    FiredState::Executing => {
                        sqlx::query(
                            r#"UPDATE qrtz_triggers SET trigger_state = 'WAITING'
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ? AND trigger_state = 'EXECUTING';"#,
                        )
                        .bind(&self.sched_name)
                        .bind(&record.trigger_key.group)
                        .bind(&record.trigger_key.name)
                        .execute(&mut *tx)
                        .await?;
                        if record.is_nonconcurrent {
                            unblock_job_triggers(&mut *tx, &self.sched_name, &record.job_key)
                                .await?;
                        }
                        if record.requests_recovery
                            && let Some(job) =
                                load_job(&mut *tx, &self.sched_name, &record.job_key).await?
                        {
                            let recovery = build_recovery_trigger(&record, &job);
                            insert_trigger(&mut *tx, &self.sched_name, &recovery).await?;
                            recovered += 1;
                        }
                    }
                }
            }
            sqlx::query(
                r#"DELETE FROM qrtz_fired_triggers WHERE sched_name = ? AND instance_name = ?;"#,
            )
            .bind(&self.sched_name)
            .bind(&instance.instance_name)
            .execute(&mut *tx)
            .await?;
            self.commit(tx, "cluster_recover").await?;

            // the same writer guard spans the state cleanup
            let mut tx = locked.begin().await?;
            sqlx::query(
                r#"DELETE FROM qrtz_scheduler_state WHERE sched_name = ? AND instance_name = ?;"#,
            )
            .bind(&self.sched_name)
            .bind(&instance.instance_name)
            .execute(&mut *tx)
            .await?;
            self.commit(tx, "cluster_recover state").await?;
            drop(locked);
            log::warn!(
                "[SQLITE] recovered failed instance {}: {} in-flight firing(s), {} recovery trigger(s)",
                instance.instance_name,
                rows.len(),
                recovered
            );
        }
        Ok(())
    }

    async fn clean_completed_triggers(&self) -> Result<usize> {
        let client = CLIENT_RW.clone();
        let locked = client.lock().await;
        let mut tx = locked.begin().await?;
        let deleted = sqlx::query(
            r#"DELETE FROM qrtz_triggers WHERE sched_name = ? AND trigger_state = 'COMPLETE';"#,
        )
        .bind(&self.sched_name)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query(
            r#"DELETE FROM qrtz_job_details
WHERE sched_name = ? AND is_durable = false
  AND NOT EXISTS (
    SELECT 1 FROM qrtz_triggers t
    WHERE t.sched_name = qrtz_job_details.sched_name
      AND t.job_group = qrtz_job_details.job_group
      AND t.job_name = qrtz_job_details.job_name
  );"#,
        )
        .bind(&self.sched_name)
        .execute(&mut *tx)
        .await?;
        self.commit(tx, "clean_completed_triggers").await?;
        Ok(deleted as usize)
    }
}

// row mapping and per-connection helpers

fn job_from_row(row: &SqliteRow) -> Result<JobDetail> {
    let group: String = row.try_get("job_group")?;
    let name: String = row.try_get("job_name")?;
    let job_data: Option<String> = row.try_get("job_data")?;
    let job_data: JobDataMap = match job_data {
        Some(data) if !data.is_empty() => json::from_str(&data)?,
        _ => JobDataMap::default(),
    };
    Ok(JobDetail {
        key: JobKey::new(&name, &group),
        job_type: row.try_get("job_type")?,
        description: row.try_get("description")?,
        durable: row.try_get("is_durable")?,
        concurrent_execution_disallowed: row.try_get("is_nonconcurrent")?,
        persist_job_data_after_execution: row.try_get("is_update_data")?,
        request_recovery: row.try_get("requests_recovery")?,
        job_data,
    })
}

fn fired_record_from_row(row: &SqliteRow) -> Result<FiredTriggerRecord> {
    let trigger_group: String = row.try_get("trigger_group")?;
    let trigger_name: String = row.try_get("trigger_name")?;
    let job_group: String = row.try_get("job_group")?;
    let job_name: String = row.try_get("job_name")?;
    let state: String = row.try_get("state")?;
    Ok(FiredTriggerRecord {
        entry_id: row.try_get("entry_id")?,
        trigger_key: TriggerKey::new(&trigger_name, &trigger_group),
        job_key: JobKey::new(&job_name, &job_group),
        instance_name: row.try_get("instance_name")?,
        fired_time: row.try_get("fired_time")?,
        scheduled_time: row.try_get("sched_time")?,
        priority: row.try_get("priority")?,
        state: FiredState::from_str(&state),
        is_nonconcurrent: row.try_get("is_nonconcurrent")?,
        requests_recovery: row.try_get("requests_recovery")?,
    })
}

async fn load_job(conn: &mut SqliteConnection, sched: &str, key: &JobKey) -> Result<Option<JobDetail>> {
    let row = sqlx::query(
        r#"SELECT * FROM qrtz_job_details WHERE sched_name = ? AND job_group = ? AND job_name = ?;"#,
    )
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(|r| job_from_row(&r)).transpose()
}

async fn load_calendar(
    conn: &mut SqliteConnection,
    sched: &str,
    name: &str,
) -> Result<Option<Calendar>> {
    let row = sqlx::query(
        r#"SELECT calendar FROM qrtz_calendars WHERE sched_name = ? AND calendar_name = ?;"#,
    )
    .bind(sched)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(r) => {
            let text: String = r.try_get("calendar")?;
            Ok(Some(json::from_str(&text)?))
        }
        None => Ok(None),
    }
}

async fn load_trigger(
    conn: &mut SqliteConnection,
    sched: &str,
    key: &TriggerKey,
) -> Result<Option<Trigger>> {
    let Some(row) = sqlx::query(
        r#"SELECT * FROM qrtz_triggers WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?;"#,
    )
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };
    let trigger_type: String = row.try_get("trigger_type")?;
    let misfire_instr: i16 = row.try_get("misfire_instr")?;
    let Some(mut schedule) = load_schedule(conn, sched, key, &trigger_type).await? else {
        return Err(Error::JobPersistence(format!(
            "trigger {key} of type {trigger_type} has no schedule row"
        )));
    };
    schedule.set_misfire_code(misfire_instr);

    let job_group: String = row.try_get("job_group")?;
    let job_name: String = row.try_get("job_name")?;
    let state: String = row.try_get("trigger_state")?;
    let job_data: Option<String> = row.try_get("job_data")?;
    let job_data: JobDataMap = match job_data {
        Some(data) if !data.is_empty() => json::from_str(&data)?,
        _ => JobDataMap::default(),
    };
    Ok(Some(Trigger {
        key: key.clone(),
        job_key: JobKey::new(&job_name, &job_group),
        description: row.try_get("description")?,
        start_time: time::from_millis(row.try_get("start_time")?),
        end_time: time::option_from_millis(row.try_get("end_time")?),
        next_fire_time: time::option_from_millis(row.try_get("next_fire_time")?),
        previous_fire_time: time::option_from_millis(row.try_get("prev_fire_time")?),
        priority: row.try_get("priority")?,
        calendar_name: row.try_get("calendar_name")?,
        state: TriggerState::from_str(&state),
        job_data,
        fired_entry_id: None,
        schedule,
    }))
}

async fn load_schedule(
    conn: &mut SqliteConnection,
    sched: &str,
    key: &TriggerKey,
    trigger_type: &str,
) -> Result<Option<Schedule>> {
    match trigger_type {
        "SIMPLE" => {
            let Some(row) = sqlx::query(
                r#"SELECT repeat_count, repeat_interval, times_triggered FROM qrtz_simple_triggers
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?;"#,
            )
            .bind(sched)
            .bind(&key.group)
            .bind(&key.name)
            .fetch_optional(&mut *conn)
            .await?
            else {
                return Ok(None);
            };
            Ok(Some(Schedule::Simple(SimpleSchedule {
                repeat_interval: row.try_get("repeat_interval")?,
                repeat_count: row.try_get::<i64, _>("repeat_count")? as i32,
                times_triggered: row.try_get::<i64, _>("times_triggered")? as i32,
                misfire_policy: Default::default(),
            })))
        }
        "CRON" => {
            let Some(row) = sqlx::query(
                r#"SELECT cron_expression, time_zone_id FROM qrtz_cron_triggers
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?;"#,
            )
            .bind(sched)
            .bind(&key.group)
            .bind(&key.name)
            .fetch_optional(&mut *conn)
            .await?
            else {
                return Ok(None);
            };
            let tz: Option<String> = row.try_get("time_zone_id")?;
            Ok(Some(Schedule::Cron(CronSchedule {
                cron_expression: row.try_get("cron_expression")?,
                time_zone: tz_from_str(tz.as_deref().unwrap_or("UTC")),
                misfire_policy: Default::default(),
            })))
        }
        _ => {
            let Some(row) = sqlx::query(
                r#"SELECT str_prop_1, str_prop_2, str_prop_3, int_prop_1, int_prop_2,
       long_prop_1, long_prop_2, bool_prop_1, bool_prop_2, time_zone_id
FROM qrtz_simprop_triggers
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?;"#,
            )
            .bind(sched)
            .bind(&key.group)
            .bind(&key.name)
            .fetch_optional(&mut *conn)
            .await?
            else {
                return Ok(None);
            };
            let simprop = SimpropRow {
                str1: row.try_get("str_prop_1")?,
                str2: row.try_get("str_prop_2")?,
                str3: row.try_get("str_prop_3")?,
                int1: row.try_get("int_prop_1")?,
                int2: row.try_get("int_prop_2")?,
                long1: row.try_get("long_prop_1")?,
                long2: row.try_get("long_prop_2")?,
                bool1: row.try_get("bool_prop_1")?,
                bool2: row.try_get("bool_prop_2")?,
                time_zone_id: row.try_get("time_zone_id")?,
            };
            Ok(schedule_from_simprop(trigger_type, simprop))
        }
    }
}

async fn job_exists_in(conn: &mut SqliteConnection, sched: &str, key: &JobKey) -> Result<bool> {
    let row = sqlx::query(
        r#"SELECT 1 AS one FROM qrtz_job_details WHERE sched_name = ? AND job_group = ? AND job_name = ?;"#,
    )
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.is_some())
}

async fn insert_job(conn: &mut SqliteConnection, sched: &str, job: &JobDetail) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO qrtz_job_details
(sched_name, job_group, job_name, description, job_type, is_durable, is_nonconcurrent, is_update_data, requests_recovery, job_data)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"#,
    )
    .bind(sched)
    .bind(&job.key.group)
    .bind(&job.key.name)
    .bind(&job.description)
    .bind(&job.job_type)
    .bind(job.durable)
    .bind(job.concurrent_execution_disallowed)
    .bind(job.persist_job_data_after_execution)
    .bind(job.request_recovery)
    .bind(json::to_string(&job.job_data)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update_job(conn: &mut SqliteConnection, sched: &str, job: &JobDetail) -> Result<()> {
    sqlx::query(
        r#"UPDATE qrtz_job_details
SET description = ?, job_type = ?, is_durable = ?, is_nonconcurrent = ?, is_update_data = ?, requests_recovery = ?, job_data = ?
WHERE sched_name = ? AND job_group = ? AND job_name = ?;"#,
    )
    .bind(&job.description)
    .bind(&job.job_type)
    .bind(job.durable)
    .bind(job.concurrent_execution_disallowed)
    .bind(job.persist_job_data_after_execution)
    .bind(job.request_recovery)
    .bind(json::to_string(&job.job_data)?)
    .bind(sched)
    .bind(&job.key.group)
    .bind(&job.key.name)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Inserts the trigger row plus its schedule subtype row, with the trigger's
/// current in-memory state.
async fn insert_trigger(conn: &mut SqliteConnection, sched: &str, trigger: &Trigger) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO qrtz_triggers
(sched_name, trigger_group, trigger_name, job_group, job_name, description, next_fire_time, prev_fire_time,
 priority, trigger_state, trigger_type, start_time, end_time, calendar_name, misfire_instr, job_data)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"#,
    )
    .bind(sched)
    .bind(&trigger.key.group)
    .bind(&trigger.key.name)
    .bind(&trigger.job_key.group)
    .bind(&trigger.job_key.name)
    .bind(&trigger.description)
    .bind(time::option_to_millis(trigger.next_fire_time))
    .bind(time::option_to_millis(trigger.previous_fire_time))
    .bind(trigger.priority)
    .bind(trigger.state.as_str())
    .bind(trigger.schedule.trigger_type())
    .bind(time::to_millis(trigger.start_time))
    .bind(time::option_to_millis(trigger.end_time))
    .bind(&trigger.calendar_name)
    .bind(trigger.schedule.misfire_code())
    .bind(json::to_string(&trigger.job_data)?)
    .execute(&mut *conn)
    .await?;
    insert_schedule(conn, sched, trigger).await
}

async fn insert_schedule(conn: &mut SqliteConnection, sched: &str, trigger: &Trigger) -> Result<()> {
    match &trigger.schedule {
        Schedule::Simple(s) => {
            sqlx::query(
                r#"INSERT INTO qrtz_simple_triggers
(sched_name, trigger_group, trigger_name, repeat_count, repeat_interval, times_triggered)
VALUES (?, ?, ?, ?, ?, ?);"#,
            )
            .bind(sched)
            .bind(&trigger.key.group)
            .bind(&trigger.key.name)
            .bind(s.repeat_count as i64)
            .bind(s.repeat_interval)
            .bind(s.times_triggered as i64)
            .execute(&mut *conn)
            .await?;
        }
        Schedule::Cron(s) => {
            sqlx::query(
                r#"INSERT INTO qrtz_cron_triggers
(sched_name, trigger_group, trigger_name, cron_expression, time_zone_id)
VALUES (?, ?, ?, ?, ?);"#,
            )
            .bind(sched)
            .bind(&trigger.key.group)
            .bind(&trigger.key.name)
            .bind(&s.cron_expression)
            .bind(s.time_zone.name())
            .execute(&mut *conn)
            .await?;
        }
        _ => {
            let Some(row) = simprop_from_schedule(&trigger.schedule) else {
                return Err(Error::JobPersistence(format!(
                    "trigger {} has no persistable schedule",
                    trigger.key
                )));
            };
            sqlx::query(
                r#"INSERT INTO qrtz_simprop_triggers
(sched_name, trigger_group, trigger_name, str_prop_1, str_prop_2, str_prop_3,
 int_prop_1, int_prop_2, long_prop_1, long_prop_2, bool_prop_1, bool_prop_2, time_zone_id)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"#,
            )
            .bind(sched)
            .bind(&trigger.key.group)
            .bind(&trigger.key.name)
            .bind(&row.str1)
            .bind(&row.str2)
            .bind(&row.str3)
            .bind(row.int1)
            .bind(row.int2)
            .bind(row.long1)
            .bind(row.long2)
            .bind(row.bool1)
            .bind(row.bool2)
            .bind(&row.time_zone_id)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

/// Full update of the trigger row and its subtype row.
async fn update_trigger(conn: &mut SqliteConnection, sched: &str, trigger: &Trigger) -> Result<()> {
    sqlx::query(
        r#"UPDATE qrtz_triggers
SET job_group = ?, job_name = ?, description = ?, next_fire_time = ?, prev_fire_time = ?,
    priority = ?, trigger_state = ?, trigger_type = ?, start_time = ?, end_time = ?,
    calendar_name = ?, misfire_instr = ?, job_data = ?
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?;"#,
    )
    .bind(&trigger.job_key.group)
    .bind(&trigger.job_key.name)
    .bind(&trigger.description)
    .bind(time::option_to_millis(trigger.next_fire_time))
    .bind(time::option_to_millis(trigger.previous_fire_time))
    .bind(trigger.priority)
    .bind(trigger.state.as_str())
    .bind(trigger.schedule.trigger_type())
    .bind(time::to_millis(trigger.start_time))
    .bind(time::option_to_millis(trigger.end_time))
    .bind(&trigger.calendar_name)
    .bind(trigger.schedule.misfire_code())
    .bind(json::to_string(&trigger.job_data)?)
    .bind(sched)
    .bind(&trigger.key.group)
    .bind(&trigger.key.name)
    .execute(&mut *conn)
    .await?;
    delete_schedule_rows(conn, sched, &trigger.key).await?;
    insert_schedule(conn, sched, trigger).await
}

async fn delete_schedule_rows(
    conn: &mut SqliteConnection,
    sched: &str,
    key: &TriggerKey,
) -> Result<()> {
    for table in [
        "qrtz_simple_triggers",
        "qrtz_cron_triggers",
        "qrtz_simprop_triggers",
        "qrtz_blob_triggers",
    ] {
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?;"
        ))
        .bind(sched)
        .bind(&key.group)
        .bind(&key.name)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn delete_trigger_rows(conn: &mut SqliteConnection, sched: &str, key: &TriggerKey) -> Result<u64> {
    let deleted = sqlx::query(
        r#"DELETE FROM qrtz_triggers WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?;"#,
    )
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(deleted)
}

/// Removes a trigger and, when it was the last reference to a non-durable
/// job, the job as well.
async fn remove_trigger_in(conn: &mut SqliteConnection, sched: &str, key: &TriggerKey) -> Result<bool> {
    let Some(trigger) = load_trigger(conn, sched, key).await? else {
        return Ok(false);
    };
    delete_trigger_rows(conn, sched, key).await?;
    let remaining: i64 = sqlx::query_scalar(
        r#"SELECT COUNT(*) FROM qrtz_triggers WHERE sched_name = ? AND job_group = ? AND job_name = ?;"#,
    )
    .bind(sched)
    .bind(&trigger.job_key.group)
    .bind(&trigger.job_key.name)
    .fetch_one(&mut *conn)
    .await?;
    if remaining == 0 {
        sqlx::query(
            r#"DELETE FROM qrtz_job_details
WHERE sched_name = ? AND job_group = ? AND job_name = ? AND is_durable = false;"#,
        )
        .bind(sched)
        .bind(&trigger.job_key.group)
        .bind(&trigger.job_key.name)
        .execute(&mut *conn)
        .await?;
    }
    Ok(true)
}

async fn store_trigger_in(
    conn: &mut SqliteConnection,
    sched: &str,
    trigger: &Trigger,
    replace_existing: bool,
) -> Result<()> {
    let existing = sqlx::query(
        r#"SELECT trigger_state FROM qrtz_triggers WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?;"#,
    )
    .bind(sched)
    .bind(&trigger.key.group)
    .bind(&trigger.key.name)
    .fetch_optional(&mut *conn)
    .await?;
    if existing.is_some() && !replace_existing {
        return Err(Error::ObjectAlreadyExists(trigger.key.to_string()));
    }
    let Some(job_row) = sqlx::query(
        r#"SELECT is_nonconcurrent FROM qrtz_job_details WHERE sched_name = ? AND job_group = ? AND job_name = ?;"#,
    )
    .bind(sched)
    .bind(&trigger.job_key.group)
    .bind(&trigger.job_key.name)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Err(Error::JobPersistence(format!(
            "trigger {} references missing job {}",
            trigger.key, trigger.job_key
        )));
    };
    let nonconcurrent: bool = job_row.try_get("is_nonconcurrent")?;

    let paused = sqlx::query(
        r#"SELECT 1 AS one FROM qrtz_paused_trigger_grps WHERE sched_name = ? AND trigger_group IN (?, ?);"#,
    )
    .bind(sched)
    .bind(&trigger.key.group)
    .bind(ALL_GROUPS_PAUSED)
    .fetch_optional(&mut *conn)
    .await?
    .is_some();
    let blocked = if nonconcurrent {
        let blocked_siblings: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM qrtz_triggers
WHERE sched_name = ? AND job_group = ? AND job_name = ?
  AND trigger_state IN ('EXECUTING', 'BLOCKED', 'PAUSED_BLOCKED');"#,
        )
        .bind(sched)
        .bind(&trigger.job_key.group)
        .bind(&trigger.job_key.name)
        .fetch_one(&mut *conn)
        .await?;
        blocked_siblings > 0
    } else {
        false
    };
    let mut stored = trigger.clone();
    stored.fired_entry_id = None;
    stored.state = match (paused, blocked) {
        (true, true) => TriggerState::PausedBlocked,
        (true, false) => TriggerState::Paused,
        (false, true) => TriggerState::Blocked,
        (false, false) => TriggerState::Waiting,
    };
    if existing.is_some() {
        update_trigger(conn, sched, &stored).await?;
    } else {
        insert_trigger(conn, sched, &stored).await?;
    }
    Ok(())
}

async fn set_trigger_state(
    conn: &mut SqliteConnection,
    sched: &str,
    key: &TriggerKey,
    state: &str,
) -> Result<()> {
    sqlx::query(&format!(
        "UPDATE qrtz_triggers SET trigger_state = '{state}' WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?;"
    ))
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn set_job_trigger_states(
    conn: &mut SqliteConnection,
    sched: &str,
    key: &JobKey,
    state: &str,
) -> Result<()> {
    sqlx::query(&format!(
        "UPDATE qrtz_triggers SET trigger_state = '{state}' WHERE sched_name = ? AND job_group = ? AND job_name = ?;"
    ))
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn unblock_job_triggers(conn: &mut SqliteConnection, sched: &str, key: &JobKey) -> Result<()> {
    sqlx::query(
        r#"UPDATE qrtz_triggers SET trigger_state = 'WAITING'
WHERE sched_name = ? AND job_group = ? AND job_name = ? AND trigger_state = 'BLOCKED';"#,
    )
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        r#"UPDATE qrtz_triggers SET trigger_state = 'PAUSED'
WHERE sched_name = ? AND job_group = ? AND job_name = ? AND trigger_state = 'PAUSED_BLOCKED';"#,
    )
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn pause_trigger_in(conn: &mut SqliteConnection, sched: &str, key: &TriggerKey) -> Result<()> {
    sqlx::query(
        r#"UPDATE qrtz_triggers SET trigger_state = 'PAUSED'
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ?
  AND trigger_state IN ('WAITING', 'ACQUIRED', 'EXECUTING');"#,
    )
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        r#"UPDATE qrtz_triggers SET trigger_state = 'PAUSED_BLOCKED'
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ? AND trigger_state = 'BLOCKED';"#,
    )
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn resume_trigger_in(conn: &mut SqliteConnection, sched: &str, key: &TriggerKey) -> Result<()> {
    sqlx::query(
        r#"UPDATE qrtz_triggers SET trigger_state = 'WAITING'
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ? AND trigger_state = 'PAUSED';"#,
    )
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        r#"UPDATE qrtz_triggers SET trigger_state = 'BLOCKED'
WHERE sched_name = ? AND trigger_group = ? AND trigger_name = ? AND trigger_state = 'PAUSED_BLOCKED';"#,
    )
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .execute(&mut *conn)
    .await?;
    // a trigger that sat paused past the misfire threshold is re-planned
    let now = time::now();
    let threshold = config::get_config().job_store.misfire_threshold;
    if let Some(mut trigger) = load_trigger(conn, sched, key).await?
        && trigger.state == TriggerState::Waiting
        && let Some(next) = trigger.next_fire_time
        && time::to_millis(now) - time::to_millis(next) > threshold
        && trigger.schedule.misfire_code() != -1
    {
        let calendar = match &trigger.calendar_name {
            Some(cal) => load_calendar(conn, sched, cal).await?,
            None => None,
        };
        trigger.update_after_misfire_at(calendar.as_ref(), now);
        if trigger.next_fire_time.is_none() {
            trigger.state = TriggerState::Complete;
        }
        update_trigger(conn, sched, &trigger).await?;
    }
    Ok(())
}

async fn pause_job_in(conn: &mut SqliteConnection, sched: &str, key: &JobKey) -> Result<()> {
    let rows = sqlx::query(
        r#"SELECT trigger_group, trigger_name FROM qrtz_triggers WHERE sched_name = ? AND job_group = ? AND job_name = ?;"#,
    )
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .fetch_all(&mut *conn)
    .await?;
    for row in rows {
        let group: String = row.try_get("trigger_group")?;
        let name: String = row.try_get("trigger_name")?;
        pause_trigger_in(conn, sched, &TriggerKey::new(&name, &group)).await?;
    }
    Ok(())
}

async fn resume_job_in(conn: &mut SqliteConnection, sched: &str, key: &JobKey) -> Result<()> {
    let rows = sqlx::query(
        r#"SELECT trigger_group, trigger_name FROM qrtz_triggers WHERE sched_name = ? AND job_group = ? AND job_name = ?;"#,
    )
    .bind(sched)
    .bind(&key.group)
    .bind(&key.name)
    .fetch_all(&mut *conn)
    .await?;
    for row in rows {
        let group: String = row.try_get("trigger_group")?;
        let name: String = row.try_get("trigger_name")?;
        resume_trigger_in(conn, sched, &TriggerKey::new(&name, &group)).await?;
    }
    Ok(())
}
