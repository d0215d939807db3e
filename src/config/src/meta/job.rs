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

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_GROUP, meta::key::JobKey, utils::json};

/// Mutable job payload. Jobs receive a snapshot unless the owning job is
/// marked concurrent-disallowed, in which case mutations are written back by
/// the store on completion when `persist_job_data_after_execution` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDataMap(pub json::Map<String, json::Value>);

impl JobDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(|v| v.as_i64())
    }

    pub fn put<V: Into<json::Value>>(&mut self, key: &str, value: V) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<json::Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Overlays `other` onto `self`, keeping `other`'s values on conflict.
    pub fn merge(&mut self, other: &JobDataMap) {
        for (k, v) in other.0.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

/// Metadata describing a job type and its initial data. The job type is a
/// descriptor string resolved through a `JobFactory` at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: JobKey,
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub concurrent_execution_disallowed: bool,
    #[serde(default)]
    pub persist_job_data_after_execution: bool,
    #[serde(default)]
    pub request_recovery: bool,
    #[serde(default)]
    pub job_data: JobDataMap,
}

impl JobDetail {
    pub fn builder() -> JobBuilder {
        JobBuilder::new()
    }
}

/// Fluent construction of a `JobDetail`:
///
/// ```
/// use config::meta::job::JobBuilder;
///
/// let job = JobBuilder::new()
///     .of_type("examples::SendReport")
///     .with_identity("send-report", "reports")
///     .store_durably()
///     .request_recovery()
///     .using_job_data("recipient", "ops@example.com")
///     .build();
/// assert!(job.durable);
/// ```
#[derive(Debug, Clone, Default)]
pub struct JobBuilder {
    key: Option<JobKey>,
    job_type: String,
    description: Option<String>,
    durable: bool,
    concurrent_execution_disallowed: bool,
    persist_job_data_after_execution: bool,
    request_recovery: bool,
    job_data: JobDataMap,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(mut self, job_type: &str) -> Self {
        self.job_type = job_type.to_string();
        self
    }

    pub fn with_identity(mut self, name: &str, group: &str) -> Self {
        self.key = Some(JobKey::new(name, group));
        self
    }

    pub fn with_key(mut self, key: JobKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn store_durably(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn disallow_concurrent_execution(mut self) -> Self {
        self.concurrent_execution_disallowed = true;
        self
    }

    pub fn persist_job_data_after_execution(mut self) -> Self {
        self.persist_job_data_after_execution = true;
        self
    }

    pub fn request_recovery(mut self) -> Self {
        self.request_recovery = true;
        self
    }

    pub fn using_job_data<V: Into<json::Value>>(mut self, key: &str, value: V) -> Self {
        self.job_data.put(key, value);
        self
    }

    pub fn set_job_data(mut self, data: JobDataMap) -> Self {
        self.job_data = data;
        self
    }

    pub fn build(self) -> JobDetail {
        let key = self
            .key
            .unwrap_or_else(|| JobKey::new(&crate::ider::generate(), DEFAULT_GROUP));
        JobDetail {
            key,
            job_type: self.job_type,
            description: self.description,
            durable: self.durable,
            concurrent_execution_disallowed: self.concurrent_execution_disallowed,
            persist_job_data_after_execution: self.persist_job_data_after_execution,
            request_recovery: self.request_recovery,
            job_data: self.job_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_builder() {
        let job = JobBuilder::new()
            .of_type("examples::Cleanup")
            .with_identity("cleanup", "maintenance")
            .store_durably()
            .disallow_concurrent_execution()
            .using_job_data("keep_days", 30)
            .build();
        assert_eq!(job.key, JobKey::new("cleanup", "maintenance"));
        assert_eq!(job.job_type, "examples::Cleanup");
        assert!(job.durable);
        assert!(job.concurrent_execution_disallowed);
        assert!(!job.request_recovery);
        assert_eq!(job.job_data.get_i64("keep_days"), Some(30));
    }

    #[test]
    fn test_data_map_merge() {
        let mut a = JobDataMap::new();
        a.put("x", 1);
        a.put("y", "keep");
        let mut b = JobDataMap::new();
        b.put("x", 2);
        a.merge(&b);
        assert_eq!(a.get_i64("x"), Some(2));
        assert_eq!(a.get_str("y"), Some("keep"));
    }

    #[test]
    fn test_job_detail_serde_round_trip() {
        let job = JobBuilder::new()
            .of_type("examples::Cleanup")
            .with_identity("cleanup", "maintenance")
            .persist_job_data_after_execution()
            .using_job_data("keep_days", 30)
            .build();
        let s = json::to_string(&job).unwrap();
        let back: JobDetail = json::from_str(&s).unwrap();
        assert_eq!(job, back);
    }
}
