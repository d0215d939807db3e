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

use crate::DEFAULT_GROUP;

/// Identity of a stored job: `(group, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub group: String,
    pub name: String,
}

impl JobKey {
    pub fn new(name: &str, group: &str) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
        }
    }

    pub fn with_default_group(name: &str) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Identity of a stored trigger: `(group, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub group: String,
    pub name: String,
}

impl TriggerKey {
    pub fn new(name: &str, group: &str) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
        }
    }

    pub fn with_default_group(name: &str) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl std::fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Group predicate used by the enumeration and pause/resume group operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMatcher {
    Equals(String),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    Any,
}

impl GroupMatcher {
    pub fn group_equals(group: &str) -> Self {
        Self::Equals(group.to_string())
    }

    pub fn matches(&self, group: &str) -> bool {
        match self {
            Self::Equals(v) => group == v,
            Self::StartsWith(v) => group.starts_with(v.as_str()),
            Self::EndsWith(v) => group.ends_with(v.as_str()),
            Self::Contains(v) => group.contains(v.as_str()),
            Self::Any => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = JobKey::with_default_group("reindex");
        assert_eq!(key.to_string(), "DEFAULT.reindex");
        let key = TriggerKey::new("nightly", "maintenance");
        assert_eq!(key.to_string(), "maintenance.nightly");
    }

    #[test]
    fn test_group_matcher() {
        assert!(GroupMatcher::group_equals("etl").matches("etl"));
        assert!(!GroupMatcher::group_equals("etl").matches("etl2"));
        assert!(GroupMatcher::StartsWith("etl".into()).matches("etl2"));
        assert!(GroupMatcher::EndsWith("2".into()).matches("etl2"));
        assert!(GroupMatcher::Contains("tl".into()).matches("etl2"));
        assert!(GroupMatcher::Any.matches("anything"));
    }
}
