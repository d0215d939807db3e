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

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("IoError# {0}")]
    IoError(#[from] std::io::Error),
    #[error("DbError# {0}")]
    DbError(#[from] DbError),
    #[error("SerdeJsonError# {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("SqlxError# {0}")]
    SqlxError(#[from] sqlx::Error),
    #[error("SchedulerError# {0}")]
    SchedulerError(String),
    #[error("JobPersistenceError# {0}")]
    JobPersistence(String),
    #[error("ObjectAlreadyExists# {0}")]
    ObjectAlreadyExists(String),
    #[error("SchedulerConfigError# {0}")]
    Config(String),
    #[error("LockTimeoutError# lock {0} was not acquired within the timeout")]
    LockTimeout(String),
    #[error("ValidationError# {0}")]
    Validation(#[from] config::meta::trigger::ValidationError),
    #[error("Error# {0}")]
    Message(String),
    #[error("Not implemented")]
    NotImplemented,
}

impl Error {
    /// Deadlocks, serialization failures and lock timeouts are worth a
    /// bounded retry; everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::LockTimeout(_) => true,
            Error::SqlxError(sqlx::Error::Database(e)) => {
                let code = e.code().unwrap_or_default();
                // postgres deadlock/serialization, mysql deadlock/timeout
                matches!(code.as_ref(), "40P01" | "40001" | "1213" | "1205")
            }
            Error::SqlxError(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

#[derive(ThisError, Debug)]
pub enum DbError {
    #[error("key {0} does not exist")]
    KeyNotExists(String),
    #[error("error {0} performing operation on key {1}")]
    DBOperError(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ObjectAlreadyExists("DEFAULT.job1".to_string());
        assert_eq!("ObjectAlreadyExists# DEFAULT.job1", &err.to_string());

        let err = Error::from(DbError::KeyNotExists("DEFAULT.trigger1".to_string()));
        assert_eq!("DbError# key DEFAULT.trigger1 does not exist", &err.to_string());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::LockTimeout("TRIGGER_ACCESS".to_string()).is_retryable());
        assert!(!Error::Message("boom".to_string()).is_retryable());
    }
}
