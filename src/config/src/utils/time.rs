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

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;

/// All fire-time arithmetic reads the clock through this capability so tests
/// can inject a virtual one.
pub trait TimeProvider: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock for tests.
pub struct FixedTimeProvider(pub DateTime<Utc>);

impl TimeProvider for FixedTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

static PROVIDER: Lazy<ArcSwap<Arc<dyn TimeProvider>>> =
    Lazy::new(|| ArcSwap::from(Arc::new(Arc::new(SystemTimeProvider) as Arc<dyn TimeProvider>)));

pub fn set_time_provider(provider: Arc<dyn TimeProvider>) {
    PROVIDER.store(Arc::new(provider));
}

pub fn reset_time_provider() {
    PROVIDER.store(Arc::new(Arc::new(SystemTimeProvider) as Arc<dyn TimeProvider>));
}

#[inline(always)]
pub fn now() -> DateTime<Utc> {
    PROVIDER.load().now()
}

#[inline(always)]
pub fn now_millis() -> i64 {
    now().timestamp_millis()
}

/// Fire times are stored as signed 64-bit millisecond ticks since Unix epoch.
#[inline(always)]
pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

#[inline(always)]
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[inline(always)]
pub fn option_to_millis(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(to_millis)
}

#[inline(always)]
pub fn option_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip() {
        let t = Utc.with_ymd_and_hms(2024, 7, 15, 5, 0, 0).unwrap();
        assert_eq!(from_millis(to_millis(t)), t);
    }

    #[test]
    fn test_fixed_provider() {
        let t = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let p = FixedTimeProvider(t);
        assert_eq!(p.now(), t);
    }
}
