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

use once_cell::sync::Lazy;
use svix_ksuid::{Ksuid, KsuidLike};

use crate::utils::rand::generate_random_string;

/// Resolved once per process: either the configured instance id, or a
/// generated one when `quartz.scheduler.instanceId` is `AUTO`.
static INSTANCE_ID: Lazy<String> = Lazy::new(|| {
    let cfg = crate::get_config();
    if cfg.scheduler.instance_id.is_empty() || cfg.scheduler.instance_id == "AUTO" {
        format!("{}-{}", hostname(), generate())
    } else {
        cfg.scheduler.instance_id.clone()
    }
});

pub fn init() -> Result<(), anyhow::Error> {
    _ = generate();
    _ = instance_id();
    Ok(())
}

/// Generates a unique, roughly time-ordered id. Used for fired-trigger entry
/// ids and AUTO instance ids.
pub fn generate() -> String {
    format!("{}{}", Ksuid::new(None, None), generate_random_string(6))
}

pub fn instance_id() -> &'static str {
    INSTANCE_ID.as_str()
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = generate();
        assert_ne!(id, "");
        assert_ne!(generate(), generate());
    }

    #[test]
    fn test_instance_id_stable() {
        assert_eq!(instance_id(), instance_id());
    }
}
