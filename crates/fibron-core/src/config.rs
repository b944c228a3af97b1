//! Core replica configuration.
//!
//! Every replica carries a stable instance id, the key prefix under which
//! ownership leases are written, and the reservation TTL. Defaults can be
//! overridden through environment variables.

use serde::{Deserialize, Serialize};

/// Default reservation TTL in seconds.
pub const DEFAULT_RESERVATION_TTL_SECS: u64 = 10;

/// Default ownership lease key prefix.
pub const DEFAULT_OWNERSHIP_PREFIX: &str = "service/fibron/_core/ownership";

/// Environment variable names.
pub mod env_vars {
    pub const INSTANCE_ID: &str = "FIBRON_INSTANCE_ID";
    pub const OWNERSHIP_PREFIX: &str = "FIBRON_OWNERSHIP_PREFIX";
    pub const RESERVATION_TTL_SECS: &str = "FIBRON_RESERVATION_TTL_SECS";
}

/// Configuration for one core replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Stable identifier of this replica; the value written into ownership
    /// leases.
    pub instance_id: String,
    /// Key prefix for ownership leases (`<prefix>_<device_id>`).
    pub ownership_prefix: String,
    /// Reservation TTL in seconds.
    pub reservation_ttl_secs: u64,
}

impl CoreConfig {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ownership_prefix: DEFAULT_OWNERSHIP_PREFIX.to_string(),
            reservation_ttl_secs: DEFAULT_RESERVATION_TTL_SECS,
        }
    }

    /// Build a config from the environment, generating an instance id when
    /// none is set.
    pub fn from_env() -> Self {
        let instance_id = std::env::var(env_vars::INSTANCE_ID)
            .unwrap_or_else(|_| format!("core-{}", uuid::Uuid::new_v4()));
        let ownership_prefix = std::env::var(env_vars::OWNERSHIP_PREFIX)
            .unwrap_or_else(|_| DEFAULT_OWNERSHIP_PREFIX.to_string());
        let reservation_ttl_secs = std::env::var(env_vars::RESERVATION_TTL_SECS)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RESERVATION_TTL_SECS);
        Self {
            instance_id,
            ownership_prefix,
            reservation_ttl_secs,
        }
    }

    pub fn with_ownership_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ownership_prefix = prefix.into();
        self
    }

    pub fn with_reservation_ttl_secs(mut self, secs: u64) -> Self {
        self.reservation_ttl_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::new("core-1");
        assert_eq!(config.instance_id, "core-1");
        assert_eq!(config.reservation_ttl_secs, DEFAULT_RESERVATION_TTL_SECS);
        assert_eq!(config.ownership_prefix, DEFAULT_OWNERSHIP_PREFIX);
    }

    #[test]
    fn test_builders() {
        let config = CoreConfig::new("core-2")
            .with_ownership_prefix("test/ownership")
            .with_reservation_ttl_secs(3);
        assert_eq!(config.ownership_prefix, "test/ownership");
        assert_eq!(config.reservation_ttl_secs, 3);
    }
}
