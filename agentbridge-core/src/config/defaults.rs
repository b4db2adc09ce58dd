//! Centralized default values for bridge configuration.

use std::time::Duration;
use tracing::warn;

/// Defaults applied when the configuration file leaves a value out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDefaults {
    /// How long a request waits for its reply.
    pub response_timeout: Duration,

    /// Period of the overdue-request sweep.
    pub sweep_interval: Duration,

    /// Bound on each topic admin call.
    pub admin_timeout: Duration,

    /// Maximum time for graceful shutdown.
    pub shutdown_timeout: Duration,

    /// In-flight requests before the oldest is evicted.
    pub max_pending: usize,
}

impl Default for BridgeDefaults {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(100),
            admin_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            max_pending: 10_000,
        }
    }
}

impl BridgeDefaults {
    /// Create defaults from environment variables.
    ///
    /// # Environment Variables
    /// - `AGENTBRIDGE_RESPONSE_TIMEOUT_MS`
    /// - `AGENTBRIDGE_SWEEP_INTERVAL_MS`
    /// - `AGENTBRIDGE_ADMIN_TIMEOUT_MS`
    /// - `AGENTBRIDGE_SHUTDOWN_TIMEOUT_MS`
    /// - `AGENTBRIDGE_MAX_PENDING`
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            response_timeout: millis_env("AGENTBRIDGE_RESPONSE_TIMEOUT_MS", default.response_timeout),
            sweep_interval: millis_env("AGENTBRIDGE_SWEEP_INTERVAL_MS", default.sweep_interval),
            admin_timeout: millis_env("AGENTBRIDGE_ADMIN_TIMEOUT_MS", default.admin_timeout),
            shutdown_timeout: millis_env("AGENTBRIDGE_SHUTDOWN_TIMEOUT_MS", default.shutdown_timeout),
            max_pending: parse_env_warn("AGENTBRIDGE_MAX_PENDING", default.max_pending),
        }
    }

    /// Checks `sweep_interval <= response_timeout` and that nothing is zero.
    pub fn validate(&self) -> Result<(), String> {
        if self.response_timeout.is_zero() || self.sweep_interval.is_zero() {
            return Err("response_timeout and sweep_interval must be positive".to_string());
        }
        if self.sweep_interval > self.response_timeout {
            return Err(format!(
                "sweep_interval ({:?}) must not exceed response_timeout ({:?})",
                self.sweep_interval, self.response_timeout
            ));
        }
        if self.max_pending == 0 {
            return Err("max_pending must be greater than zero".to_string());
        }
        Ok(())
    }
}

fn millis_env(name: &str, default: Duration) -> Duration {
    let millis = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(parse_env_warn(name, millis))
}

/// Parse an environment variable with a warning on invalid values.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "AGENTBRIDGE_RESPONSE_TIMEOUT_MS",
            "AGENTBRIDGE_SWEEP_INTERVAL_MS",
            "AGENTBRIDGE_ADMIN_TIMEOUT_MS",
            "AGENTBRIDGE_SHUTDOWN_TIMEOUT_MS",
            "AGENTBRIDGE_MAX_PENDING",
        ] {
            // SAFETY: serialized with every other env-mutating test
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn test_defaults() {
        let defaults = BridgeDefaults::default();
        assert_eq!(defaults.response_timeout, Duration::from_secs(10));
        assert_eq!(defaults.sweep_interval, Duration::from_millis(100));
        assert_eq!(defaults.max_pending, 10_000);
        assert!(defaults.validate().is_ok());
    }

    #[test]
    fn test_validate_sweep_interval() {
        let defaults = BridgeDefaults {
            sweep_interval: Duration::from_secs(20),
            ..Default::default()
        };
        assert!(defaults.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        // SAFETY: serialized with every other env-mutating test
        unsafe {
            std::env::set_var("AGENTBRIDGE_RESPONSE_TIMEOUT_MS", "200");
            std::env::set_var("AGENTBRIDGE_SWEEP_INTERVAL_MS", "not-a-number");
        }

        let defaults = BridgeDefaults::from_env();
        assert_eq!(defaults.response_timeout, Duration::from_millis(200));
        assert_eq!(defaults.sweep_interval, Duration::from_millis(100));
        clear_env();
    }
}
