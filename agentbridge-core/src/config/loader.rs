//! Configuration loading and validation.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::error::ConfigError;
use super::schema::Config;

/// Configuration file search paths (in priority order).
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = std::env::var("AGENTBRIDGE_CONFIG") {
        paths.push(PathBuf::from(path));
    }
    paths.push(PathBuf::from("/etc/agentbridge/config.yaml"));
    paths.push(PathBuf::from("./config.yaml"));

    paths
}

/// Find the first existing config file.
///
/// An explicit path (the `--config` flag) must exist; otherwise the default
/// paths are searched in order.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::ConfigFileNotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    let paths = default_config_paths();
    for path in &paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    Err(ConfigError::ConfigFileNotFound { searched: paths })
}

/// Load configuration from a file path without validating it.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse configuration from YAML text after env substitution.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }

    let contents = substitute_env_vars(contents)?;
    let config: Config = serde_saphyr::from_str(&contents)?;
    Ok(config)
}

/// Load and validate configuration.
pub fn load_and_validate(path: &Path) -> Result<Config, ConfigError> {
    let config = load_config(path)?;
    validate(&config)?;
    Ok(config)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Variable Substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// SAFETY: .expect() on LazyLock with a compile-time literal regex pattern.
// The pattern is known-valid and tested by test_env_var_pattern_compiles().
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Substitute environment variables in a string.
///
/// # Syntax
/// - `${VAR}` - Required, fail if not set
/// - `${VAR:-default}` - Optional with default
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing = None;

    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => value,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| var_name.to_string());
                    String::new()
                }
            },
        }
    });

    match missing {
        Some(var) => Err(ConfigError::MissingEnvVar { var }),
        None => Ok(result.into_owned()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate a parsed configuration. The first violation is returned.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.schema != 1 {
        return Err(ConfigError::UnsupportedSchemaVersion {
            version: config.schema,
        });
    }

    if config.registry.topic.trim().is_empty() {
        return Err(ConfigError::EmptyRegistryTopic);
    }
    if config.registry.max_entries == 0 {
        return Err(ConfigError::ZeroValue {
            field: "registry.max_entries",
        });
    }

    if config.topics.partitions == 0 {
        return Err(ConfigError::ZeroValue {
            field: "topics.partitions",
        });
    }
    if config.topics.replication_factor == 0 {
        return Err(ConfigError::ZeroValue {
            field: "topics.replication_factor",
        });
    }
    if config.topics.admin_timeout.is_zero() {
        return Err(ConfigError::ZeroDuration {
            field: "topics.admin_timeout",
        });
    }

    let correlation = &config.correlation;
    if correlation.response_timeout.is_zero() {
        return Err(ConfigError::ZeroDuration {
            field: "correlation.response_timeout",
        });
    }
    if correlation.sweep_interval.is_zero() {
        return Err(ConfigError::ZeroDuration {
            field: "correlation.sweep_interval",
        });
    }
    if correlation.sweep_interval > correlation.response_timeout {
        return Err(ConfigError::SweepIntervalTooLarge {
            sweep_ms: correlation.sweep_interval.as_millis(),
            timeout_ms: correlation.response_timeout.as_millis(),
        });
    }
    if correlation.max_pending == 0 {
        return Err(ConfigError::ZeroValue {
            field: "correlation.max_pending",
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_env_var_pattern_compiles() {
        assert!(ENV_VAR_PATTERN.is_match("${FOO}"));
        assert!(ENV_VAR_PATTERN.is_match("${FOO:-bar}"));
        assert!(!ENV_VAR_PATTERN.is_match("$FOO"));
    }

    #[test]
    #[serial]
    fn test_substitute_env_vars() {
        // SAFETY: serialized with every other env-mutating test
        unsafe {
            std::env::set_var("AB_TEST_TOPIC", "_registry_from_env");
            std::env::remove_var("AB_TEST_UNSET");
        }

        let out = substitute_env_vars("topic: ${AB_TEST_TOPIC}\nport: ${AB_TEST_UNSET:-9090}").unwrap();
        assert_eq!(out, "topic: _registry_from_env\nport: 9090");

        let err = substitute_env_vars("topic: ${AB_TEST_UNSET}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar { var } if var == "AB_TEST_UNSET"));

        // SAFETY: serialized with every other env-mutating test
        unsafe { std::env::remove_var("AB_TEST_TOPIC") };
    }

    #[test]
    #[serial]
    fn test_load_full_config() {
        let file = write_config(
            r#"
schema: 1
registry:
  topic: _agents
  max_entries: 50
topics:
  partitions: 3
  replication_factor: 1
  admin_timeout: 5s
  configs:
    retention.ms: "-1"
correlation:
  response_timeout: 200ms
  sweep_interval: 50ms
  max_pending: 10
admin:
  bind: 127.0.0.1
  port: 9000
  shutdown_timeout: PT5S
"#,
        );

        let config = load_and_validate(file.path()).unwrap();
        assert_eq!(config.store_config().topic, "_agents");
        assert_eq!(config.store_config().max_entries, 50);

        let topics = config.topic_settings();
        assert_eq!(topics.partitions, 3);
        assert_eq!(topics.replication_factor, 1);
        assert_eq!(topics.admin_timeout, Duration::from_secs(5));
        assert_eq!(topics.configs.get("retention.ms").map(String::as_str), Some("-1"));

        let correlation = config.correlation_config();
        assert_eq!(correlation.response_timeout, Duration::from_millis(200));
        assert_eq!(correlation.sweep_interval, Duration::from_millis(50));
        assert_eq!(correlation.max_pending, 10);

        assert_eq!(
            config.admin.socket_addr(),
            Some("127.0.0.1:9000".parse().unwrap())
        );
        assert_eq!(config.admin.shutdown_timeout(), Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn test_minimal_config_uses_defaults() {
        let file = write_config("schema: 1\n");
        let config = load_and_validate(file.path()).unwrap();

        assert_eq!(config.registry.topic, "_agent_registry");
        assert_eq!(config.topics.partitions, 6);
        assert_eq!(config.topics.replication_factor, 3);
        assert_eq!(config.correlation.response_timeout, Duration::from_secs(10));
        assert_eq!(config.correlation.sweep_interval, Duration::from_millis(100));
        assert_eq!(config.admin.port, 8080);
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = write_config("   \n");
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::EmptyConfigFile)
        ));
    }

    #[test]
    #[serial]
    fn test_validation_errors() {
        let cases = [
            ("schema: 2\n", "unsupported schema version"),
            ("schema: 1\nregistry:\n  topic: \"  \"\n", "registry.topic"),
            ("schema: 1\ntopics:\n  partitions: 0\n", "topics.partitions"),
            ("schema: 1\ntopics:\n  replication_factor: 0\n", "topics.replication_factor"),
            ("schema: 1\ncorrelation:\n  response_timeout: 0s\n", "correlation.response_timeout"),
            (
                "schema: 1\ncorrelation:\n  response_timeout: 1s\n  sweep_interval: 2s\n",
                "sweep_interval",
            ),
        ];

        for (yaml, expected) in cases {
            let config = parse_config(yaml).unwrap();
            let err = validate(&config).unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "{yaml:?}: {err} does not mention {expected}"
            );
        }
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            parse_config("schema: 1\nregistery: {}\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let err = find_config_file(Some(Path::new("/nonexistent/agentbridge.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigFileNotFound { searched } if searched.len() == 1));
    }

    #[test]
    #[serial]
    fn test_env_path_searched_first() {
        let file = write_config("schema: 1\n");
        // SAFETY: serialized with every other env-mutating test
        unsafe { std::env::set_var("AGENTBRIDGE_CONFIG", file.path()) };

        assert_eq!(default_config_paths()[0], file.path());
        assert_eq!(find_config_file(None).unwrap(), file.path());

        // SAFETY: serialized with every other env-mutating test
        unsafe { std::env::remove_var("AGENTBRIDGE_CONFIG") };
    }
}
