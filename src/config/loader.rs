//! Configuration loading for cgtproxy
//!
//! Loads a JSON configuration file, applies serde defaults and runs
//! validation. The rest of the crate only ever sees a validated,
//! immutable [`Config`].

use std::fs;
use std::path::Path;

use tracing::debug;

use super::types::Config;
use crate::error::ConfigError;

/// Load and validate a configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file is missing, malformed or fails
/// validation.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = fs::read_to_string(path)?;
    let config: Config =
        serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;
    debug!(
        "loaded configuration: {} listeners, {} rules, root {}",
        config.tproxies.len(),
        config.rules.len(),
        config.cgroup_root.display()
    );

    Ok(config)
}

/// Write a default configuration template to the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, DEFAULT_CONFIG)?;
    Ok(())
}

/// Default configuration template
const DEFAULT_CONFIG: &str = r#"{
    "cgroup_root": "/sys/fs/cgroup",
    "route_table": 300,
    "bypass": [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "::1",
        "fe80::/10"
    ],
    "tproxies": {
        "clash": {
            "port": 7893,
            "mark": 32,
            "allow_udp": true,
            "allow_ipv6": true,
            "dns_hijack": {
                "ip": "127.0.0.1",
                "port": 1053,
                "hijack_tcp": false
            }
        }
    },
    "rules": [
        { "match": "^/proxied\\.slice", "decision": { "tproxy": "clash" } },
        { "match": "^/blocked\\.slice", "decision": "drop" },
        { "match": ".*", "decision": "direct" }
    ],
    "monitor": {
        "event_buffer": 1024
    },
    "log": {
        "level": "info",
        "format": "text"
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file() {
        let result = load_config("/nonexistent/cgtproxy.json");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_default_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        create_default_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.route_table, 300);
        assert!(config.tproxies.contains_key("clash"));
        assert_eq!(config.rules.len(), 3);
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"{ not json").unwrap();

        let result = load_config(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validation_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invalid.json");
        fs::write(
            &path,
            r#"{ "cgroup_root": "relative/path" }"#,
        )
        .unwrap();

        let result = load_config(&path);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
