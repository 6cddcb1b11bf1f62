//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "relay.toml",
    "config.toml",
    "./config/relay.toml",
    "/etc/relay/relay.toml",
];

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "RELAY_CONFIG";

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) but reads overrides through `lookup`
    pub fn load_with<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file(&lookup)? {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, &lookup)?;

        Ok(config)
    }

    fn find_config_file<F>(&self, lookup: &F) -> Result<Option<PathBuf>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // An explicitly requested file must exist
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::ValidationError(format!(
                "config file {} not found",
                path.display()
            )));
        }

        if let Some(path) = lookup(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(ConfigError::EnvError(format!(
                "{} points at missing file {}",
                CONFIG_ENV,
                path.display()
            )));
        }

        Ok(CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvError(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(None),
    }
}

fn apply_overrides<F>(config: &mut AppConfig, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // HTTP
    if let Some(port) = parse_var(lookup, "RELAY_HTTP_PORT")? {
        config.http.port = port;
    }
    if let Some(host) = lookup("RELAY_HTTP_HOST") {
        config.http.host = host;
    }

    // Logging
    if let Some(format) = lookup("RELAY_LOG_FORMAT") {
        config.logging.format = format;
    }

    // Dispatch
    if let Some(size) = parse_var(lookup, "RELAY_CHUNK_SIZE")? {
        config.dispatch.chunk_size = size;
    }
    if let Some(interval) = parse_var(lookup, "RELAY_POLL_INTERVAL_MS")? {
        config.dispatch.poll_interval_ms = interval;
    }
    if let Some(timeout) = parse_var(lookup, "RELAY_DELIVERY_TIMEOUT_SECS")? {
        config.dispatch.delivery_timeout_secs = timeout;
    }

    // Notifications
    if let Some(recipients) = lookup("RELAY_NOTIFY_RECIPIENTS") {
        config.notifications.recipients = recipients
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        config.notifications.enabled = !config.notifications.recipients.is_empty();
    }
    if let Some(url) = lookup("RELAY_SMTP_URL") {
        config.notifications.smtp_url = url;
    }
    if let Some(from) = lookup("RELAY_NOTIFY_FROM") {
        config.notifications.from = from;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_explicit_path() {
        let file = write_config(&AppConfig::example_toml());
        let config = ConfigLoader::with_path(file.path())
            .load_with(lookup_from(&[]))
            .unwrap();
        assert_eq!(config.stores.len(), 2);
        assert_eq!(config.http.port, 9090);
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let result = ConfigLoader::with_path("/nonexistent/relay.toml").load_with(lookup_from(&[]));
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let file = write_config(&AppConfig::example_toml());
        let config = ConfigLoader::with_path(file.path())
            .load_with(lookup_from(&[
                ("RELAY_CHUNK_SIZE", "50"),
                ("RELAY_POLL_INTERVAL_MS", "250"),
                ("RELAY_HTTP_PORT", "8081"),
                ("RELAY_LOG_FORMAT", "json"),
                ("RELAY_NOTIFY_RECIPIENTS", "a@example.org, b@example.org"),
            ]))
            .unwrap();

        assert_eq!(config.dispatch.chunk_size, 50);
        assert_eq!(config.dispatch.poll_interval_ms, 250);
        assert_eq!(config.http.port, 8081);
        assert_eq!(config.logging.format, "json");
        assert!(config.notifications.enabled);
        assert_eq!(
            config.notifications.recipients,
            vec!["a@example.org".to_string(), "b@example.org".to_string()]
        );
    }

    #[test]
    fn test_invalid_env_value_is_rejected() {
        let file = write_config(&AppConfig::example_toml());
        let err = ConfigLoader::with_path(file.path())
            .load_with(lookup_from(&[("RELAY_CHUNK_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EnvError(_)));
    }

    #[test]
    fn test_config_env_var_points_at_file() {
        let file = write_config(&AppConfig::example_toml());
        let path = file.path().to_string_lossy().to_string();
        let config = ConfigLoader::new()
            .load_with(lookup_from(&[(CONFIG_ENV, path.as_str())]))
            .unwrap();
        assert!(config.stores.contains_key("default"));
    }
}
