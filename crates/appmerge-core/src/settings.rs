//! Settings for a merge client
//!
//! Loaded by [`SettingsLoader`] from an optional TOML file overlaid with
//! `APPMERGE_*` environment variables, e.g. `APPMERGE_BASE_URL` or
//! `APPMERGE_POLL_INTERVAL_MS`.

use std::path::PathBuf;
use std::time::Duration;

use appmerge_http::HttpConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{MergeError, MergeResult};
use crate::execution::InitiateOptions;
use crate::lock::LockOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    /// Root of the merge API, e.g. `https://api.example.com/`
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub lock_duration_secs: u64,
    pub lock_auto_extend: bool,
    pub lock_warning_threshold_secs: u64,
    pub lock_check_interval_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for MergeSettings {
    fn default() -> Self {
        let http = HttpConfig::default();
        Self {
            base_url: String::new(),
            request_timeout_ms: http.timeout.as_millis() as u64,
            retry_count: http.retry_count,
            retry_delay_ms: http.retry_delay.as_millis() as u64,
            proxy: None,
            user_agent: None,
            lock_duration_secs: 600,
            lock_auto_extend: false,
            lock_warning_threshold_secs: 60,
            lock_check_interval_secs: 10,
            poll_interval_ms: 2000,
        }
    }
}

impl MergeSettings {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn validate(&self) -> MergeResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(MergeError::Settings("base_url must be set".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(MergeError::Settings(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(MergeError::Settings(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.lock_duration_secs == 0 {
            return Err(MergeError::Settings(
                "lock_duration_secs must be greater than 0".to_string(),
            ));
        }
        if self.lock_check_interval_secs == 0 {
            return Err(MergeError::Settings(
                "lock_check_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.lock_warning_threshold_secs >= self.lock_duration_secs {
            return Err(MergeError::Settings(
                "lock_warning_threshold_secs must be smaller than lock_duration_secs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn http_config(&self) -> HttpConfig {
        let mut config = HttpConfig::default()
            .with_base_url(self.base_url.clone())
            .with_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_retry_count(self.retry_count)
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms));
        if let Some(proxy) = &self.proxy {
            config = config.with_proxy(proxy.clone());
        }
        if let Some(user_agent) = &self.user_agent {
            config = config.with_user_agent(user_agent.clone());
        }
        config
    }

    /// Transport settings for status polls: short timeouts and no in-place retries
    pub fn polling_http_config(&self) -> HttpConfig {
        let mut config = HttpConfig::polling().with_base_url(self.base_url.clone());
        config.proxy = self.proxy.clone();
        if let Some(user_agent) = &self.user_agent {
            config = config.with_user_agent(user_agent.clone());
        }
        config
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            duration: Duration::from_secs(self.lock_duration_secs),
            auto_extend: self.lock_auto_extend,
            warning_threshold: Duration::from_secs(self.lock_warning_threshold_secs),
            check_interval: Duration::from_secs(self.lock_check_interval_secs),
        }
    }

    pub fn initiate_options(&self) -> InitiateOptions {
        InitiateOptions {
            start_monitoring: true,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Layers a settings file and the environment
pub struct SettingsLoader {
    path: PathBuf,
    env_prefix: String,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self::with_path(PathBuf::from("appmerge.toml"))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            env_prefix: "APPMERGE".to_string(),
        }
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Read and validate; a missing file is not an error
    pub fn load(&self) -> MergeResult<MergeSettings> {
        let config = Config::builder()
            .add_source(File::from(self.path.clone()).required(false))
            .add_source(Environment::with_prefix(&self.env_prefix).try_parsing(true))
            .build()
            .map_err(|e| MergeError::Settings(e.to_string()))?;

        let settings: MergeSettings = config
            .try_deserialize()
            .map_err(|e| MergeError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_settings(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_match_operation_defaults() {
        let settings = MergeSettings::default();
        assert_eq!(settings.lock_options(), LockOptions::default());
        assert_eq!(settings.initiate_options(), InitiateOptions::default());
        assert!(settings.validate().is_err());
        assert!(settings.with_base_url("http://localhost/").validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let file = write_settings(
            r#"
base_url = "https://merge.example.com/api/"
retry_count = 1
lock_duration_secs = 900
lock_auto_extend = true
"#,
        );

        let settings = SettingsLoader::with_path(file.path())
            .with_env_prefix("APPMERGE_TEST_FILE")
            .load()
            .unwrap();

        assert_eq!(settings.base_url, "https://merge.example.com/api/");
        assert_eq!(settings.retry_count, 1);
        assert_eq!(settings.lock_options().duration, Duration::from_secs(900));
        assert!(settings.lock_auto_extend);
        assert_eq!(settings.poll_interval_ms, 2000);

        let http = settings.http_config();
        assert_eq!(http.base_url.as_deref(), Some("https://merge.example.com/api/"));
        assert_eq!(http.retry_count, 1);

        let polling = settings.polling_http_config();
        assert_eq!(polling.base_url, http.base_url);
        assert_eq!(polling.retry_count, 0);
        assert!(polling.timeout < http.timeout);
    }

    #[test]
    fn test_missing_file_still_needs_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let err = SettingsLoader::with_path(dir.path().join("absent.toml"))
            .with_env_prefix("APPMERGE_TEST_ABSENT")
            .load()
            .unwrap_err();
        assert!(matches!(err, MergeError::Settings(_)));
    }

    #[test]
    fn test_threshold_must_be_below_duration() {
        let file = write_settings(
            r#"
base_url = "http://localhost/"
lock_duration_secs = 60
lock_warning_threshold_secs = 60
"#,
        );

        let err = SettingsLoader::with_path(file.path())
            .with_env_prefix("APPMERGE_TEST_THRESHOLD")
            .load()
            .unwrap_err();
        assert!(err.to_string().contains("lock_warning_threshold_secs"));
    }
}
