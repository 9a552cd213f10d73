//! Process configuration.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults ([`Settings::default`])
//! 2. `backoffice.toml` in the config directory (optional)
//! 3. environment variables `BACKOFFICE__<SECTION>__<KEY>`, e.g. `BACKOFFICE__CACHE__REDIS_URL`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use backoffice_observability::LoggingSettings;

use crate::jobs::{EnqueueOptions, RetryPolicy};
use crate::resilience::{BreakerConfig, BreakerConfigError};

pub const CONFIG_FILE_NAME: &str = "backoffice.toml";
pub const ENV_PREFIX: &str = "BACKOFFICE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid breaker configuration: {0}")]
    Breaker(#[from] BreakerConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    /// How long shutdown waits for in-flight jobs before giving up.
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            shutdown_grace_ms: 30_000,
        }
    }
}

impl ServerSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Postgres connection settings. Without a `url` the process runs on in-memory stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            min_connections: 10,
            max_connections: 100,
            acquire_timeout_ms: 5_000,
            run_migrations: true,
        }
    }
}

impl DatabaseSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Cache settings. Without a `redis_url` an in-process cache is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub redis_url: Option<String>,
    pub default_ttl_secs: u64,
    pub operation_timeout_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            default_ttl_secs: 3600,
            operation_timeout_ms: 250,
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub asset_upload: BreakerConfig,
    pub asset_delete: BreakerConfig,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            asset_upload: BreakerConfig::asset_upload(),
            asset_delete: BreakerConfig::asset_delete(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    pub queue_name: String,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
    pub poll_interval_ms: u64,
    /// Upper bound on one job execution; unset means unbounded.
    pub job_timeout_ms: Option<u64>,
    /// Claim lease; a running job not renewed within it is recovered as stalled.
    pub lease_ms: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            queue_name: "product-tasks".to_string(),
            concurrency: 5,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            remove_on_complete: true,
            remove_on_fail: false,
            poll_interval_ms: 200,
            job_timeout_ms: None,
            lease_ms: 30_000,
        }
    }
}

impl JobSettings {
    pub fn enqueue_defaults(&self) -> EnqueueOptions {
        EnqueueOptions {
            retry: RetryPolicy::exponential(
                self.max_attempts,
                Duration::from_millis(self.backoff_base_ms),
            ),
            remove_on_complete: self.remove_on_complete,
            remove_on_fail: self.remove_on_fail,
            ..Default::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetSettings {
    /// Public base URL of the asset store.
    pub base_url: String,
}

impl Default for AssetSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/assets".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub breakers: BreakerSettings,
    pub jobs: JobSettings,
    pub assets: AssetSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for breaker in [&self.breakers.asset_upload, &self.breakers.asset_delete] {
            breaker.validate()?;
        }
        if self.jobs.concurrency == 0 {
            return Err(ConfigError::Invalid("jobs.concurrency must be at least 1".into()));
        }
        if self.jobs.lease_ms == 0 {
            return Err(ConfigError::Invalid("jobs.lease_ms must be non-zero".into()));
        }
        if self.jobs.max_attempts == 0 {
            return Err(ConfigError::Invalid("jobs.max_attempts must be at least 1".into()));
        }
        if self.database.max_connections == 0
            || self.database.min_connections > self.database.max_connections
        {
            return Err(ConfigError::Invalid(format!(
                "database pool bounds {}..{} are inconsistent",
                self.database.min_connections, self.database.max_connections
            )));
        }
        if self.cache.default_ttl_secs == 0 {
            return Err(ConfigError::Invalid("cache.default_ttl_secs must be non-zero".into()));
        }
        if self.cache.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid("cache.operation_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }
}

/// Builds [`Settings`] from defaults, an optional file and the environment.
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    config_dir: PathBuf,
    env_prefix: String,
    env_vars: Option<config::Map<String, String>>,
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self {
            config_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: ENV_PREFIX.to_string(),
            env_vars: None,
        }
    }

    pub fn with_config_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Read overrides from `vars` instead of the process environment.
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn load(self) -> Result<Settings, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Settings::default())?);

        let file = self.config_dir.join(CONFIG_FILE_NAME);
        if file.exists() {
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(self.env_vars),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoffice_observability::LogFormat;
    use std::fs;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> SettingsLoader {
        SettingsLoader::new()
            .with_config_dir(dir)
            .with_env_vars(Vec::<(String, String)>::new())
    }

    #[test]
    fn defaults_load_without_any_file() {
        let dir = tempdir().unwrap();
        let settings = loader(dir.path()).load().unwrap();

        assert_eq!(settings, Settings::default());
        assert_eq!(settings.cache.default_ttl(), Duration::from_secs(3600));
        assert_eq!(settings.jobs.concurrency, 5);
        assert_eq!(settings.breakers.asset_upload.error_threshold_percentage, 60);
        assert_eq!(settings.database.max_connections, 100);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"
[jobs]
concurrency = 12
job_timeout_ms = 60000

[breakers.asset_upload]
timeout = 5000

[logging]
format = "text"
"#,
        )
        .unwrap();

        let settings = loader(dir.path()).load().unwrap();
        assert_eq!(settings.jobs.concurrency, 12);
        assert_eq!(settings.jobs.job_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(settings.breakers.asset_upload.timeout, Duration::from_secs(5));
        assert_eq!(settings.breakers.asset_upload.name, "asset-upload");
        assert_eq!(settings.logging.format, LogFormat::Text);
        // Untouched sections keep their defaults.
        assert_eq!(settings.jobs.max_attempts, 3);
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), "[jobs]\nconcurrency = 12\n").unwrap();

        let settings = SettingsLoader::new()
            .with_config_dir(dir.path())
            .with_env_vars([
                ("BACKOFFICE__JOBS__CONCURRENCY", "3"),
                ("BACKOFFICE__CACHE__REDIS_URL", "redis://cache:6379"),
            ])
            .load()
            .unwrap();

        assert_eq!(settings.jobs.concurrency, 3);
        assert_eq!(settings.cache.redis_url.as_deref(), Some("redis://cache:6379"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[breakers.asset_delete]\nerror_threshold_percentage = 150\n",
        )
        .unwrap();
        assert!(matches!(
            loader(dir.path()).load(),
            Err(ConfigError::Breaker(BreakerConfigError::ThresholdOutOfRange { value: 150, .. }))
        ));

        let mut settings = Settings::default();
        settings.jobs.lease_ms = 0;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = Settings::default();
        settings.jobs.concurrency = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.database.min_connections = 200;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn enqueue_defaults_follow_job_settings() {
        let options = JobSettings::default().enqueue_defaults();
        assert_eq!(options.retry.max_attempts, 3);
        assert_eq!(options.retry.delay_for_attempt(2), Duration::from_millis(2000));
        assert!(options.remove_on_complete);
        assert!(!options.remove_on_fail);
    }
}
