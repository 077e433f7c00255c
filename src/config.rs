use crate::error::{AppError, Result};
use crate::idempotency::RetryPolicy;
use crate::models::OperationConfig;
use crate::observability::{LogConfig, LogFormat};
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub application: ApplicationSettings,
    #[serde(default)]
    pub store: StoreSettings,
    pub database: Option<DatabaseSettings>,
    pub redis: Option<RedisSettings>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub reaper: ReaperSettings,
    /// Operation policies seeded into the registry at startup.
    #[serde(default)]
    pub operations: Vec<OperationSettings>,
}

#[derive(Debug, Deserialize)]
pub struct ApplicationSettings {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl ApplicationSettings {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: LogFormat::from(self.log_format.as_str()),
            ..LogConfig::default()
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Where reservations and durable records live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
    /// Reservations in Redis, everything else in PostgreSQL.
    Hybrid,
}

#[derive(Debug, Default, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "idem".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 2000,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReaperSettings {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub batch_size: i64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct OperationSettings {
    #[validate(length(min = 1, max = 255))]
    pub service: String,
    #[validate(length(min = 1, max = 255))]
    pub operation: String,
    #[validate(range(min = 1, max = 86400000))]
    pub lock_duration_ms: i64,
    #[serde(default = "default_allow_save_on_expired")]
    pub allow_save_on_expired: bool,
}

fn default_allow_save_on_expired() -> bool {
    true
}

impl OperationSettings {
    pub fn to_config(&self) -> Result<OperationConfig> {
        self.validate().map_err(|e| {
            AppError::Validation(format!(
                "operation {}/{}: {}",
                self.service, self.operation, e
            ))
        })?;

        OperationConfig::new(
            self.service.clone(),
            self.operation.clone(),
            chrono::Duration::milliseconds(self.lock_duration_ms),
            self.allow_save_on_expired,
        )
    }
}

impl Settings {
    pub fn new() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects backends whose connection settings are missing and invalid
    /// operation seeds.
    pub fn validate(&self) -> Result<()> {
        let needs_database = matches!(self.store.backend, StoreBackend::Postgres | StoreBackend::Hybrid);
        if needs_database && self.database.is_none() {
            return Err(AppError::Validation(
                "store backend requires a [database] section".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Hybrid && self.redis.is_none() {
            return Err(AppError::Validation(
                "hybrid store backend requires a [redis] section".to_string(),
            ));
        }

        self.operation_configs().map(|_| ())
    }

    pub fn operation_configs(&self) -> Result<Vec<OperationConfig>> {
        self.operations.iter().map(OperationSettings::to_config).collect()
    }
}
