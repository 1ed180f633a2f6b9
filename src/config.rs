use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_WORKDAY_START_HOUR: u32 = 8;
const DEFAULT_WORKDAY_END_HOUR: u32 = 18;
const DEFAULT_SLOT_MINUTES: u32 = 60;
const DEFAULT_APPOINTMENT_MINUTES: i32 = 60;

/// Working calendar of the workshop
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// First slot of the day starts at this local hour
    #[serde(default = "default_workday_start_hour")]
    #[validate(range(max = 23))]
    pub workday_start_hour: u32,

    /// No slot starts at or after this local hour
    #[serde(default = "default_workday_end_hour")]
    #[validate(range(min = 1, max = 24))]
    pub workday_end_hour: u32,

    /// Slot grid width in minutes
    #[serde(default = "default_slot_minutes")]
    #[validate(range(min = 5, max = 240))]
    pub slot_minutes: u32,

    /// Duration given to appointments created without an explicit estimate
    #[serde(default = "default_appointment_minutes")]
    #[validate(range(min = 1))]
    pub default_appointment_minutes: i32,

    /// Offset of the workshop's wall clock from UTC, in minutes
    #[serde(default)]
    #[validate(range(min = -720, max = 840))]
    pub utc_offset_minutes: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workday_start_hour: default_workday_start_hour(),
            workday_end_hour: default_workday_end_hour(),
            slot_minutes: default_slot_minutes(),
            default_appointment_minutes: default_appointment_minutes(),
            utc_offset_minutes: 0,
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Deadline for a single workflow transaction (seconds)
    #[serde(default = "default_transaction_timeout_secs")]
    #[validate(range(min = 1))]
    pub transaction_timeout_secs: u64,

    /// Extra attempts made for a transaction that failed transiently
    #[serde(default = "default_transaction_max_retries")]
    #[validate(range(max = 10))]
    pub transaction_max_retries: u32,

    /// Capacity of the post-commit notification channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1, max = 100000))]
    pub event_channel_capacity: usize,

    /// Reject order status changes that do not follow a defined edge
    #[serde(default = "default_true_bool")]
    pub enforce_status_transitions: bool,

    /// Working calendar
    #[serde(default)]
    #[validate]
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    /// Creates a new configuration with defaults for every tunable
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            transaction_timeout_secs: default_transaction_timeout_secs(),
            transaction_max_retries: default_transaction_max_retries(),
            event_channel_capacity: default_event_channel_capacity(),
            enforce_status_transitions: default_true_bool(),
            scheduler: SchedulerConfig::default(),
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.scheduler.workday_start_hour >= self.scheduler.workday_end_hour {
            let mut err = ValidationError::new("workday_window_empty");
            err.message = Some("scheduler.workday_start_hour must be before scheduler.workday_end_hour".into());
            errors.add("scheduler", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_pool_bounds");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_transaction_timeout_secs() -> u64 {
    15
}
fn default_transaction_max_retries() -> u32 {
    2
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_true_bool() -> bool {
    true
}
fn default_workday_start_hour() -> u32 {
    DEFAULT_WORKDAY_START_HOUR
}
fn default_workday_end_hour() -> u32 {
    DEFAULT_WORKDAY_END_HOUR
}
fn default_slot_minutes() -> u32 {
    DEFAULT_SLOT_MINUTES
}
fn default_appointment_minutes() -> i32 {
    DEFAULT_APPOINTMENT_MINUTES
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level")),
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("workshop_core={},sea_orm=warn,sqlx=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

/// Loads configuration from an explicit directory and profile name
pub fn load_config_from(config_dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://workshop.db?mode=rwc")?
        .set_default("environment", run_env)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&config_dir.join("default").to_string_lossy()).required(false))
        .add_source(File::with_name(&config_dir.join(run_env).to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
