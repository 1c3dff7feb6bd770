// Daemon configuration
// Layers: defaults < optional TOML file < TRANSIT_* environment variables

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use transit_core::application::{ImportSettings, LifecycleSettings, WorkerSettings, IMPORT_CONTAINER};

pub const ENV_PREFIX: &str = "TRANSIT";
pub const CONFIG_PATH_VAR: &str = "TRANSIT_CONFIG";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "~/.transit/transit.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BlobConfig {
    pub root: String,
    pub allowed_extensions: Vec<String>,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            root: "~/.transit/blobs".to_string(),
            allowed_extensions: vec![".csv".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImportConfig {
    pub max_buffer_bytes: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: ImportSettings::default().max_buffer_bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobsConfig {
    pub queue: String,
    pub poll_interval_ms: u64,
    pub card_cleanup_cron: String,
    pub blob_sweep_cron: String,
    pub orphan_blob_grace_secs: u64,
    pub stalled_batch_cron: String,
    pub stalled_batch_age_secs: u64,
    pub max_processing_attempts: i32,
    pub bus_capacity: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        let worker = WorkerSettings::default();
        let lifecycle = LifecycleSettings::default();
        Self {
            queue: worker.queue,
            poll_interval_ms: worker.poll_interval.as_millis() as u64,
            card_cleanup_cron: "0 0 * * *".to_string(),
            blob_sweep_cron: "0 * * * *".to_string(),
            orphan_blob_grace_secs: lifecycle.orphan_blob_grace.as_secs(),
            stalled_batch_cron: "*/5 * * * *".to_string(),
            stalled_batch_age_secs: lifecycle.stalled_batch_age.as_secs(),
            max_processing_attempts: lifecycle.max_processing_attempts,
            bus_capacity: transit_infra_system::DEFAULT_BUS_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StationsConfig {
    pub base_url: String,
    pub sync_cron: String,
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            base_url: transit_infra_system::DEFAULT_STATIONS_BASE_URL.to_string(),
            sync_cron: "1 * * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub blob: BlobConfig,
    pub import: ImportConfig,
    pub jobs: JobsConfig,
    pub stations: StationsConfig,
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("blob.allowed_extensions")
}

impl AppConfig {
    /// Load from `TRANSIT_CONFIG` (if set) and the process environment
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var(CONFIG_PATH_VAR).ok();
        Self::load_from(file.as_deref(), environment())
    }

    fn load_from(file: Option<&str>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let config: AppConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config.expanded())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.import.max_buffer_bytes == 0 {
            return Err(ConfigError::Message(
                "import.max_buffer_bytes must be greater than zero".to_string(),
            ));
        }
        if self.blob.allowed_extensions.is_empty() {
            return Err(ConfigError::Message(
                "blob.allowed_extensions cannot be empty".to_string(),
            ));
        }
        if self.jobs.max_processing_attempts < 1 {
            return Err(ConfigError::Message(
                "jobs.max_processing_attempts must be at least 1".to_string(),
            ));
        }
        if self.jobs.stalled_batch_age_secs == 0 {
            return Err(ConfigError::Message(
                "jobs.stalled_batch_age_secs must be greater than zero".to_string(),
            ));
        }
        if self.stations.base_url.trim().is_empty() {
            return Err(ConfigError::Message(
                "stations.base_url cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn expanded(mut self) -> Self {
        self.database.url = shellexpand::tilde(&self.database.url).into_owned();
        self.blob.root = shellexpand::tilde(&self.blob.root).into_owned();
        self
    }

    pub fn import_settings(&self) -> ImportSettings {
        ImportSettings {
            container: IMPORT_CONTAINER.to_string(),
            max_buffer_bytes: self.import.max_buffer_bytes,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            queue: self.jobs.queue.clone(),
            poll_interval: Duration::from_millis(self.jobs.poll_interval_ms),
        }
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            container: IMPORT_CONTAINER.to_string(),
            max_processing_attempts: self.jobs.max_processing_attempts,
            orphan_blob_grace: Duration::from_secs(self.jobs.orphan_blob_grace_secs),
            stalled_batch_age: Duration::from_secs(self.jobs.stalled_batch_age_secs),
        }
    }
}
