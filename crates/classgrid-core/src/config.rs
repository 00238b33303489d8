//! classgrid.toml configuration parser.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a runnable single-process setup. Durations are written as
//! strings: `"250ms"`, `"10s"`, `"5m"`, `"1h"`, or a bare number of seconds.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassgridConfig {
    pub queues: QueueConfig,
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
    pub worker: WorkerConfig,
    pub autoscale: AutoscaleConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    /// In-process broker. Only usable when every component shares a process.
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub redis_url: String,
    /// Prefix for every Redis key the broker touches.
    pub key_prefix: String,
    pub task_queue: String,
    pub result_queue: String,
    /// Where poison tasks are copied before being acknowledged.
    pub dead_letter_queue: Option<String>,
    /// How long a received message stays hidden before redelivery.
    #[serde(with = "duration_str")]
    pub visibility_timeout: Duration,
    /// Long-poll wait used by workers on the task queue.
    #[serde(with = "duration_str")]
    pub receive_wait: Duration,
    /// Long-poll wait used by the result relay.
    #[serde(with = "duration_str")]
    pub result_wait: Duration,
    /// Max results the relay claims per receive.
    pub result_batch: usize,
    /// Re-check period for brokers without native blocking receive.
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "classgrid".to_string(),
            task_queue: "requests".to_string(),
            result_queue: "responses".to_string(),
            dead_letter_queue: None,
            visibility_timeout: Duration::from_secs(30),
            receive_wait: Duration::from_secs(10),
            result_wait: Duration::from_secs(20),
            result_batch: 10,
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Fs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory of the filesystem backend.
    pub root: PathBuf,
    /// Bucket holding submitted payloads.
    pub input_bucket: String,
    /// Bucket holding result artifacts.
    pub output_bucket: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            root: PathBuf::from("/var/lib/classgrid"),
            input_bucket: "input".to_string(),
            output_bucket: "output".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    /// Deadline for a correlated result before the client gets a timeout.
    #[serde(with = "duration_str")]
    pub max_wait: Duration,
    /// Multipart field holding the uploaded file.
    pub upload_field: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            max_wait: Duration::from_secs(120),
            upload_field: "myfile".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// JSON label table for the lookup classifier (`{"stem": "label"}`).
    pub labels: Option<PathBuf>,
    /// Deliveries after which a task is treated as poison.
    pub max_receive_count: u32,
    /// Attempts for transient queue operations.
    pub retry_attempts: u32,
    #[serde(with = "duration_str")]
    pub retry_base: Duration,
    #[serde(with = "duration_str")]
    pub retry_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            labels: None,
            max_receive_count: 5,
            retry_attempts: 5,
            retry_base: Duration::from_millis(200),
            retry_max: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    /// Control loop period.
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Backlog messages one worker is expected to absorb.
    pub scale_factor: u32,
    pub min_instances: u32,
    pub max_instances: u32,
    /// Instances that are never counted or terminated (e.g. the gateway host).
    pub protected_instances: Vec<String>,
    /// Executable launched for each worker instance. Defaults to the
    /// running classgridd binary.
    pub launch_template: Option<PathBuf>,
    /// How long a launched instance may take to report running.
    #[serde(with = "duration_str")]
    pub launch_timeout: Duration,
    /// How long a terminated instance may keep reporting running.
    #[serde(with = "duration_str")]
    pub terminate_timeout: Duration,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            scale_factor: 5,
            min_instances: 1,
            max_instances: 20,
            protected_instances: Vec::new(),
            launch_template: None,
            launch_timeout: Duration::from_secs(300),
            terminate_timeout: Duration::from_secs(300),
        }
    }
}

impl ClassgridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ClassgridConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the control loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scale = &self.autoscale;
        if scale.scale_factor == 0 {
            return Err(ConfigError::Invalid(
                "autoscale.scale_factor must be positive".to_string(),
            ));
        }
        if scale.min_instances > scale.max_instances {
            return Err(ConfigError::Invalid(format!(
                "autoscale.min_instances ({}) exceeds max_instances ({})",
                scale.min_instances, scale.max_instances
            )));
        }
        if self.queues.result_batch == 0 {
            return Err(ConfigError::Invalid(
                "queues.result_batch must be positive".to_string(),
            ));
        }
        if self.queues.task_queue == self.queues.result_queue {
            return Err(ConfigError::Invalid(
                "task and result queues must differ".to_string(),
            ));
        }
        if self.worker.max_receive_count == 0 {
            return Err(ConfigError::Invalid(
                "worker.max_receive_count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a duration string like "250ms", "30s", "5m", "1h".
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());
    let (digits, unit): (&str, fn(u64) -> Duration) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, |n| Duration::from_secs(n * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, |n| Duration::from_secs(n * 3600))
    } else {
        (s, Duration::from_secs)
    };
    let n = digits.trim().parse::<u64>().map_err(|_| invalid())?;
    Ok(unit(n))
}

fn format_duration(d: &Duration) -> String {
    if d.subsec_millis() != 0 || d.as_secs() == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: ClassgridConfig = toml::from_str("").unwrap();
        assert_eq!(config.queues.backend, QueueBackend::Memory);
        assert_eq!(config.queues.task_queue, "requests");
        assert_eq!(config.gateway.upload_field, "myfile");
        assert_eq!(config.autoscale.scale_factor, 5);
        assert_eq!(config.autoscale.max_instances, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_sections() {
        let toml_str = r#"
[queues]
backend = "redis"
redis_url = "redis://queue:6379"
visibility_timeout = "45s"
poll_interval = "100ms"

[storage]
backend = "fs"
root = "/srv/classgrid"

[autoscale]
interval = "5s"
min_instances = 2
max_instances = 8
protected_instances = ["i-gateway"]
"#;
        let config: ClassgridConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.queues.backend, QueueBackend::Redis);
        assert_eq!(config.queues.visibility_timeout, Duration::from_secs(45));
        assert_eq!(config.queues.poll_interval, Duration::from_millis(100));
        assert_eq!(config.storage.backend, StorageBackend::Fs);
        assert_eq!(config.autoscale.interval, Duration::from_secs(5));
        assert_eq!(config.autoscale.protected_instances, vec!["i-gateway"]);
        // Untouched fields keep their defaults.
        assert_eq!(config.queues.result_queue, "responses");
    }

    #[test]
    fn render_and_reparse() {
        let config = ClassgridConfig::default();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("visibility_timeout = \"30s\""));
        assert!(rendered.contains("poll_interval = \"250ms\""));
        let back: ClassgridConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(back.queues.visibility_timeout, config.queues.visibility_timeout);
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let mut config = ClassgridConfig::default();
        config.autoscale.min_instances = 5;
        config.autoscale.max_instances = 2;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_zero_scale_factor() {
        let mut config = ClassgridConfig::default();
        config.autoscale.scale_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_shared_queue() {
        let mut config = ClassgridConfig::default();
        config.queues.result_queue = config.queues.task_queue.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("12").unwrap(), Duration::from_secs(12));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn bad_duration_fails_parse() {
        let err = toml::from_str::<ClassgridConfig>("[gateway]\nmax_wait = \"forever\"\n");
        assert!(err.is_err());
    }

    #[test]
    fn from_file_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classgrid.toml");
        std::fs::write(&path, "[worker]\nmax_receive_count = 3\n").unwrap();
        let config = ClassgridConfig::from_file(&path).unwrap();
        assert_eq!(config.worker.max_receive_count, 3);

        let missing = ClassgridConfig::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
