//! Configuration structures for ChatRelay
//!
//! Configurations are loaded from YAML files and can be overridden by
//! environment variables of the form `CHATRELAY__<SECTION>__<KEY>`.

use crate::error::{RelayError, Result};
use ::config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "CHATRELAY_CONFIG";

/// Config file used when [`CONFIG_PATH_ENV`] is unset
pub const DEFAULT_CONFIG_PATH: &str = "/etc/chatrelay/worker.yaml";

/// Top-level configuration for the relay worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Message broker connection and queue names
    pub broker: BrokerConfig,

    /// Record store (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Generation service configuration
    pub generation: GenerationConfig,

    /// Worker behaviour
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default = "default_broker_credential")]
    pub user: String,

    #[serde(default = "default_broker_credential")]
    pub password: String,

    /// Virtual host
    #[serde(default = "default_vhost")]
    pub vhost: String,

    /// Queue consumed for chat requests
    #[serde(default = "default_request_queue")]
    pub request_queue: String,

    /// Queue replies are published to
    #[serde(default = "default_response_queue")]
    pub response_queue: String,

    /// Queue receiving the original body of requests that failed processing
    #[serde(default)]
    pub dead_letter_queue: Option<String>,

    /// Declare the queues on startup
    #[serde(default = "default_true")]
    pub declare_queues: bool,

    /// Declare queues as durable
    #[serde(default = "default_true")]
    pub durable_queues: bool,

    /// Unacknowledged deliveries the broker may push (default: concurrency + queue capacity)
    #[serde(default)]
    pub prefetch: Option<u16>,
}

/// Record store backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// MongoDB server
    #[default]
    Mongo,

    /// Process-local store, for development
    Memory,
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_store_host")]
    pub host: String,

    #[serde(default = "default_store_port")]
    pub port: u16,

    /// Database name
    pub db: String,

    /// Collection receiving exchange records
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Persist every completed exchange
    #[serde(default = "default_true")]
    pub record_exchanges: bool,

    /// Exchanges the memory backend keeps per conversation, oldest dropped first
    #[serde(default = "default_memory_history")]
    pub memory_history: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Force debug level regardless of `level`
    #[serde(default)]
    pub debug: bool,
}

/// Generation service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Inference endpoint accepting generation requests
    pub endpoint: String,

    /// Directory holding model checkpoints
    #[serde(default = "default_model_root")]
    pub model_root: PathBuf,

    /// Directory holding tokenizers
    #[serde(default = "default_tokenizer_root")]
    pub tokenizer_root: PathBuf,

    /// Model identifier, relative to `model_root`
    pub model: String,

    /// Tokenizer identifier, relative to `tokenizer_root`
    pub tokenizer: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Decoding parameters sent with every call
    #[serde(default)]
    pub decoding: DecodingConfig,
}

/// Fixed decoding hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecodingConfig {
    #[serde(default = "default_true")]
    pub do_sample: bool,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_num_beams")]
    pub num_beams: u32,

    #[serde(default = "default_no_repeat_ngram_size")]
    pub no_repeat_ngram_size: u32,

    #[serde(default = "default_length_penalty")]
    pub length_penalty: f32,

    /// Minimum output length in tokens
    #[serde(default = "default_min_length")]
    pub min_length: u32,

    /// Maximum output length in tokens
    #[serde(default = "default_max_length")]
    pub max_length: u32,
}

/// When a delivery is acknowledged to the broker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Ack only once the response is published (at-least-once)
    #[default]
    AfterPublish,

    /// Broker auto-acks on delivery (at-most-once)
    OnReceipt,
}

/// Worker behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identifier used as consumer tag prefix and in logs
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// `user_uuid` stamped on every response
    #[serde(default = "default_user_uuid")]
    pub user_uuid: String,

    /// Number of messages processed in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Deliveries buffered between the consumer and the pool
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub ack_mode: AckMode,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            debug: false,
        }
    }
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            do_sample: true,
            temperature: default_temperature(),
            num_beams: default_num_beams(),
            no_repeat_ngram_size: default_no_repeat_ngram_size(),
            length_penalty: default_length_penalty(),
            min_length: default_min_length(),
            max_length: default_max_length(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            user_uuid: default_user_uuid(),
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            ack_mode: AckMode::default(),
        }
    }
}

/// Default value functions
fn default_true() -> bool {
    true
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    5672
}

fn default_broker_credential() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_request_queue() -> String {
    "chatrelay-requests".to_string()
}

fn default_response_queue() -> String {
    "chatrelay-responses".to_string()
}

fn default_store_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    27017
}

fn default_memory_history() -> usize {
    100
}

fn default_collection() -> String {
    "exchanges".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_model_root() -> PathBuf {
    PathBuf::from("/opt/chatrelay/models")
}

fn default_tokenizer_root() -> PathBuf {
    PathBuf::from("/opt/chatrelay/tokenizers")
}

fn default_request_timeout() -> u64 {
    120
}

fn default_temperature() -> f32 {
    0.39
}

fn default_num_beams() -> u32 {
    2
}

fn default_no_repeat_ngram_size() -> u32 {
    2
}

fn default_length_penalty() -> f32 {
    1.0
}

fn default_min_length() -> u32 {
    20
}

fn default_max_length() -> u32 {
    100
}

fn default_worker_id() -> String {
    format!("chatrelay-{}", Uuid::new_v4().simple())
}

fn default_user_uuid() -> String {
    chatrelay_proto::DEFAULT_USER_UUID.to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    8
}

impl RelayConfig {
    /// Load configuration from a YAML file, layered with `CHATRELAY__*` overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(RelayError::Config(format!(
                "Config file {} not found",
                path.display()
            )));
        }

        let config: RelayConfig = ::config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(
                Environment::with_prefix("CHATRELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                RelayError::Config(format!(
                    "Failed to load config file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the path in `CHATRELAY_CONFIG`, or the default path
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(path)
    }

    /// Parse a YAML document without environment overrides
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: RelayConfig = serde_yaml::from_str(content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let broker = &self.broker;
        if broker.request_queue.is_empty() || broker.response_queue.is_empty() {
            return Err(RelayError::config("Queue names must not be empty"));
        }
        if broker.request_queue == broker.response_queue {
            return Err(RelayError::config(format!(
                "Request and response queue are both {}",
                broker.request_queue
            )));
        }
        if let Some(dlq) = &broker.dead_letter_queue {
            if dlq.is_empty() || *dlq == broker.request_queue {
                return Err(RelayError::config(format!("Invalid dead letter queue: {:?}", dlq)));
            }
        }
        if broker.prefetch == Some(0) {
            return Err(RelayError::config("Prefetch must be at least 1"));
        }

        if let Some(store) = &self.store {
            if store.db.is_empty() {
                return Err(RelayError::config("Store database name must not be empty"));
            }
            if store.memory_history == 0 {
                return Err(RelayError::config("Store memory_history must be at least 1"));
            }
        }

        let generation = &self.generation;
        if generation.endpoint.is_empty() {
            return Err(RelayError::config("Generation endpoint must not be empty"));
        }
        if generation.request_timeout_secs == 0 {
            return Err(RelayError::config("Generation timeout must be positive"));
        }
        let decoding = &generation.decoding;
        if decoding.temperature <= 0.0 {
            return Err(RelayError::config("Temperature must be positive"));
        }
        if decoding.num_beams == 0 {
            return Err(RelayError::config("num_beams must be at least 1"));
        }
        if decoding.min_length > decoding.max_length {
            return Err(RelayError::config(format!(
                "min_length {} exceeds max_length {}",
                decoding.min_length, decoding.max_length
            )));
        }

        if self.worker.concurrency == 0 {
            return Err(RelayError::config("Worker concurrency must be at least 1"));
        }
        if self.worker.queue_capacity == 0 {
            return Err(RelayError::config("Worker queue capacity must be at least 1"));
        }
        self.user_uuid()?;

        Ok(())
    }

    /// Sentinel stamped on every response
    pub fn user_uuid(&self) -> Result<Uuid> {
        Ok(Uuid::parse_str(&self.worker.user_uuid)?)
    }

    /// Broker prefetch, defaulting to what the pool can hold
    pub fn prefetch_count(&self) -> u16 {
        self.broker.prefetch.unwrap_or_else(|| {
            let held = self.worker.concurrency + self.worker.queue_capacity;
            u16::try_from(held).unwrap_or(u16::MAX)
        })
    }
}

impl LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub fn filter_directive(&self) -> String {
        if self.debug {
            "debug".to_string()
        } else {
            self.level.clone()
        }
    }
}

impl GenerationConfig {
    pub fn model_path(&self) -> PathBuf {
        self.model_root.join(&self.model)
    }

    pub fn tokenizer_path(&self) -> PathBuf {
        self.tokenizer_root.join(&self.tokenizer)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl StoreConfig {
    /// Connection string for the store server
    pub fn uri(&self) -> String {
        format!("mongodb://{}:{}", self.host, self.port)
    }
}
