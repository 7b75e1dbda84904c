use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub capture: CaptureConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// Path to the dump utility; looked up on `PATH` when relative.
    #[serde(default)]
    pub dump_path: Option<String>,
    /// Export existing rows when a replication slot is freshly created.
    #[serde(default)]
    pub historical: bool,
    pub tables: Vec<TableConfig>,
}

/// One capture unit: a table pattern with its own replication slot and sinks.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableConfig {
    /// Table name, shell-glob syntax (`*`, `?`).
    pub name: String,
    pub slot_name: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Column allow-list. Empty keeps every column.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Sinks in delivery order.
    #[serde(default)]
    pub sinks: Vec<SinkKind>,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    /// Fields joined into the document id. Defaults to the primary key.
    #[serde(default)]
    pub id_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Kafka,
    Stdout,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// In-flight transactions larger than this are flushed before COMMIT.
    #[serde(default = "default_max_transaction_records")]
    pub max_transaction_records: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_dispatch_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Retries before a failing batch is abandoned. Unset retries forever.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
    #[serde(default)]
    pub stdout: Option<StdoutConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    /// Topic used when the capture rule does not name one.
    pub topic: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// `id`, `table`, `none` or `field:<dotted.path>`.
    #[serde(default = "default_key_strategy")]
    pub key_strategy: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StdoutConfig {
    #[serde(default)]
    pub pretty: bool,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_RIVER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.tables.is_empty() {
            return Err(Error::Config("no capture tables configured".to_string()));
        }

        let mut slots = HashSet::new();
        for table in &self.capture.tables {
            if table.slot_name.is_empty() {
                return Err(Error::Config(format!(
                    "table '{}' has an empty slot_name",
                    table.name
                )));
            }
            if !slots.insert(table.slot_name.as_str()) {
                return Err(Error::Config(format!(
                    "slot '{}' is used by more than one table",
                    table.slot_name
                )));
            }
            for sink in &table.sinks {
                let configured = match sink {
                    SinkKind::Kafka => self.output.kafka.is_some(),
                    SinkKind::Stdout => true,
                };
                if !configured {
                    return Err(Error::Config(format!(
                        "table '{}' routes to {:?} but [output.{:?}] is missing",
                        table.name, sink, sink
                    )));
                }
            }
        }

        if self.dispatch.batch_size == 0 || self.dispatch.queue_capacity == 0 {
            return Err(Error::Config(
                "dispatch batch_size and queue_capacity must be positive".to_string(),
            ));
        }
        if self.replication.max_transaction_records == 0 {
            return Err(Error::Config(
                "replication.max_transaction_records must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

impl PostgresConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ReplicationConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl DispatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_transaction_records: default_max_transaction_records(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_dispatch_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retries: None,
            pool_capacity: default_pool_capacity(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_reconnect_delay_secs() -> u64 {
    10
}

fn default_max_transaction_records() -> usize {
    1000
}

fn default_queue_capacity() -> usize {
    20480
}

fn default_dispatch_batch_size() -> usize {
    10_000
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_pool_capacity() -> usize {
    20_000
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_linger_ms() -> u32 {
    10
}

fn default_batch_size() -> usize {
    16384
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_key_strategy() -> String {
    "id".to_string()
}
