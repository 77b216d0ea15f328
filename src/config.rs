//! コネクタの設定。
//!
//! JSONから読み込むか、[ConnectorConfig::new]から組み立てる。
//!
//! ```
//! use kafka_group_connector::config::ConnectorConfig;
//!
//! let mut config = ConnectorConfig::new();
//! config
//!     .set("bootstrap.servers", "localhost:9092")
//!     .set("group.id", "connector")
//!     .topics("/app-.*/")
//!     .workers(2);
//! assert!(config.validate().is_ok());
//! ```
use crate::error::ConfigError;
use crate::kafka::config::ClientSettings;
use crate::offsets::OffsetReset;
use crate::parser::{IParser, ParserConfig};
use crate::policy::{Backoff, RetryLimit};
use crate::poll_loop::LoopSettings;
use crate::processor::FieldMapping;
use crate::topic::Subscription;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// `max_worker_restarts`と組み合わせて使うワーカーの再起動間隔
const RESTART_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommitConfig {
    pub interval_ms: u64,
    pub max_records: usize,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            max_records: 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectorConfig {
    /// カンマ区切りのトピック名か`/regexp/`。JSONでは文字列の配列も受け付ける。
    #[serde(deserialize_with = "deserialize_topics")]
    pub topics: String,
    /// librdkafkaに渡すプロパティ。数値と真偽値は文字列に変換する。
    #[serde(deserialize_with = "deserialize_properties")]
    pub kafka_configs: BTreeMap<String, String>,
    pub parser: ParserConfig,
    pub mapping: FieldMapping,
    pub offset_reset: OffsetReset,
    pub workers: usize,
    pub max_wait_time_ms: u64,
    pub max_batch_size: usize,
    pub max_batch_interval_ms: u64,
    pub commit: CommitConfig,
    pub retry_wait_seconds: u64,
    pub retry_limit: usize,
    pub disable_retry_limit: bool,
    pub retry_emit_limit: Option<usize>,
    pub max_inflight_records: usize,
    pub metadata_refresh_interval_ms: u64,
    pub max_worker_restarts: Option<usize>,
    pub shutdown_drain_ms: u64,
    pub join_timeout_ms: u64,
    pub broker_timeout_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            topics: String::new(),
            kafka_configs: BTreeMap::new(),
            parser: ParserConfig::default(),
            mapping: FieldMapping::default(),
            offset_reset: OffsetReset::Earliest,
            workers: 1,
            max_wait_time_ms: 250,
            max_batch_size: 10000,
            max_batch_interval_ms: 1000,
            commit: CommitConfig::default(),
            retry_wait_seconds: 30,
            retry_limit: 10,
            disable_retry_limit: false,
            retry_emit_limit: None,
            max_inflight_records: 10000,
            metadata_refresh_interval_ms: 300_000,
            max_worker_restarts: None,
            shutdown_drain_ms: 5000,
            join_timeout_ms: 60000,
            broker_timeout_ms: 10000,
        }
    }
}

fn deserialize_topics<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Topics {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Topics::deserialize(deserializer)? {
        Topics::One(topics) => topics,
        Topics::Many(topics) => topics.join(","),
    })
}

fn deserialize_properties<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| match value {
            Value::String(s) => Ok((key, s)),
            Value::Bool(b) => Ok((key, b.to_string())),
            Value::Number(n) => Ok((key, n.to_string())),
            other => Err(D::Error::custom(format!(
                "kafka_configs.{} must be a string, number or boolean: {}",
                key, other
            ))),
        })
        .collect()
}

impl ConnectorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// librdkafkaのプロパティを設定する。
    pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
        self.kafka_configs.insert(key.to_string(), value.to_string());
        self
    }

    pub fn topics(&mut self, topics: &str) -> &mut Self {
        self.topics = topics.to_string();
        self
    }

    pub fn workers(&mut self, workers: usize) -> &mut Self {
        self.workers = workers;
        self
    }

    pub fn parser(&mut self, parser: ParserConfig) -> &mut Self {
        self.parser = parser;
        self
    }

    pub fn mapping(&mut self, mapping: FieldMapping) -> &mut Self {
        self.mapping = mapping;
        self
    }

    pub fn offset_reset(&mut self, offset_reset: OffsetReset) -> &mut Self {
        self.offset_reset = offset_reset;
        self
    }

    /// 起動前に設定の整合性を検査する。
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.subscription()?;
        for key in ["bootstrap.servers", "group.id"] {
            match self.kafka_configs.get(key) {
                Some(value) if !value.trim().is_empty() => {}
                _ => return Err(ConfigError::Missing(format!("kafka_configs.{}", key))),
            }
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be greater than 0"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid("max_batch_size", "must be greater than 0"));
        }
        if self.max_batch_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "max_batch_interval_ms",
                "must be greater than 0",
            ));
        }
        if self.commit.max_records == 0 {
            return Err(ConfigError::invalid(
                "commit.max_records",
                "must be greater than 0",
            ));
        }
        if self.max_inflight_records == 0 {
            return Err(ConfigError::invalid(
                "max_inflight_records",
                "must be greater than 0",
            ));
        }
        if !self.disable_retry_limit && self.retry_limit == 0 {
            return Err(ConfigError::invalid(
                "retry_limit",
                "must be greater than 0 unless disable_retry_limit is set",
            ));
        }
        self.parser.build()?;
        Ok(())
    }

    pub fn subscription(&self) -> Result<Subscription, ConfigError> {
        Subscription::parse(&self.topics)
    }

    pub fn build_parser(&self) -> Result<Box<dyn IParser>, ConfigError> {
        self.parser.build()
    }

    /// 複数のプロセスで同時に起動してよいかどうか。
    ///
    /// グループIDがあればパーティションの所有はブローカーが調停する。
    pub fn multi_workers_ready(&self) -> bool {
        self.client_settings().group_id().is_some()
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings::new(self.kafka_configs.clone())
            .with_offset_reset(self.offset_reset)
            .with_batch(
                self.max_batch_size,
                Duration::from_millis(self.max_wait_time_ms),
            )
            .with_timeouts(
                Duration::from_millis(self.join_timeout_ms),
                Duration::from_millis(self.broker_timeout_ms),
            )
    }

    pub fn join_retry_limit(&self) -> RetryLimit {
        if self.disable_retry_limit {
            RetryLimit::Unbounded
        } else {
            RetryLimit::Bounded(self.retry_limit)
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        let retry_wait = Duration::from_secs(self.retry_wait_seconds);
        LoopSettings {
            poll_timeout: Duration::from_millis(self.max_batch_interval_ms),
            join_backoff: Backoff::new(retry_wait, retry_wait * 8),
            join_retry_limit: self.join_retry_limit(),
            error_backoff: Backoff::default(),
            commit_interval: Duration::from_millis(self.commit.interval_ms),
            commit_max_records: self.commit.max_records,
            max_inflight_records: self.max_inflight_records,
            metadata_refresh_interval: Duration::from_millis(self.metadata_refresh_interval_ms),
            shutdown_drain: Duration::from_millis(self.shutdown_drain_ms),
        }
    }

    pub fn restart_backoff(&self) -> Backoff {
        Backoff::new(RESTART_BACKOFF_INITIAL, RESTART_BACKOFF_MAX)
    }
}
