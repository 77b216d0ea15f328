use crate::offsets::OffsetReset;
use rdkafka::ClientConfig;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_CLIENT_ID: &str = "kafka-group-connector";
const DEFAULT_ASSIGNMENT_STRATEGY: &str = "cooperative-sticky";

/// [super::RdKafkaGroupClient]の生成に使う設定。
///
/// 生成後に変更されることはなく、ワーカーごとに同じ値から[ClientConfig]を組み立てる。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientSettings {
    properties: BTreeMap<String, String>,
    offset_reset: OffsetReset,
    max_batch_size: usize,
    max_wait_time: Duration,
    join_timeout: Duration,
    broker_timeout: Duration,
}

impl ClientSettings {
    pub fn new(properties: BTreeMap<String, String>) -> Self {
        Self {
            properties,
            offset_reset: OffsetReset::Earliest,
            max_batch_size: 10000,
            max_wait_time: Duration::from_millis(250),
            join_timeout: Duration::from_secs(60),
            broker_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_offset_reset(mut self, offset_reset: OffsetReset) -> Self {
        self.offset_reset = offset_reset;
        self
    }

    /// 1回のポーリングで取得するレコード数の上限と、追加のレコードを待つ時間
    pub fn with_batch(mut self, max_batch_size: usize, max_wait_time: Duration) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self.max_wait_time = max_wait_time;
        self
    }

    pub fn with_timeouts(mut self, join_timeout: Duration, broker_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self.broker_timeout = broker_timeout;
        self
    }

    pub fn group_id(&self) -> Option<&str> {
        self.properties
            .get("group.id")
            .map(String::as_str)
            .filter(|id| !id.trim().is_empty())
    }

    pub fn offset_reset(&self) -> OffsetReset {
        self.offset_reset
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_wait_time(&self) -> Duration {
        self.max_wait_time
    }

    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    pub fn broker_timeout(&self) -> Duration {
        self.broker_timeout
    }

    /// `worker`番目のワーカーのための設定を組み立てる。
    ///
    /// オフセットはコネクタが管理するため、自動コミットと自動保存は常に無効にする。
    pub fn client_config(&self, worker: usize) -> ClientConfig {
        let mut config = ClientConfig::new();
        for (key, value) in self.properties.iter() {
            config.set(key, value);
        }
        if !self.properties.contains_key("partition.assignment.strategy") {
            config.set("partition.assignment.strategy", DEFAULT_ASSIGNMENT_STRATEGY);
        }
        let client_id = self
            .properties
            .get("client.id")
            .map(String::as_str)
            .unwrap_or(DEFAULT_CLIENT_ID);
        config.set("client.id", format!("{}-{}", client_id, worker));
        config.set("auto.offset.reset", self.offset_reset.as_str());
        config.set("enable.auto.commit", "false");
        config.set("enable.auto.offset.store", "false");
        config.set("enable.partition.eof", "false");
        config
    }
}
