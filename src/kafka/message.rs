use super::key::{key, Offset, Partition, TopicPartition};
use rdkafka::message::{BorrowedMessage, Headers, Message as IMessage};

/// ブローカーから取得した1件のレコード。
///
/// ポーリング1回分の処理の間だけ保持され、オフセットのコミット後に参照されることはない。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRecord {
    topic: String,
    partition: Partition,
    offset: Offset,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    headers: Vec<(String, Option<Vec<u8>>)>,
    timestamp: Option<i64>,
}

impl RawRecord {
    pub fn new(topic: impl Into<String>, partition: Partition, offset: Offset) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: None,
            headers: vec![],
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        self.headers.push((key.into(), value));
        self
    }

    /// produce時のタイムスタンプ(エポックミリ秒)
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub(crate) fn from_message(msg: &BorrowedMessage<'_>) -> Self {
        let headers = msg
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| (header.key.to_string(), header.value.map(|v| v.to_vec())))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|p| p.to_vec()),
            headers,
            timestamp: msg.timestamp().to_millis(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// tombstoneの場合はNone
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn headers(&self) -> &[(String, Option<Vec<u8>>)] {
        &self.headers
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn topic_partition(&self) -> TopicPartition {
        key!(self)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    pub fn create_record<P>(topic: &str, partition: i32, offset: i64, payload: P) -> RawRecord
    where
        P: Into<Vec<u8>>,
    {
        RawRecord::new(topic, partition, offset)
            .with_value(payload)
            .with_timestamp(1_650_000_000_000 + offset)
    }
}
