use crate::error::{ParseError, PipelineError};
use crate::kafka::key::Offset;
use crate::kafka::message::RawRecord;
use crate::parser::{FieldMap, IParser};
use crate::pipeline::{Ack, IPipeline};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// イベントの生成元となったレコードの情報。
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: Offset,
    pub timestamp: Option<i64>,
    pub headers: BTreeMap<String, String>,
}

impl From<&RawRecord> for RecordMetadata {
    fn from(record: &RawRecord) -> Self {
        let headers = record
            .headers()
            .iter()
            .map(|(key, value)| {
                let value = value
                    .as_deref()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default();
                (key.clone(), value)
            })
            .collect();
        Self {
            topic: record.topic().to_string(),
            partition: record.partition(),
            offset: record.offset(),
            timestamp: record.timestamp(),
            headers,
        }
    }
}

/// パイプラインへ転送される構造化イベント。
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    pub tag: String,
    pub time: DateTime<Utc>,
    pub record: FieldMap,
    pub metadata: RecordMetadata,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSource {
    /// 処理した時刻
    #[default]
    Now,
    /// レコードのタイムスタンプ
    Kafka,
    /// デコードしたフィールドの値
    Record,
}

/// デコードしたフィールドにレコードの情報を付与する規則。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FieldMapping {
    /// レコードのキーを格納するフィールド名
    pub kafka_message_key: Option<String>,
    /// ヘッダーをフィールドとして追加する
    pub add_headers: bool,
    pub add_prefix: Option<String>,
    pub add_suffix: Option<String>,
    pub time_source: TimeSource,
    pub record_time_key: String,
    /// `time_source = record`のときの書式。未指定の場合はRFC 3339かエポック秒として解釈する。
    pub time_format: Option<String>,
    /// レコードの情報をオブジェクトとして格納するフィールド名
    pub metadata_key: Option<String>,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            kafka_message_key: None,
            add_headers: false,
            add_prefix: None,
            add_suffix: None,
            time_source: TimeSource::Now,
            record_time_key: "time".to_string(),
            time_format: None,
            metadata_key: None,
        }
    }
}

impl FieldMapping {
    pub fn tag(&self, topic: &str) -> String {
        let mut tag = String::new();
        if let Some(prefix) = &self.add_prefix {
            tag.push_str(prefix);
            tag.push('.');
        }
        tag.push_str(topic);
        if let Some(suffix) = &self.add_suffix {
            tag.push('.');
            tag.push_str(suffix);
        }
        tag
    }

    fn apply(&self, mut fields: FieldMap, record: &RawRecord, metadata: &RecordMetadata) -> FieldMap {
        if self.add_headers {
            for (key, value) in &metadata.headers {
                fields.insert(key.clone(), Value::String(value.clone()));
            }
        }
        if let Some(key_field) = &self.kafka_message_key {
            let key = record
                .key()
                .map(|k| Value::String(String::from_utf8_lossy(k).into_owned()))
                .unwrap_or(Value::Null);
            fields.insert(key_field.clone(), key);
        }
        if let Some(metadata_key) = &self.metadata_key {
            fields.insert(
                metadata_key.clone(),
                serde_json::json!({
                    "topic": metadata.topic,
                    "partition": metadata.partition,
                    "offset": metadata.offset,
                    "timestamp": metadata.timestamp,
                }),
            );
        }
        fields
    }

    fn time(&self, fields: &FieldMap, record: &RawRecord) -> DateTime<Utc> {
        match self.time_source {
            TimeSource::Now => Utc::now(),
            TimeSource::Kafka => record
                .timestamp()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now),
            TimeSource::Record => match fields.get(&self.record_time_key) {
                Some(value) => self.parse_time(value).unwrap_or_else(|| {
                    warn!(
                        "Failed to parse record time. Use current time instead.({}={})",
                        self.record_time_key, value
                    );
                    Utc::now()
                }),
                None => {
                    debug!("Record time key does not exist.({})", self.record_time_key);
                    Utc::now()
                }
            },
        }
    }

    fn parse_time(&self, value: &Value) -> Option<DateTime<Utc>> {
        match (value, &self.time_format) {
            (Value::String(s), Some(format)) => DateTime::parse_from_str(s, format)
                .map(|t| t.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(s, format)
                        .ok()
                        .map(|t| Utc.from_utc_datetime(&t))
                }),
            (Value::String(s), None) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(epoch_seconds)),
            (Value::Number(n), _) => n.as_f64().and_then(epoch_seconds),
            _ => None,
        }
    }
}

fn epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let nanos = (seconds.fract() * 1e9).round() as u32;
    Utc.timestamp_opt(seconds.trunc() as i64, nanos.min(999_999_999)).single()
}

/// [RecordProcessor::forward]の結果。
#[derive(Debug, Default)]
pub struct Forwarded {
    pub acks: Vec<Ack>,
    pub parse_failed: bool,
}

/// レコードをイベントへ変換し、パイプラインへ転送する。
pub struct RecordProcessor {
    parser: Box<dyn IParser>,
    mapping: FieldMapping,
    pipeline: Arc<dyn IPipeline>,
    retry_emit_limit: Option<usize>,
    retry_emit_wait: Duration,
}

impl RecordProcessor {
    pub fn new(parser: Box<dyn IParser>, mapping: FieldMapping, pipeline: Arc<dyn IPipeline>) -> Self {
        Self {
            parser,
            mapping,
            pipeline,
            retry_emit_limit: None,
            retry_emit_wait: Duration::from_secs(1),
        }
    }

    /// パイプラインのバッファが一杯のときに再送する回数
    pub fn with_retry_emit(mut self, limit: Option<usize>, wait: Duration) -> Self {
        self.retry_emit_limit = limit;
        self.retry_emit_wait = wait;
        self
    }

    /// レコードをイベントへ変換する。値を持たないレコードはイベントを生成しない。
    pub fn process(&self, record: &RawRecord) -> Result<Vec<Event>, ParseError> {
        let value = match record.value() {
            Some(value) => value,
            None => {
                debug!(
                    "Record has no value.(topic={}, partition={}, offset={})",
                    record.topic(),
                    record.partition(),
                    record.offset()
                );
                return Ok(vec![]);
            }
        };
        let decoded = self.parser.decode(value).map_err(|source| ParseError {
            topic: record.topic().to_string(),
            partition: record.partition(),
            offset: record.offset(),
            source,
        })?;
        let metadata = RecordMetadata::from(record);
        let tag = self.mapping.tag(record.topic());
        Ok(decoded
            .into_iter()
            .map(|fields| {
                let time = self.mapping.time(&fields, record);
                Event {
                    tag: tag.clone(),
                    time,
                    record: self.mapping.apply(fields, record, &metadata),
                    metadata: metadata.clone(),
                }
            })
            .collect())
    }

    /// レコードを変換してパイプラインへ転送する。
    ///
    /// 変換に失敗したレコードはイベントを生成しなかったものとして扱い、
    /// オフセットの前進を妨げない。
    pub async fn forward(&self, record: &RawRecord) -> Result<Forwarded, PipelineError> {
        let events = match self.process(record) {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to parse record. Skipped.({})", e);
                return Ok(Forwarded {
                    acks: vec![],
                    parse_failed: true,
                });
            }
        };
        let mut acks = Vec::with_capacity(events.len());
        for event in events {
            acks.push(self.emit(event).await?);
        }
        Ok(Forwarded {
            acks,
            parse_failed: false,
        })
    }

    async fn emit(&self, event: Event) -> Result<Ack, PipelineError> {
        let limit = match self.retry_emit_limit {
            Some(limit) => limit,
            None => return self.pipeline.emit(event).await,
        };
        let mut retries = 0;
        loop {
            match self.pipeline.emit(event.clone()).await {
                Err(PipelineError::BufferFull) if retries < limit => {
                    retries += 1;
                    warn!(
                        "Pipeline buffer is full. Retry emit.(tag={}, retry={}/{})",
                        event.tag, retries, limit
                    );
                    tokio::time::sleep(self.retry_emit_wait).await;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    pub fn create_event(message: &str) -> Event {
        let mut record = FieldMap::new();
        record.insert("message".to_string(), Value::String(message.to_string()));
        Event {
            tag: "topic".to_string(),
            time: Utc::now(),
            record,
            metadata: RecordMetadata {
                topic: "topic".to_string(),
                partition: 0,
                offset: 0,
                timestamp: None,
                headers: BTreeMap::new(),
            },
        }
    }
}
