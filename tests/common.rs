use kafka_group_connector::prelude::*;
use rdkafka::producer::{BaseProducer, BaseRecord, Producer};
use rdkafka::ClientConfig;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BOOTSTRAP_SERVERS: &str = "localhost:9092";

pub fn create_producer() -> BaseProducer {
    ClientConfig::new()
        .set("bootstrap.servers", BOOTSTRAP_SERVERS)
        .create()
        .unwrap()
}

pub fn produce(topic: &str, payloads: &[&str]) {
    let producer = &create_producer();
    for payload in payloads {
        producer
            .send(BaseRecord::<str, str>::to(topic).payload(*payload))
            .unwrap();
    }
    producer.flush(Duration::from_secs(10)).unwrap();
}

pub fn create_config(group: &str, topics: &str) -> ConnectorConfig {
    let mut config = ConnectorConfig::new();
    config
        .set("bootstrap.servers", BOOTSTRAP_SERVERS)
        .set("group.id", group)
        .set("session.timeout.ms", "6000")
        .set("topic.metadata.refresh.interval.ms", "1000")
        .topics(topics)
        .offset_reset(OffsetReset::Earliest);
    config.max_batch_interval_ms = 100;
    config.retry_wait_seconds = 1;
    config.commit.interval_ms = 100;
    config.metadata_refresh_interval_ms = 1000;
    config
}

/// 受け取ったイベントを記録して確認応答するパイプライン
pub fn recording_pipeline() -> (Arc<dyn IPipeline>, Arc<Mutex<Vec<Event>>>) {
    let (pipeline, mut deliveries) = ChannelPipeline::channel(1024);
    let events = Arc::new(Mutex::new(vec![]));
    tokio::spawn({
        let events = events.clone();
        async move {
            while let Some(delivery) = deliveries.recv().await {
                events.lock().unwrap().push(delivery.ack());
            }
        }
    });
    (Arc::new(pipeline), events)
}

pub async fn wait_for<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let started = std::time::Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    condition()
}
