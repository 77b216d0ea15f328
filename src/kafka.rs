//! rdkafkaによる[crate::client::IGroupClient]の実装。
pub mod config;
pub mod consumer;
pub mod key;
pub mod message;

pub use config::ClientSettings;
pub use consumer::{ConnectorContext, RdKafkaGroupClient};
pub use key::{Offset, Partition, Topic, TopicPartition};
pub use message::RawRecord;
