//! コンシューマーグループとしてkafkaのトピックを購読し、レコードをイベントに変換して
//! パイプラインへ渡すコネクタ。
//!
//! ### Features
//!
//! - トピックはカンマ区切りの一覧か`/regexp/`で指定する。正規表現の場合は定期的にトピック一覧を取得し、
//!   新しく作られたトピックを購読に加える
//! - オフセットはパイプラインが確認応答したレコードの分だけコミットする(at-least-once)
//! - 複数のワーカーが同じグループに参加し、パーティションの分配はブローカーに任せる
//! - [parser::IParser]と[pipeline::IPipeline]を実装することで変換と出力先を組み込むことができる
//!
//! ### Examples
//!
//! ```no_run
//! use kafka_group_connector::prelude::*;
//! use std::sync::Arc;
//! use tokio::signal;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     env_logger::init();
//!     let mut config = ConnectorConfig::new();
//!     config
//!         .set("bootstrap.servers", "localhost:9092")
//!         .set("group.id", "group")
//!         .set("session.timeout.ms", "6000")
//!         .topics("/sample_.*/")
//!         .workers(2);
//!
//!     let (pipeline, mut deliveries) = ChannelPipeline::channel(1024);
//!     tokio::spawn(async move {
//!         while let Some(delivery) = deliveries.recv().await {
//!             let event = delivery.ack();
//!             println!("{} {:?}", event.tag, event.record);
//!         }
//!     });
//!
//!     let mut connector = Connector::builder(config)
//!         .pipeline(Arc::new(pipeline))
//!         .build()?;
//!     connector.run(signal::ctrl_c()).await?;
//!     Ok(())
//! }
//! ```
pub mod client;
pub mod config;
pub mod connector;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod kafka;
pub mod offsets;
pub mod parser;
pub mod pipeline;
pub mod policy;
pub mod poll_loop;
pub mod processor;
pub mod topic;

pub mod prelude {
    pub use super::client::{IGroupClient, IRebalanceListener};
    pub use super::config::ConnectorConfig;
    pub use super::connector::{Connector, ConnectorBuilder};
    pub use super::context::Context;
    pub use super::coordinator::{Health, SlotStatus};
    pub use super::error::*;
    pub use super::kafka::*;
    pub use super::offsets::OffsetReset;
    pub use super::parser::{FieldMap, IParser, ParserConfig};
    pub use super::pipeline::*;
    pub use super::processor::{Event, FieldMapping, RecordMetadata, TimeSource};
    pub use super::topic::Subscription;
}
