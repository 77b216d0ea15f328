//! コンシューマーグループのクライアントの抽象。
//!
//! 実装は[crate::kafka::RdKafkaGroupClient]。テストでは[testing::MockBroker]を使う。
use crate::error::ClientError;
use crate::kafka::key::TopicPartition;
use crate::kafka::message::RawRecord;
use crate::offsets::{CommitBatch, PartitionAssignment};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// リバランスの通知を受け取る。
///
/// どちらのメソッドもポーリングの途中で同期的に呼ばれるため、待機してはならない。
pub trait IRebalanceListener: Send + Sync {
    /// パーティションが剥奪される直前に呼ばれる。
    ///
    /// 返したオフセットは、ブローカーへ制御を戻す前に同期的にコミットされる。
    fn on_revoke(&self, partitions: &[TopicPartition]) -> CommitBatch;

    /// 割り当てが確定した後に、割り当て全体を渡して呼ばれる。
    fn on_assign(&self, assignment: PartitionAssignment);
}

/// ブローカーとのセッションを持つクライアント。ワーカー1つにつき1つ生成する。
#[async_trait]
pub trait IGroupClient: Send {
    /// ブローカーのトピック一覧を取得する。
    async fn fetch_topics(&mut self) -> Result<Vec<String>, ClientError>;

    /// `topics`を購読してグループに参加し、最初の割り当てが確定するまで待機する。
    async fn join(
        &mut self,
        topics: &[String],
        listener: Arc<dyn IRebalanceListener>,
    ) -> Result<(), ClientError>;

    /// 参加したまま購読するトピックを置き換える。
    async fn update_subscription(&mut self, topics: &[String]) -> Result<(), ClientError>;

    /// 0件以上のレコードを取得する。レコードが無い場合は最大で`timeout`待機する。
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<RawRecord>, ClientError>;

    /// オフセットをコミットする。同じ内容を何度コミットしても結果は変わらない。
    async fn commit(&mut self, batch: &CommitBatch) -> Result<(), ClientError>;

    async fn close(&mut self);
}

#[cfg(test)]
pub mod testing;
