//! イベントの転送先となるパイプラインとの境界。
//!
//! パイプラインは[IPipeline::emit]でイベントを受け取り、[Ack]を返す。
//! イベントを確実に受け入れた時点で対応する[Acker::ack]を呼ぶことで、
//! コネクタはそのレコードのオフセットをコミットできるようになる。
use crate::error::PipelineError;
use crate::processor::Event;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckStatus {
    Pending,
    Acked,
    /// パイプラインがイベントを受け入れられなかった
    Nacked,
}

/// 1件のイベントに対する確認応答の受け取り側。
#[derive(Clone, Debug)]
pub struct Ack {
    receiver: watch::Receiver<AckStatus>,
}

impl Ack {
    /// 既に確認応答済みの[Ack]
    pub fn acked() -> Self {
        let (_, receiver) = watch::channel(AckStatus::Acked);
        Self { receiver }
    }

    pub fn status(&self) -> AckStatus {
        *self.receiver.borrow()
    }

    /// 確認応答か否定応答が届くまで待機する。
    pub async fn resolved(&self) -> AckStatus {
        let mut receiver = self.receiver.clone();
        let status = match receiver.wait_for(|status| *status != AckStatus::Pending).await {
            Ok(status) => *status,
            Err(_) => AckStatus::Nacked,
        };
        status
    }
}

/// 1件のイベントに対する確認応答の送り側。
///
/// 応答しないまま[Drop]された場合は否定応答として扱われる。
#[derive(Debug)]
pub struct Acker {
    sender: watch::Sender<AckStatus>,
}

impl Acker {
    pub fn ack(self) {
        self.sender.send_replace(AckStatus::Acked);
    }

    pub fn nack(self) {
        self.sender.send_replace(AckStatus::Nacked);
    }
}

impl Drop for Acker {
    fn drop(&mut self) {
        if *self.sender.borrow() == AckStatus::Pending {
            self.sender.send_replace(AckStatus::Nacked);
        }
    }
}

pub fn ack_pair() -> (Acker, Ack) {
    let (sender, receiver) = watch::channel(AckStatus::Pending);
    (Acker { sender }, Ack { receiver })
}

/// コネクタが生成したイベントの転送先。
///
/// [IPipeline::emit]はバックプレッシャーのために待機してよい。
#[async_trait]
pub trait IPipeline: 'static + Send + Sync {
    async fn emit(&self, event: Event) -> Result<Ack, PipelineError>;
}

/// [ChannelPipeline]のバッファが一杯のときの振る舞い。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// 空きができるまで待機する
    Block,
    /// [PipelineError::BufferFull]を返す
    Reject,
}

/// [ChannelPipeline]から受信側へ渡される1件のイベント。
#[derive(Debug)]
pub struct Delivery {
    pub event: Event,
    acker: Acker,
}

impl Delivery {
    pub fn ack(self) -> Event {
        self.acker.ack();
        self.event
    }

    pub fn nack(self) {
        self.acker.nack();
    }

    pub fn into_parts(self) -> (Event, Acker) {
        (self.event, self.acker)
    }
}

/// 有界のチャネルでイベントを受信側へ渡すパイプライン。
pub struct ChannelPipeline {
    sender: mpsc::Sender<Delivery>,
    overflow: OverflowPolicy,
}

impl ChannelPipeline {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        Self::with_overflow(capacity, OverflowPolicy::Block)
    }

    pub fn with_overflow(
        capacity: usize,
        overflow: OverflowPolicy,
    ) -> (Self, mpsc::Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, overflow }, receiver)
    }
}

#[async_trait]
impl IPipeline for ChannelPipeline {
    async fn emit(&self, event: Event) -> Result<Ack, PipelineError> {
        let (acker, ack) = ack_pair();
        let delivery = Delivery { event, acker };
        match self.overflow {
            OverflowPolicy::Block => self
                .sender
                .send(delivery)
                .await
                .map_err(|_| PipelineError::Closed)?,
            OverflowPolicy::Reject => self.sender.try_send(delivery).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PipelineError::BufferFull,
                mpsc::error::TrySendError::Closed(_) => PipelineError::Closed,
            })?,
        }
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::create_event;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_ack_status() {
        let (acker, ack) = ack_pair();
        assert_eq!(ack.status(), AckStatus::Pending);
        acker.ack();
        assert_eq!(ack.status(), AckStatus::Acked);
        assert_eq!(Ack::acked().status(), AckStatus::Acked);
    }

    #[test]
    fn test_dropped_acker_is_nack() {
        let (acker, ack) = ack_pair();
        drop(acker);
        assert_eq!(ack.status(), AckStatus::Nacked);
    }

    #[tokio::test]
    async fn test_resolved_waits_for_ack() {
        let (acker, ack) = ack_pair();
        let waiter = tokio::spawn({
            let ack = ack.clone();
            async move { ack.resolved().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        acker.ack();
        let status = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(status, AckStatus::Acked);
    }

    #[tokio::test]
    async fn test_resolved_after_sender_is_gone() {
        assert_eq!(
            timeout(Duration::from_secs(1), Ack::acked().resolved())
                .await
                .unwrap(),
            AckStatus::Acked
        );
        let (acker, ack) = ack_pair();
        drop(acker);
        assert_eq!(ack.resolved().await, AckStatus::Nacked);
    }

    #[tokio::test]
    async fn test_channel_pipeline_delivers() {
        let (pipeline, mut receiver) = ChannelPipeline::channel(4);
        let ack = pipeline.emit(create_event("Hello, world")).await.unwrap();
        let delivery = receiver.recv().await.unwrap();
        assert_eq!(delivery.event.record["message"], "Hello, world");
        assert_eq!(ack.status(), AckStatus::Pending);
        delivery.ack();
        assert_eq!(ack.status(), AckStatus::Acked);
    }

    #[tokio::test]
    async fn test_channel_pipeline_applies_backpressure() {
        let (pipeline, mut receiver) = ChannelPipeline::channel(1);
        pipeline.emit(create_event("first")).await.unwrap();
        assert!(timeout(Duration::from_millis(50), pipeline.emit(create_event("second")))
            .await
            .is_err());
        receiver.recv().await.unwrap().ack();
        assert!(timeout(Duration::from_millis(50), pipeline.emit(create_event("third")))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_channel_pipeline_rejects_when_full() {
        let (pipeline, receiver) = ChannelPipeline::with_overflow(1, OverflowPolicy::Reject);
        pipeline.emit(create_event("first")).await.unwrap();
        assert_eq!(
            pipeline.emit(create_event("second")).await.unwrap_err(),
            PipelineError::BufferFull
        );
        drop(receiver);
        assert_eq!(
            pipeline.emit(create_event("third")).await.unwrap_err(),
            PipelineError::Closed
        );
    }
}
