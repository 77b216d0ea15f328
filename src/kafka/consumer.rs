use super::config::ClientSettings;
use super::key::TopicPartition;
use super::message::RawRecord;
use crate::client::{IGroupClient, IRebalanceListener};
use crate::error::ClientError;
use crate::offsets::{CommitBatch, OffsetReset, PartitionAssignment, ResumePosition};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{timeout, Instant};

const JOIN_POLL_SLICE: Duration = Duration::from_millis(100);

type Inner = StreamConsumer<ConnectorContext>;

fn to_partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

fn to_tpl(batch: &CommitBatch) -> KafkaResult<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for (tp, offset) in batch.iter() {
        tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*offset))?;
    }
    Ok(tpl)
}

/// librdkafkaのコールバックを受け取るコンテキスト。
///
/// ログを[log]へ転送し、リバランスを[IRebalanceListener]へ通知する。
pub struct ConnectorContext {
    worker: usize,
    offset_reset: OffsetReset,
    broker_timeout: Duration,
    listener: Mutex<Option<Arc<dyn IRebalanceListener>>>,
    assigned: AtomicBool,
}

impl ConnectorContext {
    pub fn new(worker: usize, offset_reset: OffsetReset, broker_timeout: Duration) -> Self {
        Self {
            worker,
            offset_reset,
            broker_timeout,
            listener: Mutex::new(None),
            assigned: AtomicBool::new(false),
        }
    }

    fn set_listener(&self, listener: Option<Arc<dyn IRebalanceListener>>) {
        let mut guard = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = listener;
    }

    fn listener(&self) -> Option<Arc<dyn IRebalanceListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_assigned(&self) -> bool {
        self.assigned.load(Ordering::SeqCst)
    }

    /// 現在の割り当て全体と、それぞれのコミット済みオフセットを取得する。
    fn current_assignment(&self, consumer: &BaseConsumer<Self>) -> KafkaResult<PartitionAssignment> {
        let assignment = consumer.assignment()?;
        if assignment.count() == 0 {
            return Ok(PartitionAssignment::new());
        }
        let committed = consumer.committed_offsets(assignment, self.broker_timeout)?;
        Ok(committed
            .elements()
            .iter()
            .map(|elem| {
                let position = match elem.offset() {
                    Offset::Offset(offset) if offset >= 0 => ResumePosition::Committed(offset),
                    _ => ResumePosition::Reset(self.offset_reset),
                };
                (TopicPartition::new(elem.topic(), elem.partition()), position)
            })
            .collect())
    }
}

impl ClientContext for ConnectorContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => {
                error!("librdkafka: {} {}(worker={})", fac, log_message, self.worker)
            }
            RDKafkaLogLevel::Warning => {
                warn!("librdkafka: {} {}(worker={})", fac, log_message, self.worker)
            }
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!("librdkafka: {} {}(worker={})", fac, log_message, self.worker)
            }
            RDKafkaLogLevel::Debug => {
                debug!("librdkafka: {} {}(worker={})", fac, log_message, self.worker)
            }
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        warn!(
            "KafkaError occurred.(worker={}, reason={}): {}",
            self.worker, reason, error
        );
    }
}

impl ConsumerContext for ConnectorContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let tpl = match rebalance {
            Rebalance::Revoke(tpl) => tpl,
            _ => return,
        };
        let partitions = to_partitions(tpl);
        info!(
            "Partitions are being revoked.(worker={}, partitions={:?})",
            self.worker, partitions
        );
        let listener = match self.listener() {
            Some(listener) => listener,
            None => return,
        };
        let batch = listener.on_revoke(&partitions);
        if batch.is_empty() {
            return;
        }
        // librdkafkaの`socket.timeout.ms`まで待つ。`broker_timeout`は適用されない
        let result = to_tpl(&batch).and_then(|tpl| base_consumer.commit(&tpl, CommitMode::Sync));
        match result.map_err(ClientError::from) {
            Ok(()) => debug!("Committed offsets before revocation.(batch={:?})", batch),
            Err(ClientError::CommitConflict(_)) | Err(ClientError::RebalanceInProgress) => {
                debug!("Dropped stale commit on revocation.(batch={:?})", batch)
            }
            Err(e) => warn!(
                "Failed to commit offset on revocation.(worker={}, batch={:?}): {}",
                self.worker, batch, e
            ),
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Error(e) = rebalance {
            warn!("Rebalance failed.(worker={}): {}", self.worker, e);
            return;
        }
        let assignment = match self.current_assignment(base_consumer) {
            Ok(assignment) => assignment,
            Err(e) => {
                error!(
                    "Failed to fetch committed offsets. Resume with reset policy.(worker={}): {}",
                    self.worker, e
                );
                match base_consumer.assignment() {
                    Ok(tpl) => to_partitions(&tpl)
                        .into_iter()
                        .map(|tp| (tp, ResumePosition::Reset(self.offset_reset)))
                        .collect(),
                    Err(_) => PartitionAssignment::new(),
                }
            }
        };
        info!(
            "Partitions are assigned.(worker={}, partitions={})",
            self.worker,
            assignment.len()
        );
        if let Some(listener) = self.listener() {
            listener.on_assign(assignment);
        }
        if let Rebalance::Assign(_) = rebalance {
            self.assigned.store(true, Ordering::SeqCst);
        }
    }
}

/// rdkafkaの[StreamConsumer]によるグループクライアント。
pub struct RdKafkaGroupClient {
    consumer: Option<Arc<Inner>>,
    settings: ClientSettings,
    worker: usize,
    backlog: VecDeque<RawRecord>,
}

impl RdKafkaGroupClient {
    pub fn new(settings: &ClientSettings, worker: usize) -> Result<Self, ClientError> {
        let context = ConnectorContext::new(worker, settings.offset_reset(), settings.broker_timeout());
        let consumer: Inner = settings.client_config(worker).create_with_context(context)?;
        Ok(Self {
            consumer: Some(Arc::new(consumer)),
            settings: settings.clone(),
            worker,
            backlog: VecDeque::new(),
        })
    }

    fn consumer(&self) -> Result<&Arc<Inner>, ClientError> {
        self.consumer
            .as_ref()
            .ok_or_else(|| ClientError::Fatal("consumer is already closed".to_string()))
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), ClientError> {
        let topics = topics.iter().map(String::as_str).collect::<Vec<_>>();
        self.consumer()?.subscribe(&topics)?;
        Ok(())
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(&Inner) -> KafkaResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let consumer = self.consumer()?.clone();
        match tokio::task::spawn_blocking(move || f(&consumer)).await {
            Ok(result) => result.map_err(ClientError::from),
            Err(e) => Err(ClientError::Fatal(e.to_string())),
        }
    }
}

/// `limit`以内に応答のなかった呼び出しを再試行可能なエラーにする。
///
/// 待つのをやめてもブロッキングスレッド上の呼び出しは完了するまで続く。
async fn bounded<F, T>(limit: Duration, future: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Transient(format!(
            "no response from broker within {:?}",
            limit
        ))),
    }
}

#[async_trait]
impl IGroupClient for RdKafkaGroupClient {
    async fn fetch_topics(&mut self) -> Result<Vec<String>, ClientError> {
        let broker_timeout = self.settings.broker_timeout();
        self.blocking(move |consumer| {
            let metadata = consumer.fetch_metadata(None, broker_timeout)?;
            Ok(metadata
                .topics()
                .iter()
                .map(|topic| topic.name().to_string())
                .collect())
        })
        .await
    }

    async fn join(
        &mut self,
        topics: &[String],
        listener: Arc<dyn IRebalanceListener>,
    ) -> Result<(), ClientError> {
        let consumer = self.consumer()?.clone();
        consumer.context().set_listener(Some(listener));
        consumer.context().assigned.store(false, Ordering::SeqCst);
        self.subscribe(topics)?;
        info!(
            "Subscribed topics. Waiting for assignment.(worker={}, topics={:?})",
            self.worker, topics
        );

        let deadline = Instant::now() + self.settings.join_timeout();
        while !consumer.context().is_assigned() {
            if Instant::now() >= deadline {
                return Err(ClientError::Transient(format!(
                    "no assignment within {:?}",
                    self.settings.join_timeout()
                )));
            }
            match timeout(JOIN_POLL_SLICE, consumer.recv()).await {
                Ok(Ok(msg)) => self.backlog.push_back(RawRecord::from_message(&msg)),
                Ok(Err(e)) => match ClientError::from(e) {
                    e @ ClientError::Auth(_) | e @ ClientError::Fatal(_) => return Err(e),
                    e => warn!("KafkaError occurred while joining.(worker={}): {}", self.worker, e),
                },
                Err(_) => {}
            }
        }
        Ok(())
    }

    async fn update_subscription(&mut self, topics: &[String]) -> Result<(), ClientError> {
        self.subscribe(topics)
    }

    async fn poll(&mut self, wait: Duration) -> Result<Vec<RawRecord>, ClientError> {
        let consumer = self.consumer()?.clone();
        let max_batch_size = self.settings.max_batch_size();
        let mut records = self
            .backlog
            .drain(..self.backlog.len().min(max_batch_size))
            .collect::<Vec<_>>();
        let deadline = Instant::now() + wait;

        if records.is_empty() {
            match timeout(wait, consumer.recv()).await {
                Ok(Ok(msg)) => records.push(RawRecord::from_message(&msg)),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(records),
            }
        }
        while records.len() < max_batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = self.settings.max_wait_time().min(remaining);
            if slice.is_zero() {
                break;
            }
            match timeout(slice, consumer.recv()).await {
                Ok(Ok(msg)) => records.push(RawRecord::from_message(&msg)),
                Ok(Err(e)) => {
                    warn!(
                        "KafkaError occurred. Return partial batch.(worker={}, records={}): {}",
                        self.worker,
                        records.len(),
                        e
                    );
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(records)
    }

    async fn commit(&mut self, batch: &CommitBatch) -> Result<(), ClientError> {
        if batch.is_empty() {
            return Ok(());
        }
        let tpl = to_tpl(batch)?;
        let broker_timeout = self.settings.broker_timeout();
        bounded(
            broker_timeout,
            self.blocking(move |consumer| consumer.commit(&tpl, CommitMode::Sync)),
        )
        .await
    }

    async fn close(&mut self) {
        let consumer = match self.consumer.take() {
            Some(consumer) => consumer,
            None => return,
        };
        self.backlog.clear();
        let worker = self.worker;
        let result = tokio::task::spawn_blocking(move || {
            consumer.unsubscribe();
            consumer.context().set_listener(None);
            drop(consumer);
        })
        .await;
        if let Err(e) = result {
            error!("Failed to close consumer.(worker={}): {}", worker, e);
        }
        info!("Closed consumer.(worker={})", worker);
    }
}
