//! ワーカー1つ分のポーリングループ。
//!
//! `Joining → Steady → Rebalancing → Steady → … → Stopped`の順に状態が遷移する。
//!
//! - Joining: トピックを解決してグループに参加する。失敗した場合は[RetryPolicy]に従って再試行する
//! - Steady: ポーリングしたレコードをパーティション内のオフセット順に[RecordProcessor]へ渡し、
//!   確認応答されたオフセットを[CommitCadence]に従ってコミットする
//! - Rebalancing: パーティションの剥奪を通知されてから、新しい割り当てが確定するまで
//! - Stopped: 停止の要求を受け、確認応答済みのオフセットをコミットしてセッションを閉じた後
//!
//! 値をデコードできなかったレコードはイベントを生成しなかったものとして扱い、
//! 後続のレコードのオフセットのコミットを妨げない。
use crate::client::{IGroupClient, IRebalanceListener};
use crate::context::Context;
use crate::error::{ClientError, WorkerError};
use crate::kafka::key::TopicPartition;
use crate::kafka::message::RawRecord;
use crate::offsets::{CommitBatch, OffsetTracker, PartitionAssignment};
use crate::policy::{Backoff, CommitCadence, IJobPolicy, RetryLimit, RetryPolicy};
use crate::processor::RecordProcessor;
use crate::topic::{ResolveError, TopicResolver};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoopState {
    Joining,
    Steady,
    Rebalancing,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct LoopSettings {
    /// 1回のポーリングで待機する時間の上限
    pub poll_timeout: Duration,
    pub join_backoff: Backoff,
    pub join_retry_limit: RetryLimit,
    /// ポーリングとメタデータ取得の一時的な失敗に対する待ち時間
    pub error_backoff: Backoff,
    pub commit_interval: Duration,
    pub commit_max_records: usize,
    /// 確認応答を待つレコード数の上限。超えた場合は最も古いレコードの確認応答を待つ。
    pub max_inflight_records: usize,
    pub metadata_refresh_interval: Duration,
    /// 停止時に確認応答を待つ時間
    pub shutdown_drain: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(1000),
            join_backoff: Backoff::new(Duration::from_secs(30), Duration::from_secs(240)),
            join_retry_limit: RetryLimit::Bounded(10),
            error_backoff: Backoff::default(),
            commit_interval: Duration::from_millis(5000),
            commit_max_records: 1000,
            max_inflight_records: 10000,
            metadata_refresh_interval: Duration::from_millis(300_000),
            shutdown_drain: Duration::from_millis(5000),
        }
    }
}

/// ワーカーの処理件数。ワーカーが再起動しても引き継がれる。
#[derive(Debug, Default)]
pub struct WorkerStats {
    records: AtomicU64,
    events: AtomicU64,
    parse_errors: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
    restarts: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub records: u64,
    pub events: u64,
    pub parse_errors: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub restarts: u64,
}

impl StatsSnapshot {
    pub fn merge(mut self, other: StatsSnapshot) -> Self {
        self.records += other.records;
        self.events += other.events;
        self.parse_errors += other.parse_errors;
        self.commits += other.commits;
        self.commit_failures += other.commit_failures;
        self.restarts += other.restarts;
        self
    }
}

fn incr(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records: self.records.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn restarted(&self) {
        incr(&self.restarts, 1);
    }
}

fn lock(tracker: &Mutex<OffsetTracker>) -> MutexGuard<'_, OffsetTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// リバランスの通知を[OffsetTracker]へ反映する。
struct TrackerListener {
    worker: usize,
    tracker: Arc<Mutex<OffsetTracker>>,
    state: Arc<watch::Sender<LoopState>>,
}

impl IRebalanceListener for TrackerListener {
    fn on_revoke(&self, partitions: &[TopicPartition]) -> CommitBatch {
        self.state.send_if_modified(|state| {
            if *state == LoopState::Steady {
                *state = LoopState::Rebalancing;
                return true;
            }
            false
        });
        let batch = lock(&self.tracker).revoke(partitions);
        debug!(
            "Flush offsets of revoked partitions.(worker={}, batch={:?})",
            self.worker, batch
        );
        batch
    }

    fn on_assign(&self, assignment: PartitionAssignment) {
        debug!(
            "Partitions are assigned.(worker={}, assignment={:?})",
            self.worker, assignment
        );
        lock(&self.tracker).assign(assignment);
        self.state.send_if_modified(|state| {
            if *state == LoopState::Rebalancing {
                *state = LoopState::Steady;
                return true;
            }
            false
        });
    }
}

pub struct PollLoop {
    worker: usize,
    client: Box<dyn IGroupClient>,
    resolver: TopicResolver,
    processor: Arc<RecordProcessor>,
    settings: LoopSettings,
    tracker: Arc<Mutex<OffsetTracker>>,
    cadence: CommitCadence,
    refresh: RetryPolicy,
    next_refresh: Instant,
    state: Arc<watch::Sender<LoopState>>,
    stats: Arc<WorkerStats>,
}

impl PollLoop {
    pub fn new(
        worker: usize,
        client: Box<dyn IGroupClient>,
        resolver: TopicResolver,
        processor: Arc<RecordProcessor>,
        settings: LoopSettings,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Joining);
        let cadence = CommitCadence::new(settings.commit_interval, settings.commit_max_records);
        let refresh = RetryPolicy::new(settings.error_backoff.clone(), RetryLimit::Unbounded);
        let next_refresh = Instant::now() + settings.metadata_refresh_interval;
        Self {
            worker,
            client,
            resolver,
            processor,
            settings,
            tracker: Arc::new(Mutex::new(OffsetTracker::new())),
            cadence,
            refresh,
            next_refresh,
            state: Arc::new(state),
            stats: Arc::new(WorkerStats::new()),
        }
    }

    /// 状態と処理件数の出力先を差し替える。再起動をまたいで同じ値を使うために用いる。
    pub fn with_observers(
        mut self,
        state: Arc<watch::Sender<LoopState>>,
        stats: Arc<WorkerStats>,
    ) -> Self {
        state.send_replace(LoopState::Joining);
        self.state = state;
        self.stats = stats;
        self
    }

    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// `context`が停止するか、回復できないエラーが発生するまでループを実行する。
    pub async fn run(mut self, context: Context) -> Result<(), WorkerError> {
        self.set_state(LoopState::Joining);
        let result = match self.join(&context).await {
            Ok(true) => self.steady(&context).await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            error!("Worker stopped with error.(worker={}): {}", self.worker, e);
        }
        self.finish(result.is_ok()).await;
        self.set_state(LoopState::Stopped);
        info!("Worker stopped.(worker={})", self.worker);
        result
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }

    async fn resolve_topics(&mut self) -> Result<Result<Vec<String>, ResolveError>, ClientError> {
        if !self.resolver.needs_catalog() {
            return Ok(self.resolver.resolve(&[]));
        }
        let catalog = self.client.fetch_topics().await?;
        Ok(self.resolver.resolve(&catalog))
    }

    /// グループに参加する。停止が要求された場合はfalseを返す。
    async fn join(&mut self, context: &Context) -> Result<bool, WorkerError> {
        let mut policy = RetryPolicy::new(
            self.settings.join_backoff.clone(),
            self.settings.join_retry_limit,
        );
        let listener: Arc<dyn IRebalanceListener> = Arc::new(TrackerListener {
            worker: self.worker,
            tracker: self.tracker.clone(),
            state: self.state.clone(),
        });
        loop {
            if context.is_shutdown() {
                return Ok(false);
            }
            let attempt = tokio::select! {
                _ = context.done() => return Ok(false),
                attempt = self.try_join(listener.clone()) => attempt,
            };
            let wait = match attempt {
                Ok(Some(topics)) => {
                    info!(
                        "Joined consumer group.(worker={}, topics={:?})",
                        self.worker, topics
                    );
                    self.resolver.apply(topics);
                    self.next_refresh = Instant::now() + self.settings.metadata_refresh_interval;
                    return Ok(true);
                }
                Ok(None) => {
                    info!(
                        "No topic matches subscription. Retry.(worker={}, subscription={})",
                        self.worker,
                        self.resolver.subscription()
                    );
                    self.settings.join_backoff.delay(0)
                }
                Err(e @ ClientError::Auth(_)) => return Err(e.into()),
                Err(e) => {
                    policy.update();
                    if policy.check() {
                        return Err(WorkerError::JoinExhausted {
                            attempts: policy.attempts(),
                            source: e,
                        });
                    }
                    let wait = policy.interval();
                    warn!(
                        "Failed to join consumer group. Retry after {:?}.(worker={}, attempt={}): {}",
                        wait,
                        self.worker,
                        policy.attempts(),
                        e
                    );
                    wait
                }
            };
            tokio::select! {
                _ = context.done() => return Ok(false),
                _ = sleep(wait) => {}
            }
        }
    }

    /// 一致するトピックが無い場合はNoneを返す。
    async fn try_join(
        &mut self,
        listener: Arc<dyn IRebalanceListener>,
    ) -> Result<Option<Vec<String>>, ClientError> {
        let topics = match self.resolve_topics().await? {
            Ok(topics) => topics,
            Err(ResolveError::Empty(_)) => return Ok(None),
        };
        self.client.join(&topics, listener).await?;
        Ok(Some(topics))
    }

    async fn steady(&mut self, context: &Context) -> Result<(), WorkerError> {
        self.set_state(LoopState::Steady);
        self.cadence.reset();
        let mut failures = RetryPolicy::new(self.settings.error_backoff.clone(), RetryLimit::Unbounded);
        let poll_timeout = self.settings.poll_timeout;
        loop {
            if !self.wait_for_capacity(context).await? {
                return Ok(());
            }
            let polled = tokio::select! {
                _ = context.done() => return Ok(()),
                polled = self.client.poll(poll_timeout) => polled,
            };
            match polled {
                Ok(records) => {
                    failures.reset();
                    let handled = tokio::select! {
                        _ = context.done() => return Ok(()),
                        handled = self.handle_batch(records, context) => handled,
                    };
                    if !handled? {
                        return Ok(());
                    }
                }
                Err(e @ ClientError::Auth(_)) | Err(e @ ClientError::Fatal(_)) => {
                    return Err(e.into())
                }
                Err(e) => {
                    failures.update();
                    let wait = failures.interval();
                    warn!(
                        "Failed to poll records. Retry after {:?}.(worker={}): {}",
                        wait, self.worker, e
                    );
                    tokio::select! {
                        _ = context.done() => return Ok(()),
                        _ = sleep(wait) => {}
                    }
                }
            }

            self.collect()?;
            if self.cadence.check() {
                self.commit().await?;
                self.cadence.reset();
            }
            if self.resolver.needs_catalog() && Instant::now() >= self.next_refresh {
                self.refresh_topics(context).await;
            }
        }
    }

    /// パーティションごとにオフセット順で処理する。停止が要求された場合はfalseを返す。
    async fn handle_batch(
        &mut self,
        mut records: Vec<RawRecord>,
        context: &Context,
    ) -> Result<bool, WorkerError> {
        records.sort_by(|a, b| {
            (a.topic(), a.partition(), a.offset()).cmp(&(b.topic(), b.partition(), b.offset()))
        });
        let processor = self.processor.clone();
        for record in records {
            let tp = record.topic_partition();
            let accepted = lock(&self.tracker).accepts(&tp, record.offset());
            if !accepted {
                debug!(
                    "Skipped record of unassigned partition.(partition={}, offset={})",
                    tp,
                    record.offset()
                );
                continue;
            }
            incr(&self.stats.records, 1);
            let forwarded = processor.forward(&record).await?;
            if forwarded.parse_failed {
                incr(&self.stats.parse_errors, 1);
            }
            incr(&self.stats.events, forwarded.acks.len() as u64);
            lock(&self.tracker).track(tp, record.offset(), forwarded.acks);
            if !self.wait_for_capacity(context).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 確認応答済みのレコードを取り除き、コミットの頻度の判定に加える。
    fn collect(&mut self) -> Result<(), WorkerError> {
        let released = lock(&self.tracker).collect_acked()?;
        self.cadence.add(released);
        Ok(())
    }

    /// 確認応答を待つレコードが上限未満になるまで待機する。停止が要求された場合はfalseを返す。
    async fn wait_for_capacity(&mut self, context: &Context) -> Result<bool, WorkerError> {
        loop {
            self.collect()?;
            let oldest = {
                let tracker = lock(&self.tracker);
                if tracker.inflight_records() < self.settings.max_inflight_records {
                    return Ok(true);
                }
                tracker.oldest_pending()
            };
            let ack = match oldest {
                Some(ack) => ack,
                None => return Ok(true),
            };
            debug!(
                "Too many records are waiting for acknowledgement.(worker={})",
                self.worker
            );
            tokio::select! {
                _ = context.done() => return Ok(false),
                _ = ack.resolved() => {}
            }
        }
    }

    /// 確認応答済みでコミットされていないオフセットをコミットする。
    ///
    /// 一時的な失敗は次の機会に再試行する。古い世代のコミットは破棄する。
    async fn commit(&mut self) -> Result<(), WorkerError> {
        let batch = lock(&self.tracker).pending_commits();
        if batch.is_empty() {
            return Ok(());
        }
        match self.client.commit(&batch).await {
            Ok(()) => {
                lock(&self.tracker).mark_committed(&batch);
                incr(&self.stats.commits, 1);
                debug!("Committed offsets.(worker={}, batch={:?})", self.worker, batch);
            }
            Err(ClientError::CommitConflict(reason)) => {
                debug!(
                    "Dropped stale commit.(worker={}, batch={:?}): {}",
                    self.worker, batch, reason
                );
            }
            Err(ClientError::RebalanceInProgress) => {
                debug!(
                    "Deferred commit during rebalance.(worker={}, batch={:?})",
                    self.worker, batch
                );
            }
            Err(e @ ClientError::Auth(_)) => return Err(e.into()),
            Err(e) => {
                incr(&self.stats.commit_failures, 1);
                for (tp, offset) in batch.iter() {
                    warn!(
                        "Failed to commit offset. Retry at next cadence.(topic={}, partition={}, offset={}): {}",
                        tp.topic, tp.partition, offset, e
                    );
                }
            }
        }
        Ok(())
    }

    /// トピック一覧を再解決し、変化があれば購読を更新する。
    ///
    /// 既に割り当てられているパーティションは購読の更新で剥奪されない。
    async fn refresh_topics(&mut self, context: &Context) {
        let resolved = tokio::select! {
            _ = context.done() => return,
            resolved = self.resolve_topics() => resolved,
        };
        let topics = match resolved {
            Ok(Ok(topics)) => topics,
            Ok(Err(e)) => {
                warn!(
                    "Keep current subscription.(worker={}, topics={:?}): {}",
                    self.worker,
                    self.resolver.current(),
                    e
                );
                self.schedule_refresh(true);
                return;
            }
            Err(e) => {
                self.refresh.update();
                warn!(
                    "Failed to fetch topic metadata. Retry after {:?}.(worker={}): {}",
                    self.refresh.interval(),
                    self.worker,
                    e
                );
                self.schedule_refresh(false);
                return;
            }
        };
        if let Some(change) = self.resolver.diff(&topics) {
            info!(
                "Subscribed topics are changed.(worker={}, added={:?}, removed={:?})",
                self.worker, change.added, change.removed
            );
            if let Err(e) = self.client.update_subscription(&change.topics).await {
                self.refresh.update();
                warn!(
                    "Failed to update subscription.(worker={}, topics={:?}): {}",
                    self.worker, change.topics, e
                );
                self.schedule_refresh(false);
                return;
            }
            self.resolver.apply(change.topics);
        }
        self.schedule_refresh(true);
    }

    fn schedule_refresh(&mut self, succeeded: bool) {
        let interval = self.settings.metadata_refresh_interval;
        let wait = if succeeded {
            self.refresh.reset();
            interval
        } else {
            self.refresh.interval().min(interval)
        };
        self.next_refresh = Instant::now() + wait;
    }

    /// 確認応答を一定時間待ち、確認応答済みのオフセットをコミットしてセッションを閉じる。
    async fn finish(&mut self, drain: bool) {
        if drain {
            self.drain().await;
        }
        if let Err(e) = self.collect() {
            warn!("Records after a rejected event will be redelivered.({})", e);
        }
        if let Err(e) = self.commit().await {
            warn!("Failed to commit offset on shutdown.(worker={}): {}", self.worker, e);
        }
        self.client.close().await;
    }

    async fn drain(&mut self) {
        let deadline = Instant::now() + self.settings.shutdown_drain;
        loop {
            if self.collect().is_err() {
                return;
            }
            let oldest = lock(&self.tracker).oldest_pending();
            let ack = match oldest {
                Some(ack) => ack,
                None => return,
            };
            if timeout_at(deadline, ack.resolved()).await.is_err() {
                warn!(
                    "Gave up waiting for acknowledgement.(worker={}, inflight={})",
                    self.worker,
                    lock(&self.tracker).inflight_records()
                );
                return;
            }
        }
    }
}
