use super::*;
use crate::offsets::{OffsetReset, ResumePosition};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct BrokerState {
    topics: BTreeMap<String, Vec<Vec<RawRecord>>>,
    committed: BTreeMap<TopicPartition, i64>,
    commits: Vec<(TopicPartition, i64)>,
    revoked: Vec<TopicPartition>,
    subscriptions: Vec<Vec<String>>,
    members: BTreeMap<usize, Vec<String>>,
    assignments: BTreeMap<usize, Vec<TopicPartition>>,
    generation: u64,
    next_member: usize,
    joins: usize,
    closed: usize,
    offset_reset: OffsetReset,
    join_errors: VecDeque<ClientError>,
    poll_errors: VecDeque<ClientError>,
    commit_errors: VecDeque<ClientError>,
    fetch_errors: VecDeque<ClientError>,
}

impl BrokerState {
    fn rebalance(&mut self) {
        let mut assignments: BTreeMap<usize, Vec<TopicPartition>> =
            self.members.keys().map(|id| (*id, vec![])).collect();
        for (topic, partitions) in self.topics.iter() {
            let candidates = self
                .members
                .iter()
                .filter(|(_, topics)| topics.contains(topic))
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            if candidates.is_empty() {
                continue;
            }
            for partition in 0..partitions.len() {
                let owner = candidates[partition % candidates.len()];
                if let Some(assigned) = assignments.get_mut(&owner) {
                    assigned.push(TopicPartition::new(topic.clone(), partition as i32));
                }
            }
        }
        self.assignments = assignments;
        self.generation += 1;
    }

    fn resume_position(&self, tp: &TopicPartition) -> (ResumePosition, i64) {
        match self.committed.get(tp) {
            Some(offset) => (ResumePosition::Committed(*offset), *offset),
            None => {
                let position = match self.offset_reset {
                    OffsetReset::Earliest => 0,
                    OffsetReset::Latest => self.log(tp).map_or(0, |log| log.len() as i64),
                };
                (ResumePosition::Reset(self.offset_reset), position)
            }
        }
    }

    fn log(&self, tp: &TopicPartition) -> Option<&Vec<RawRecord>> {
        self.topics
            .get(&tp.topic)
            .and_then(|partitions| partitions.get(tp.partition as usize))
    }
}

/// メモリ上でコンシューマーグループを模倣するブローカー。
///
/// パーティションは購読しているメンバーに`partition % メンバー数`で割り振られ、
/// 割り当ての変化した分だけが剥奪される。
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offset_reset(self, offset_reset: OffsetReset) -> Self {
        self.state.lock().unwrap().offset_reset = offset_reset;
        self
    }

    pub fn client(&self) -> MockGroupClient {
        MockGroupClient {
            broker: self.clone(),
            member: None,
            listener: None,
            generation: 0,
            assignment: vec![],
            positions: BTreeMap::new(),
        }
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.state.lock().unwrap();
        if state.topics.contains_key(topic) {
            return;
        }
        state
            .topics
            .insert(topic.to_string(), vec![vec![]; partitions.max(1)]);
        if state.members.values().any(|topics| topics.iter().any(|t| t == topic)) {
            state.rebalance();
        }
    }

    /// レコードを追加してオフセットを返す。トピックが無い場合は1パーティションで作成する。
    pub fn produce(&self, topic: &str, partition: i32, value: &str) -> i64 {
        self.produce_record(topic, partition, |record| record.with_value(value))
    }

    pub fn produce_tombstone(&self, topic: &str, partition: i32) -> i64 {
        self.produce_record(topic, partition, |record| record)
    }

    fn produce_record<F>(&self, topic: &str, partition: i32, build: F) -> i64
    where
        F: FnOnce(RawRecord) -> RawRecord,
    {
        self.create_topic(topic, 1);
        let mut state = self.state.lock().unwrap();
        let log = state
            .topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
            .unwrap();
        let offset = log.len() as i64;
        let record = build(RawRecord::new(topic, partition, offset))
            .with_timestamp(1_650_000_000_000 + offset);
        log.push(record);
        offset
    }

    pub fn fail_joins(&self, times: usize, error: ClientError) {
        let mut state = self.state.lock().unwrap();
        state.join_errors.extend(std::iter::repeat(error).take(times));
    }

    pub fn fail_polls(&self, times: usize, error: ClientError) {
        let mut state = self.state.lock().unwrap();
        state.poll_errors.extend(std::iter::repeat(error).take(times));
    }

    pub fn fail_commits(&self, times: usize, error: ClientError) {
        let mut state = self.state.lock().unwrap();
        state.commit_errors.extend(std::iter::repeat(error).take(times));
    }

    pub fn fail_fetches(&self, times: usize, error: ClientError) {
        let mut state = self.state.lock().unwrap();
        state.fetch_errors.extend(std::iter::repeat(error).take(times));
    }

    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.state.lock().unwrap().committed.get(tp).copied()
    }

    /// 受け付けたコミットの履歴
    pub fn commits(&self) -> Vec<(TopicPartition, i64)> {
        self.state.lock().unwrap().commits.clone()
    }

    /// 剥奪されたパーティションの履歴
    pub fn revoked(&self) -> Vec<TopicPartition> {
        self.state.lock().unwrap().revoked.clone()
    }

    /// 購読したトピック一覧の履歴
    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn joins(&self) -> usize {
        self.state.lock().unwrap().joins
    }

    pub fn members(&self) -> usize {
        self.state.lock().unwrap().members.len()
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn assignments(&self) -> Vec<Vec<TopicPartition>> {
        self.state
            .lock()
            .unwrap()
            .assignments
            .values()
            .cloned()
            .collect()
    }
}

pub struct MockGroupClient {
    broker: MockBroker,
    member: Option<usize>,
    listener: Option<Arc<dyn IRebalanceListener>>,
    generation: u64,
    assignment: Vec<TopicPartition>,
    positions: BTreeMap<TopicPartition, i64>,
}

impl MockGroupClient {
    /// ブローカー側で割り当てが変わっていれば、リバランスのコールバックを呼ぶ。
    fn sync_assignment(&mut self) {
        let (member, listener) = match (self.member, &self.listener) {
            (Some(member), Some(listener)) => (member, listener.clone()),
            _ => return,
        };
        let next = {
            let state = self.broker.state.lock().unwrap();
            if state.generation == self.generation {
                return;
            }
            self.generation = state.generation;
            state.assignments.get(&member).cloned().unwrap_or_default()
        };
        if next == self.assignment {
            return;
        }

        let revoked = self
            .assignment
            .iter()
            .filter(|tp| !next.contains(tp))
            .cloned()
            .collect::<Vec<_>>();
        if !revoked.is_empty() {
            let batch = listener.on_revoke(&revoked);
            let mut state = self.broker.state.lock().unwrap();
            for (tp, offset) in batch.iter() {
                state.committed.insert(tp.clone(), *offset);
                state.commits.push((tp.clone(), *offset));
            }
            state.revoked.extend(revoked.iter().cloned());
        }
        self.positions.retain(|tp, _| next.contains(tp));

        let assignment = {
            let state = self.broker.state.lock().unwrap();
            next.iter()
                .map(|tp| {
                    let (resume, position) = state.resume_position(tp);
                    if !self.assignment.contains(tp) {
                        self.positions.insert(tp.clone(), position);
                    }
                    (tp.clone(), resume)
                })
                .collect::<PartitionAssignment>()
        };
        self.assignment = next;
        listener.on_assign(assignment);
    }
}

#[async_trait]
impl IGroupClient for MockGroupClient {
    async fn fetch_topics(&mut self) -> Result<Vec<String>, ClientError> {
        let mut state = self.broker.state.lock().unwrap();
        if let Some(error) = state.fetch_errors.pop_front() {
            return Err(error);
        }
        Ok(state.topics.keys().cloned().collect())
    }

    async fn join(
        &mut self,
        topics: &[String],
        listener: Arc<dyn IRebalanceListener>,
    ) -> Result<(), ClientError> {
        {
            let mut state = self.broker.state.lock().unwrap();
            state.joins += 1;
            if let Some(error) = state.join_errors.pop_front() {
                return Err(error);
            }
            let member = state.next_member;
            state.next_member += 1;
            state.members.insert(member, topics.to_vec());
            state.subscriptions.push(topics.to_vec());
            state.rebalance();
            self.member = Some(member);
        }
        self.listener = Some(listener);
        self.generation = 0;
        self.assignment = vec![];
        self.positions.clear();
        self.sync_assignment();
        Ok(())
    }

    async fn update_subscription(&mut self, topics: &[String]) -> Result<(), ClientError> {
        {
            let mut state = self.broker.state.lock().unwrap();
            let member = match self.member {
                Some(member) => member,
                None => return Err(ClientError::Fatal("not joined".to_string())),
            };
            state.members.insert(member, topics.to_vec());
            state.subscriptions.push(topics.to_vec());
            state.rebalance();
        }
        self.sync_assignment();
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<RawRecord>, ClientError> {
        if let Some(error) = self.broker.state.lock().unwrap().poll_errors.pop_front() {
            return Err(error);
        }
        self.sync_assignment();
        let records = {
            let state = self.broker.state.lock().unwrap();
            let mut records = vec![];
            for (tp, position) in self.positions.iter_mut() {
                if let Some(log) = state.log(tp) {
                    records.extend(log.iter().skip(*position as usize).cloned());
                    *position = log.len() as i64;
                }
            }
            records
        };
        if records.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        Ok(records)
    }

    async fn commit(&mut self, batch: &CommitBatch) -> Result<(), ClientError> {
        let mut state = self.broker.state.lock().unwrap();
        if let Some(error) = state.commit_errors.pop_front() {
            return Err(error);
        }
        for (tp, offset) in batch.iter() {
            state.committed.insert(tp.clone(), *offset);
            state.commits.push((tp.clone(), *offset));
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.broker.state.lock().unwrap();
        state.closed += 1;
        if let Some(member) = self.member.take() {
            state.members.remove(&member);
            state.rebalance();
        }
        self.listener = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingListener {
        revoked: StdMutex<Vec<TopicPartition>>,
        assigned: StdMutex<Vec<PartitionAssignment>>,
    }

    impl IRebalanceListener for RecordingListener {
        fn on_revoke(&self, partitions: &[TopicPartition]) -> CommitBatch {
            self.revoked.lock().unwrap().extend(partitions.iter().cloned());
            partitions.iter().map(|tp| (tp.clone(), 1)).collect()
        }

        fn on_assign(&self, assignment: PartitionAssignment) {
            self.assigned.lock().unwrap().push(assignment);
        }
    }

    #[tokio::test]
    async fn test_members_share_partitions() {
        let broker = MockBroker::new();
        broker.create_topic("T", 2);
        broker.produce("T", 1, "x");

        let first_listener = Arc::new(RecordingListener::default());
        let mut first = broker.client();
        first
            .join(&["T".to_string()], first_listener.clone())
            .await
            .unwrap();
        assert_eq!(first_listener.assigned.lock().unwrap()[0].len(), 2);

        let mut second = broker.client();
        second
            .join(&["T".to_string()], Arc::new(RecordingListener::default()))
            .await
            .unwrap();
        let records = first.poll(Duration::from_millis(1)).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(
            *first_listener.revoked.lock().unwrap(),
            vec![TopicPartition::new("T", 1)]
        );
        assert_eq!(broker.committed(&TopicPartition::new("T", 1)), Some(1));
        assert_eq!(
            broker.assignments(),
            vec![
                vec![TopicPartition::new("T", 0)],
                vec![TopicPartition::new("T", 1)]
            ]
        );

        let records = second.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic_partition(), TopicPartition::new("T", 1));
        second.close().await;
        assert_eq!(broker.members(), 1);
    }

    #[tokio::test]
    async fn test_resume_from_committed_offset() {
        let broker = MockBroker::new();
        broker.produce("T", 0, "a");
        broker.produce("T", 0, "b");
        let mut client = broker.client();
        client
            .commit(&vec![(TopicPartition::new("T", 0), 1)].into_iter().collect())
            .await
            .unwrap();
        client
            .join(&["T".to_string()], Arc::new(RecordingListener::default()))
            .await
            .unwrap();
        let records = client.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset(), 1);
    }
}
