//! オフセットの管理。
//!
//! - [PartitionAssignment]: リバランス完了時点で割り当てられたパーティションと再開位置
//! - [CommitCursor]: パーティションごとのコミット可能なオフセットの水位
//! - [OffsetTracker]: パイプラインの確認応答を待っているレコードの管理
//!
//! オフセットはKafkaの慣例に従い「次に読み出すべき位置」で表す。
use crate::error::DeliveryError;
use crate::kafka::key::{Offset, TopicPartition};
use crate::pipeline::{Ack, AckStatus};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::{BTreeMap, VecDeque};

/// コミット済みオフセットが存在しない場合の読み出し開始位置。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumePosition {
    Committed(Offset),
    Reset(OffsetReset),
}

/// リバランスの結果割り当てられたパーティションと、それぞれの再開位置。
///
/// 部分的に更新されることはなく、リバランスの度に丸ごと置き換えられる。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionAssignment(BTreeMap<TopicPartition, ResumePosition>);

impl PartitionAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, tp: &TopicPartition) -> bool {
        self.0.contains_key(tp)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TopicPartition, &ResumePosition)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `revoked`を除いた新しい割り当てを返す。
    pub fn without(&self, revoked: &[TopicPartition]) -> Self {
        self.0
            .iter()
            .filter(|(tp, _)| !revoked.contains(tp))
            .map(|(tp, position)| (tp.clone(), *position))
            .collect()
    }
}

impl FromIterator<(TopicPartition, ResumePosition)> for PartitionAssignment {
    fn from_iter<I: IntoIterator<Item = (TopicPartition, ResumePosition)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// ブローカーへ送るコミット対象のオフセット集合。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitBatch(BTreeMap<TopicPartition, Offset>);

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tp: TopicPartition, offset: Offset) {
        self.0.insert(tp, offset);
    }

    pub fn get(&self, tp: &TopicPartition) -> Option<Offset> {
        self.0.get(tp).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TopicPartition, &Offset)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(TopicPartition, Offset)> for CommitBatch {
    fn from_iter<I: IntoIterator<Item = (TopicPartition, Offset)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Watermark {
    acked: Offset,
    committed: Option<Offset>,
}

/// パーティションごとのコミット可能なオフセットの水位。
///
/// 水位は後退せず、確認応答されていないレコードを越えて進むこともない。
#[derive(Clone, Debug, Default)]
pub struct CommitCursor {
    marks: BTreeMap<TopicPartition, Watermark>,
}

impl CommitCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// ブローカーに保存されているコミット済みオフセットで水位を初期化する。
    pub fn seed(&mut self, tp: TopicPartition, committed: Offset) {
        let mark = self.marks.entry(tp).or_insert(Watermark {
            acked: committed,
            committed: Some(committed),
        });
        mark.acked = mark.acked.max(committed);
        mark.committed = Some(mark.committed.map_or(committed, |c| c.max(committed)));
    }

    /// 水位を`next`まで進める。後退させようとした場合は何もせずfalseを返す。
    pub fn advance(&mut self, tp: &TopicPartition, next: Offset) -> bool {
        match self.marks.get_mut(tp) {
            Some(mark) if next <= mark.acked => false,
            Some(mark) => {
                mark.acked = next;
                true
            }
            None => {
                self.marks.insert(
                    tp.clone(),
                    Watermark {
                        acked: next,
                        committed: None,
                    },
                );
                true
            }
        }
    }

    pub fn position(&self, tp: &TopicPartition) -> Option<Offset> {
        self.marks.get(tp).map(|mark| mark.acked)
    }

    pub fn committed(&self, tp: &TopicPartition) -> Option<Offset> {
        self.marks.get(tp).and_then(|mark| mark.committed)
    }

    /// コミットされていない水位を持つパーティション
    pub fn pending(&self) -> CommitBatch {
        self.marks
            .iter()
            .filter(|(_, mark)| mark.committed.map_or(true, |c| mark.acked > c))
            .map(|(tp, mark)| (tp.clone(), mark.acked))
            .collect()
    }

    pub fn pending_for(&self, partitions: &[TopicPartition]) -> CommitBatch {
        self.pending()
            .iter()
            .filter(|(tp, _)| partitions.contains(tp))
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect()
    }

    pub fn mark_committed(&mut self, batch: &CommitBatch) {
        for (tp, offset) in batch.iter() {
            if let Some(mark) = self.marks.get_mut(tp) {
                let offset = (*offset).min(mark.acked);
                mark.committed = Some(mark.committed.map_or(offset, |c| c.max(offset)));
            }
        }
    }

    pub fn remove(&mut self, tp: &TopicPartition) {
        self.marks.remove(tp);
    }

    fn retain(&mut self, assignment: &PartitionAssignment) {
        self.marks.retain(|tp, _| assignment.contains(tp));
    }
}

struct InFlight {
    offset: Offset,
    acks: Vec<Ack>,
}

impl InFlight {
    fn status(&self) -> AckStatus {
        let mut status = AckStatus::Acked;
        for ack in &self.acks {
            match ack.status() {
                AckStatus::Nacked => return AckStatus::Nacked,
                AckStatus::Pending => status = AckStatus::Pending,
                AckStatus::Acked => {}
            }
        }
        status
    }
}

/// パイプラインへ転送したレコードの確認応答を追跡し、[CommitCursor]を進める。
///
/// ワーカー1つにつき1つ存在し、ポーリングループとリバランスのコールバックの間でのみ共有される。
#[derive(Default)]
pub struct OffsetTracker {
    cursor: CommitCursor,
    inflight: BTreeMap<TopicPartition, VecDeque<InFlight>>,
    inflight_records: usize,
    assignment: PartitionAssignment,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assignment(&self) -> &PartitionAssignment {
        &self.assignment
    }

    pub fn cursor(&self) -> &CommitCursor {
        &self.cursor
    }

    pub fn inflight_records(&self) -> usize {
        self.inflight_records
    }

    pub fn is_assigned(&self, tp: &TopicPartition) -> bool {
        self.assignment.contains(tp)
    }

    /// 割り当てを置き換え、割り当てから外れたパーティションの状態を破棄する。
    pub fn assign(&mut self, assignment: PartitionAssignment) {
        self.inflight.retain(|tp, _| assignment.contains(tp));
        self.inflight_records = self.inflight.values().map(VecDeque::len).sum();
        self.cursor.retain(&assignment);
        for (tp, position) in assignment.iter() {
            if let ResumePosition::Committed(offset) = position {
                self.cursor.seed(tp.clone(), *offset);
            }
        }
        self.assignment = assignment;
    }

    /// 剥奪されるパーティションについて、確認応答済みでコミットされていないオフセットを返す。
    ///
    /// 返却後、それらのパーティションの状態は破棄される。確認応答を待っていたレコードは
    /// 次に割り当てられたメンバーへ再配信される。
    pub fn revoke(&mut self, partitions: &[TopicPartition]) -> CommitBatch {
        for tp in partitions {
            if let Err(e) = self.collect_partition(tp) {
                warn!("Delivery failed on revoked partition. Records will be redelivered.({})", e);
            }
        }
        let batch = self.cursor.pending_for(partitions);
        for tp in partitions {
            if let Some(queue) = self.inflight.remove(tp) {
                self.inflight_records -= queue.len();
            }
            self.cursor.remove(tp);
        }
        self.assignment = self.assignment.without(partitions);
        batch
    }

    /// レコードを受け付けるかどうか。
    ///
    /// 割り当てられていないパーティションのレコードと、既に追跡済みの位置より前のレコードは受け付けない。
    pub fn accepts(&self, tp: &TopicPartition, offset: Offset) -> bool {
        if !self.assignment.contains(tp) {
            return false;
        }
        let last_tracked = self
            .inflight
            .get(tp)
            .and_then(|queue| queue.back())
            .map(|f| f.offset + 1);
        match last_tracked.max(self.cursor.position(tp)) {
            Some(floor) => offset >= floor,
            None => true,
        }
    }

    /// 転送したレコードを追跡する。イベントを生成しなかったレコードは`acks`が空になる。
    pub fn track(&mut self, tp: TopicPartition, offset: Offset, acks: Vec<Ack>) {
        if !self.accepts(&tp, offset) {
            debug!("Ignored record already tracked.(partition={}, offset={})", tp, offset);
            return;
        }
        self.inflight
            .entry(tp)
            .or_default()
            .push_back(InFlight { offset, acks });
        self.inflight_records += 1;
    }

    /// 確認応答を待っているレコードのうち、最も古いものの確認応答
    pub fn oldest_pending(&self) -> Option<Ack> {
        self.inflight
            .values()
            .filter_map(|queue| queue.front())
            .flat_map(|f| f.acks.iter())
            .find(|ack| ack.status() == AckStatus::Pending)
            .cloned()
    }

    /// 各パーティションについて確認応答済みの連続した先頭部分を取り除き、水位を進める。
    ///
    /// 取り除いたレコード数を返す。否定応答を見つけた場合は、全てのパーティションを処理した後に
    /// 最初に見つけた否定応答をエラーとして返す。
    pub fn collect_acked(&mut self) -> Result<usize, DeliveryError> {
        let partitions = self.inflight.keys().cloned().collect::<Vec<_>>();
        let mut released = 0;
        let mut rejected = None;
        for tp in partitions {
            match self.collect_partition(&tp) {
                Ok(n) => released += n,
                Err(e) => {
                    rejected.get_or_insert(e);
                }
            }
        }
        match rejected {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }

    fn collect_partition(&mut self, tp: &TopicPartition) -> Result<usize, DeliveryError> {
        let queue = match self.inflight.get_mut(tp) {
            Some(queue) => queue,
            None => return Ok(0),
        };
        let mut released = 0;
        loop {
            let (offset, status) = match queue.front() {
                Some(front) => (front.offset, front.status()),
                None => break,
            };
            match status {
                AckStatus::Pending => break,
                AckStatus::Nacked => {
                    self.inflight_records -= released;
                    return Err(DeliveryError {
                        partition: tp.clone(),
                        offset,
                    });
                }
                AckStatus::Acked => {
                    queue.pop_front();
                    self.cursor.advance(tp, offset + 1);
                    released += 1;
                }
            }
        }
        self.inflight_records -= released;
        Ok(released)
    }

    pub fn pending_commits(&self) -> CommitBatch {
        self.cursor.pending()
    }

    pub fn mark_committed(&mut self, batch: &CommitBatch) {
        self.cursor.mark_committed(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ack_pair;

    fn tp(topic: &str, partition: i32) -> TopicPartition {
        TopicPartition::new(topic, partition)
    }

    fn assigned(partitions: &[(TopicPartition, ResumePosition)]) -> OffsetTracker {
        let mut tracker = OffsetTracker::new();
        tracker.assign(partitions.iter().cloned().collect());
        tracker
    }

    #[test]
    fn test_cursor_never_moves_backward() {
        let mut cursor = CommitCursor::new();
        let key = tp("topic", 0);
        assert!(cursor.advance(&key, 10));
        assert!(!cursor.advance(&key, 5));
        assert!(!cursor.advance(&key, 10));
        assert_eq!(cursor.position(&key), Some(10));
        cursor.seed(key.clone(), 3);
        assert_eq!(cursor.position(&key), Some(10));
    }

    #[test]
    fn test_cursor_pending_and_mark_committed() {
        let mut cursor = CommitCursor::new();
        let key = tp("topic", 0);
        cursor.seed(key.clone(), 4);
        assert!(cursor.pending().is_empty());

        cursor.advance(&key, 7);
        let batch = cursor.pending();
        assert_eq!(batch.get(&key), Some(7));

        cursor.mark_committed(&batch);
        assert!(cursor.pending().is_empty());
        cursor.mark_committed(&batch);
        assert_eq!(cursor.committed(&key), Some(7));

        let stale: CommitBatch = vec![(key.clone(), 5)].into_iter().collect();
        cursor.mark_committed(&stale);
        assert_eq!(cursor.committed(&key), Some(7));
    }

    #[test]
    fn test_tracker_advances_only_over_contiguous_acks() {
        let key = tp("topic", 0);
        let mut tracker = assigned(&[(key.clone(), ResumePosition::Committed(0))]);
        let (acker0, ack0) = ack_pair();
        let (acker1, ack1) = ack_pair();
        tracker.track(key.clone(), 0, vec![ack0]);
        tracker.track(key.clone(), 1, vec![ack1]);

        acker1.ack();
        assert_eq!(tracker.collect_acked().unwrap(), 0);
        assert!(tracker.pending_commits().is_empty());

        acker0.ack();
        assert_eq!(tracker.collect_acked().unwrap(), 2);
        assert_eq!(tracker.pending_commits().get(&key), Some(2));
        assert_eq!(tracker.inflight_records(), 0);
    }

    #[test]
    fn test_record_without_events_does_not_block_cursor() {
        let key = tp("topic", 0);
        let mut tracker = assigned(&[(key.clone(), ResumePosition::Reset(OffsetReset::Earliest))]);
        let (acker, ack) = ack_pair();
        tracker.track(key.clone(), 0, vec![]);
        tracker.track(key.clone(), 1, vec![ack]);
        assert_eq!(tracker.collect_acked().unwrap(), 1);
        assert_eq!(tracker.cursor().position(&key), Some(1));

        acker.ack();
        assert_eq!(tracker.collect_acked().unwrap(), 1);
        assert_eq!(tracker.cursor().position(&key), Some(2));
    }

    #[test]
    fn test_nack_is_reported() {
        let key = tp("topic", 0);
        let mut tracker = assigned(&[(key.clone(), ResumePosition::Committed(3))]);
        let (acker, ack) = ack_pair();
        tracker.track(key.clone(), 3, vec![ack]);
        acker.nack();
        let error = tracker.collect_acked().unwrap_err();
        assert_eq!(error.partition, key);
        assert_eq!(error.offset, 3);
        assert_eq!(tracker.cursor().position(&key), Some(3));
    }

    #[test]
    fn test_nack_does_not_hold_back_other_partitions() {
        let a = tp("topic", 0);
        let b = tp("topic", 1);
        let mut tracker = assigned(&[
            (a.clone(), ResumePosition::Committed(0)),
            (b.clone(), ResumePosition::Committed(0)),
        ]);
        let (rejected, ack_a) = ack_pair();
        let (accepted, ack_b) = ack_pair();
        tracker.track(a.clone(), 0, vec![ack_a]);
        tracker.track(b.clone(), 0, vec![ack_b]);
        accepted.ack();
        rejected.nack();

        let error = tracker.collect_acked().unwrap_err();
        assert_eq!(error.partition, a);
        assert_eq!(tracker.cursor().position(&b), Some(1));
        assert_eq!(tracker.cursor().position(&a), Some(0));
        assert_eq!(tracker.inflight_records(), 1);
        let batch = tracker.pending_commits();
        assert_eq!(batch.get(&b), Some(1));
        assert_eq!(batch.get(&a), None);
    }

    #[test]
    fn test_accepts_rejects_unassigned_and_duplicates() {
        let key = tp("topic", 0);
        let mut tracker = assigned(&[(key.clone(), ResumePosition::Committed(5))]);
        assert!(!tracker.accepts(&tp("other", 0), 0));
        assert!(!tracker.accepts(&key, 4));
        assert!(tracker.accepts(&key, 5));
        tracker.track(key.clone(), 5, vec![]);
        assert!(!tracker.accepts(&key, 5));
        assert!(tracker.accepts(&key, 6));
        assert_eq!(tracker.inflight_records(), 1);
    }

    #[test]
    fn test_revoke_flushes_acked_offsets() {
        let a = tp("a", 0);
        let b = tp("b", 0);
        let mut tracker = assigned(&[
            (a.clone(), ResumePosition::Committed(0)),
            (b.clone(), ResumePosition::Committed(0)),
        ]);
        let (acker, ack) = ack_pair();
        tracker.track(a.clone(), 0, vec![ack]);
        tracker.track(a.clone(), 1, vec![ack_pair().1]);
        tracker.track(b.clone(), 0, vec![]);
        acker.ack();

        let batch = tracker.revoke(&[a.clone()]);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.get(&a), Some(1));
        assert!(!tracker.is_assigned(&a));
        assert!(tracker.is_assigned(&b));
        assert_eq!(tracker.inflight_records(), 1);
        assert_eq!(tracker.cursor().position(&a), None);
    }

    #[test]
    fn test_assign_replaces_wholesale_and_keeps_progress() {
        let a = tp("a", 0);
        let b = tp("b", 0);
        let mut tracker = assigned(&[(a.clone(), ResumePosition::Committed(0))]);
        tracker.track(a.clone(), 0, vec![]);
        tracker.collect_acked().unwrap();

        tracker.assign(
            vec![
                (a.clone(), ResumePosition::Committed(0)),
                (b.clone(), ResumePosition::Committed(9)),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(tracker.cursor().position(&a), Some(1));
        assert_eq!(tracker.cursor().position(&b), Some(9));

        tracker.assign(vec![(b.clone(), ResumePosition::Committed(9))].into_iter().collect());
        assert_eq!(tracker.cursor().position(&a), None);
        assert_eq!(tracker.assignment().len(), 1);
    }
}
