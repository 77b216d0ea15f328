use std::fmt;

pub type Topic = String;
pub type Partition = i32;
pub type Offset = i64;

/// オフセット管理のキーとなるトピックとパーティションの組。
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TopicPartition {
    pub topic: Topic,
    pub partition: Partition,
}

impl TopicPartition {
    pub fn new(topic: impl Into<Topic>, partition: Partition) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

macro_rules! key {
    ($msg: expr) => {
        $crate::kafka::key::TopicPartition {
            topic: $msg.topic().to_string(),
            partition: $msg.partition(),
        }
    };
}

pub(crate) use key;
