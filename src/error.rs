use crate::kafka::key::{Offset, TopicPartition};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

/// ブローカーとのやり取りで発生するエラー。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// 接続断やリーダー不在など、時間をおいて再試行すれば回復する見込みのあるエラー
    #[error("TransientBrokerError: {0}")]
    Transient(String),
    #[error("AuthError: {0}")]
    Auth(String),
    #[error("RebalanceInProgress")]
    RebalanceInProgress,
    /// 古い世代のメンバーからのコミット。新しい割り当てが優先されるため破棄してよい。
    #[error("CommitConflict: {0}")]
    CommitConflict(String),
    #[error("FatalClientError: {0}")]
    Fatal(String),
}

impl From<KafkaError> for ClientError {
    fn from(e: KafkaError) -> Self {
        match e.rdkafka_error_code() {
            Some(
                RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed,
            ) => ClientError::Auth(e.to_string()),
            Some(RDKafkaErrorCode::RebalanceInProgress) => ClientError::RebalanceInProgress,
            Some(
                RDKafkaErrorCode::IllegalGeneration
                | RDKafkaErrorCode::UnknownMemberId
                | RDKafkaErrorCode::FencedInstanceId
                | RDKafkaErrorCode::AssignmentLost,
            ) => ClientError::CommitConflict(e.to_string()),
            _ => match e {
                KafkaError::ClientCreation(reason) => ClientError::Fatal(reason),
                e => ClientError::Transient(e.to_string()),
            },
        }
    }
}

/// パーサーがレコードの値をデコードできなかったことを表す。
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("InvalidJson: {0}")]
    Json(#[from] serde_json::Error),
    #[error("UnsupportedPayload: {0}")]
    Unsupported(String),
    #[error("PatternMismatch: {0}")]
    Mismatch(String),
    #[error("DecodeError: {0}")]
    Custom(String),
}

#[derive(Error, Debug)]
#[error("ParseError occurred.(topic={topic}, partition={partition}, offset={offset}): {source}")]
pub struct ParseError {
    pub topic: String,
    pub partition: i32,
    pub offset: Offset,
    #[source]
    pub source: DecodeError,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    #[error("PipelineClosed")]
    Closed,
    #[error("BufferFull")]
    BufferFull,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("DeliveryFailed: events were rejected by the pipeline.(partition={partition}, offset={offset})")]
pub struct DeliveryError {
    pub partition: TopicPartition,
    pub offset: Offset,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("MissingConfig: {0}")]
    Missing(String),
    #[error("InvalidConfig: {key} ({reason})")]
    Invalid { key: String, reason: String },
    #[error("InvalidPattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("InvalidJson: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// ワーカーを停止させるエラー。
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("ClientError: {0}")]
    Client(#[from] ClientError),
    #[error("JoinExhausted: gave up joining the group after {attempts} attempts ({source})")]
    JoinExhausted {
        attempts: usize,
        #[source]
        source: ClientError,
    },
    #[error("RestartExhausted: gave up after {restarts} restarts ({reason})")]
    RestartExhausted { restarts: usize, reason: String },
    #[error("{0}")]
    Delivery(#[from] DeliveryError),
    #[error("PipelineError: {0}")]
    Pipeline(#[from] PipelineError),
}

impl WorkerError {
    /// 再起動しても回復しないエラーかどうか。
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerError::Client(ClientError::Auth(_))
                | WorkerError::JoinExhausted { .. }
                | WorkerError::RestartExhausted { .. }
                | WorkerError::Pipeline(PipelineError::Closed)
        )
    }
}

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("ConfigError: {0}")]
    Config(#[from] ConfigError),
    #[error("ConnectorError: pipeline is not set")]
    MissingPipeline,
    #[error("ConnectorError: already started")]
    AlreadyStarted,
    #[error("ConnectorError: not running")]
    NotRunning,
    #[error("ConnectorError: all workers failed")]
    WorkersFailed,
}
