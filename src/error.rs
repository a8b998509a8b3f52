use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

/// 统一错误类型
///
/// Every error carries a retry classification: transient faults are retried
/// locally and reported as retryable activity failures, everything else is
/// permanent and fails the workflow.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("unknown task {name}:{version}")]
    UnknownTask { name: String, version: String },

    #[error("task {name}:{version} is already registered with a different handler")]
    DuplicateTask { name: String, version: String },

    #[error("not found: {key}")]
    NotFound { key: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("heartbeat out of order for {token}: sent {sent}, last accepted {last}")]
    HeartbeatOutOfOrder { token: String, sent: u64, last: u64 },

    #[error("workflow already started: {0}")]
    WorkflowAlreadyStarted(String),

    #[error("unknown task token: {0}")]
    UnknownToken(String),

    #[error("inconsistent history: {0}")]
    InconsistentHistory(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HarnessError {
    pub fn is_retryable(&self) -> bool {
        match self {
            HarnessError::Storage(_) | HarnessError::Backend(_) => true,
            HarnessError::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
            }
            _ => false,
        }
    }

    /// Short machine-readable reason used in activity failure reports.
    pub fn reason(&self) -> &'static str {
        match self {
            HarnessError::UnknownTask { .. } => "UnknownTask",
            HarnessError::DuplicateTask { .. } => "DuplicateTask",
            HarnessError::NotFound { .. } => "NotFound",
            HarnessError::Storage(_) => "StorageError",
            HarnessError::Backend(_) => "BackendError",
            HarnessError::MalformedInput(_) => "MalformedInput",
            HarnessError::HeartbeatOutOfOrder { .. } => "HeartbeatOutOfOrder",
            HarnessError::WorkflowAlreadyStarted(_) => "WorkflowAlreadyStarted",
            HarnessError::UnknownToken(_) => "UnknownToken",
            HarnessError::InconsistentHistory(_) => "InconsistentHistory",
            HarnessError::Handler(_) => "HandlerError",
            HarnessError::Config(_) => "ConfigError",
            HarnessError::Redis(_) => "RedisError",
            HarnessError::Serialization(_) => "SerializationError",
        }
    }
}
