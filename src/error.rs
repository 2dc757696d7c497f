use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum OprError {
    #[error("missing config file opr-sync.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("overpass request failed: {0}")]
    TransientNetwork(String),

    #[error("overpass returned status {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("overpass response exceeds server limits: {0}")]
    UpstreamTooLarge(String),

    #[error("invalid upstream timestamp: {0}")]
    Timestamp(String),

    #[error("failed to decode overpass response: {0}")]
    Decode(String),

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("split of {bbox} exceeded max depth {max_depth}")]
    SplitTooDeep { bbox: String, max_depth: u32 },

    #[error("ledger index is stale, retry the read")]
    StaleIndex,

    #[error("ledger rejected operation: {0}")]
    Ledger(String),

    #[error("failed to sign operation: {0}")]
    Sign(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("another sync cycle holds the lock at {0}")]
    CycleInProgress(String),

    #[error("sync task panicked: {0}")]
    TaskPanicked(String),

    #[error("sync cycle was cancelled")]
    Cancelled,
}

impl OprError {
    /// Errors the planner answers by splitting the region instead of failing.
    pub fn is_split_trigger(&self) -> bool {
        matches!(
            self,
            OprError::TransientNetwork(_)
                | OprError::UpstreamTooLarge(_)
                | OprError::UpstreamStatus {
                    status: 429 | 500 | 502 | 503 | 504,
                    ..
                }
        )
    }
}
