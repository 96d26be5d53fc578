use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SpiderError {
    /// No namespace or proxy is currently free. Retryable; the
    /// supervisor tries again on its next tick.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// IO against the browser child failed (dead process, closed pipe,
    /// timeout). Triggers a session rebuild.
    #[error(transparent)]
    ChildIo(#[from] browser_host::ChildIoError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("namespace error: {0}")]
    Netns(#[from] netns_pool::NetnsError),

    /// Session could not be assembled (spawn failure, no local IP).
    #[error("setup error: {0}")]
    Setup(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SpiderError>;
