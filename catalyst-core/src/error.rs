use thiserror::Error;

/// Error kinds produced by the routing core.
///
/// Several variants exist purely to drive retry control flow at the HTTP
/// edge (`WrongRegion`, `LockDenied`, `RateLimited`); callers that do not
/// care about the distinction should match on the broad groups documented
/// on each variant rather than introduce new ad-hoc error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("selector failed: {0}")]
    SelectorFailed(String),

    #[error("no origin found for stream")]
    NoOrigin,

    #[error("lease denied for stream {0}")]
    LockDenied(String),

    #[error("stream is pinned to region {pull_region}, we are {own_region}")]
    WrongRegion {
        pull_region: String,
        own_region: String,
    },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("stream directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("stream is suspended")]
    StreamSuspended,

    #[error("stream is deleted")]
    StreamDeleted,

    #[error("node tag unresolvable: {0}")]
    Internal(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a caller at the retry loop in 4.H should attempt again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockDenied(_) | Error::WrongRegion { .. } | Error::RateLimited { .. }
        )
    }

    /// Whether this error is a wrong-region signal specifically (the retry
    /// loop caps these separately from other retryable kinds).
    #[must_use]
    pub fn is_wrong_region(&self) -> bool {
        matches!(self, Error::WrongRegion { .. })
    }
}
