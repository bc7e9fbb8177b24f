use change_feed::FeedError;
use thiserror::Error;

/// Failures of the realtime connection itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(#[from] FeedError),
    #[error("host is offline")]
    Offline,
    #[error("app is backgrounded")]
    Backgrounded,
    #[error("reconnect attempts exhausted after {attempts} tries; call reconnect()")]
    AttemptsExhausted { attempts: u32 },
    #[error("connection was explicitly disconnected")]
    Disconnected,
}

impl ConnectionError {
    /// Connectivity errors suppress reconnection instead of consuming an attempt.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ConnectionError::Offline | ConnectionError::Backgrounded)
    }
}

/// Typed failure returned by the remote mutation endpoint, plus the locally
/// produced timeout.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("rate limited; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("not allowed")]
    Forbidden,
    #[error("target not found")]
    NotFound,
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("operation timed out before confirmation")]
    TimedOut,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type SyncResult<T> = Result<T, SyncError>;
