use thiserror::Error;

/// Lifecycle-facing failures (§7). The hot path never returns a
/// `Result`; it drops and counts instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline already initialized")]
    AlreadyInitialized,
    #[error("pipeline not initialized")]
    NotInitialized,
    #[error("provider '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("provider config rejected: {0}")]
    InvalidProviderConfig(&'static str),
    #[error("session table is full (max {0} concurrent sessions)")]
    SessionTableFull(usize),
    #[error("unknown session id")]
    UnknownSession,
    #[error("io error writing trace stream: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
