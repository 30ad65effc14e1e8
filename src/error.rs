use thiserror::Error;

/// Library error type for shutdown coordination.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation is only allowed before shutdown has been requested.
    #[error("shutdown has already been requested")]
    AlreadyStarted,

    /// Configuration values parsed but failed validation.
    #[error("invalid shutdown configuration: {0}")]
    InvalidConfig(String),

    /// Installing an OS signal listener failed.
    #[error("failed to listen for {signal}")]
    Signal {
        signal: String,
        #[source]
        source: std::io::Error,
    },

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// YAML/serde configuration error.
    #[error(transparent)]
    Config(#[from] serde_yaml::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
