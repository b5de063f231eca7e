use std::time::Duration;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid name server format: {input} (expected host:port)")]
    Format { input: String },

    #[error("resolve hostname {host}")]
    Resolution {
        host: String,
        #[source]
        source: BoxError,
    },
}

/// Errors raised by a message-queue backend.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("{0} has been shut down")]
    ShutDown(&'static str),

    #[error("invalid client option: {0}")]
    InvalidOption(String),

    #[error("no IPv4 name server address resolved from '{0}'")]
    NoNameServer(String),

    #[error("send to topic '{topic}' timed out after {timeout:?}")]
    SendTimeout { topic: String, timeout: Duration },

    #[error("topic '{0}' already subscribed")]
    AlreadySubscribed(String),

    #[error("no tokio runtime to run message delivery on")]
    NoRuntime,
}
