use discovery_protocol::ProtocolError;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RegistrantError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no reply from server within {0:?}")]
    Timeout(Duration),
    #[error("request rejected by server: {0}")]
    Rejected(String),
    #[error("connection closed by server")]
    Closed,
    #[error("registrant is shut down")]
    ShutDown,
    #[error("invalid node info in config store: {0}")]
    NodeInfo(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RegistrantError>;
