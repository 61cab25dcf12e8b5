/// Erreurs possibles lors de la lecture/écriture de frames
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame integrity check failed")]
    FrameIntegrity,
    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
    #[error("Stream closed in the middle of a frame ({buffered} bytes buffered)")]
    UnexpectedEof { buffered: usize },
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
