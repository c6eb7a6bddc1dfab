#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue io error: {0}")]
    Io(String),
    #[error("queue serialization error: {0}")]
    Serde(String),
    #[error("unknown delivery id: {0}")]
    UnknownDelivery(String),
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serde(err.to_string())
    }
}
