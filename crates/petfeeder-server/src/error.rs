use petfeeder_shared::types::UserId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    #[error("Connection closed")]
    Closed,

    #[error("Client {0} is not keeping up and was dropped")]
    Lagging(UserId),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
