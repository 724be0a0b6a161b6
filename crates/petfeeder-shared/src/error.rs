use thiserror::Error;

/// A competing operation already holds a shared resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("Feeding is already in progress")]
    FeedingInProgress,

    #[error("Camera is already recording")]
    AlreadyRecording,

    #[error("Video stream is already started for this user")]
    AlreadyStreaming,

    #[error("Camera is taking a picture at the moment")]
    AlreadyTakingPicture,

    #[error("Camera is streaming video at the moment")]
    CameraStreaming,

    #[error("Camera is recording video at the moment")]
    CameraRecording,

    #[error("Video stream is not started for this user")]
    NotSubscribed,

    #[error("Control belongs to another user")]
    NotInControl,
}

/// Errors returned to RPC callers as `{id, error}`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Invalid RPC resource: {0}")]
    InvalidResource(String),

    #[error("Invalid RPC request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("External tool error: {0}")]
    ExternalTool(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl RpcError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
