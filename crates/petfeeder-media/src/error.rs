use std::path::PathBuf;

use petfeeder_shared::error::ConflictError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Could not start {binary}; is it installed? ({source})")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Capture process has no stdout")]
    NoOutput,

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Could not start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {code:?}: {stderr}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Not a media file path: {0}")]
    InvalidPath(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
