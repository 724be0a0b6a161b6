//! # petfeeder-media
//!
//! Camera capture and post-processing for feeding recordings.
//!
//! - [`camera`]: the [`Camera`] contract and [`ProcessCamera`], which drives
//!   the `raspivid` / `raspistill` binaries and fans their output out to
//!   stream subscribers and a recording file.
//! - [`splitter`]: splits an H.264 Annex-B byte stream into NAL units.
//! - [`convert`]: the [`MediaConverter`] contract and [`FfmpegConverter`]
//!   (container muxing and thumbnail extraction).

pub mod camera;
pub mod convert;
pub mod splitter;

mod error;

pub use camera::{
    ByteStream, Camera, CameraConfig, CameraEvent, CameraFactory, PhotoConfig, ProcessCamera,
    ProcessCameraFactory, StreamId, VideoConfig,
};
pub use convert::{ConvertConfig, FfmpegConverter, MediaConverter};
pub use error::{CameraError, ConvertError};
pub use splitter::NalSplitter;
