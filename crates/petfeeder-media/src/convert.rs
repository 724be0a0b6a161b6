use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ConvertError;

/// Post-processing of a finished recording.
#[async_trait]
pub trait MediaConverter: Send + Sync {
    /// Wrap the raw H.264 file into an MP4 container next to it and return
    /// the new file's path.
    async fn mux(&self, raw: &Path) -> Result<PathBuf, ConvertError>;

    /// Extract still images from `video`, named `<stem>-<n>.jpg`.
    async fn thumbnails(&self, video: &Path) -> Result<Vec<PathBuf>, ConvertError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertConfig {
    pub ffmpeg: PathBuf,
    /// Frame rate of the raw stream; raw H.264 carries no timing.
    pub framerate: u32,
    /// Length of a recording, used to spread thumbnails over the clip.
    pub clip_secs: f64,
    pub thumbnail_count: usize,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    /// Keep the `.h264` file after a successful mux.
    pub keep_raw: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        use petfeeder_shared::constants::*;

        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            framerate: 30,
            clip_secs: DEFAULT_RECORDING_CUTOFF_SECS as f64,
            thumbnail_count: DEFAULT_THUMBNAIL_COUNT,
            thumbnail_width: DEFAULT_THUMBNAIL_WIDTH,
            thumbnail_height: DEFAULT_THUMBNAIL_HEIGHT,
            keep_raw: false,
        }
    }
}

impl ConvertConfig {
    /// Seek offsets (seconds) of each thumbnail, evenly spaced inside the clip.
    pub fn thumbnail_offsets(&self) -> Vec<f64> {
        let slots = (self.thumbnail_count + 1) as f64;
        (1..=self.thumbnail_count)
            .map(|n| self.clip_secs * n as f64 / slots)
            .collect()
    }
}

pub struct FfmpegConverter {
    config: ConvertConfig,
}

impl FfmpegConverter {
    pub fn new(config: ConvertConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    async fn run_ffmpeg(&self, args: &[String]) -> Result<(), ConvertError> {
        let tool = self.config.ffmpeg.display().to_string();
        debug!(tool = %tool, ?args, "running");

        let output = Command::new(&self.config.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ConvertError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ConvertError::ToolFailed {
                tool,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

fn file_stem(path: &Path) -> Result<&str, ConvertError> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| ConvertError::InvalidPath(path.to_path_buf()))
}

#[async_trait]
impl MediaConverter for FfmpegConverter {
    async fn mux(&self, raw: &Path) -> Result<PathBuf, ConvertError> {
        file_stem(raw)?;
        let out = raw.with_extension("mp4");

        self.run_ffmpeg(&[
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-framerate".into(),
            self.config.framerate.to_string(),
            "-i".into(),
            raw.display().to_string(),
            "-c".into(),
            "copy".into(),
            out.display().to_string(),
        ])
        .await?;

        if !self.config.keep_raw {
            if let Err(e) = tokio::fs::remove_file(raw).await {
                warn!(path = %raw.display(), error = %e, "could not remove raw recording");
            }
        }

        info!(path = %out.display(), "recording muxed");
        Ok(out)
    }

    async fn thumbnails(&self, video: &Path) -> Result<Vec<PathBuf>, ConvertError> {
        let stem = file_stem(video)?;
        let dir = video.parent().unwrap_or_else(|| Path::new("."));
        let size = format!(
            "{}x{}",
            self.config.thumbnail_width, self.config.thumbnail_height
        );

        let mut images = Vec::with_capacity(self.config.thumbnail_count);
        for (n, offset) in self.config.thumbnail_offsets().into_iter().enumerate() {
            let image = dir.join(format!("{stem}-{}.jpg", n + 1));
            self.run_ffmpeg(&[
                "-y".into(),
                "-loglevel".into(),
                "error".into(),
                "-ss".into(),
                format!("{offset:.2}"),
                "-i".into(),
                video.display().to_string(),
                "-frames:v".into(),
                "1".into(),
                "-s".into(),
                size.clone(),
                image.display().to_string(),
            ])
            .await?;
            images.push(image);
        }

        info!(video = %video.display(), count = images.len(), "thumbnails generated");
        Ok(images)
    }
}
