//! Camera capture backed by the Raspberry Pi camera tools.
//!
//! One capture process runs at a time. Video output is split into NAL units
//! and fanned out to every open [`ByteStream`]; a recording, when active,
//! receives the raw chunks. Stills come from a separate `raspistill` run whose
//! output is handed to the caller untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use petfeeder_shared::error::ConflictError;

use crate::error::CameraError;
use crate::splitter::NalSplitter;

/// Units buffered per stream subscriber before chunks start being dropped.
const STREAM_BUFFER: usize = 64;

/// Chunks buffered for a picture reader.
const PICTURE_BUFFER: usize = 16;

const READ_BUFFER_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Bits per second.
    pub bitrate: u32,
    /// Sensor mode passed to `--mode`.
    pub mode: u32,
    pub binary: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            framerate: 30,
            bitrate: 640_000,
            mode: 4,
            binary: "raspivid".into(),
        }
    }
}

impl VideoConfig {
    /// Baseline profile, no preview window, run until killed, write to stdout.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--width".into(),
            self.width.to_string(),
            "--height".into(),
            self.height.to_string(),
            "--framerate".into(),
            self.framerate.to_string(),
            "--bitrate".into(),
            self.bitrate.to_string(),
            "--mode".into(),
            self.mode.to_string(),
            "--profile".into(),
            "baseline".into(),
            "--nopreview".into(),
            "--timeout".into(),
            "0".into(),
            "--output".into(),
            "-".into(),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoConfig {
    pub width: u32,
    pub height: u32,
    pub binary: String,
}

impl Default for PhotoConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            binary: "raspistill".into(),
        }
    }
}

impl PhotoConfig {
    /// JPEG without embedded thumbnail, 100 ms warm-up, write to stdout.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--width".into(),
            self.width.to_string(),
            "--height".into(),
            self.height.to_string(),
            "--thumb".into(),
            "none".into(),
            "--encoding".into(),
            "jpg".into(),
            "--timeout".into(),
            "100".into(),
            "--output".into(),
            "-".into(),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CameraConfig {
    pub video: VideoConfig,
    pub photo: PhotoConfig,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

/// Receiving end of a camera output. `recv` yields `None` once the stream is
/// stopped or the capture process exits.
#[derive(Debug)]
pub struct ByteStream {
    id: StreamId,
    rx: mpsc::Receiver<Bytes>,
}

impl ByteStream {
    pub fn new(id: StreamId, rx: mpsc::Receiver<Bytes>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraEvent {
    /// The capture process reported a problem.
    Error(String),
    /// The capture process output ended.
    Close,
}

#[async_trait]
pub trait Camera: Send + Sync {
    /// Start video capture if needed and open a new subscriber stream.
    async fn start_streaming(&self) -> Result<ByteStream, CameraError>;

    /// Close one subscriber stream; capture stops with the last one unless a
    /// recording is active.
    async fn stop_streaming(&self, id: StreamId) -> Result<(), CameraError>;

    /// Write raw video to `path` until [`Camera::stop_recording`].
    async fn start_recording(&self, path: &Path) -> Result<(), CameraError>;

    /// Finish the recording file. No-op when not recording.
    async fn stop_recording(&self) -> Result<(), CameraError>;

    async fn take_picture(&self) -> Result<ByteStream, CameraError>;

    fn streaming(&self) -> bool;

    fn recording(&self) -> bool;

    fn taking_picture(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<CameraEvent>;
}

/// Builds a fresh camera each time the server needs one.
pub trait CameraFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Camera>;
}

pub struct ProcessCameraFactory {
    config: CameraConfig,
}

impl ProcessCameraFactory {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }
}

impl CameraFactory for ProcessCameraFactory {
    fn create(&self) -> Arc<dyn Camera> {
        Arc::new(ProcessCamera::new(self.config.clone()))
    }
}

// ---------------------------------------------------------------------------
// Process-backed implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Flags {
    streaming: AtomicBool,
    recording: AtomicBool,
    taking_picture: AtomicBool,
}

/// Where output of the current capture process goes.
#[derive(Default)]
struct Fanout {
    /// Incremented for every spawned process so a finished reader does not
    /// tear down the outputs of its successor.
    generation: u64,
    streams: HashMap<StreamId, mpsc::Sender<Bytes>>,
    recorder: Option<mpsc::UnboundedSender<Bytes>>,
    picture: Option<mpsc::Sender<Bytes>>,
}

struct Capture {
    child: Option<Child>,
    recorder: Option<JoinHandle<std::io::Result<u64>>>,
    recording_path: Option<PathBuf>,
}

pub struct ProcessCamera {
    config: CameraConfig,
    capture: Mutex<Capture>,
    fanout: Arc<StdMutex<Fanout>>,
    flags: Arc<Flags>,
    events: broadcast::Sender<CameraEvent>,
    next_stream: AtomicU64,
}

fn lock(fanout: &StdMutex<Fanout>) -> MutexGuard<'_, Fanout> {
    fanout.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProcessCamera {
    pub fn new(config: CameraConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            config,
            capture: Mutex::new(Capture {
                child: None,
                recorder: None,
                recording_path: None,
            }),
            fanout: Arc::new(StdMutex::new(Fanout::default())),
            flags: Arc::new(Flags::default()),
            events,
            next_stream: AtomicU64::new(1),
        }
    }

    fn next_stream_id(&self) -> StreamId {
        StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed))
    }

    fn spawn_capture(
        &self,
        capture: &mut Capture,
        binary: &str,
        args: &[String],
    ) -> Result<(), CameraError> {
        info!(binary, "starting capture process");
        debug!(?args, "capture arguments");

        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CameraError::Spawn {
                binary: binary.to_string(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(CameraError::NoOutput)?;
        let generation = {
            let mut fanout = lock(&self.fanout);
            fanout.generation += 1;
            fanout.generation
        };

        tokio::spawn(pump_output(
            stdout,
            generation,
            self.fanout.clone(),
            self.flags.clone(),
            self.events.clone(),
        ));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_errors(stderr, self.events.clone()));
        }

        capture.child = Some(child);
        Ok(())
    }

    async fn stop_capture(&self, capture: &mut Capture) {
        if let Some(mut child) = capture.child.take() {
            info!("stopping capture process");
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "capture process already gone");
            }
            if let Err(e) = child.wait().await {
                warn!(error = %e, "failed to reap capture process");
            }
        }
        self.flags.streaming.store(false, Ordering::SeqCst);
    }

    fn ensure_video_capture(&self, capture: &mut Capture) -> Result<(), CameraError> {
        if capture.child.is_some() && self.flags.streaming.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.flags.streaming.store(true, Ordering::SeqCst);
        let video = &self.config.video;
        if let Err(e) = self.spawn_capture(capture, &video.binary, &video.to_args()) {
            self.flags.streaming.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl Camera for ProcessCamera {
    async fn start_streaming(&self) -> Result<ByteStream, CameraError> {
        if self.taking_picture() {
            return Err(ConflictError::AlreadyTakingPicture.into());
        }

        let mut capture = self.capture.lock().await;

        let id = self.next_stream_id();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        lock(&self.fanout).streams.insert(id, tx);

        if let Err(e) = self.ensure_video_capture(&mut capture) {
            lock(&self.fanout).streams.remove(&id);
            return Err(e);
        }

        debug!(stream = id.0, "stream opened");
        Ok(ByteStream::new(id, rx))
    }

    async fn stop_streaming(&self, id: StreamId) -> Result<(), CameraError> {
        let mut capture = self.capture.lock().await;

        let remaining = {
            let mut fanout = lock(&self.fanout);
            fanout.streams.remove(&id);
            fanout.streams.len()
        };
        debug!(stream = id.0, remaining, "stream closed");

        if remaining == 0 && capture.recorder.is_none() {
            self.stop_capture(&mut capture).await;
        }
        Ok(())
    }

    async fn start_recording(&self, path: &Path) -> Result<(), CameraError> {
        if self.taking_picture() {
            return Err(ConflictError::AlreadyTakingPicture.into());
        }

        let mut capture = self.capture.lock().await;
        if capture.recorder.is_some() {
            return Err(ConflictError::AlreadyRecording.into());
        }

        let file = tokio::fs::File::create(path).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.fanout).recorder = Some(tx);
        capture.recorder = Some(tokio::spawn(write_recording(file, rx)));
        capture.recording_path = Some(path.to_path_buf());
        self.flags.recording.store(true, Ordering::SeqCst);

        if let Err(e) = self.ensure_video_capture(&mut capture) {
            lock(&self.fanout).recorder = None;
            capture.recorder = None;
            capture.recording_path = None;
            self.flags.recording.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!(path = %path.display(), "recording started");
        Ok(())
    }

    async fn stop_recording(&self) -> Result<(), CameraError> {
        let mut capture = self.capture.lock().await;
        let Some(writer) = capture.recorder.take() else {
            return Ok(());
        };

        lock(&self.fanout).recorder = None;
        self.flags.recording.store(false, Ordering::SeqCst);
        let path = capture.recording_path.take();

        let streams_left = !lock(&self.fanout).streams.is_empty();
        if !streams_left {
            self.stop_capture(&mut capture).await;
        }

        match writer.await {
            Ok(Ok(bytes)) => {
                info!(path = ?path, bytes, "recording finished");
                Ok(())
            }
            Ok(Err(e)) => Err(CameraError::Io(e)),
            Err(e) => Err(CameraError::Io(std::io::Error::other(e))),
        }
    }

    async fn take_picture(&self) -> Result<ByteStream, CameraError> {
        if self.taking_picture() {
            return Err(ConflictError::AlreadyTakingPicture.into());
        }
        if self.streaming() {
            return Err(ConflictError::CameraStreaming.into());
        }
        if self.recording() {
            return Err(ConflictError::CameraRecording.into());
        }

        let mut capture = self.capture.lock().await;
        self.flags.taking_picture.store(true, Ordering::SeqCst);

        let id = self.next_stream_id();
        let (tx, rx) = mpsc::channel(PICTURE_BUFFER);
        lock(&self.fanout).picture = Some(tx);

        let photo = &self.config.photo;
        if let Err(e) = self.spawn_capture(&mut capture, &photo.binary, &photo.to_args()) {
            lock(&self.fanout).picture = None;
            self.flags.taking_picture.store(false, Ordering::SeqCst);
            return Err(e);
        }

        Ok(ByteStream::new(id, rx))
    }

    fn streaming(&self) -> bool {
        self.flags.streaming.load(Ordering::SeqCst)
    }

    fn recording(&self) -> bool {
        self.flags.recording.load(Ordering::SeqCst)
    }

    fn taking_picture(&self) -> bool {
        self.flags.taking_picture.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<CameraEvent> {
        self.events.subscribe()
    }
}

/// Read process stdout until EOF, distributing chunks.
async fn pump_output<R>(
    mut stdout: R,
    generation: u64,
    fanout: Arc<StdMutex<Fanout>>,
    flags: Arc<Flags>,
    events: broadcast::Sender<CameraEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut splitter = NalSplitter::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut total_bytes = 0u64;

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = events.send(CameraEvent::Error(e.to_string()));
                break;
            }
        };
        total_bytes += n as u64;
        let chunk = Bytes::copy_from_slice(&buf[..n]);

        let picture = {
            let mut out = lock(&fanout);
            if out.generation != generation {
                break;
            }
            if let Some(recorder) = &out.recorder {
                let _ = recorder.send(chunk.clone());
            }
            if !out.streams.is_empty() {
                let units = splitter.push(&chunk);
                dispatch_units(&mut out, units);
            }
            out.picture.clone()
        };

        // Stills are small and must arrive whole, so wait for the reader.
        if let Some(picture) = picture {
            let _ = picture.send(chunk).await;
        }
    }

    {
        let mut out = lock(&fanout);
        if out.generation == generation {
            if let Some(rest) = splitter.flush() {
                dispatch_units(&mut out, vec![rest]);
            }
            flags.streaming.store(false, Ordering::SeqCst);
            flags.recording.store(false, Ordering::SeqCst);
            flags.taking_picture.store(false, Ordering::SeqCst);
            out.streams.clear();
            out.recorder = None;
            out.picture = None;
        }
    }

    debug!(generation, total_bytes, "capture output ended");
    let _ = events.send(CameraEvent::Close);
}

fn dispatch_units(fanout: &mut Fanout, units: Vec<Bytes>) {
    for unit in units {
        fanout.streams.retain(|id, tx| match tx.try_send(unit.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(stream = id.0, "subscriber lagging, unit dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

async fn pump_errors<R>(stderr: R, events: broadcast::Sender<CameraEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        warn!(message = line, "capture process stderr");
        let _ = events.send(CameraEvent::Error(line.to_string()));
    }
}

async fn write_recording(
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> std::io::Result<u64> {
    let mut written = 0u64;
    while let Some(chunk) = rx.recv().await {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `echo` prints its arguments and exits, which stands in for a capture
    /// binary that produces a little output and then closes.
    fn echo_config() -> CameraConfig {
        CameraConfig {
            video: VideoConfig {
                binary: "echo".into(),
                ..Default::default()
            },
            photo: PhotoConfig {
                binary: "echo".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn video_args() {
        let args = VideoConfig::default().to_args();
        assert_eq!(&args[..2], &["--width".to_string(), "640".to_string()]);
        assert!(args.contains(&"--nopreview".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[tokio::test]
    async fn missing_binary_fails_cleanly() {
        let camera = ProcessCamera::new(CameraConfig {
            video: VideoConfig {
                binary: "/nonexistent/raspivid".into(),
                ..Default::default()
            },
            ..Default::default()
        });

        let err = camera.start_streaming().await.unwrap_err();
        assert!(matches!(err, CameraError::Spawn { .. }));
        assert!(!camera.streaming());
    }

    #[tokio::test]
    async fn picture_stream_ends_with_process() {
        let camera = ProcessCamera::new(echo_config());
        let mut events = camera.subscribe();

        let mut stream = camera.take_picture().await.unwrap();
        assert!(camera.take_picture().await.is_err());

        let mut data = Vec::new();
        while let Some(chunk) = stream.recv().await {
            data.extend_from_slice(&chunk);
        }
        assert!(String::from_utf8_lossy(&data).starts_with("--width 640"));
        assert!(!camera.taking_picture());

        loop {
            if events.recv().await.unwrap() == CameraEvent::Close {
                break;
            }
        }
    }

    #[tokio::test]
    async fn recording_writes_raw_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.h264");
        let camera = ProcessCamera::new(echo_config());
        let mut events = camera.subscribe();

        camera.start_recording(&path).await.unwrap();
        loop {
            if events.recv().await.unwrap() == CameraEvent::Close {
                break;
            }
        }
        camera.stop_recording().await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.contains("--profile baseline"));
        assert!(!camera.recording());
    }

    #[tokio::test]
    async fn stop_recording_without_recording_is_noop() {
        let camera = ProcessCamera::new(echo_config());
        camera.stop_recording().await.unwrap();
    }
}
