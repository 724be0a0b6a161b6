//! Collaborator doubles shared by the server's unit tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

use petfeeder_device::{Device, MockDevice};
use petfeeder_media::{
    ByteStream, Camera, CameraError, CameraEvent, CameraFactory, ConvertError, MediaConverter,
    StreamId,
};
use petfeeder_shared::error::ConflictError;
use petfeeder_shared::protocol::{Payload, RpcResponse};
use petfeeder_shared::types::{Connection, TransportClass, UserId};
use petfeeder_store::Store;

use crate::camera_session::CameraSessions;
use crate::error::TransportError;
use crate::feeding::FeedingPipeline;
use crate::rpc::Dispatcher;
use crate::server::{PetfeederServer, ServerParts, ServerSettings};
use crate::transport::{Transport, TransportEvent};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Poll `cond` until it holds; panics after two seconds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Camera
// ---------------------------------------------------------------------------

pub struct FakeCamera {
    streams: Mutex<HashMap<StreamId, mpsc::Sender<Bytes>>>,
    next_stream: AtomicU64,
    streaming: AtomicBool,
    recording: AtomicBool,
    taking_picture: Arc<AtomicBool>,
    events: broadcast::Sender<CameraEvent>,
    fail_streaming: bool,
    fail_recording: bool,
    destroyed: Arc<AtomicUsize>,
}

impl FakeCamera {
    /// Deliver a chunk to every open stream.
    pub fn push_chunk(&self, chunk: Bytes) {
        for tx in lock(&self.streams).values() {
            let _ = tx.try_send(chunk.clone());
        }
    }

    pub fn emit(&self, event: CameraEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Camera for FakeCamera {
    async fn start_streaming(&self) -> Result<ByteStream, CameraError> {
        if self.fail_streaming {
            return Err(CameraError::NoOutput);
        }
        let id = StreamId(self.next_stream.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(16);
        lock(&self.streams).insert(id, tx);
        self.streaming.store(true, Ordering::SeqCst);
        Ok(ByteStream::new(id, rx))
    }

    async fn stop_streaming(&self, id: StreamId) -> Result<(), CameraError> {
        let mut streams = lock(&self.streams);
        streams.remove(&id);
        if streams.is_empty() {
            self.streaming.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn start_recording(&self, path: &Path) -> Result<(), CameraError> {
        if self.fail_recording {
            return Err(CameraError::NoOutput);
        }
        if self.recording.load(Ordering::SeqCst) {
            return Err(ConflictError::AlreadyRecording.into());
        }
        tokio::fs::write(path, b"\x00\x00\x00\x01\x67").await?;
        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_recording(&self) -> Result<(), CameraError> {
        self.recording.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn take_picture(&self) -> Result<ByteStream, CameraError> {
        self.taking_picture.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(4);
        let busy = Arc::clone(&self.taking_picture);
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = tx.send(Bytes::from_static(b"\xff\xd8")).await;
            let _ = tx.send(Bytes::from_static(b"\xff\xd9")).await;
            drop(tx);
            busy.store(false, Ordering::SeqCst);
            let _ = events.send(CameraEvent::Close);
        });
        Ok(ByteStream::new(StreamId(u64::MAX), rx))
    }

    fn streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    fn taking_picture(&self) -> bool {
        self.taking_picture.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<CameraEvent> {
        self.events.subscribe()
    }
}

/// Counts cameras built and dropped.
#[derive(Default)]
pub struct FakeCameraFactory {
    created: AtomicUsize,
    destroyed: Arc<AtomicUsize>,
    last: Mutex<Weak<FakeCamera>>,
    fail_streaming: AtomicBool,
    fail_recording: AtomicBool,
}

impl FakeCameraFactory {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn last_camera(&self) -> Option<Arc<FakeCamera>> {
        lock(&self.last).upgrade()
    }

    pub fn fail_streaming(&self, fail: bool) {
        self.fail_streaming.store(fail, Ordering::SeqCst);
    }

    pub fn fail_recording(&self, fail: bool) {
        self.fail_recording.store(fail, Ordering::SeqCst);
    }
}

impl CameraFactory for FakeCameraFactory {
    fn create(&self) -> Arc<dyn Camera> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(16);
        let camera = Arc::new(FakeCamera {
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            streaming: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            taking_picture: Arc::new(AtomicBool::new(false)),
            events,
            fail_streaming: self.fail_streaming.load(Ordering::SeqCst),
            fail_recording: self.fail_recording.load(Ordering::SeqCst),
            destroyed: Arc::clone(&self.destroyed),
        });
        *lock(&self.last) = Arc::downgrade(&camera);
        camera
    }
}

// ---------------------------------------------------------------------------
// Converter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedConverter {
    fail_mux: AtomicBool,
    fail_thumbnails: AtomicBool,
    mux_calls: AtomicUsize,
    thumbnail_calls: AtomicUsize,
}

impl ScriptedConverter {
    pub const THUMBNAILS: usize = 4;

    pub fn fail_mux(&self, fail: bool) {
        self.fail_mux.store(fail, Ordering::SeqCst);
    }

    pub fn fail_thumbnails(&self, fail: bool) {
        self.fail_thumbnails.store(fail, Ordering::SeqCst);
    }

    pub fn mux_calls(&self) -> usize {
        self.mux_calls.load(Ordering::SeqCst)
    }

    pub fn thumbnail_calls(&self) -> usize {
        self.thumbnail_calls.load(Ordering::SeqCst)
    }
}

fn scripted_failure() -> ConvertError {
    ConvertError::ToolFailed {
        tool: "ffmpeg".into(),
        code: Some(1),
        stderr: "scripted failure".into(),
    }
}

#[async_trait]
impl MediaConverter for ScriptedConverter {
    async fn mux(&self, raw: &Path) -> Result<PathBuf, ConvertError> {
        self.mux_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_mux.load(Ordering::SeqCst) {
            return Err(scripted_failure());
        }
        Ok(raw.with_extension("mp4"))
    }

    async fn thumbnails(&self, video: &Path) -> Result<Vec<PathBuf>, ConvertError> {
        self.thumbnail_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_thumbnails.load(Ordering::SeqCst) {
            return Err(scripted_failure());
        }
        Ok((1..=Self::THUMBNAILS)
            .map(|n| video.with_extension(format!("{n}.jpg")))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Notification {
    pub event: String,
    pub user: Option<UserId>,
    pub payload: Payload,
}

/// Keeps everything it is asked to deliver.
pub struct RecordingTransport {
    class: TransportClass,
    notifications: Mutex<Vec<Notification>>,
    responses: Mutex<Vec<(UserId, RpcResponse)>>,
    failing: AtomicBool,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl RecordingTransport {
    pub fn new(class: &str) -> Self {
        Self {
            class: TransportClass::new(class),
            notifications: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            events: Mutex::new(None),
        }
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.notifications).clone()
    }

    pub fn named(&self, event: &str) -> Vec<Notification> {
        lock(&self.notifications)
            .iter()
            .filter(|n| n.event == event)
            .cloned()
            .collect()
    }

    pub fn responses(&self) -> Vec<(UserId, RpcResponse)> {
        lock(&self.responses).clone()
    }

    pub fn fail_deliveries(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Push an event as if a client produced it. Requires `run`.
    pub async fn inject(&self, event: TransportEvent) {
        let tx = lock(&self.events).clone();
        match tx {
            Some(tx) => tx.send(event).await.unwrap(),
            None => panic!("transport is not running"),
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn class(&self) -> TransportClass {
        self.class.clone()
    }

    async fn run(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        *lock(&self.events) = Some(events);
        Ok(())
    }

    async fn notify(
        &self,
        event: &str,
        payload: &Payload,
        user: Option<&UserId>,
    ) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        lock(&self.notifications).push(Notification {
            event: event.to_string(),
            user: user.cloned(),
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn respond(&self, user: &UserId, response: RpcResponse) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        lock(&self.responses).push((user.clone(), response));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A server wired to doubles, with a connected quiet device. `run` is left to
/// the test.
pub struct Harness {
    pub device: Arc<MockDevice>,
    pub cameras: Arc<FakeCameraFactory>,
    pub converter: Arc<ScriptedConverter>,
    pub transport: Arc<RecordingTransport>,
    pub store: Arc<Store>,
    pub server: Arc<PetfeederServer>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(MockDevice::quiet());
        device.setup_gpio().await.unwrap();
        device.connect().await.unwrap();

        let cameras = Arc::new(FakeCameraFactory::default());
        let converter = Arc::new(ScriptedConverter::default());
        let transport = Arc::new(RecordingTransport::new("RecordingTransport"));
        let store = Arc::new(Store::in_memory(dir.path().join("media")).unwrap());

        let server = Arc::new(PetfeederServer::new(
            ServerParts {
                device: device.clone(),
                transports: vec![transport.clone() as Arc<dyn Transport>],
                persistence: store.clone(),
                camera_factory: cameras.clone(),
                converter: converter.clone(),
            },
            ServerSettings {
                recording_cutoff: Duration::from_millis(50),
                led_settle: Duration::from_millis(1),
            },
        ));

        Self {
            device,
            cameras,
            converter,
            transport,
            store,
            server,
            _dir: dir,
        }
    }

    pub fn sessions(&self) -> CameraSessions {
        self.server.cameras().clone()
    }

    pub fn pipeline(&self) -> &FeedingPipeline {
        self.server.pipeline()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.server.dispatcher()
    }

    pub fn conn(&self, user: &str) -> Connection {
        Connection::new(self.transport.class(), UserId::new(user))
    }

    /// Register `user` with the server as a transport would.
    pub async fn connect(&self, user: &str) -> Connection {
        let connection = self.conn(user);
        self.server
            .handle_transport_event(TransportEvent::UserConnect(connection.clone()))
            .await;
        connection
    }
}
