//! Shared camera ownership.
//!
//! At most one camera exists at a time. It is created on the first stream,
//! picture or recording request and released when nothing uses it anymore,
//! or when it reports an error or closes. Each subscribed connection gets
//! its own forwarder task that pushes stream chunks to that connection only.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use petfeeder_device::Device;
use petfeeder_media::{ByteStream, Camera, CameraError, CameraEvent, CameraFactory, StreamId};
use petfeeder_shared::error::{ConflictError, RpcError};
use petfeeder_shared::protocol::{events, Payload};
use petfeeder_shared::types::Connection;

use crate::notify::EventBus;
use crate::persistence::Persistence;

/// Identity of a recording started for a feeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    pub file_timestamp: i64,
    pub file_name: String,
    pub full_path: PathBuf,
}

#[derive(Clone)]
pub struct CameraSessions {
    inner: Arc<Inner>,
}

struct Inner {
    factory: Arc<dyn CameraFactory>,
    device: Arc<dyn Device>,
    bus: Arc<EventBus>,
    persistence: Arc<dyn Persistence>,
    led_settle: Duration,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    camera: Option<ActiveCamera>,
    /// Bumped for every created camera so late events from a released one
    /// are ignored.
    generation: u64,
    subscriptions: HashMap<Connection, Subscription>,
}

struct ActiveCamera {
    camera: Arc<dyn Camera>,
    generation: u64,
}

struct Subscription {
    stream_id: StreamId,
    forwarder: JoinHandle<()>,
}

fn camera_error(e: CameraError) -> RpcError {
    match e {
        CameraError::Conflict(c) => RpcError::Conflict(c),
        other => RpcError::Camera(other.to_string()),
    }
}

impl CameraSessions {
    pub fn new(
        factory: Arc<dyn CameraFactory>,
        device: Arc<dyn Device>,
        bus: Arc<EventBus>,
        persistence: Arc<dyn Persistence>,
        led_settle: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                device,
                bus,
                persistence,
                led_settle,
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    pub async fn has_camera(&self) -> bool {
        self.inner.state.lock().await.camera.is_some()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.state.lock().await.subscriptions.len()
    }

    pub async fn start_video_stream(&self, connection: &Connection) -> Result<(), RpcError> {
        let mut state = self.inner.state.lock().await;

        if state.subscriptions.contains_key(connection) {
            return Err(ConflictError::AlreadyStreaming.into());
        }
        if let Some(active) = &state.camera {
            if active.camera.taking_picture() {
                return Err(ConflictError::AlreadyTakingPicture.into());
            }
        }

        let camera = self.get_or_create(&mut state);
        let stream = match camera.start_streaming().await {
            Ok(stream) => stream,
            Err(e) => {
                self.release_if_idle(&mut state);
                return Err(camera_error(e));
            }
        };

        let stream_id = stream.id();
        let forwarder = tokio::spawn(forward_video(
            Arc::clone(&self.inner.bus),
            connection.clone(),
            stream,
        ));
        state.subscriptions.insert(
            connection.clone(),
            Subscription {
                stream_id,
                forwarder,
            },
        );
        self.inner.device.set_link_led_blinking(true);

        info!(
            connection = %connection,
            subscribers = state.subscriptions.len(),
            "video stream started"
        );
        Ok(())
    }

    pub async fn stop_video_stream(&self, connection: &Connection) -> Result<(), RpcError> {
        let mut state = self.inner.state.lock().await;

        let Some(subscription) = state.subscriptions.remove(connection) else {
            return Err(ConflictError::NotSubscribed.into());
        };
        subscription.forwarder.abort();

        if let Some(camera) = state.camera.as_ref().map(|a| Arc::clone(&a.camera)) {
            if let Err(e) = camera.stop_streaming(subscription.stream_id).await {
                warn!(connection = %connection, error = %e, "failed to stop camera stream");
            }
        }
        self.release_if_idle(&mut state);

        info!(
            connection = %connection,
            subscribers = state.subscriptions.len(),
            "video stream stopped"
        );
        Ok(())
    }

    /// Stop the connection's stream if it has one. Used on disconnect.
    pub async fn drop_subscription(&self, connection: &Connection) {
        match self.stop_video_stream(connection).await {
            Ok(()) => debug!(connection = %connection, "stream released on disconnect"),
            Err(RpcError::Conflict(ConflictError::NotSubscribed)) => {}
            Err(e) => warn!(connection = %connection, error = %e, "failed to release stream"),
        }
    }

    pub async fn take_picture(&self, connection: &Connection) -> Result<(), RpcError> {
        let mut state = self.inner.state.lock().await;

        if let Some(active) = &state.camera {
            let camera = &active.camera;
            if camera.taking_picture() {
                return Err(ConflictError::AlreadyTakingPicture.into());
            }
            if camera.streaming() {
                return Err(ConflictError::CameraStreaming.into());
            }
            if camera.recording() {
                return Err(ConflictError::CameraRecording.into());
            }
        }

        let camera = self.get_or_create(&mut state);
        // Power LED off while the shutter is busy.
        if let Err(e) = self.inner.device.set_power_led_state(false).await {
            warn!(error = %e, "could not switch power LED off");
        }

        let stream = match camera.take_picture().await {
            Ok(stream) => stream,
            Err(e) => {
                self.teardown(&mut state);
                return Err(camera_error(e));
            }
        };

        tokio::spawn(forward_picture(
            Arc::clone(&self.inner.bus),
            connection.clone(),
            stream,
        ));
        info!(connection = %connection, "taking picture");
        Ok(())
    }

    pub async fn start_recording(&self) -> Result<RecordingSession, RpcError> {
        let mut state = self.inner.state.lock().await;

        if let Some(active) = &state.camera {
            if active.camera.recording() {
                return Err(ConflictError::AlreadyRecording.into());
            }
            if active.camera.taking_picture() {
                return Err(ConflictError::AlreadyTakingPicture.into());
            }
        }

        // The folder follows the file timestamp so both land on the same day.
        let started = Utc::now();
        let file_timestamp = started.timestamp_millis();
        let dir = self
            .inner
            .persistence
            .get_or_create_path_for(started)
            .await
            .map_err(|e| RpcError::Persistence(e.to_string()))?;
        let file_name = format!("{file_timestamp}.h264");
        let full_path = dir.join(&file_name);

        let camera = self.get_or_create(&mut state);
        if let Err(e) = camera.start_recording(&full_path).await {
            self.release_if_idle(&mut state);
            return Err(camera_error(e));
        }
        self.inner.device.set_link_led_blinking(true);

        info!(path = %full_path.display(), "recording started");
        Ok(RecordingSession {
            file_timestamp,
            file_name,
            full_path,
        })
    }

    /// No-op without a camera.
    pub async fn stop_recording(&self) -> Result<(), RpcError> {
        let mut state = self.inner.state.lock().await;
        let Some(camera) = state.camera.as_ref().map(|a| Arc::clone(&a.camera)) else {
            return Ok(());
        };

        let result = camera.stop_recording().await;
        self.release_if_idle(&mut state);
        result.map_err(camera_error)
    }

    /// Release everything; used on shutdown.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(camera) = state.camera.as_ref().map(|a| Arc::clone(&a.camera)) {
            if let Err(e) = camera.stop_recording().await {
                warn!(error = %e, "failed to finish recording on shutdown");
            }
        }
        self.teardown(&mut state);
    }

    fn get_or_create(&self, state: &mut SessionState) -> Arc<dyn Camera> {
        if let Some(active) = &state.camera {
            return Arc::clone(&active.camera);
        }

        let camera = self.inner.factory.create();
        state.generation += 1;
        let generation = state.generation;

        let mut events = camera.subscribe();
        let sessions = self.clone();
        tokio::spawn(async move {
            loop {
                let released = match events.recv().await {
                    Ok(CameraEvent::Error(message)) => {
                        sessions.on_camera_gone(generation, Some(message)).await
                    }
                    Ok(CameraEvent::Close) => sessions.on_camera_gone(generation, None).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(generation, skipped, "camera events lagged");
                        false
                    }
                    Err(RecvError::Closed) => break,
                };
                if released {
                    break;
                }
            }
        });

        info!(generation, "camera created");
        state.camera = Some(ActiveCamera {
            camera: Arc::clone(&camera),
            generation,
        });
        camera
    }

    /// Returns `true` if the camera of `generation` was released.
    async fn on_camera_gone(&self, generation: u64, error: Option<String>) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            if state.camera.as_ref().map(|a| a.generation) != Some(generation) {
                return false;
            }
            self.teardown(&mut state);
        }

        if let Some(message) = error {
            error!(generation, error = %message, "camera failed");
            self.inner
                .bus
                .broadcast(events::CAMERA_ERROR, Payload::Json(json!(message)))
                .await;
        } else {
            debug!(generation, "camera closed");
        }
        true
    }

    fn release_if_idle(&self, state: &mut SessionState) {
        let busy = match &state.camera {
            Some(active) => active.camera.recording() || active.camera.taking_picture(),
            None => return,
        };
        if state.subscriptions.is_empty() && !busy {
            self.teardown(state);
        }
    }

    fn teardown(&self, state: &mut SessionState) {
        let Some(active) = state.camera.take() else {
            return;
        };
        for (connection, subscription) in state.subscriptions.drain() {
            debug!(connection = %connection, "dropping stream of released camera");
            subscription.forwarder.abort();
        }
        info!(generation = active.generation, "camera released");
        drop(active);

        let device = Arc::clone(&self.inner.device);
        let settle = self.inner.led_settle;
        tokio::spawn(async move { restore_idle_leds(device.as_ref(), settle).await });
    }
}

/// Power LED on, link LED steady off. Waits `settle` first so blink timers
/// stopping now do not overwrite the final state.
pub async fn restore_idle_leds(device: &dyn Device, settle: Duration) {
    device.set_link_led_blinking(false);
    tokio::time::sleep(settle).await;
    if let Err(e) = device.set_power_led_state(true).await {
        warn!(error = %e, "could not restore power LED");
    }
    if let Err(e) = device.set_link_led_state(false).await {
        warn!(error = %e, "could not restore link LED");
    }
}

async fn forward_video(bus: Arc<EventBus>, connection: Connection, mut stream: ByteStream) {
    while let Some(chunk) = stream.recv().await {
        bus.notify_connection(events::VIDEO_STREAM, &connection, Payload::Binary(chunk))
            .await;
    }
    debug!(connection = %connection, "video stream ended");
}

/// Picture chunks followed by an empty payload marking the end.
async fn forward_picture(bus: Arc<EventBus>, connection: Connection, mut stream: ByteStream) {
    while let Some(chunk) = stream.recv().await {
        bus.notify_connection(events::PICTURE, &connection, Payload::Binary(chunk))
            .await;
    }
    bus.notify_connection(events::PICTURE, &connection, Payload::Empty)
        .await;
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use petfeeder_device::MockDevice;

    use super::*;
    use crate::testing::{wait_until, Harness};

    #[tokio::test]
    async fn camera_lives_while_subscribed() {
        let h = Harness::new().await;
        let sessions = h.sessions();
        let a = h.conn("a");

        sessions.start_video_stream(&a).await.unwrap();
        assert_eq!(h.cameras.created(), 1);
        assert!(sessions.has_camera().await);
        assert!(h.device.link_led_blinking());

        sessions.stop_video_stream(&a).await.unwrap();
        assert_eq!(h.cameras.destroyed(), 1);
        assert!(!sessions.has_camera().await);

        let device = Arc::clone(&h.device);
        wait_until(move || !device.link_led_blinking() && device.power_led()).await;
    }

    #[tokio::test]
    async fn stop_without_start_is_rejected() {
        let h = Harness::new().await;
        let err = h.sessions().stop_video_stream(&h.conn("a")).await.unwrap_err();
        assert_eq!(err, RpcError::Conflict(ConflictError::NotSubscribed));
        assert_eq!(h.cameras.created(), 0);
        assert_eq!(h.cameras.destroyed(), 0);
    }

    #[tokio::test]
    async fn shared_camera_for_several_subscribers() {
        let h = Harness::new().await;
        let sessions = h.sessions();
        let (a, b) = (h.conn("a"), h.conn("b"));

        sessions.start_video_stream(&a).await.unwrap();
        sessions.start_video_stream(&b).await.unwrap();
        assert_eq!(h.cameras.created(), 1);
        assert_eq!(
            sessions.start_video_stream(&a).await,
            Err(RpcError::Conflict(ConflictError::AlreadyStreaming))
        );

        sessions.stop_video_stream(&a).await.unwrap();
        assert_eq!(h.cameras.destroyed(), 0);
        sessions.stop_video_stream(&b).await.unwrap();
        assert_eq!(h.cameras.destroyed(), 1);
    }

    #[tokio::test]
    async fn chunks_reach_only_the_subscriber() {
        let h = Harness::new().await;
        let sessions = h.sessions();
        let a = h.conn("a");

        sessions.start_video_stream(&a).await.unwrap();
        h.cameras
            .last_camera()
            .unwrap()
            .push_chunk(Bytes::from_static(b"\x00\x00\x00\x01\x65"));

        let transport = Arc::clone(&h.transport);
        wait_until(move || !transport.named(events::VIDEO_STREAM).is_empty()).await;

        let sent = h.transport.named(events::VIDEO_STREAM);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user, Some(a.user_id.clone()));
        assert!(sent[0].payload.is_binary());
    }

    #[tokio::test]
    async fn picture_excludes_streaming() {
        let h = Harness::new().await;
        let sessions = h.sessions();
        let a = h.conn("a");

        sessions.start_video_stream(&a).await.unwrap();
        assert_eq!(
            sessions.take_picture(&h.conn("b")).await,
            Err(RpcError::Conflict(ConflictError::CameraStreaming))
        );
    }

    #[tokio::test]
    async fn picture_ends_with_empty_payload() {
        let h = Harness::new().await;
        let sessions = h.sessions();
        let a = h.conn("a");

        sessions.take_picture(&a).await.unwrap();
        assert!(!h.device.power_led());

        let transport = Arc::clone(&h.transport);
        wait_until(move || {
            transport
                .named(events::PICTURE)
                .last()
                .is_some_and(|n| n.payload == Payload::Empty)
        })
        .await;

        let sent = h.transport.named(events::PICTURE);
        assert!(sent.iter().all(|n| n.user == Some(a.user_id.clone())));
        assert!(sent[..sent.len() - 1].iter().all(|n| n.payload.is_binary()));

        // The capture closes, the camera is released and the LED comes back.
        let cameras = Arc::clone(&h.cameras);
        wait_until(move || cameras.destroyed() == 1).await;
        let device = Arc::clone(&h.device);
        wait_until(move || device.power_led()).await;
    }

    #[tokio::test]
    async fn camera_error_releases_camera() {
        let h = Harness::new().await;
        let sessions = h.sessions();
        let a = h.conn("a");

        sessions.start_video_stream(&a).await.unwrap();
        h.cameras
            .last_camera()
            .unwrap()
            .emit(CameraEvent::Error("sensor timeout".into()));

        let transport = Arc::clone(&h.transport);
        wait_until(move || !transport.named(events::CAMERA_ERROR).is_empty()).await;
        assert!(!sessions.has_camera().await);
        assert_eq!(sessions.subscriber_count().await, 0);

        // The next request gets a fresh camera.
        sessions.start_video_stream(&a).await.unwrap();
        assert_eq!(h.cameras.created(), 2);
    }

    #[tokio::test]
    async fn recording_keeps_camera_alive() {
        let h = Harness::new().await;
        let sessions = h.sessions();
        let a = h.conn("a");

        sessions.start_video_stream(&a).await.unwrap();
        let session = sessions.start_recording().await.unwrap();
        assert_eq!(session.file_name, format!("{}.h264", session.file_timestamp));
        assert!(session.full_path.ends_with(&session.file_name));
        assert_eq!(
            sessions.start_recording().await,
            Err(RpcError::Conflict(ConflictError::AlreadyRecording))
        );

        sessions.stop_video_stream(&a).await.unwrap();
        assert_eq!(h.cameras.destroyed(), 0);

        sessions.stop_recording().await.unwrap();
        assert_eq!(h.cameras.destroyed(), 1);
        // Nothing left to stop.
        sessions.stop_recording().await.unwrap();
    }

    #[tokio::test]
    async fn recording_folder_matches_file_timestamp() {
        let h = Harness::new().await;

        let session = h.sessions().start_recording().await.unwrap();
        let started = chrono::DateTime::from_timestamp_millis(session.file_timestamp).unwrap();
        let dir = session.full_path.parent().unwrap();
        assert_eq!(dir, h.store.media().path_for(started));
        assert!(dir.is_dir());

        h.sessions().stop_recording().await.unwrap();
    }

    #[tokio::test]
    async fn failed_start_releases_camera() {
        let h = Harness::new().await;
        h.cameras.fail_streaming(true);

        let err = h.sessions().start_video_stream(&h.conn("a")).await.unwrap_err();
        assert!(matches!(err, RpcError::Camera(_)));
        assert_eq!(h.cameras.destroyed(), 1);
    }

    #[tokio::test]
    async fn idle_leds_restored() {
        let device = MockDevice::quiet();
        device.setup_gpio().await.unwrap();
        device.set_power_led_state(false).await.unwrap();
        device.set_link_led_state(true).await.unwrap();
        device.set_link_led_blinking(true);

        restore_idle_leds(&device, Duration::from_millis(1)).await;
        assert!(device.power_led());
        assert!(!device.link_led());
        assert!(!device.link_led_blinking());
    }
}
