//! The orchestrator: owns the device and wires transports, the dispatcher,
//! camera sessions and the feeding pipeline together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use petfeeder_device::{Device, DeviceEvent};
use petfeeder_media::{CameraFactory, MediaConverter};
use petfeeder_shared::protocol::{events, Payload, RpcRequest, RpcResponse};
use petfeeder_shared::types::Connection;

use crate::camera_session::CameraSessions;
use crate::config::ServerConfig;
use crate::connections::ConnectionRegistry;
use crate::feeding::FeedingPipeline;
use crate::notify::EventBus;
use crate::persistence::Persistence;
use crate::rpc::Dispatcher;
use crate::state::{refresh_schedule, FeedingState, ScheduleCache};
use crate::transport::{Transport, TransportEvent};

const TRANSPORT_EVENT_BUFFER: usize = 256;

/// Collaborators the server is built from.
pub struct ServerParts {
    pub device: Arc<dyn Device>,
    pub transports: Vec<Arc<dyn Transport>>,
    pub persistence: Arc<dyn Persistence>,
    pub camera_factory: Arc<dyn CameraFactory>,
    pub converter: Arc<dyn MediaConverter>,
}

#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    pub recording_cutoff: Duration,
    pub led_settle: Duration,
}

impl From<&ServerConfig> for ServerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            recording_cutoff: config.recording_cutoff,
            led_settle: config.led_settle,
        }
    }
}

pub struct PetfeederServer {
    device: Arc<dyn Device>,
    transports: Vec<Arc<dyn Transport>>,
    bus: Arc<EventBus>,
    connections: Arc<Mutex<ConnectionRegistry>>,
    schedule: Arc<RwLock<ScheduleCache>>,
    cameras: CameraSessions,
    pipeline: FeedingPipeline,
    dispatcher: Dispatcher,
    /// One request queue per connection keeps its RPCs in arrival order.
    workers: Mutex<HashMap<Connection, mpsc::UnboundedSender<Value>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl PetfeederServer {
    pub fn new(parts: ServerParts, settings: ServerSettings) -> Self {
        let bus = Arc::new(EventBus::new(&parts.transports));
        let connections = Arc::new(Mutex::new(ConnectionRegistry::default()));
        let feeding = Arc::new(Mutex::new(FeedingState::default()));
        let schedule = Arc::new(RwLock::new(ScheduleCache::default()));

        let cameras = CameraSessions::new(
            parts.camera_factory,
            Arc::clone(&parts.device),
            Arc::clone(&bus),
            Arc::clone(&parts.persistence),
            settings.led_settle,
        );
        let pipeline = FeedingPipeline::new(
            Arc::clone(&feeding),
            Arc::clone(&schedule),
            Arc::clone(&parts.device),
            Arc::clone(&bus),
            Arc::clone(&parts.persistence),
            cameras.clone(),
            parts.converter,
            settings.recording_cutoff,
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&parts.device),
            feeding,
            Arc::clone(&schedule),
            Arc::clone(&connections),
            cameras.clone(),
            parts.persistence,
        );

        Self {
            device: parts.device,
            transports: parts.transports,
            bus,
            connections,
            schedule,
            cameras,
            pipeline,
            dispatcher,
            workers: Mutex::new(HashMap::new()),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn cameras(&self) -> &CameraSessions {
        &self.cameras
    }

    pub fn pipeline(&self) -> &FeedingPipeline {
        &self.pipeline
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Bring the device up, start listening to it, then open the transports.
    /// Returns once everything runs in the background.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        // Subscribe first so nothing emitted during startup is missed.
        let device_events = self.device.subscribe();

        info!(device = self.device.name(), "starting device");
        self.device.setup_gpio().await.context("GPIO setup failed")?;
        let pressed = self
            .device
            .get_button_state()
            .await
            .context("could not read button state")?;
        debug!(pressed, "button state");

        self.device
            .connect()
            .await
            .context("could not connect to the feeder")?;
        self.device.set_power_led_state(true).await?;
        self.device.set_link_led_state(false).await?;

        if let Err(e) = refresh_schedule(self.device.as_ref(), &self.schedule).await {
            warn!(error = %e, "could not read schedule, feedings will report -1 portions");
        }

        let server = Arc::clone(self);
        self.track(tokio::spawn(server.device_loop(device_events)));

        let (tx, rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        let server = Arc::clone(self);
        self.track(tokio::spawn(server.transport_loop(rx)));

        for transport in &self.transports {
            let class = transport.class();
            transport
                .run(tx.clone())
                .await
                .with_context(|| format!("transport {class} failed to start"))?;
            info!(transport = %class, "transport running");
        }

        info!("petfeeder server running");
        Ok(())
    }

    async fn device_loop(self: Arc<Self>, mut events: broadcast::Receiver<DeviceEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    debug!(event = event.name(), "device event");
                    self.pipeline.handle_event(event).await;
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "device events lagged"),
                Err(RecvError::Closed) => {
                    info!("device event stream closed");
                    break;
                }
            }
        }
    }

    async fn transport_loop(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_transport_event(event).await;
        }
        debug!("all transports stopped");
    }

    pub async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::UserConnect(connection) => self.on_user_connect(connection).await,
            TransportEvent::UserDisconnect(connection) => {
                self.on_user_disconnect(&connection).await
            }
            TransportEvent::RpcRequest {
                connection,
                payload,
            } => self.enqueue_request(connection, payload).await,
        }
    }

    async fn on_user_connect(&self, connection: Connection) {
        let (granted, total) = {
            let mut registry = self.connections.lock().await;
            let granted = registry.on_connect(connection.clone());
            (granted, registry.len())
        };
        info!(connection = %connection, total, control = granted, "user connected");

        if granted {
            self.grant_control(&connection).await;
        }
    }

    async fn on_user_disconnect(&self, connection: &Connection) {
        // The worker skips what is still queued and releases the stream again
        // once its queue is drained.
        self.workers.lock().await.remove(connection);
        self.cameras.drop_subscription(connection).await;

        let (successor, total) = {
            let mut registry = self.connections.lock().await;
            let successor = registry.on_disconnect(connection);
            (successor, registry.len())
        };
        info!(connection = %connection, total, "user disconnected");

        if let Some(successor) = successor {
            info!(from = %connection, to = %successor, "control transferred");
            self.grant_control(&successor).await;
        }
    }

    async fn grant_control(&self, connection: &Connection) {
        let data = serde_json::to_value(connection).unwrap_or_default();
        self.bus
            .notify_connection(events::CONTROL_GRANTED, connection, Payload::Json(data))
            .await;
    }

    async fn enqueue_request(self: &Arc<Self>, connection: Connection, payload: Value) {
        if !self.connections.lock().await.contains(&connection) {
            warn!(connection = %connection, "request from unknown connection, dropping");
            return;
        }

        let mut workers = self.workers.lock().await;
        let queue = workers
            .entry(connection.clone())
            .or_insert_with(|| self.spawn_worker(connection.clone()));

        if queue.send(payload).is_err() {
            warn!(connection = %connection, "request queue closed, dropping request");
            workers.remove(&connection);
        }
    }

    fn spawn_worker(self: &Arc<Self>, connection: Connection) -> mpsc::UnboundedSender<Value> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if !server.connections.lock().await.contains(&connection) {
                    debug!(connection = %connection, "connection gone, skipping queued request");
                    continue;
                }
                server.handle_request(&connection, payload).await;
            }
            // A request that was running when the user left may have subscribed.
            server.cameras.drop_subscription(&connection).await;
        });
        tx
    }

    async fn handle_request(&self, connection: &Connection, payload: Value) {
        let id = RpcRequest::id_hint(&payload);
        let result = match RpcRequest::from_value(payload) {
            Ok(request) => self.dispatcher.dispatch(connection, &request).await,
            Err(e) => {
                warn!(connection = %connection, id, error = %e, "malformed rpc request");
                Err(e)
            }
        };
        self.bus
            .respond(connection, RpcResponse::from_result(id, result))
            .await;
    }

    /// Release the camera, switch the LEDs off and let go of the device.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.cameras.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            task.abort();
        }

        self.device.set_power_led_blinking(false);
        self.device.set_link_led_blinking(false);
        if let Err(e) = self.device.set_power_led_state(false).await {
            warn!(error = %e, "could not switch power LED off");
        }
        if let Err(e) = self.device.set_link_led_state(false).await {
            warn!(error = %e, "could not switch link LED off");
        }
        self.device.destroy().await;
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
    }
}
