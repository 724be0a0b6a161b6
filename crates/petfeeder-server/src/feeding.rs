//! Reactions to device events.
//!
//! Feedings started by the schedule are filmed: recording starts with the
//! feeding and is cut after a fixed delay, whether or not the feeding has
//! finished. The clip is then muxed and thumbnailed, and its gallery row
//! advances through `Recording`, `Converted` and `Thumbnailed`. A failing
//! stage stops the pipeline and leaves the row where it is.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use petfeeder_device::{Device, DeviceEvent};
use petfeeder_media::MediaConverter;
use petfeeder_shared::protocol::{events, Payload};
use petfeeder_shared::types::{EventKind, GalleryState, ScheduledFeeding};

use crate::camera_session::{CameraSessions, RecordingSession};
use crate::notify::EventBus;
use crate::persistence::Persistence;
use crate::state::{FeedingState, ScheduleCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Stopping,
    Converting,
    Thumbnailing,
}

impl PipelineStage {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stopping => "stopping",
            Self::Converting => "converting",
            Self::Thumbnailing => "thumbnailing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed { thumbnails: usize },
    Failed(PipelineStage),
}

pub struct FeedingPipeline {
    pub(crate) feeding: Arc<Mutex<FeedingState>>,
    pub(crate) schedule: Arc<RwLock<ScheduleCache>>,
    device: Arc<dyn Device>,
    bus: Arc<EventBus>,
    persistence: Arc<dyn Persistence>,
    cameras: CameraSessions,
    converter: Arc<dyn MediaConverter>,
    recording_cutoff: Duration,
}

impl FeedingPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feeding: Arc<Mutex<FeedingState>>,
        schedule: Arc<RwLock<ScheduleCache>>,
        device: Arc<dyn Device>,
        bus: Arc<EventBus>,
        persistence: Arc<dyn Persistence>,
        cameras: CameraSessions,
        converter: Arc<dyn MediaConverter>,
        recording_cutoff: Duration,
    ) -> Self {
        Self {
            feeding,
            schedule,
            device,
            bus,
            persistence,
            cameras,
            converter,
            recording_cutoff,
        }
    }

    /// Handle one device event. Returns the recording pipeline task when the
    /// event started one.
    pub async fn handle_event(&self, event: DeviceEvent) -> Option<JoinHandle<PipelineOutcome>> {
        match event {
            DeviceEvent::ButtonDown => debug!("button down"),
            DeviceEvent::ButtonUp => debug!("button up"),
            DeviceEvent::ButtonLongPress { pressed_ms } => {
                info!(pressed_ms, "button long press");
                let blinking = self.device.link_led_blinking();
                self.device.set_link_led_blinking(!blinking);
            }
            DeviceEvent::ClockSynchronized => {
                info!("device clock synchronized");
                self.persist(EventKind::ClockSync, json!({})).await;
                self.bus
                    .broadcast(events::CLOCK_SYNCHRONIZED, Payload::Empty)
                    .await;
            }
            DeviceEvent::ScheduledFeedingStarted(feeding) => {
                return self.on_feeding_started(feeding).await;
            }
            DeviceEvent::FeedingComplete { motor_revolutions } => {
                self.on_feeding_complete(motor_revolutions).await;
            }
            DeviceEvent::UnknownMessage(data) => {
                warn!(len = data.len(), ?data, "unknown message from device");
            }
            DeviceEvent::WarningNoFood => {
                warn!("food container is empty");
                self.persist(EventKind::Warning, json!({"type": "nofood"}))
                    .await;
                self.bus.broadcast(events::NO_FOOD, Payload::Empty).await;
            }
        }
        None
    }

    async fn on_feeding_started(
        &self,
        feeding: ScheduledFeeding,
    ) -> Option<JoinHandle<PipelineOutcome>> {
        let (hardware, requested) = {
            let schedule = self.schedule.read().await;
            let mut state = self.feeding.lock().await;
            let hardware = state.begin_scheduled(&feeding, &schedule);
            (hardware, state.requested_portions)
        };
        info!(
            entry = feeding.entry_index,
            sound = feeding.sound_index,
            requested,
            hardware,
            "feeding started"
        );

        let data = serde_json::to_value(feeding).unwrap_or_default();
        self.bus
            .broadcast(events::FEEDING_STARTED, Payload::Json(data))
            .await;

        if hardware {
            return None;
        }
        self.start_recording_pipeline().await
    }

    async fn on_feeding_complete(&self, motor_revolutions: u32) {
        let outcome = self.feeding.lock().await.complete(motor_revolutions);
        let Some(outcome) = outcome else {
            warn!(motor_revolutions, "feeding complete without a feeding in progress");
            return;
        };
        info!(
            motor_revolutions,
            requested = outcome.record.scheduled_portions,
            "feeding complete"
        );

        match serde_json::to_value(&outcome.record) {
            Ok(data) => self.persist(EventKind::Feeding, data).await,
            Err(e) => error!(error = %e, "could not encode feeding record"),
        }
        self.bus
            .broadcast(events::FEEDING_COMPLETE, Payload::Json(json!(motor_revolutions)))
            .await;

        if outcome.motor_stuck {
            warn!(
                motor_revolutions,
                requested = outcome.record.scheduled_portions,
                "motor stuck"
            );
            self.bus
                .broadcast(
                    events::MOTOR_STUCK,
                    Payload::Json(json!({
                        "requestedPortions": outcome.record.scheduled_portions,
                        "motorRevolutions": motor_revolutions,
                    })),
                )
                .await;
        }
    }

    async fn start_recording_pipeline(&self) -> Option<JoinHandle<PipelineOutcome>> {
        let session = match self.cameras.start_recording().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "could not record feeding");
                return None;
            }
        };

        if let Err(e) = self.persistence.push_gallery(session.file_timestamp).await {
            error!(
                file_timestamp = session.file_timestamp,
                error = %e,
                "could not store gallery row"
            );
        }

        let job = PostRecording {
            cameras: self.cameras.clone(),
            converter: Arc::clone(&self.converter),
            persistence: Arc::clone(&self.persistence),
            cutoff: self.recording_cutoff,
        };
        Some(tokio::spawn(job.run(session)))
    }

    async fn persist(&self, kind: EventKind, data: serde_json::Value) {
        if let Err(e) = self.persistence.push_event(kind, data).await {
            error!(kind = kind.as_str(), error = %e, "could not store event");
        }
    }
}

/// Everything the post-recording task needs, detached from the pipeline.
struct PostRecording {
    cameras: CameraSessions,
    converter: Arc<dyn MediaConverter>,
    persistence: Arc<dyn Persistence>,
    cutoff: Duration,
}

impl PostRecording {
    async fn run(self, session: RecordingSession) -> PipelineOutcome {
        tokio::time::sleep(self.cutoff).await;
        let ts = session.file_timestamp;

        if let Err(e) = self.cameras.stop_recording().await {
            return fail(ts, PipelineStage::Stopping, &e);
        }

        let video = match self.converter.mux(&session.full_path).await {
            Ok(path) => path,
            Err(e) => return fail(ts, PipelineStage::Converting, &e),
        };
        self.advance(ts, GalleryState::Converted).await;

        let thumbnails = match self.converter.thumbnails(&video).await {
            Ok(images) => images.len(),
            Err(e) => return fail(ts, PipelineStage::Thumbnailing, &e),
        };
        self.advance(ts, GalleryState::Thumbnailed).await;

        info!(file_timestamp = ts, thumbnails, "recording processed");
        PipelineOutcome::Completed { thumbnails }
    }

    async fn advance(&self, file_timestamp: i64, state: GalleryState) {
        if let Err(e) = self.persistence.update_gallery(file_timestamp, state).await {
            error!(file_timestamp, ?state, error = %e, "could not update gallery row");
        }
    }
}

fn fail(file_timestamp: i64, stage: PipelineStage, error: &dyn std::fmt::Display) -> PipelineOutcome {
    error!(file_timestamp, stage = stage.as_str(), error = %error, "recording pipeline aborted");
    PipelineOutcome::Failed(stage)
}
