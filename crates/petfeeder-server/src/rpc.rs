//! RPC dispatch.
//!
//! Every callable method is listed in [`RpcCall`]. A path that does not parse
//! into one is rejected before anything else happens, so methods that exist
//! on a collaborator but are not listed (`device/destroy`, ...) are
//! unreachable.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use petfeeder_device::Device;
use petfeeder_shared::constants::{DEFAULT_MANUAL_PORTIONS, NO_SOUND_INDEX};
use petfeeder_shared::error::{ConflictError, RpcError};
use petfeeder_shared::protocol::RpcRequest;
use petfeeder_shared::types::{Connection, ScheduleEntry};
use petfeeder_store::StoreError;

use crate::camera_session::CameraSessions;
use crate::connections::ConnectionRegistry;
use crate::persistence::Persistence;
use crate::state::{refresh_schedule, FeedingState, ScheduleCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMethod {
    FeedManually,
    GetSchedule,
    SetScheduleEntry,
    ClearSchedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraMethod {
    StartVideoStream,
    StopVideoStream,
    TakePicture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseMethod {
    GetEvents,
    GetGallery,
    GetEventDates,
    GetGalleryDates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCall {
    Device(DeviceMethod),
    Camera(CameraMethod),
    Database(DatabaseMethod),
}

impl RpcCall {
    pub fn parse(path: &str) -> Result<Self, RpcError> {
        let call = match path.split_once('/') {
            Some(("device", "feedManually")) => Self::Device(DeviceMethod::FeedManually),
            Some(("device", "getSchedule")) => Self::Device(DeviceMethod::GetSchedule),
            Some(("device", "setScheduleEntry")) => Self::Device(DeviceMethod::SetScheduleEntry),
            Some(("device", "clearSchedule")) => Self::Device(DeviceMethod::ClearSchedule),
            Some(("camera", "startVideoStream")) => Self::Camera(CameraMethod::StartVideoStream),
            Some(("camera", "stopVideoStream")) => Self::Camera(CameraMethod::StopVideoStream),
            Some(("camera", "takePicture")) => Self::Camera(CameraMethod::TakePicture),
            Some(("database", "getEvents")) => Self::Database(DatabaseMethod::GetEvents),
            Some(("database", "getGallery")) => Self::Database(DatabaseMethod::GetGallery),
            Some(("database", "getEventDates")) => Self::Database(DatabaseMethod::GetEventDates),
            Some(("database", "getGalleryDates")) => {
                Self::Database(DatabaseMethod::GetGalleryDates)
            }
            _ => return Err(RpcError::InvalidResource(path.to_string())),
        };
        Ok(call)
    }
}

pub struct Dispatcher {
    device: Arc<dyn Device>,
    feeding: Arc<Mutex<FeedingState>>,
    pub(crate) schedule: Arc<RwLock<ScheduleCache>>,
    connections: Arc<Mutex<ConnectionRegistry>>,
    cameras: CameraSessions,
    persistence: Arc<dyn Persistence>,
}

impl Dispatcher {
    pub fn new(
        device: Arc<dyn Device>,
        feeding: Arc<Mutex<FeedingState>>,
        schedule: Arc<RwLock<ScheduleCache>>,
        connections: Arc<Mutex<ConnectionRegistry>>,
        cameras: CameraSessions,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            device,
            feeding,
            schedule,
            connections,
            cameras,
            persistence,
        }
    }

    pub async fn dispatch(
        &self,
        connection: &Connection,
        request: &RpcRequest,
    ) -> Result<Value, RpcError> {
        info!(
            transport = %connection.transport_class,
            user = %connection.user_id,
            id = request.id,
            method = %request.method,
            args = ?request.args,
            "rpc request"
        );

        let result = match RpcCall::parse(&request.method) {
            Ok(call) => self.call(call, connection, &request.args).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(data) => debug!(
                user = %connection.user_id,
                id = request.id,
                method = %request.method,
                data = %data,
                "rpc result"
            ),
            Err(e) => warn!(
                user = %connection.user_id,
                id = request.id,
                method = %request.method,
                error = %e,
                "rpc failed"
            ),
        }
        result
    }

    async fn call(
        &self,
        call: RpcCall,
        connection: &Connection,
        args: &[Value],
    ) -> Result<Value, RpcError> {
        match call {
            RpcCall::Device(method) => self.call_device(method, connection, args).await,
            RpcCall::Camera(method) => {
                match method {
                    CameraMethod::StartVideoStream => {
                        self.cameras.start_video_stream(connection).await?
                    }
                    CameraMethod::StopVideoStream => {
                        self.cameras.stop_video_stream(connection).await?
                    }
                    CameraMethod::TakePicture => self.cameras.take_picture(connection).await?,
                }
                Ok(Value::Null)
            }
            RpcCall::Database(method) => self.call_database(method, args).await,
        }
    }

    async fn call_device(
        &self,
        method: DeviceMethod,
        connection: &Connection,
        args: &[Value],
    ) -> Result<Value, RpcError> {
        match method {
            DeviceMethod::FeedManually => {
                let portions = parse_portions(args)?;
                self.feeding.lock().await.begin_manual(portions)?;

                if let Err(e) = self.device.feed_manually(portions).await {
                    self.feeding.lock().await.abort();
                    return Err(RpcError::Device(e.to_string()));
                }
                Ok(Value::Null)
            }
            DeviceMethod::GetSchedule => {
                let entries = self.device.get_schedule().await.map_err(device_error)?;
                device_reply(entries)
            }
            DeviceMethod::SetScheduleEntry => {
                let entry = parse_schedule_entry(args)?;
                entry.validate().map_err(RpcError::InvalidRequest)?;
                self.require_control(connection).await?;

                self.device
                    .set_schedule_entry(entry)
                    .await
                    .map_err(device_error)?;
                self.refresh_in_background();
                Ok(Value::Null)
            }
            DeviceMethod::ClearSchedule => {
                self.require_control(connection).await?;
                self.device.clear_schedule().await.map_err(device_error)?;
                self.refresh_in_background();
                Ok(Value::Null)
            }
        }
    }

    async fn call_database(&self, method: DatabaseMethod, args: &[Value]) -> Result<Value, RpcError> {
        let data = match method {
            DatabaseMethod::GetEvents => {
                let (year, month, date) = parse_date(args)?;
                let events = self
                    .persistence
                    .get_events(year, month, date)
                    .await
                    .map_err(store_error)?;
                serde_json::to_value(events)
            }
            DatabaseMethod::GetGallery => {
                let (year, month, date) = parse_date(args)?;
                let rows = self
                    .persistence
                    .get_gallery(year, month, date)
                    .await
                    .map_err(store_error)?;
                serde_json::to_value(rows)
            }
            DatabaseMethod::GetEventDates => {
                serde_json::to_value(self.persistence.get_event_dates().await.map_err(store_error)?)
            }
            DatabaseMethod::GetGalleryDates => serde_json::to_value(
                self.persistence
                    .get_gallery_dates()
                    .await
                    .map_err(store_error)?,
            ),
        };
        data.map_err(|e| RpcError::Persistence(e.to_string()))
    }

    async fn require_control(&self, connection: &Connection) -> Result<(), RpcError> {
        if self.connections.lock().await.holds_control(connection) {
            Ok(())
        } else {
            Err(ConflictError::NotInControl.into())
        }
    }

    /// Re-read the schedule without making the caller wait for it.
    fn refresh_in_background(&self) {
        let device = Arc::clone(&self.device);
        let schedule = Arc::clone(&self.schedule);
        tokio::spawn(async move {
            if let Err(e) = refresh_schedule(device.as_ref(), &schedule).await {
                warn!(error = %e, "schedule refresh failed");
            }
        });
    }
}

fn device_error(e: petfeeder_device::DeviceError) -> RpcError {
    RpcError::Device(e.to_string())
}

fn device_reply<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Device(e.to_string()))
}

fn store_error(e: StoreError) -> RpcError {
    match e {
        StoreError::InvalidDate { .. } => RpcError::InvalidRequest(e.to_string()),
        other => RpcError::Persistence(other.to_string()),
    }
}

fn parse_portions(args: &[Value]) -> Result<u32, RpcError> {
    match args.first() {
        None | Some(Value::Null) => Ok(DEFAULT_MANUAL_PORTIONS),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                RpcError::InvalidRequest(format!("portions must be a positive integer, got {v}"))
            }),
    }
}

fn int_arg<T: TryFrom<u64>>(args: &[Value], index: usize, name: &str) -> Result<T, RpcError> {
    args.get(index)
        .and_then(Value::as_u64)
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| RpcError::InvalidRequest(format!("missing or invalid '{name}'")))
}

/// `[hours, minutes, portions, entryIndex, soundIndex?, enabled?]` or a
/// single entry object.
fn parse_schedule_entry(args: &[Value]) -> Result<ScheduleEntry, RpcError> {
    if let [obj @ Value::Object(_)] = args {
        return serde_json::from_value(obj.clone())
            .map_err(|e| RpcError::InvalidRequest(format!("invalid schedule entry: {e}")));
    }
    if args.len() < 4 {
        return Err(RpcError::InvalidRequest(
            "expected [hours, minutes, portions, entryIndex, soundIndex?, enabled?]".into(),
        ));
    }

    let sound_index = match args.get(4) {
        None | Some(Value::Null) => NO_SOUND_INDEX,
        Some(_) => int_arg(args, 4, "soundIndex")?,
    };
    let enabled = match args.get(5) {
        None | Some(Value::Null) => true,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| RpcError::InvalidRequest("'enabled' must be a boolean".into()))?,
    };

    Ok(ScheduleEntry {
        hours: int_arg(args, 0, "hours")?,
        minutes: int_arg(args, 1, "minutes")?,
        portions: int_arg(args, 2, "portions")?,
        entry_index: int_arg(args, 3, "entryIndex")?,
        sound_index,
        enabled,
    })
}

fn parse_date(args: &[Value]) -> Result<(i32, u32, u32), RpcError> {
    let year = args
        .first()
        .and_then(Value::as_i64)
        .and_then(|y| i32::try_from(y).ok())
        .ok_or_else(|| RpcError::InvalidRequest("missing or invalid 'year'".into()))?;
    Ok((year, int_arg(args, 1, "month")?, int_arg(args, 2, "date")?))
}
