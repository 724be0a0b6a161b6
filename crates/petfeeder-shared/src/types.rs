use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{NO_SOUND_INDEX, SCHEDULE_ENTRIES};

// Per-transport client identifier (socket id, bluetooth address, ...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a transport implementation, e.g. `"WebSocketTransport"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TransportClass(pub String);

impl TransportClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransportClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One client session on one transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub transport_class: TransportClass,
    pub user_id: UserId,
}

impl Connection {
    pub fn new(transport_class: TransportClass, user_id: UserId) -> Self {
        Self {
            transport_class,
            user_id,
        }
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.transport_class, self.user_id)
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// A single slot of the feeder's on-board schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    /// 1-based slot index.
    pub entry_index: u8,
    pub hours: u8,
    pub minutes: u8,
    pub portions: u32,
    #[serde(default = "default_sound_index")]
    pub sound_index: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_sound_index() -> u8 {
    NO_SOUND_INDEX
}

fn default_enabled() -> bool {
    true
}

impl ScheduleEntry {
    /// A cleared slot: 00:00, zero portions, silent, disabled.
    pub fn disabled(entry_index: u8) -> Self {
        Self {
            entry_index,
            hours: 0,
            minutes: 0,
            portions: 0,
            sound_index: NO_SOUND_INDEX,
            enabled: false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.entry_index == 0 || self.entry_index > SCHEDULE_ENTRIES {
            return Err(format!(
                "entryIndex must be within 1..={SCHEDULE_ENTRIES}, got {}",
                self.entry_index
            ));
        }
        if self.hours > 23 {
            return Err(format!("hours must be within 0..=23, got {}", self.hours));
        }
        if self.minutes > 59 {
            return Err(format!("minutes must be within 0..=59, got {}", self.minutes));
        }
        if self.sound_index > NO_SOUND_INDEX {
            return Err(format!(
                "soundIndex must be within 0..={NO_SOUND_INDEX}, got {}",
                self.sound_index
            ));
        }
        Ok(())
    }
}

/// Payload of the device's "scheduled feeding started" event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledFeeding {
    pub entry_index: u8,
    pub sound_index: u8,
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// Type tag of a persisted event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Feeding,
    ClockSync,
    Warning,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feeding => "feeding",
            Self::ClockSync => "clocksync",
            Self::Warning => "warning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "feeding" => Some(Self::Feeding),
            "clocksync" => Some(Self::ClockSync),
            "warning" => Some(Self::Warning),
            _ => None,
        }
    }
}

/// Data of a `feeding` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeedingRecord {
    pub scheduled: bool,
    pub scheduled_portions: i64,
    pub issued_portions: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hardware_button_pressed: bool,
}

/// Processing state of a gallery row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum GalleryState {
    Recording = 0,
    Converted = 1,
    Thumbnailed = 2,
}

impl From<GalleryState> for u8 {
    fn from(state: GalleryState) -> u8 {
        state as u8
    }
}

impl TryFrom<u8> for GalleryState {
    type Error = String;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(Self::Recording),
            1 => Ok(Self::Converted),
            2 => Ok(Self::Thumbnailed),
            other => Err(format!("unknown gallery state {other}")),
        }
    }
}
