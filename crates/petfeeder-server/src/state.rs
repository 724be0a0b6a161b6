//! In-memory feeding and schedule state shared by the dispatcher and the
//! feeding pipeline.

use tokio::sync::RwLock;

use petfeeder_device::{Device, DeviceError};
use petfeeder_shared::constants::{HARDWARE_BUTTON_ENTRY_INDEX, UNKNOWN_PORTIONS};
use petfeeder_shared::error::ConflictError;
use petfeeder_shared::types::{FeedingRecord, ScheduleEntry, ScheduledFeeding};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedingState {
    pub in_progress: bool,
    pub was_scheduled: bool,
    /// `-1` when the schedule could not resolve the slot.
    pub requested_portions: i64,
    pub hardware_triggered: bool,
}

/// Result of a completed feeding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedingOutcome {
    pub record: FeedingRecord,
    /// Fewer revolutions than requested portions.
    pub motor_stuck: bool,
}

impl FeedingState {
    /// Claim the feeder for a manual feeding.
    pub fn begin_manual(&mut self, portions: u32) -> Result<(), ConflictError> {
        if self.in_progress {
            return Err(ConflictError::FeedingInProgress);
        }
        *self = Self {
            in_progress: true,
            was_scheduled: false,
            requested_portions: i64::from(portions),
            hardware_triggered: false,
        };
        Ok(())
    }

    /// Record a feeding started by the device itself. Returns `true` when it
    /// came from the hardware button.
    pub fn begin_scheduled(&mut self, feeding: &ScheduledFeeding, schedule: &ScheduleCache) -> bool {
        let hardware = feeding.entry_index == HARDWARE_BUTTON_ENTRY_INDEX;
        *self = if hardware {
            Self {
                in_progress: true,
                was_scheduled: false,
                requested_portions: 1,
                hardware_triggered: true,
            }
        } else {
            Self {
                in_progress: true,
                was_scheduled: true,
                requested_portions: schedule
                    .portions_for(feeding.entry_index)
                    .map(i64::from)
                    .unwrap_or(UNKNOWN_PORTIONS),
                hardware_triggered: false,
            }
        };
        hardware
    }

    /// Finish the feeding in progress. `None` if nothing was in progress.
    pub fn complete(&mut self, motor_revolutions: u32) -> Option<FeedingOutcome> {
        if !self.in_progress {
            return None;
        }
        self.in_progress = false;

        Some(FeedingOutcome {
            record: FeedingRecord {
                scheduled: self.was_scheduled,
                scheduled_portions: self.requested_portions,
                issued_portions: motor_revolutions,
                hardware_button_pressed: self.hardware_triggered,
            },
            motor_stuck: i64::from(motor_revolutions) < self.requested_portions,
        })
    }

    /// Release a manual claim whose device call failed.
    pub fn abort(&mut self) {
        self.in_progress = false;
    }
}

/// Last schedule read from the device.
#[derive(Debug, Clone, Default)]
pub struct ScheduleCache {
    entries: Option<Vec<ScheduleEntry>>,
}

impl ScheduleCache {
    pub fn replace(&mut self, entries: Vec<ScheduleEntry>) {
        self.entries = Some(entries);
    }

    pub fn entries(&self) -> Option<&[ScheduleEntry]> {
        self.entries.as_deref()
    }

    pub fn portions_for(&self, entry_index: u8) -> Option<u32> {
        self.entries
            .as_ref()?
            .iter()
            .find(|e| e.entry_index == entry_index)
            .map(|e| e.portions)
    }
}

/// Re-read the schedule from the device into `cache`.
pub async fn refresh_schedule(
    device: &dyn Device,
    cache: &RwLock<ScheduleCache>,
) -> Result<(), DeviceError> {
    let entries = device.get_schedule().await?;
    tracing::debug!(entries = entries.len(), "schedule cache refreshed");
    cache.write().await.replace(entries);
    Ok(())
}
