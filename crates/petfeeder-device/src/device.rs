//! Driver contract for the feeder hardware.
//!
//! A driver owns the UART link to the feeder's controller and the GPIO pins
//! for the two LEDs and the "SET" button. Commands are async methods; anything
//! the hardware reports on its own initiative is published as a
//! [`DeviceEvent`] on a broadcast channel, in the order it was received.

use async_trait::async_trait;
use tokio::sync::broadcast;

use petfeeder_shared::types::{ScheduleEntry, ScheduledFeeding};

use crate::error::Result;

/// Unsolicited events reported by the feeder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    ButtonDown,
    ButtonUp,
    /// The button was held; carries the press duration.
    ButtonLongPress { pressed_ms: u64 },
    /// The controller's RTC was synchronized with the host clock.
    ClockSynchronized,
    /// A schedule slot fired, or the hardware button started a feeding
    /// (`entry_index == 0`).
    ScheduledFeedingStarted(ScheduledFeeding),
    /// The motor stopped; carries the revolutions actually performed.
    FeedingComplete { motor_revolutions: u32 },
    /// A frame the driver could not decode.
    UnknownMessage(Vec<u8>),
    /// The food container is empty.
    WarningNoFood,
}

impl DeviceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ButtonDown => "buttondown",
            Self::ButtonUp => "buttonup",
            Self::ButtonLongPress { .. } => "buttonlongpress",
            Self::ClockSynchronized => "clocksynchronized",
            Self::ScheduledFeedingStarted(_) => "scheduledfeedingstarted",
            Self::FeedingComplete { .. } => "feedingcomplete",
            Self::UnknownMessage(_) => "unknownmessage",
            Self::WarningNoFood => "warningnofood",
        }
    }
}

#[async_trait]
pub trait Device: Send + Sync {
    /// Human-readable driver name for logs.
    fn name(&self) -> &str;

    async fn setup_gpio(&self) -> Result<()>;

    /// Open the UART link to the controller.
    async fn connect(&self) -> Result<()>;

    async fn set_power_led_state(&self, on: bool) -> Result<()>;

    async fn set_link_led_state(&self, on: bool) -> Result<()>;

    fn power_led_blinking(&self) -> bool;

    /// Start or stop the power LED blink timer.
    fn set_power_led_blinking(&self, blinking: bool);

    fn link_led_blinking(&self) -> bool;

    /// Start or stop the link LED blink timer.
    fn set_link_led_blinking(&self, blinking: bool);

    /// `true` while the "SET" button is held down.
    async fn get_button_state(&self) -> Result<bool>;

    /// Dispense `portions` now. Completion is reported later as
    /// [`DeviceEvent::FeedingComplete`].
    async fn feed_manually(&self, portions: u32) -> Result<()>;

    async fn get_schedule(&self) -> Result<Vec<ScheduleEntry>>;

    async fn set_schedule_entry(&self, entry: ScheduleEntry) -> Result<()>;

    /// Reset every slot to a disabled 00:00 entry.
    async fn clear_schedule(&self) -> Result<()>;

    /// Receive device events from now on.
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent>;

    /// Release the UART and GPIO resources.
    async fn destroy(&self);
}
