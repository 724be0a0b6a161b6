//! In-process emulation of the feeder.
//!
//! Behaves like the real controller from the server's point of view: GPIO and
//! UART preconditions are enforced, manual feedings complete after a delay,
//! the clock is "synchronized" periodically and the four schedule slots are
//! kept in memory. The `emulate_*` helpers inject hardware events.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use petfeeder_shared::constants::SCHEDULE_ENTRIES;
use petfeeder_shared::types::{ScheduleEntry, ScheduledFeeding};

use crate::device::{Device, DeviceEvent};
use crate::error::{DeviceError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const BLINK_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_FEED_DURATION: Duration = Duration::from_secs(2);
const DEFAULT_CLOCK_SYNC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct MockState {
    gpio_ready: bool,
    uart_connected: bool,
    power_led: bool,
    link_led: bool,
    button_pressed: bool,
    schedule: Vec<ScheduleEntry>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            gpio_ready: false,
            uart_connected: false,
            power_led: false,
            link_led: false,
            button_pressed: false,
            schedule: cleared_schedule(),
        }
    }
}

fn cleared_schedule() -> Vec<ScheduleEntry> {
    (1..=SCHEDULE_ENTRIES).map(ScheduleEntry::disabled).collect()
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
enum Led {
    Power,
    Link,
}

/// Toggles one LED on an interval while enabled.
#[derive(Default)]
struct Blinker {
    blinking: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Blinker {
    fn is_blinking(&self) -> bool {
        self.blinking.load(Ordering::SeqCst)
    }

    fn set(&self, blinking: bool, led: Led, state: Arc<Mutex<MockState>>) {
        self.blinking.store(blinking, Ordering::SeqCst);

        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
        }

        if !blinking {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                *task = Some(rt.spawn(async move {
                    let mut interval = tokio::time::interval(BLINK_INTERVAL);
                    loop {
                        interval.tick().await;
                        let mut s = lock(&state);
                        match led {
                            Led::Power => s.power_led = !s.power_led,
                            Led::Link => s.link_led = !s.link_led,
                        }
                    }
                }));
            }
            Err(_) => warn!(?led, "No tokio runtime, LED blink timer not started"),
        }
    }
}

/// Emulated feeder.
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<DeviceEvent>,
    power_blink: Blinker,
    link_blink: Blinker,
    feed_duration: Option<Duration>,
    clock_sync_interval: Option<Duration>,
    feed_calls: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MockDevice {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            events,
            power_blink: Blinker::default(),
            link_blink: Blinker::default(),
            feed_duration: Some(DEFAULT_FEED_DURATION),
            clock_sync_interval: Some(DEFAULT_CLOCK_SYNC_INTERVAL),
            feed_calls: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// How long an emulated feeding takes; `None` means feedings never
    /// complete on their own (use [`MockDevice::emulate_feeding_complete`]).
    pub fn with_feed_duration(mut self, duration: Option<Duration>) -> Self {
        self.feed_duration = duration;
        self
    }

    /// Period of emulated clock synchronizations; `None` disables them.
    pub fn with_clock_sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.clock_sync_interval = interval;
        self
    }

    /// A device that only emits what the caller injects.
    pub fn quiet() -> Self {
        Self::new()
            .with_feed_duration(None)
            .with_clock_sync_interval(None)
    }

    // -- Inspection --

    /// Number of `feed_manually` calls that reached the device.
    pub fn feed_calls(&self) -> usize {
        self.feed_calls.load(Ordering::SeqCst)
    }

    pub fn power_led(&self) -> bool {
        lock(&self.state).power_led
    }

    pub fn link_led(&self) -> bool {
        lock(&self.state).link_led
    }

    pub fn schedule_snapshot(&self) -> Vec<ScheduleEntry> {
        lock(&self.state).schedule.clone()
    }

    // -- Emulation --

    fn emit(&self, event: DeviceEvent) {
        debug!(event = event.name(), "Mock device emitting event");
        // No subscribers yet is fine.
        let _ = self.events.send(event);
    }

    pub fn set_button_pressed(&self, pressed: bool) {
        lock(&self.state).button_pressed = pressed;
    }

    pub fn emulate_button_down(&self) {
        self.set_button_pressed(true);
        self.emit(DeviceEvent::ButtonDown);
    }

    pub fn emulate_button_up(&self) {
        self.set_button_pressed(false);
        self.emit(DeviceEvent::ButtonUp);
    }

    pub fn emulate_long_press(&self, pressed_ms: u64) {
        self.emit(DeviceEvent::ButtonLongPress { pressed_ms });
    }

    pub fn emulate_warning_no_food(&self) {
        self.emit(DeviceEvent::WarningNoFood);
    }

    pub fn emulate_clock_sync(&self) {
        self.emit(DeviceEvent::ClockSynchronized);
    }

    pub fn emulate_unknown_message(&self, data: Vec<u8>) {
        self.emit(DeviceEvent::UnknownMessage(data));
    }

    pub fn emulate_feeding_complete(&self, motor_revolutions: u32) {
        self.emit(DeviceEvent::FeedingComplete { motor_revolutions });
    }

    /// Fire a schedule slot (or the hardware button for `entry_index == 0`).
    /// With a feed duration configured, completion follows with the slot's
    /// portions.
    pub fn emulate_scheduled_feeding(&self, entry_index: u8, sound_index: u8) {
        let portions = if entry_index == 0 {
            1
        } else {
            lock(&self.state)
                .schedule
                .iter()
                .find(|e| e.entry_index == entry_index)
                .map(|e| e.portions)
                .unwrap_or(0)
        };

        self.emit(DeviceEvent::ScheduledFeedingStarted(ScheduledFeeding {
            entry_index,
            sound_index,
        }));
        self.complete_later(portions);
    }

    fn complete_later(&self, motor_revolutions: u32) {
        let Some(duration) = self.feed_duration else {
            return;
        };
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = events.send(DeviceEvent::FeedingComplete { motor_revolutions });
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn require_gpio(&self) -> Result<MutexGuard<'_, MockState>> {
        let state = lock(&self.state);
        if !state.gpio_ready {
            return Err(DeviceError::GpioNotSetup);
        }
        Ok(state)
    }

    fn require_uart(&self) -> Result<MutexGuard<'_, MockState>> {
        let state = lock(&self.state);
        if !state.uart_connected {
            return Err(DeviceError::UartNotConnected);
        }
        Ok(state)
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for MockDevice {
    fn name(&self) -> &str {
        "MockDevice"
    }

    async fn setup_gpio(&self) -> Result<()> {
        lock(&self.state).gpio_ready = true;
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.uart_connected {
                return Ok(());
            }
            state.uart_connected = true;
        }

        if let Some(period) = self.clock_sync_interval {
            let events = self.events.clone();
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                // The first tick completes immediately.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let _ = events.send(DeviceEvent::ClockSynchronized);
                }
            });
            self.track(handle);
        }

        info!("Mock device connected");
        Ok(())
    }

    async fn set_power_led_state(&self, on: bool) -> Result<()> {
        self.require_gpio()?.power_led = on;
        Ok(())
    }

    async fn set_link_led_state(&self, on: bool) -> Result<()> {
        self.require_gpio()?.link_led = on;
        Ok(())
    }

    fn power_led_blinking(&self) -> bool {
        self.power_blink.is_blinking()
    }

    fn set_power_led_blinking(&self, blinking: bool) {
        self.power_blink
            .set(blinking, Led::Power, Arc::clone(&self.state));
    }

    fn link_led_blinking(&self) -> bool {
        self.link_blink.is_blinking()
    }

    fn set_link_led_blinking(&self, blinking: bool) {
        self.link_blink.set(blinking, Led::Link, Arc::clone(&self.state));
    }

    async fn get_button_state(&self) -> Result<bool> {
        Ok(self.require_gpio()?.button_pressed)
    }

    async fn feed_manually(&self, portions: u32) -> Result<()> {
        if portions == 0 {
            return Err(DeviceError::InvalidParameter(
                "portions must be greater than zero".into(),
            ));
        }
        drop(self.require_uart()?);
        self.feed_calls.fetch_add(1, Ordering::SeqCst);
        self.complete_later(portions);
        Ok(())
    }

    async fn get_schedule(&self) -> Result<Vec<ScheduleEntry>> {
        Ok(self.require_uart()?.schedule.clone())
    }

    async fn set_schedule_entry(&self, entry: ScheduleEntry) -> Result<()> {
        entry.validate().map_err(DeviceError::InvalidParameter)?;
        let mut state = self.require_uart()?;
        let index = usize::from(entry.entry_index - 1);
        match state.schedule.get_mut(index) {
            Some(slot) => *slot = entry,
            None => {
                return Err(DeviceError::InvalidParameter(format!(
                    "no schedule slot {}",
                    entry.entry_index
                )))
            }
        }
        Ok(())
    }

    async fn clear_schedule(&self) -> Result<()> {
        self.require_uart()?.schedule = cleared_schedule();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    async fn destroy(&self) {
        self.power_blink
            .set(false, Led::Power, Arc::clone(&self.state));
        self.link_blink.set(false, Led::Link, Arc::clone(&self.state));

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            task.abort();
        }

        lock(&self.state).uart_connected = false;
        info!("Mock device destroyed");
    }
}
