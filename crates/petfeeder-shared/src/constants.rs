/// Application name
pub const APP_NAME: &str = "petfeeder";

/// `entryIndex` reported by the device when feeding was started with the
/// hardware button instead of the schedule.
pub const HARDWARE_BUTTON_ENTRY_INDEX: u8 = 0;

/// Requested portions when the schedule cache cannot resolve an entry.
pub const UNKNOWN_PORTIONS: i64 = -1;

/// Number of schedule slots on the feeder (indexes are 1-based).
pub const SCHEDULE_ENTRIES: u8 = 4;

/// Sound index meaning "play nothing".
pub const NO_SOUND_INDEX: u8 = 10;

/// Portions dispensed by `feedManually` when the caller passes none.
pub const DEFAULT_MANUAL_PORTIONS: u32 = 1;

/// Seconds between the start of a feeding recording and its cutover.
pub const DEFAULT_RECORDING_CUTOFF_SECS: u64 = 30;

/// Delay before restoring idle LEDs so blink timers can wind down.
pub const DEFAULT_LED_SETTLE_MS: u64 = 100;

/// Thumbnails generated per converted recording.
pub const DEFAULT_THUMBNAIL_COUNT: usize = 4;

/// Thumbnail dimensions in pixels.
pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 320;
pub const DEFAULT_THUMBNAIL_HEIGHT: u32 = 240;

/// Default HTTP / WebSocket port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// H.264 Annex-B start code separating NAL units.
pub const NAL_SEPARATOR: [u8; 4] = [0, 0, 0, 1];
