//! # petfeeder-device
//!
//! The contract every feeder driver implements ([`Device`]) and the events it
//! reports ([`DeviceEvent`]), plus [`MockDevice`], an in-process emulation used
//! for development and tests.

pub mod device;
pub mod mock;

mod error;

pub use device::{Device, DeviceEvent};
pub use error::{DeviceError, Result};
pub use mock::MockDevice;
