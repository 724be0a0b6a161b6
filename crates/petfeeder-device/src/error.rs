use thiserror::Error;

/// Errors produced by device drivers.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// GPIO-backed operations were called before `setup_gpio`.
    #[error("GPIO setup is not completed, call setup_gpio() first")]
    GpioNotSetup,

    /// UART-backed operations were called before `connect`.
    #[error("UART is not connected, call connect() first")]
    UartNotConnected,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The device answered with something we could not interpret.
    #[error("Unexpected device response: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DeviceError>;
