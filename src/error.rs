use thiserror::Error;

/// Failures at the serial or USB layer, shared by both engines.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid serial port {0}")]
    InvalidPort(String),

    #[error("Serial port {0} is busy")]
    PortBusy(String),

    #[error("Serial port {0} failed to open")]
    OpenFailed(String),

    #[error("No DFU device found")]
    NoDevice,

    #[error("Multiple DFU devices found")]
    MultipleDevices,

    #[error("Serial transport error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("USB transport error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for device ({0})")]
    Timeout(&'static str),
}

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Firmware format error: {0}")]
    Format(String),

    #[error("Unknown chip signature {0:02x?}")]
    UnknownChip([u8; 3]),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Verify error at offset {0:#x}")]
    Verify(usize),

    #[error("Programming cancelled")]
    Cancelled,
}

pub type FlashResult<T> = std::result::Result<T, FlashError>;
