pub mod serial;
pub mod usb;

use std::time::Duration;

use crate::error::TransportError;

/// Byte-stream transport used by the STK500v2 engine. Implemented by a
/// serial port in production and by scripted fakes in tests.
pub trait ByteStream: Send {
    /// Write all bytes and flush them towards the device.
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    /// Returns `Ok(0)` when nothing arrived in time.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Drive the DTR line, used to reset the target.
    fn set_dtr(&mut self, level: bool) -> Result<(), TransportError>;

    /// Drop any bytes pending in the receive buffer.
    fn discard_input(&mut self) -> Result<(), TransportError>;
}

/// Control-transfer transport used by the DFU engine. Class-specific
/// requests always address DFU interface 0.
pub trait DfuBus: Send {
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Read a string descriptor from the device, used for DFU error
    /// strings reported via the status string index.
    fn read_string(&mut self, index: u8) -> Result<String, TransportError>;

    /// The device's free-text memory layout descriptor (the DFU
    /// interface's iInterface string).
    fn memory_layout(&mut self) -> Result<String, TransportError>;

    /// Maximum bytes per DNLOAD transfer, from the DFU functional
    /// descriptor.
    fn transfer_size(&self) -> u16;
}
