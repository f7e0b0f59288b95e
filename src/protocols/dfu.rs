//! USB DFU programming engine for STM32 bootloaders (AN3156).
//!
//! All commands ride on DNLOAD control transfers: `0x41` erases (with a
//! page address, or alone for a mass erase), `0x21` sets the write
//! pointer, and a transfer with `wValue >= 2` carries firmware data. After
//! every command the device must report `DOWNLOAD_BUSY` and then
//! `DOWNLOAD_IDLE`; a zero-length DNLOAD leaves DFU mode through the
//! `MANIFEST` state.

pub mod file;
pub mod layout;

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{FlashError, FlashResult};
use crate::progress::CancelToken;
use crate::transport::DfuBus;
use crate::transport::usb::UsbDfuBus;
use self::file::Element;
use self::layout::MemorySegment;

/// Application entry point jumped to when leaving DFU mode.
pub const FLASH_BASE: u32 = 0x0800_0000;

const DFU_DNLOAD: u8 = 1;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_ABORT: u8 = 6;

const REQUEST_TIMEOUT: Duration = Duration::from_millis(4000);
/// Status polls may stall while an erase executes.
const STATUS_TIMEOUT: Duration = Duration::from_millis(20000);

const SETTLE_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    Idle,
    DownloadSync,
    DownloadBusy,
    DownloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    Unknown(u8),
}

impl DfuState {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => DfuState::AppIdle,
            0x01 => DfuState::AppDetach,
            0x02 => DfuState::Idle,
            0x03 => DfuState::DownloadSync,
            0x04 => DfuState::DownloadBusy,
            0x05 => DfuState::DownloadIdle,
            0x06 => DfuState::ManifestSync,
            0x07 => DfuState::Manifest,
            0x08 => DfuState::ManifestWaitReset,
            0x09 => DfuState::UploadIdle,
            0x0A => DfuState::Error,
            other => DfuState::Unknown(other),
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::AppIdle => write!(f, "STATE_APP_IDLE"),
            DfuState::AppDetach => write!(f, "STATE_APP_DETACH"),
            DfuState::Idle => write!(f, "STATE_DFU_IDLE"),
            DfuState::DownloadSync => write!(f, "STATE_DFU_DOWNLOAD_SYNC"),
            DfuState::DownloadBusy => write!(f, "STATE_DFU_DOWNLOAD_BUSY"),
            DfuState::DownloadIdle => write!(f, "STATE_DFU_DOWNLOAD_IDLE"),
            DfuState::ManifestSync => write!(f, "STATE_DFU_MANIFEST_SYNC"),
            DfuState::Manifest => write!(f, "STATE_DFU_MANIFEST"),
            DfuState::ManifestWaitReset => write!(f, "STATE_DFU_MANIFEST_WAIT_RESET"),
            DfuState::UploadIdle => write!(f, "STATE_DFU_UPLOAD_IDLE"),
            DfuState::Error => write!(f, "STATE_DFU_ERROR"),
            DfuState::Unknown(byte) => write!(f, "STATE_UNKNOWN({:#04x})", byte),
        }
    }
}

/// Decoded GETSTATUS reply.
#[derive(Debug, Clone, Copy)]
pub struct DfuStatus {
    pub status: u8,
    pub poll_timeout_ms: u32,
    pub state: DfuState,
    pub string_index: u8,
}

pub struct DfuEngine {
    bus: Box<dyn DfuBus>,
    cancel: CancelToken,
    mass_erase: bool,
}

impl DfuEngine {
    /// Open the single attached DFU device and settle it into the idle
    /// state.
    pub fn open(vid: u16, pid: u16, cancel: CancelToken) -> FlashResult<Self> {
        let bus = UsbDfuBus::open(vid, pid)?;
        let mut engine = Self::with_bus(Box::new(bus), cancel);
        engine.settle()?;
        Ok(engine)
    }

    /// Wrap an already-open transport without touching the device.
    pub fn with_bus(bus: Box<dyn DfuBus>, cancel: CancelToken) -> Self {
        DfuEngine {
            bus,
            cancel,
            mass_erase: false,
        }
    }

    /// Erase the whole device up front instead of page-by-page.
    pub fn mass_erase(&mut self, enable: bool) {
        self.mass_erase = enable;
    }

    /// Drive the device into `DFU_IDLE`, aborting or clearing whatever
    /// state a previous session left behind.
    pub fn settle(&mut self) -> FlashResult<()> {
        for _ in 0..SETTLE_ATTEMPTS {
            let status = self.get_status()?;
            match status.state {
                DfuState::Idle => return Ok(()),
                DfuState::DownloadIdle | DfuState::UploadIdle => self.abort_request()?,
                _ => self.clear_status()?,
            }
        }
        Err(FlashError::Protocol(format!(
            "Device did not settle into {} after {} attempts",
            DfuState::Idle,
            SETTLE_ATTEMPTS
        )))
    }

    /// Program the elements and leave DFU mode. Progress is reported per
    /// element as `(element address, bytes done, element size)`.
    pub fn program(
        &mut self,
        elements: &[Element],
        progress: &mut dyn FnMut(u32, u32, u32),
    ) -> FlashResult<()> {
        if self.mass_erase {
            info!("Mass erasing device");
            self.mass_erase_device()?;
        }
        self.write_elements(elements, progress)?;
        self.leave_dfu();
        Ok(())
    }

    fn get_status(&mut self) -> FlashResult<DfuStatus> {
        let mut buf = [0u8; 6];
        let n = self
            .bus
            .control_in(DFU_GETSTATUS, 0, &mut buf, STATUS_TIMEOUT)?;
        if n != 6 {
            return Err(FlashError::Protocol(format!(
                "Short GETSTATUS reply of {} bytes",
                n
            )));
        }
        let status = DfuStatus {
            status: buf[0],
            poll_timeout_ms: u32::from_le_bytes([buf[1], buf[2], buf[3], 0]),
            state: DfuState::from_byte(buf[4]),
            string_index: buf[5],
        };
        if status.string_index != 0 {
            if let Ok(message) = self.bus.read_string(status.string_index) {
                debug!("Device status message: {}", message);
            }
        }
        Ok(status)
    }

    fn check_status(&mut self, stage: &str, expected: DfuState) -> FlashResult<()> {
        let status = self.get_status()?;
        if status.state != expected {
            return Err(FlashError::Protocol(format!(
                "{} failed: {}",
                stage, status.state
            )));
        }
        Ok(())
    }

    fn clear_status(&mut self) -> FlashResult<()> {
        self.bus
            .control_out(DFU_CLRSTATUS, 0, &[], REQUEST_TIMEOUT)?;
        Ok(())
    }

    fn abort_request(&mut self) -> FlashResult<()> {
        self.bus.control_out(DFU_ABORT, 0, &[], REQUEST_TIMEOUT)?;
        Ok(())
    }

    fn dnload(&mut self, value: u16, data: &[u8]) -> FlashResult<()> {
        self.bus.control_out(DFU_DNLOAD, value, data, REQUEST_TIMEOUT)?;
        Ok(())
    }

    /// Issue a DNLOAD command and walk it through the busy/idle contract.
    fn command(&mut self, stage: &str, value: u16, data: &[u8]) -> FlashResult<()> {
        self.dnload(value, data)?;
        self.check_status(stage, DfuState::DownloadBusy)?;
        self.check_status(stage, DfuState::DownloadIdle)?;
        Ok(())
    }

    fn mass_erase_device(&mut self) -> FlashResult<()> {
        self.command("Erase", 0, &[0x41])
    }

    fn page_erase(&mut self, addr: u32) -> FlashResult<()> {
        debug!("Erasing page at {:#010x}", addr);
        let mut buf = [0u8; 5];
        buf[0] = 0x41;
        buf[1..].copy_from_slice(&addr.to_le_bytes());
        self.command("Erase", 0, &buf)
    }

    fn set_address(&mut self, addr: u32) -> FlashResult<()> {
        let mut buf = [0u8; 5];
        buf[0] = 0x21;
        buf[1..].copy_from_slice(&addr.to_le_bytes());
        self.command("Set address", 0, &buf)
    }

    /// Write one page-clamped run of bytes, chunked to the transport's
    /// maximum transfer size. Assumes the covered pages are erased.
    fn write_memory(
        &mut self,
        addr: u32,
        data: &[u8],
        element_addr: u32,
        element_size: u32,
        progress: &mut dyn FnMut(u32, u32, u32),
    ) -> FlashResult<()> {
        let transfer_size = self.bus.transfer_size() as usize;
        let mut written = 0usize;
        while written < data.len() {
            self.cancel.check()?;
            let target = addr + written as u32;
            self.set_address(target)?;
            let chunk = &data[written..(written + transfer_size).min(data.len())];
            self.dnload(2, chunk)?;
            self.check_status("Write memory", DfuState::DownloadBusy)?;
            self.check_status("Write memory", DfuState::DownloadIdle)?;
            written += chunk.len();
            progress(
                element_addr,
                target + chunk.len() as u32 - element_addr,
                element_size,
            );
        }
        Ok(())
    }

    /// Write every element, erasing each touched page exactly once when a
    /// mass erase was not requested up front.
    fn write_elements(
        &mut self,
        elements: &[Element],
        progress: &mut dyn FnMut(u32, u32, u32),
    ) -> FlashResult<()> {
        let segments: Vec<MemorySegment> = if self.mass_erase {
            Vec::new()
        } else {
            layout::read(self.bus.as_mut())?
        };

        for element in elements {
            let element_addr = element.address;
            let element_size = element.data.len() as u32;
            info!(
                "Writing element at {:#010x}, {} bytes",
                element_addr, element_size
            );
            if element_size > 0 {
                progress(element_addr, 0, element_size);
            }

            let mut addr = element_addr;
            let mut data = &element.data[..];
            while !data.is_empty() {
                self.cancel.check()?;
                let mut write_size = data.len() as u32;
                if !self.mass_erase {
                    let segment = segments
                        .iter()
                        .find(|s| s.contains(addr))
                        .ok_or_else(|| {
                            FlashError::Protocol(format!(
                                "Address {:#010x} is outside the device memory layout",
                                addr
                            ))
                        })?;
                    let page_addr = addr & !(segment.page_size - 1);
                    if addr + write_size > page_addr + segment.page_size {
                        write_size = page_addr + segment.page_size - addr;
                    }
                    self.page_erase(page_addr)?;
                }
                self.write_memory(
                    addr,
                    &data[..write_size as usize],
                    element_addr,
                    element_size,
                    progress,
                )?;
                data = &data[write_size as usize..];
                addr += write_size;
                progress(element_addr, addr - element_addr, element_size);
            }
        }
        Ok(())
    }

    /// Point the device at the application and trigger manifestation. The
    /// device is expected to reset itself, so nothing here is fatal.
    fn leave_dfu(&mut self) {
        info!("Exiting DFU mode");
        let exit = (|| -> FlashResult<DfuStatus> {
            self.set_address(FLASH_BASE)?;
            self.dnload(0, &[])?;
            self.get_status()
        })();
        match exit {
            Ok(status) if status.state == DfuState::Manifest => {}
            Ok(status) => warn!("Failed to reset device: {}", status.state),
            Err(e) => warn!("Failed to reset device: {}", e),
        }
    }
}
