//! Firmware flashing for microcontrollers over two low-level protocols:
//! STK500v2 on a serial link (AVR parts such as the ATMega2560) and USB
//! DFU/DfuSe (STM32 bootloaders).
//!
//! The caller decodes a firmware file into a [`FirmwareImage`], opens the
//! engine matching the attached device family and drives a single
//! [`Programmer::program`] call to completion, failure or cancellation.
//! Device discovery and retry policy live outside this crate.

use tracing::debug;

pub use error::{FlashError, FlashResult, TransportError};
pub use progress::CancelToken;
pub use protocols::dfu::DfuEngine;
pub use protocols::dfu::file::Element;
pub use protocols::stk500v2::Stk500v2;

pub mod chips;
pub mod error;
pub mod hex;
pub mod progress;
pub mod protocols;
pub mod transport;

/// A firmware image ready for programming. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareImage {
    /// Bytes implicitly addressed from flash offset 0 (AVR).
    Flat(Vec<u8>),
    /// Chunks carrying absolute addresses (DFU).
    Elements(Vec<Element>),
}

impl FirmwareImage {
    /// Decode Intel HEX text into a flat image.
    pub fn from_hex(text: &str) -> FlashResult<Self> {
        Ok(FirmwareImage::Flat(hex::decode(text)?))
    }

    /// Parse a DfuSe container.
    pub fn from_dfuse(bytes: &[u8]) -> FlashResult<Self> {
        Ok(FirmwareImage::Elements(protocols::dfu::file::parse(bytes)?))
    }

    /// Wrap a raw binary as a single element at an absolute address.
    pub fn from_raw(address: u32, data: Vec<u8>) -> Self {
        FirmwareImage::Elements(vec![Element { address, data }])
    }

    pub fn len(&self) -> usize {
        match self {
            FirmwareImage::Flat(data) => data.len(),
            FirmwareImage::Elements(elements) => elements.iter().map(|e| e.data.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A programming session bound to one exclusively-owned transport. The
/// variant is selected once per session by the caller's device discovery.
pub enum Programmer {
    AvrIsp(Stk500v2),
    Dfu(DfuEngine),
}

impl Programmer {
    /// Flash the image, reporting `(current, total)` progress through the
    /// callback. The transport is released when the session is dropped,
    /// whether the session completed, failed or was cancelled.
    pub fn program(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(u32, u32),
    ) -> FlashResult<()> {
        match (self, image) {
            (Programmer::AvrIsp(engine), FirmwareImage::Flat(data)) => {
                engine.program(data, progress)
            }
            (Programmer::AvrIsp(_), FirmwareImage::Elements(_)) => Err(FlashError::Format(
                "AVR programming needs a flat image addressed from 0".to_string(),
            )),
            (Programmer::Dfu(engine), FirmwareImage::Elements(elements)) => {
                engine.program(elements, &mut |_addr, done, size| progress(done, size))
            }
            (Programmer::Dfu(engine), FirmwareImage::Flat(data)) => {
                debug!(
                    "Wrapping flat image as a single element at {:#010x}",
                    protocols::dfu::FLASH_BASE
                );
                let elements = vec![Element {
                    address: protocols::dfu::FLASH_BASE,
                    data: data.clone(),
                }];
                engine.program(&elements, &mut |_addr, done, size| progress(done, size))
            }
        }
    }
}
