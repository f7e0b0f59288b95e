//! DfuSe container parsing (STMicroelectronics UM0391).
//!
//! A container is a prefix, a list of targets each holding addressed
//! elements, and a 16 byte suffix whose CRC32 covers the entire file
//! except the CRC word itself. The suffix's device/product/vendor ids and
//! DFU version are informational and do not gate flashing.

use crc::{CRC_32_ISO_HDLC, Crc};
use tracing::debug;

use crate::error::{FlashError, FlashResult};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const PREFIX_LEN: usize = 11;
const TARGET_PREFIX_LEN: usize = 274;
const SUFFIX_LEN: usize = 16;

/// One addressed chunk of firmware extracted from a DfuSe container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub address: u32,
    pub data: Vec<u8>,
}

struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data }
    }

    fn take(&mut self, n: usize, what: &str) -> FlashResult<&'a [u8]> {
        if self.data.len() < n {
            return Err(FlashError::Format(format!("Truncated {}", what)));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &str) -> FlashResult<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16_le(&mut self, what: &str) -> FlashResult<u16> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32_le(&mut self, what: &str) -> FlashResult<u32> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The CRC as stored in a DfuSe suffix: the bit-inverted CRC32 of the
/// file minus its trailing CRC word.
pub fn suffix_crc(body: &[u8]) -> u32 {
    !CRC32.checksum(body)
}

fn cstring(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Parse a DfuSe container into its elements, validating the suffix CRC
/// and the nesting structure.
pub fn parse(bytes: &[u8]) -> FlashResult<Vec<Element>> {
    if bytes.len() < PREFIX_LEN + SUFFIX_LEN {
        return Err(FlashError::Format("DfuSe file too short".to_string()));
    }

    let stored_crc = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
    let computed_crc = suffix_crc(&bytes[..bytes.len() - 4]);
    if stored_crc != computed_crc {
        return Err(FlashError::Format(format!(
            "DfuSe crc mismatch: stored {:#010x}, computed {:#010x}",
            stored_crc, computed_crc
        )));
    }

    let mut cursor = Cursor::new(&bytes[..bytes.len() - SUFFIX_LEN]);

    let signature = cursor.take(5, "DfuSe prefix")?;
    if signature != b"DfuSe" {
        return Err(FlashError::Format("Bad DfuSe signature".to_string()));
    }
    let version = cursor.u8("DfuSe prefix")?;
    let image_size = cursor.u32_le("DfuSe prefix")?;
    let target_count = cursor.u8("DfuSe prefix")?;
    debug!(
        "DfuSe v{}, image size {}, {} targets",
        version, image_size, target_count
    );

    let mut elements = Vec::new();
    for target_idx in 0..target_count {
        let signature = cursor.take(6, "target prefix")?;
        if signature != b"Target" {
            return Err(FlashError::Format(format!(
                "Bad target signature in target {}",
                target_idx
            )));
        }
        let alt_setting = cursor.u8("target prefix")?;
        let named = cursor.u32_le("target prefix")?;
        let name_field = cursor.take(255, "target prefix")?;
        let name = if named != 0 { cstring(name_field) } else { String::new() };
        let target_size = cursor.u32_le("target prefix")? as usize;
        let element_count = cursor.u32_le("target prefix")?;
        debug!(
            "Target {}, alt setting {}, name {:?}, size {}, {} elements",
            target_idx, alt_setting, name, target_size, element_count
        );

        let mut target = Cursor::new(cursor.take(target_size, "target data")?);
        for _ in 0..element_count {
            let address = target.u32_le("element prefix")?;
            let size = target.u32_le("element prefix")? as usize;
            let data = target.take(size, "element data")?.to_vec();
            debug!("Element at {:#010x}, size {}", address, data.len());
            elements.push(Element { address, data });
        }
        if !target.is_empty() {
            return Err(FlashError::Format(format!(
                "Trailing bytes after elements of target {}",
                target_idx
            )));
        }
    }

    if !cursor.is_empty() {
        return Err(FlashError::Format(
            "Trailing bytes after last target".to_string(),
        ));
    }

    let mut suffix = Cursor::new(&bytes[bytes.len() - SUFFIX_LEN..]);
    let device = suffix.u16_le("suffix")?;
    let product = suffix.u16_le("suffix")?;
    let vendor = suffix.u16_le("suffix")?;
    let dfu_version = suffix.u16_le("suffix")?;
    debug!(
        "Suffix: usb {:04x}:{:04x}, device {:#06x}, dfu {:#06x}",
        vendor, product, device, dfu_version
    );

    Ok(elements)
}
