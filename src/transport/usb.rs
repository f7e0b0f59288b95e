use std::time::Duration;

use rusb::{Device, DeviceHandle, Direction, GlobalContext, Language, Recipient, RequestType};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::DfuBus;

/// DFU class-specific requests are issued against interface 0.
const DFU_INTERFACE: u16 = 0;

/// DFU functional descriptor type (USB DFU 1.1, table 4.2).
const DFU_FUNCTIONAL_DESCRIPTOR: u8 = 0x21;

/// Fallback DNLOAD transfer size when the device carries no functional
/// descriptor.
const DEFAULT_TRANSFER_SIZE: u16 = 2048;

const STRING_TIMEOUT: Duration = Duration::from_millis(4000);

/// Default STM32 bootloader vendor/product ids.
pub const STM_BOOTLOADER_VID: u16 = 0x0483;
pub const STM_BOOTLOADER_PID: u16 = 0xDF11;

/// USB control-transfer transport bound to one DFU-mode device.
pub struct UsbDfuBus {
    handle: DeviceHandle<GlobalContext>,
    language: Option<Language>,
    layout_index: Option<u8>,
    transfer_size: u16,
}

/// Identity of a DFU-mode device found during discovery.
pub struct DfuDeviceInfo {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub memory_layout: Option<String>,
}

fn is_dfu_interface(class: u8, sub_class: u8) -> bool {
    class == 0xFE && sub_class == 1
}

fn device_matches(device: &Device<GlobalContext>, vid: u16, pid: u16) -> bool {
    let Ok(descriptor) = device.device_descriptor() else {
        return false;
    };
    if descriptor.vendor_id() != vid || descriptor.product_id() != pid {
        return false;
    }
    let Ok(config) = device.active_config_descriptor() else {
        return false;
    };
    config.interfaces().any(|interface| {
        interface
            .descriptors()
            .any(|d| is_dfu_interface(d.class_code(), d.sub_class_code()))
    })
}

/// Walk a blob of class-specific descriptors and pull out the DFU
/// functional descriptor's wTransferSize field.
fn find_transfer_size(extra: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i + 2 <= extra.len() {
        let len = extra[i] as usize;
        if len < 2 || i + len > extra.len() {
            return None;
        }
        if extra[i + 1] == DFU_FUNCTIONAL_DESCRIPTOR && len == 9 {
            return Some(u16::from_le_bytes([extra[i + 5], extra[i + 6]]));
        }
        i += len;
    }
    None
}

fn list_matching(vid: u16, pid: u16) -> Result<Vec<Device<GlobalContext>>, TransportError> {
    let devices = rusb::devices()?;
    Ok(devices
        .iter()
        .filter(|device| device_matches(device, vid, pid))
        .collect())
}

impl UsbDfuBus {
    /// Open the single DFU-mode device matching the vendor/product id and
    /// claim its DFU interface. Fails fast when no device (or more than
    /// one) is present; waiting for enumeration is the caller's concern.
    pub fn open(vid: u16, pid: u16) -> Result<UsbDfuBus, TransportError> {
        let mut matching = list_matching(vid, pid)?;
        let device = match matching.len() {
            0 => return Err(TransportError::NoDevice),
            1 => matching.remove(0),
            _ => return Err(TransportError::MultipleDevices),
        };

        let config = device.active_config_descriptor()?;

        let mut layout_index = None;
        let mut transfer_size = find_transfer_size(config.extra());
        for interface in config.interfaces() {
            for descriptor in interface.descriptors() {
                if is_dfu_interface(descriptor.class_code(), descriptor.sub_class_code()) {
                    if layout_index.is_none() {
                        layout_index = descriptor.description_string_index();
                    }
                    transfer_size = transfer_size.or_else(|| find_transfer_size(descriptor.extra()));
                }
            }
        }
        let transfer_size = transfer_size.unwrap_or_else(|| {
            warn!(
                "No DFU functional descriptor found, assuming {} byte transfers",
                DEFAULT_TRANSFER_SIZE
            );
            DEFAULT_TRANSFER_SIZE
        });

        let handle = device.open()?;
        if let Err(e) = handle.set_active_configuration(config.number()) {
            debug!("Could not set active configuration: {e}");
        }
        handle.claim_interface(DFU_INTERFACE as u8)?;

        let language = handle
            .read_languages(STRING_TIMEOUT)
            .ok()
            .and_then(|langs| langs.first().copied());

        debug!(
            "Claimed DFU interface on {:04x}:{:04x}, transfer size {}",
            vid, pid, transfer_size
        );

        Ok(UsbDfuBus {
            handle,
            language,
            layout_index,
            transfer_size,
        })
    }
}

impl DfuBus for UsbDfuBus {
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface);
        self.handle
            .write_control(request_type, request, value, DFU_INTERFACE, data, timeout)?;
        Ok(())
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let request_type = rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface);
        let n = self
            .handle
            .read_control(request_type, request, value, DFU_INTERFACE, buf, timeout)?;
        Ok(n)
    }

    fn read_string(&mut self, index: u8) -> Result<String, TransportError> {
        let language = self.language.ok_or(rusb::Error::NotFound)?;
        let s = self
            .handle
            .read_string_descriptor(language, index, STRING_TIMEOUT)?;
        Ok(s)
    }

    fn memory_layout(&mut self) -> Result<String, TransportError> {
        let index = self.layout_index.ok_or(rusb::Error::NotFound)?;
        self.read_string(index)
    }

    fn transfer_size(&self) -> u16 {
        self.transfer_size
    }
}

impl Drop for UsbDfuBus {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(DFU_INTERFACE as u8);
    }
}

/// Enumerate DFU-mode devices for the `list` command. The memory layout
/// is read best-effort; a device we lack permissions for is still listed.
pub fn list_devices(vid: u16, pid: u16) -> Result<Vec<DfuDeviceInfo>, TransportError> {
    let mut found = Vec::new();
    for device in list_matching(vid, pid)? {
        let descriptor = device.device_descriptor()?;
        let memory_layout = read_layout_string(&device).ok();
        found.push(DfuDeviceInfo {
            bus_number: device.bus_number(),
            address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            memory_layout,
        });
    }
    Ok(found)
}

fn read_layout_string(device: &Device<GlobalContext>) -> Result<String, TransportError> {
    let config = device.active_config_descriptor()?;
    let index = config
        .interfaces()
        .flat_map(|i| i.descriptors())
        .find(|d| is_dfu_interface(d.class_code(), d.sub_class_code()))
        .and_then(|d| d.description_string_index())
        .ok_or(rusb::Error::NotFound)?;
    let handle = device.open()?;
    let language = *handle
        .read_languages(STRING_TIMEOUT)?
        .first()
        .ok_or(rusb::Error::NotFound)?;
    let s = handle.read_string_descriptor(language, index, STRING_TIMEOUT)?;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_size_is_scanned_out_of_descriptor_blob() {
        // An endpoint descriptor followed by a DFU functional descriptor.
        let extra = [
            0x07, 0x05, 0x81, 0x03, 0x40, 0x00, 0x0A, // unrelated
            0x09, 0x21, 0x0B, 0xFF, 0x00, 0x00, 0x04, 0x1A, 0x01, // DFU functional
        ];
        assert_eq!(find_transfer_size(&extra), Some(0x0400));
    }

    #[test]
    fn transfer_size_absent_from_foreign_descriptors() {
        let extra = [0x07, 0x05, 0x81, 0x03, 0x40, 0x00, 0x0A];
        assert_eq!(find_transfer_size(&extra), None);
    }

    #[test]
    fn malformed_descriptor_blob_is_not_a_panic() {
        assert_eq!(find_transfer_size(&[0x00, 0x21]), None);
        assert_eq!(find_transfer_size(&[0x09, 0x21, 0x00]), None);
        assert_eq!(find_transfer_size(&[]), None);
    }

    #[test]
    fn dfu_interface_class_filter() {
        assert!(is_dfu_interface(0xFE, 1));
        assert!(!is_dfu_interface(0xFE, 2));
        assert!(!is_dfu_interface(0x03, 1));
    }
}
