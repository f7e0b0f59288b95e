use clap::Parser;
use fwflash::error::FlashResult;
use fwflash::protocols::dfu::layout;
use fwflash::transport::usb;

use crate::program::parse_hex_u16;

#[derive(Parser, Debug, Clone)]
pub(crate) struct ListOptions {
    /// USB vendor id to match for DFU devices
    #[clap(long, value_parser = parse_hex_u16, default_value = "0x0483")]
    vid: u16,

    /// USB product id to match for DFU devices
    #[clap(long, value_parser = parse_hex_u16, default_value = "0xdf11")]
    pid: u16,
}

pub(crate) fn handle_listing(opts: ListOptions) -> FlashResult<()> {
    let ports = serialport::available_ports().unwrap_or_default();
    if ports.is_empty() {
        println!("No serial ports found");
    } else {
        println!("Serial ports:");
        for port in ports {
            match port.port_type {
                serialport::SerialPortType::UsbPort(info) => println!(
                    "    {} ({:04x}:{:04x})",
                    port.port_name, info.vid, info.pid
                ),
                _ => println!("    {}", port.port_name),
            }
        }
    }

    let devices = usb::list_devices(opts.vid, opts.pid)?;
    if devices.is_empty() {
        println!("No DFU devices matching {:04x}:{:04x}", opts.vid, opts.pid);
        return Ok(());
    }
    for device in devices {
        println!(
            "Bus {} Device {:03}: ID {:04x}:{:04x}",
            device.bus_number, device.address, device.vendor_id, device.product_id
        );
        let Some(descriptor) = device.memory_layout else {
            continue;
        };
        if let Ok(segments) = layout::parse(&descriptor) {
            println!("    Memory layout:");
            for segment in segments {
                println!(
                    "    {:#010x} {:2} pages of {:3}K bytes",
                    segment.start,
                    segment.pages,
                    segment.page_size / 1024
                );
            }
        }
    }

    Ok(())
}
