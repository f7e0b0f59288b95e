use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use fwflash::error::{FlashError, FlashResult, TransportError};
use fwflash::transport::serial::find_port_by_product_id;
use fwflash::{CancelToken, DfuEngine, FirmwareImage, Programmer, Stk500v2};
use indicatif::ProgressBar;

use crate::util::flash_progress_bar;

const DEFAULT_BAUD: u32 = 115200;

/// USB product ids of common ATMega2560 boards, used to find the serial
/// port when none is given.
const AVR_BOARD_PRODUCT_IDS: &[u16] = &[0x6001, 0x7523];

#[derive(Debug, Clone, ValueEnum)]
pub(crate) enum Target {
    /// AVR over STK500v2 on a serial port
    AvrIsp,
    /// STM32 bootloader over USB DFU
    Dfu,
}

#[derive(Parser, Debug, Clone)]
pub(crate) struct ProgramOptions {
    /// Target protocol family
    #[clap(short, long)]
    target: Target,

    /// Firmware file: .hex, .dfu, or a raw binary
    #[clap(short, long)]
    firmware: PathBuf,

    /// Serial port (AVR); auto-detected from USB ids when omitted
    #[clap(short, long)]
    port: Option<String>,

    /// Baud rate (AVR)
    #[clap(short, long)]
    baud: Option<u32>,

    /// USB vendor id (DFU)
    #[clap(long, value_parser = parse_hex_u16, default_value = "0x0483")]
    vid: u16,

    /// USB product id (DFU)
    #[clap(long, value_parser = parse_hex_u16, default_value = "0xdf11")]
    pid: u16,

    /// Erase the whole device before writing (DFU)
    #[clap(long, default_value_t = false)]
    mass_erase: bool,

    /// Skip read-back verification (AVR)
    #[clap(long, default_value_t = false)]
    no_verify: bool,
}

pub(crate) fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| e.to_string())
}

fn load_image(path: &Path) -> FlashResult<FirmwareImage> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("hex") => {
            let text = fs::read_to_string(path).map_err(|e| {
                FlashError::Format(format!("Could not read {}: {}", path.display(), e))
            })?;
            FirmwareImage::from_hex(&text)
        }
        Some("dfu") => {
            let bytes = fs::read(path).map_err(|e| {
                FlashError::Format(format!("Could not read {}: {}", path.display(), e))
            })?;
            FirmwareImage::from_dfuse(&bytes)
        }
        _ => {
            let bytes = fs::read(path).map_err(|e| {
                FlashError::Format(format!("Could not read {}: {}", path.display(), e))
            })?;
            Ok(FirmwareImage::Flat(bytes))
        }
    }
}

pub(crate) fn handle_programming(opts: ProgramOptions) -> FlashResult<()> {
    let image = load_image(&opts.firmware)?;
    let cancel = CancelToken::new();

    let mut programmer = match opts.target {
        Target::AvrIsp => {
            let port = match opts.port {
                Some(port) => port,
                None => find_port_by_product_id(AVR_BOARD_PRODUCT_IDS)?.ok_or_else(|| {
                    FlashError::Transport(TransportError::InvalidPort(
                        "no matching serial port found, pass --port".to_string(),
                    ))
                })?,
            };
            let mut engine =
                Stk500v2::open(&port, opts.baud.unwrap_or(DEFAULT_BAUD), cancel.clone())?;
            engine.verify_after_programming(!opts.no_verify);
            Programmer::AvrIsp(engine)
        }
        Target::Dfu => {
            let mut engine = DfuEngine::open(opts.vid, opts.pid, cancel.clone())?;
            engine.mass_erase(opts.mass_erase);
            Programmer::Dfu(engine)
        }
    };

    let mut bar: Option<ProgressBar> = None;
    programmer.program(&image, &mut |current, total| {
        let bar = bar.get_or_insert_with(|| flash_progress_bar(total as u64));
        if bar.length() != Some(total as u64) {
            bar.set_length(total as u64);
        }
        bar.set_position(current as u64);
    })?;
    if let Some(bar) = bar {
        bar.finish_with_message("Done");
    }

    Ok(())
}
