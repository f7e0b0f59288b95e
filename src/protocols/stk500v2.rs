//! STK500v2 programming engine for AVR targets.
//!
//! The protocol is used by the ArduinoMega2560 bootloader and a few other
//! AVR platforms. The engine drives a single blocking request/response
//! sequence over an abstract byte-stream transport: reset and sign-on at
//! open, then signature probe, programming-mode entry, chip erase, paged
//! writes, 256-byte read-back verify and programming-mode exit.

pub mod framer;

use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::chips::{self, ChipProfile};
use crate::error::{FlashError, FlashResult, TransportError};
use crate::progress::CancelToken;
use crate::transport::{ByteStream, serial::SerialLink};
use self::framer::{Framer, Receiver};

#[repr(u8)]
pub enum Stk500v2Message {
    CmdSignOn = 0x01,
    CmdLoadAddress = 0x06,
    CmdEnterProgmodeIsp = 0x10,
    CmdLeaveProgmodeIsp = 0x11,
    CmdProgramFlashIsp = 0x13,
    CmdReadFlashIsp = 0x14,
    CmdSpiMulti = 0x1D,
    StatusCmdOk = 0x00,
}

/// Bounded wait for the first byte of a reply.
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);
/// Bounded wait for each further byte while a frame is incomplete.
const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Verify reads back flash in fixed 256 byte blocks.
const VERIFY_BLOCK: usize = 0x100;

pub struct Stk500v2 {
    link: Box<dyn ByteStream>,
    framer: Framer,
    cancel: CancelToken,
    verify: bool,
}

impl std::fmt::Debug for Stk500v2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stk500v2")
            .field("framer", &self.framer)
            .field("cancel", &self.cancel)
            .field("verify", &self.verify)
            .finish_non_exhaustive()
    }
}

impl Stk500v2 {
    /// Open the serial port and perform the entry handshake: reset the
    /// target through DTR, then sign on and check the bootloader
    /// identifier.
    pub fn open(port: &str, baud: u32, cancel: CancelToken) -> FlashResult<Self> {
        let link = SerialLink::open(port, baud)?;
        info!("Opened {} at {} baud", port, baud);
        Self::with_link(Box::new(link), cancel)
    }

    /// Run the entry handshake over an already-open transport.
    pub fn with_link(link: Box<dyn ByteStream>, cancel: CancelToken) -> FlashResult<Self> {
        let mut session = Stk500v2 {
            link,
            framer: Framer::new(),
            cancel,
            verify: true,
        };
        session.enter_isp()?;
        Ok(session)
    }

    pub fn verify_after_programming(&mut self, enable: bool) {
        self.verify = enable;
    }

    fn enter_isp(&mut self) -> FlashResult<()> {
        self.framer = Framer::new();

        // Reset the controller.
        self.link.set_dtr(true)?;
        thread::sleep(Duration::from_millis(100));
        self.link.set_dtr(false)?;
        thread::sleep(Duration::from_millis(200));
        self.link.discard_input()?;

        let recv = self.send_message(&[Stk500v2Message::CmdSignOn as u8])?;
        if recv.len() < 3 || &recv[3..] != b"AVRISP_2" {
            return Err(FlashError::Protocol("Unknown bootloader".to_string()));
        }
        info!("Signed on to AVRISP_2 bootloader");
        Ok(())
    }

    /// Program and verify a flat image addressed from flash offset 0.
    pub fn program(
        &mut self,
        image: &[u8],
        progress: &mut dyn FnMut(u32, u32),
    ) -> FlashResult<()> {
        let signature = self.read_signature()?;
        let chip = chips::lookup(signature).ok_or(FlashError::UnknownChip(signature))?;
        info!("Detected {} (signature {:02x?})", chip.name, signature);

        self.enter_prog_mode()?;
        self.chip_erase()?;

        info!("Flashing {} bytes", image.len());
        self.write_flash(chip, image, progress)?;
        if self.verify {
            info!("Verifying {} bytes", image.len());
            self.verify_flash(chip, image, progress)?;
        }

        self.leave_prog_mode()?;
        Ok(())
    }

    fn read_signature(&mut self) -> FlashResult<[u8; 3]> {
        let mut signature = [0u8; 3];
        for (i, byte) in signature.iter_mut().enumerate() {
            *byte = self.send_isp([0x30, 0x00, i as u8, 0x00])?[3];
        }
        Ok(signature)
    }

    fn enter_prog_mode(&mut self) -> FlashResult<()> {
        let recv = self.send_message(&[
            Stk500v2Message::CmdEnterProgmodeIsp as u8,
            0xC8,
            0x64,
            0x19,
            0x20,
            0x00,
            0x53,
            0x03,
            0xAC,
            0x53,
            0x00,
            0x00,
        ])?;
        if recv != [Stk500v2Message::CmdEnterProgmodeIsp as u8, Stk500v2Message::StatusCmdOk as u8] {
            return Err(FlashError::Protocol(
                "Failed to enter programming mode".to_string(),
            ));
        }
        debug!("Entered programming mode");
        Ok(())
    }

    fn leave_prog_mode(&mut self) -> FlashResult<()> {
        let recv = self.send_message(&[Stk500v2Message::CmdLeaveProgmodeIsp as u8])?;
        if recv != [Stk500v2Message::CmdLeaveProgmodeIsp as u8, Stk500v2Message::StatusCmdOk as u8] {
            return Err(FlashError::Protocol(
                "Failed to leave programming mode".to_string(),
            ));
        }
        debug!("Left programming mode");
        Ok(())
    }

    fn chip_erase(&mut self) -> FlashResult<()> {
        self.send_isp([0xAC, 0x80, 0x00, 0x00])?;
        debug!("Chip erased");
        Ok(())
    }

    /// Pass four SPI bytes through to the target and return the four
    /// bytes shifted back.
    fn send_isp(&mut self, data: [u8; 4]) -> FlashResult<[u8; 4]> {
        let recv = self.send_message(&[
            Stk500v2Message::CmdSpiMulti as u8,
            4,
            4,
            0,
            data[0],
            data[1],
            data[2],
            data[3],
        ])?;
        if recv.len() < 6 {
            return Err(FlashError::Protocol(format!(
                "Short SPI reply: {:02x?}",
                recv
            )));
        }
        Ok([recv[2], recv[3], recv[4], recv[5]])
    }

    /// Point the load address at flash offset 0, enabling the address
    /// extension bit for parts larger than 64k.
    fn load_address_zero(&mut self, chip: &ChipProfile) -> FlashResult<()> {
        let payload: [u8; 5] = if chip.flash_bytes() > 0xFFFF {
            [Stk500v2Message::CmdLoadAddress as u8, 0x80, 0x00, 0x00, 0x00]
        } else {
            [Stk500v2Message::CmdLoadAddress as u8, 0x00, 0x00, 0x00, 0x00]
        };
        self.send_message(&payload)?;
        Ok(())
    }

    fn write_flash(
        &mut self,
        chip: &ChipProfile,
        image: &[u8],
        progress: &mut dyn FnMut(u32, u32),
    ) -> FlashResult<()> {
        let page_bytes = chip.page_bytes();
        let write_pages = image.len().div_ceil(page_bytes);
        let total = (write_pages + self.verify_pages(image)) as u32;

        self.load_address_zero(chip)?;
        for (i, page) in image.chunks(page_bytes).enumerate() {
            self.cancel.check()?;
            let mut payload = vec![
                Stk500v2Message::CmdProgramFlashIsp as u8,
                (page_bytes >> 8) as u8,
                (page_bytes & 0xFF) as u8,
                0xC1,
                0x0A,
                0x40,
                0x4C,
                0x20,
                0x00,
                0x00,
            ];
            payload.extend_from_slice(page);
            self.send_message(&payload)?;
            progress((i + 1) as u32, total);
        }
        Ok(())
    }

    fn verify_pages(&self, image: &[u8]) -> usize {
        if self.verify {
            image.len().div_ceil(VERIFY_BLOCK)
        } else {
            0
        }
    }

    fn verify_flash(
        &mut self,
        chip: &ChipProfile,
        image: &[u8],
        progress: &mut dyn FnMut(u32, u32),
    ) -> FlashResult<()> {
        let write_pages = image.len().div_ceil(chip.page_bytes());
        let verify_pages = image.len().div_ceil(VERIFY_BLOCK);
        let total = (write_pages + verify_pages) as u32;

        self.load_address_zero(chip)?;
        for i in 0..verify_pages {
            self.cancel.check()?;
            let recv = self.send_message(&[
                Stk500v2Message::CmdReadFlashIsp as u8,
                0x01,
                0x00,
                0x20,
            ])?;
            if recv.len() < 2 + VERIFY_BLOCK {
                return Err(FlashError::Protocol(format!(
                    "Short read flash reply of {} bytes",
                    recv.len()
                )));
            }
            let block = &recv[2..2 + VERIFY_BLOCK];
            for j in 0..VERIFY_BLOCK {
                let offset = i * VERIFY_BLOCK + j;
                if offset < image.len() && image[offset] != block[j] {
                    return Err(FlashError::Verify(offset));
                }
            }
            progress((write_pages + i + 1) as u32, total);
        }
        Ok(())
    }

    /// Frame a payload, send it and collect the framed reply.
    fn send_message(&mut self, payload: &[u8]) -> FlashResult<Vec<u8>> {
        self.cancel.check()?;
        let message = self.framer.frame(payload);
        self.link.send(&message)?;
        self.recv_message()
    }

    fn recv_message(&mut self) -> FlashResult<Vec<u8>> {
        let mut receiver = Receiver::new();
        let mut buf = [0u8; 256];
        let mut timeout = RESPONSE_TIMEOUT;
        let mut stage = "response";
        loop {
            let n = self.link.recv(&mut buf, timeout)?;
            if n == 0 {
                return Err(FlashError::Transport(TransportError::Timeout(stage)));
            }
            for &byte in &buf[..n] {
                if let Some(payload) = receiver.push(byte) {
                    return Ok(payload);
                }
            }
            timeout = READ_TIMEOUT;
            stage = "read";
        }
    }

    /// Pulse DTR so the application firmware restarts.
    fn fast_reset(&mut self) -> Result<(), TransportError> {
        thread::sleep(Duration::from_millis(50));
        self.link.set_dtr(true)?;
        self.link.set_dtr(false)?;
        Ok(())
    }
}

impl Drop for Stk500v2 {
    fn drop(&mut self) {
        let _ = self.fast_reset();
    }
}
