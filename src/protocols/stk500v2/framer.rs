//! STK500v2 wire framing.
//!
//! A message is `0x1B | seq | size (u16 BE) | 0x0E | payload | checksum`,
//! where the checksum is the XOR of every preceding byte. The receiver is
//! a byte-at-a-time state machine kept free of I/O so it can be driven
//! directly against byte sequences.

/// Start-of-message byte.
pub const MESSAGE_START: u8 = 0x1B;
/// Token byte separating the header from the payload.
pub const TOKEN: u8 = 0x0E;

/// Owns the session's wrapping sequence counter and encodes outgoing
/// frames. The counter starts at 1 on session entry and wraps modulo 256;
/// replies are matched by content, not by sequence number.
#[derive(Debug)]
pub struct Framer {
    seq: u8,
}

impl Framer {
    pub fn new() -> Self {
        Framer { seq: 1 }
    }

    /// Frame a payload, advancing the sequence counter.
    pub fn frame(&mut self, payload: &[u8]) -> Vec<u8> {
        debug_assert!(payload.len() <= u16::MAX as usize);
        let mut message = Vec::with_capacity(payload.len() + 6);
        message.push(MESSAGE_START);
        message.push(self.seq);
        message.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        message.push(TOKEN);
        message.extend_from_slice(payload);
        let checksum = message.iter().fold(0u8, |acc, &b| acc ^ b);
        message.push(checksum);

        self.seq = self.seq.wrapping_add(1);
        message
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Start,
    Seq,
    SizeHigh,
    SizeLow,
    Token,
    Data,
    Checksum,
}

/// Incremental frame decoder. Feed bytes with [`Receiver::push`]; a
/// completed payload is returned once the checksum verifies. A wrong
/// token or checksum resets the machine to scanning for the next start
/// byte instead of failing, so the receiver resynchronizes after noise.
#[derive(Debug)]
pub struct Receiver {
    state: RxState,
    checksum: u8,
    size: usize,
    payload: Vec<u8>,
}

impl Receiver {
    pub fn new() -> Self {
        Receiver {
            state: RxState::Start,
            checksum: 0,
            size: 0,
            payload: Vec::new(),
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        self.checksum ^= byte;
        match self.state {
            RxState::Start => {
                if byte == MESSAGE_START {
                    self.checksum = MESSAGE_START;
                    self.state = RxState::Seq;
                }
            }
            RxState::Seq => {
                self.state = RxState::SizeHigh;
            }
            RxState::SizeHigh => {
                self.size = (byte as usize) << 8;
                self.state = RxState::SizeLow;
            }
            RxState::SizeLow => {
                self.size |= byte as usize;
                self.state = RxState::Token;
            }
            RxState::Token => {
                if byte != TOKEN {
                    self.state = RxState::Start;
                } else {
                    self.payload = Vec::with_capacity(self.size);
                    self.state = if self.size == 0 {
                        RxState::Checksum
                    } else {
                        RxState::Data
                    };
                }
            }
            RxState::Data => {
                self.payload.push(byte);
                if self.payload.len() == self.size {
                    self.state = RxState::Checksum;
                }
            }
            RxState::Checksum => {
                self.state = RxState::Start;
                if self.checksum == 0 {
                    return Some(std::mem::take(&mut self.payload));
                }
            }
        }
        None
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(receiver: &mut Receiver, bytes: &[u8]) -> Option<Vec<u8>> {
        bytes.iter().find_map(|&b| receiver.push(b))
    }

    #[test]
    fn frames_sign_on_request() {
        let mut framer = Framer::new();
        assert_eq!(
            framer.frame(&[0x01]),
            vec![0x1B, 0x01, 0x00, 0x01, 0x0E, 0x01, 0x14]
        );
    }

    #[test]
    fn sequence_advances_and_wraps() {
        let mut framer = Framer::new();
        for _ in 0..254 {
            framer.frame(&[0x00]);
        }
        assert_eq!(framer.frame(&[0x00])[1], 0xFF);
        assert_eq!(framer.frame(&[0x00])[1], 0x00);
        assert_eq!(framer.frame(&[0x00])[1], 0x01);
    }

    #[test]
    fn receiver_decodes_a_framed_message() {
        let frame = Framer::new().frame(&[0x10, 0x00]);
        let mut receiver = Receiver::new();
        assert_eq!(feed(&mut receiver, &frame), Some(vec![0x10, 0x00]));
    }

    #[test]
    fn receiver_skips_leading_garbage() {
        let mut bytes = vec![0x00, 0xFF, 0x42, 0x0E];
        bytes.extend(Framer::new().frame(&[0x11, 0x00]));
        let mut receiver = Receiver::new();
        assert_eq!(feed(&mut receiver, &bytes), Some(vec![0x11, 0x00]));
    }

    #[test]
    fn receiver_resynchronizes_after_checksum_mismatch() {
        let mut corrupted = Framer::new().frame(&[0x10, 0x00]);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x5A;

        let mut receiver = Receiver::new();
        assert_eq!(feed(&mut receiver, &corrupted), None);

        let good = Framer::new().frame(&[0x10, 0x00]);
        assert_eq!(feed(&mut receiver, &good), Some(vec![0x10, 0x00]));
    }

    #[test]
    fn receiver_resynchronizes_after_bad_token() {
        // Valid header up to the token position, then a wrong token byte.
        let mut receiver = Receiver::new();
        assert_eq!(feed(&mut receiver, &[0x1B, 0x01, 0x00, 0x01, 0x55]), None);

        let good = Framer::new().frame(&[0x01]);
        assert_eq!(feed(&mut receiver, &good), Some(vec![0x01]));
    }

    #[test]
    fn receiver_handles_large_payload_length() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(512).collect();
        let frame = Framer::new().frame(&payload);
        let mut receiver = Receiver::new();
        assert_eq!(feed(&mut receiver, &frame), Some(payload));
    }
}
