//! Database of AVR chips supported by the STK500v2 engine. Signatures and
//! flash geometry are taken from the AVR datasheets. To support more chips
//! add the relevant data to [`AVR_CHIPS`].

/// Flash geometry for one AVR part. `page_size` is in words; the wire
/// protocol works in bytes, so a page occupies `page_size * 2` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipProfile {
    pub name: &'static str,
    pub signature: [u8; 3],
    pub page_size: u32,
    pub page_count: u32,
}

impl ChipProfile {
    /// Page size in bytes as sent on the wire.
    pub fn page_bytes(&self) -> usize {
        self.page_size as usize * 2
    }

    /// Total flash size in bytes.
    pub fn flash_bytes(&self) -> usize {
        self.page_bytes() * self.page_count as usize
    }
}

pub const AVR_CHIPS: &[ChipProfile] = &[
    ChipProfile {
        name: "ATMega1280",
        signature: [0x1E, 0x97, 0x03],
        page_size: 128,
        page_count: 512,
    },
    ChipProfile {
        name: "ATMega2560",
        signature: [0x1E, 0x98, 0x01],
        page_size: 128,
        page_count: 1024,
    },
];

/// Exact-match signature lookup. A miss is a normal negative outcome
/// (unrecognized chip), not a defect.
pub fn lookup(signature: [u8; 3]) -> Option<&'static ChipProfile> {
    AVR_CHIPS.iter().find(|chip| chip.signature == signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_atmega2560_by_signature() {
        let chip = lookup([0x1E, 0x98, 0x01]).unwrap();
        assert_eq!(chip.name, "ATMega2560");
        assert_eq!(chip.page_bytes(), 256);
        assert_eq!(chip.flash_bytes(), 256 * 1024);
    }

    #[test]
    fn unknown_signature_returns_none() {
        assert!(lookup([0x00, 0x00, 0x00]).is_none());
        assert!(lookup([0x1E, 0x98, 0x02]).is_none());
        assert!(lookup([0xFF, 0xFF, 0xFF]).is_none());
    }
}
