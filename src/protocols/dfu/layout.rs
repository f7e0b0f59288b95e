//! Decoding of the DFU bootloader's memory layout descriptor.
//!
//! STM32 bootloaders publish their flash geometry as the DFU interface
//! string, e.g. `@Internal Flash/0x08000000/04*016Kg,01*064Kg,07*128Kg`:
//! groups of a base address followed by comma-separated `<pages>*<size>`
//! segments with an optional K/M multiplier and a trailing attribute
//! byte. Segments in one group are laid out contiguously from the base.

use tracing::debug;

use crate::error::{FlashError, FlashResult};
use crate::transport::DfuBus;

/// One run of equally-sized erase pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySegment {
    pub start: u32,
    pub last: u32,
    pub size: u32,
    pub pages: u32,
    pub page_size: u32,
}

impl MemorySegment {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr <= self.last
    }
}

/// Fetch and decode the device's memory layout.
pub fn read(bus: &mut dyn DfuBus) -> FlashResult<Vec<MemorySegment>> {
    let descriptor = bus.memory_layout()?;
    debug!("Memory layout descriptor: {:?}", descriptor);
    parse(&descriptor)
}

/// Decode a layout descriptor string into erase-page segments, sorted
/// ascending and non-overlapping.
pub fn parse(descriptor: &str) -> FlashResult<Vec<MemorySegment>> {
    let parts: Vec<&str> = descriptor.split('/').collect();
    let mut segments = Vec::new();

    let mut index = 1;
    while index + 1 < parts.len() {
        let mut addr = parse_address(parts[index])?;
        for token in parts[index + 1].split(',') {
            let (pages, page_size) = parse_segment(token)?;
            let size = pages
                .checked_mul(page_size)
                .ok_or_else(|| malformed(token))?;
            segments.push(MemorySegment {
                start: addr,
                last: addr + size - 1,
                size,
                pages,
                page_size,
            });
            addr += size;
        }
        index += 2;
    }

    if segments.is_empty() {
        return Err(FlashError::Protocol(format!(
            "Memory layout descriptor {:?} holds no segments",
            descriptor
        )));
    }
    Ok(segments)
}

fn malformed(token: &str) -> FlashError {
    FlashError::Protocol(format!("Malformed memory layout segment {:?}", token))
}

fn parse_address(token: &str) -> FlashResult<u32> {
    let digits = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X"));
    match digits {
        Some(digits) => u32::from_str_radix(digits, 16),
        None => token.parse(),
    }
    .map_err(|_| FlashError::Protocol(format!("Malformed memory layout address {:?}", token)))
}

/// Parse one `<pages>*<size><multiplier><attr>` token.
fn parse_segment(token: &str) -> FlashResult<(u32, u32)> {
    let (count, rest) = token.split_once('*').ok_or_else(|| malformed(token))?;
    let pages: u32 = count.parse().map_err(|_| malformed(token))?;

    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let mut page_size: u32 = rest[..digits_end]
        .parse()
        .map_err(|_| malformed(token))?;
    match rest[digits_end..].chars().next() {
        Some('K') => page_size *= 1024,
        Some('M') => page_size *= 1024 * 1024,
        _ => {}
    }

    if pages == 0 || page_size == 0 {
        return Err(malformed(token));
    }
    Ok((pages, page_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stm32f4_layout() {
        let segments =
            parse("@Internal Flash/0x08000000/04*016Kg,01*064Kg,07*128Kg").unwrap();
        assert_eq!(
            segments,
            vec![
                MemorySegment {
                    start: 0x0800_0000,
                    last: 0x0800_FFFF,
                    size: 64 * 1024,
                    pages: 4,
                    page_size: 16 * 1024,
                },
                MemorySegment {
                    start: 0x0801_0000,
                    last: 0x0801_FFFF,
                    size: 64 * 1024,
                    pages: 1,
                    page_size: 64 * 1024,
                },
                MemorySegment {
                    start: 0x0802_0000,
                    last: 0x080F_FFFF,
                    size: 896 * 1024,
                    pages: 7,
                    page_size: 128 * 1024,
                },
            ]
        );
    }

    #[test]
    fn segments_tile_the_flash_range() {
        let segments = parse("@Flash/0x08000000/04*016Kg,01*064Kg").unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].start, segments[0].last + 1);
        assert!(segments[0].contains(0x0800_0000));
        assert!(segments[0].contains(segments[0].last));
        assert!(!segments[1].contains(segments[0].last));
    }

    #[test]
    fn parses_multiple_address_groups() {
        let segments =
            parse("@Internal Flash/0x08000000/02*016Kg/0x1FFF0000/01*032Kg").unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].start, 0x1FFF_0000);
        assert_eq!(segments[1].size, 32 * 1024);
    }

    #[test]
    fn megabyte_multiplier_and_plain_sizes() {
        let segments = parse("@RAM/0x20000000/01*001Mg,02*512 g").unwrap();
        assert_eq!(segments[0].size, 1024 * 1024);
        assert_eq!(segments[1].page_size, 512);
        assert_eq!(segments[1].size, 1024);
    }

    #[test]
    fn malformed_segment_token_is_rejected() {
        assert!(parse("@Flash/0x08000000/nonsense").is_err());
        assert!(parse("@Flash/0x08000000/4x016Kg").is_err());
        assert!(parse("@Flash/not-an-address/04*016Kg").is_err());
        assert!(parse("@Flash").is_err());
    }
}
