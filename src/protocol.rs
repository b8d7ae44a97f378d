//! Wire-level constants and frame encoding for the STM32 UART bootloader.
//!
//! See ST AN3155 (USART) and AN4872 (BlueNRG) for the byte layouts.

/// Synchronization / autobaud character, sent on its own without a control byte
pub const UART_SYNC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Hardware limit on a single READ_MEMORY / WRITE_MEMORY transaction
pub const MAX_CHUNK: usize = 256;

/// Page limit for the one-byte ERASE command
pub const MAX_ERASE_PAGES: usize = 255;

/// Page limit for the two-byte EXTENDED_ERASE command
pub const MAX_EXTENDED_ERASE_PAGES: usize = 65535;

/// Value of erased flash, used to pad writes to a word boundary
pub const ERASED_BYTE: u8 = 0xFF;

/// Global erase payload for the legacy ERASE command
pub const GLOBAL_ERASE: [u8; 2] = [0xFF, 0x00];

/// Global mass erase payload for the EXTENDED_ERASE command
pub const GLOBAL_MASS_ERASE: [u8; 3] = [0xFF, 0xFF, 0x00];

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersion = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Wakes the bootloader and lets it detect the baud rate
    Synchronize = 0x7F,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Command byte followed by its complement
    pub fn frame(self) -> [u8; 2] {
        let c = self.code();
        [c, c ^ 0xFF]
    }

    pub fn description(self) -> &'static str {
        match self {
            Command::Get => "Get",
            Command::GetVersion => "Get version",
            Command::GetId => "Get ID",
            Command::ReadMemory => "Read memory",
            Command::Go => "Go",
            Command::WriteMemory => "Write memory",
            Command::Erase => "Erase memory",
            Command::ExtendedErase => "Extended erase memory",
            Command::WriteProtect => "Write protect",
            Command::WriteUnprotect => "Write unprotect",
            Command::Synchronize => "Synchronize",
            Command::ReadoutProtect => "Readout protect",
            Command::ReadoutUnprotect => "Readout unprotect",
        }
    }
}

/// XOR of `data`, starting from `seed`
pub fn checksum(seed: u8, data: &[u8]) -> u8 {
    data.iter().fold(seed, |acc, b| acc ^ b)
}

/// Big-endian address followed by its checksum
pub fn encode_address(address: u32) -> [u8; 5] {
    let a = address.to_be_bytes();
    [a[0], a[1], a[2], a[3], checksum(0, &a)]
}

/// `N-1` length byte and its complement, as sent by READ_MEMORY
pub fn encode_length(length: usize) -> [u8; 2] {
    let n = (length.wrapping_sub(1) & 0xFF) as u8;
    [n, n ^ 0xFF]
}

/// Pad `data` to a multiple of four bytes with erased-flash filler
pub fn pad_to_word(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    let rem = padded.len() % 4;
    if rem != 0 {
        padded.resize(padded.len() + 4 - rem, ERASED_BYTE);
    }
    padded
}

/// `[N-1][data..][checksum]` block for WRITE_MEMORY; `data` must be non-empty
pub fn encode_data(data: &[u8]) -> Vec<u8> {
    let n = (data.len() - 1) as u8;

    let mut out = Vec::with_capacity(data.len() + 2);
    out.push(n);
    out.extend_from_slice(data);
    out.push(checksum(n, data));
    out
}

/// `[count-1][page..][checksum]` for ERASE and WRITE_PROTECT; `pages` must be non-empty
pub fn encode_pages(pages: &[u8]) -> Vec<u8> {
    encode_data(pages)
}

/// `[count-1 (be16)][page (be16)..][checksum]` for EXTENDED_ERASE; `pages` must be non-empty
pub fn encode_extended_pages(pages: &[u16]) -> Vec<u8> {
    let n = (pages.len() - 1) as u16;

    let mut out = Vec::with_capacity(pages.len() * 2 + 3);
    out.extend_from_slice(&n.to_be_bytes());
    for p in pages {
        out.extend_from_slice(&p.to_be_bytes());
    }
    out.push(checksum(0, &out));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_appends_complement() {
        assert_eq!(Command::Get.frame(), [0x00, 0xFF]);
        assert_eq!(Command::GetVersion.frame(), [0x01, 0xFE]);
        assert_eq!(Command::WriteMemory.frame(), [0x31, 0xCE]);
        assert_eq!(Command::ReadoutUnprotect.frame(), [0x92, 0x6D]);
    }

    #[test]
    fn address_is_big_endian_with_xor() {
        assert_eq!(encode_address(0x04030201), [0x04, 0x03, 0x02, 0x01, 0x04]);
        assert_eq!(encode_address(0x0000000F), [0x00, 0x00, 0x00, 0x0F, 0x0F]);
        assert_eq!(encode_address(0x08000000), [0x08, 0x00, 0x00, 0x00, 0x08]);

        for &address in &[0u32, 1, 0x1FFF_7A10, 0xDEAD_BEEF, u32::MAX] {
            let e = encode_address(address);
            assert_eq!(&e[..4], &address.to_be_bytes());
            assert_eq!(e[4], e[0] ^ e[1] ^ e[2] ^ e[3]);
        }
    }

    #[test]
    fn length_byte_is_complemented() {
        assert_eq!(encode_length(4), [0x03, 0xFC]);
        assert_eq!(encode_length(16), [0x0F, 0xF0]);
        assert_eq!(encode_length(256), [0xFF, 0x00]);
    }

    #[test]
    fn padding_stops_at_word_boundary() {
        assert_eq!(pad_to_word(b"1"), vec![0x31, 0xFF, 0xFF, 0xFF]);
        assert_eq!(pad_to_word(&[1, 2, 3, 4]), vec![1, 2, 3, 4]);
        assert_eq!(pad_to_word(&[1, 2, 3, 4, 5]).len(), 8);
        assert!(pad_to_word(&[]).is_empty());
    }

    #[test]
    fn data_checksum_is_seeded_with_length() {
        assert_eq!(
            encode_data(&[0x31, 0xFF, 0xFF, 0xFF]),
            vec![0x03, 0x31, 0xFF, 0xFF, 0xFF, 0xCD]
        );
    }

    #[test]
    fn page_lists() {
        assert_eq!(encode_pages(&[1, 2, 4, 8]), vec![0x03, 1, 2, 4, 8, 0x0C]);
        assert_eq!(
            encode_extended_pages(&[0x01, 0x02, 0x04, 0x0FF0]),
            vec![0x00, 0x03, 0x00, 0x01, 0x00, 0x02, 0x00, 0x04, 0x0F, 0xF0, 0xFB]
        );
    }
}
