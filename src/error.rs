use thiserror::Error;

/// Bootloader protocol errors, generic over the serial port error type
#[derive(Clone, PartialEq, Debug, Error)]
pub enum Error<SerialError> {
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    /// No (or not enough) bytes arrived before the response timeout
    #[error("timeout waiting for bootloader ({context})")]
    Timeout { context: &'static str },

    /// Neither ACK nor NACK after all synchronization attempts
    #[error("bootloader did not answer synchronization after {attempts} attempts")]
    SyncTimeout { attempts: u32 },

    #[error("NACK received: {context}")]
    Nack { context: &'static str },

    #[error("unexpected reply 0x{byte:02X}: {context}")]
    UnexpectedReply { byte: u8, context: &'static str },

    /// The command frame itself was refused
    #[error("{description} (0x{command:02X}) failed: no ack")]
    CommandRejected {
        command: u8,
        description: &'static str,
    },

    #[error("can not transfer {requested} bytes at once, maximum is {max}")]
    LengthExceeded { requested: usize, max: usize },

    #[error("can not erase more than {max} pages at once ({count} given)")]
    PageCountExceeded { count: usize, max: usize },

    #[error("page index {page} does not fit a one-byte page command")]
    PageIndexOutOfRange { page: u16 },

    #[error("no pages given")]
    EmptyPageSet,

    /// Range erase needs the page layout of a known family
    #[error("page size unknown, select a device family to erase a range")]
    UnknownPageSize,

    #[error("{0}")]
    Range(RangeError),

    /// An identification register lies outside the block read for it
    #[error("register 0x{address:08X} is not covered by the identification block")]
    RegisterOutsideBlock { address: u32 },
}

/// Address ranges that can not be mapped onto flash pages
#[derive(Clone, PartialEq, Debug, Error)]
pub enum RangeError {
    #[error("address 0x{address:08X} is below the flash base 0x{flash_base:08X}")]
    BelowFlash { address: u32, flash_base: u32 },

    #[error("{length} bytes at 0x{address:08X} overflow the address space")]
    LengthOverflow { address: u32, length: usize },

    #[error("flash offset 0x{offset:X} is past the last sector")]
    BeyondFlash { offset: u32 },

    #[error("page {page} does not fit a 16-bit page index")]
    PageOverflow { page: u32 },
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

/// Verification failures, reported by [`crate::transfer::verify`]
#[derive(Clone, PartialEq, Debug, Error)]
pub enum DataMismatchError {
    #[error("data length does not match: {got} vs {expected} bytes")]
    LengthMismatch { got: usize, expected: usize },

    #[error(
        "verification data does not match read data, first mismatch at 0x{offset:X}: 0x{got:X} vs 0x{expected:X}"
    )]
    ByteMismatch { offset: usize, expected: u8, got: u8 },
}
