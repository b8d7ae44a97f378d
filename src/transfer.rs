//! Chunked transfers on top of the single-transaction memory commands.

use embedded_hal::blocking::delay::DelayMs;

use crate::error::{DataMismatchError, Error};
use crate::{Programmer, SerialPort};

/// Default base of main flash on STM32 parts
pub const FLASH_BASE: u32 = 0x0800_0000;

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Read `length` bytes from `address`, in transfer-sized chunks
    pub fn read_range(&mut self, address: u32, length: usize) -> Result<Vec<u8>, Error<E>> {
        let chunk = self.max_transfer_size();
        let total = chunks(length, chunk);
        info!("Read {} chunks at address 0x{:08X}", total, address);

        let mut data = Vec::with_capacity(length);
        let mut address = address;
        let mut remaining = length;
        let mut current = 0;

        while remaining > 0 {
            let n = remaining.min(chunk);
            debug!("Read {} bytes at 0x{:08X}", n, address);

            data.extend(self.read_memory(address, n)?);

            current += 1;
            (self.progress)(current, total);

            remaining -= n;
            address = address.wrapping_add(n as u32);
        }

        Ok(data)
    }

    /// Write `data` to `address`, in transfer-sized chunks
    pub fn write_range(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        let chunk = self.max_transfer_size();
        let total = chunks(data.len(), chunk);
        info!("Write {} chunks at address 0x{:08X}", total, address);

        let mut address = address;
        for (i, block) in data.chunks(chunk).enumerate() {
            debug!("Write {} bytes at 0x{:08X}", block.len(), address);

            self.write_memory(address, block)?;
            (self.progress)(i + 1, total);

            address = address.wrapping_add(block.len() as u32);
        }

        Ok(())
    }

    /// Erase the pages covering `length` bytes at `address`
    ///
    /// Requires a known device family for its page layout. Nothing is sent
    /// when the range can not be mapped onto pages.
    pub fn erase_range(&mut self, address: u32, length: usize) -> Result<(), Error<E>> {
        let family = self.family().ok_or(Error::UnknownPageSize)?;

        let pages = family
            .pages_for_range(FLASH_BASE, address, length)
            .map_err(Error::Range)?;
        if pages.is_empty() {
            return Ok(());
        }
        info!(
            "Erasing {} {} pages {}..={}",
            pages.len(),
            family.name,
            pages[0],
            pages[pages.len() - 1]
        );

        if self.supports_extended_erase() {
            self.extended_erase_memory(Some(&pages[..]))
        } else {
            self.erase_memory(Some(&pages[..]))
        }
    }
}

fn chunks(length: usize, chunk: usize) -> usize {
    (length + chunk - 1) / chunk
}

/// Compare data read back from the device against the reference image
///
/// Reports the first differing byte only.
pub fn verify(read_data: &[u8], reference_data: &[u8]) -> Result<(), DataMismatchError> {
    if read_data.len() != reference_data.len() {
        return Err(DataMismatchError::LengthMismatch {
            got: read_data.len(),
            expected: reference_data.len(),
        });
    }

    match read_data
        .iter()
        .zip(reference_data)
        .position(|(got, expected)| got != expected)
    {
        Some(offset) => Err(DataMismatchError::ByteMismatch {
            offset,
            expected: reference_data[offset],
            got: read_data[offset],
        }),
        None => Ok(()),
    }
}
