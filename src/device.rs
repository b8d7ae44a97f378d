//! Device family memory maps: unique ID, flash size and page geometry.

use std::convert::TryFrom;

use embedded_hal::blocking::delay::DelayMs;

use crate::error::{Error, RangeError};
use crate::protocol::MAX_CHUNK;
use crate::{Programmer, SerialPort};

/// Length of the unique device ID register
pub const UID_LEN: usize = 12;

/// Byte groups of the UID as presented to users, little-endian words swapped
pub const UID_SWAP: [&[usize]; 4] = [&[1, 0], &[3, 2], &[7, 6, 5, 4], &[11, 10, 9, 8]];

/// How the identification registers can be read
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ReadStrategy {
    /// Read each register on its own
    DirectRegisterRead,
    /// Read the aligned block containing both registers and slice them out
    BlockRead,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFamily {
    pub name: &'static str,
    /// Unique device ID register, `None` where the part has none
    pub uid_address: Option<u32>,
    /// Flash size register (KiB, 16-bit little-endian)
    pub flash_size_address: u32,
    pub max_transfer_size: usize,
    /// Erase unit for uniformly paged flash, the smallest sector otherwise
    pub flash_page_size: u32,
    /// Sector sizes from the flash base, empty for uniformly paged flash
    pub sectors: &'static [u32],
    pub read_strategy: ReadStrategy,
}

const KIB: u32 = 1024;

/// RM0090, single-bank 1 MiB parts
const F4_SECTORS: &[u32] = &[
    16 * KIB,
    16 * KIB,
    16 * KIB,
    16 * KIB,
    64 * KIB,
    128 * KIB,
    128 * KIB,
    128 * KIB,
    128 * KIB,
    128 * KIB,
    128 * KIB,
    128 * KIB,
];

/// RM0385, 1 MiB parts
const F7_SECTORS: &[u32] = &[
    32 * KIB,
    32 * KIB,
    32 * KIB,
    32 * KIB,
    128 * KIB,
    256 * KIB,
    256 * KIB,
    256 * KIB,
];

use ReadStrategy::*;

/// Known families, see the respective reference manuals' device electronic signature chapters
pub const FAMILIES: &[DeviceFamily] = &[
    // RM0091 has no UID on the F030 line
    DeviceFamily {
        name: "F0",
        uid_address: None,
        flash_size_address: 0x1FFF_F7CC,
        max_transfer_size: MAX_CHUNK,
        flash_page_size: 1024,
        sectors: &[],
        read_strategy: DirectRegisterRead,
    },
    // RM0008 section 30
    DeviceFamily {
        name: "F1",
        uid_address: Some(0x1FFF_F7E8),
        flash_size_address: 0x1FFF_F7E0,
        max_transfer_size: MAX_CHUNK,
        flash_page_size: 1024,
        sectors: &[],
        read_strategy: DirectRegisterRead,
    },
    DeviceFamily {
        name: "F3",
        uid_address: Some(0x1FFF_F7AC),
        flash_size_address: 0x1FFF_F7CC,
        max_transfer_size: MAX_CHUNK,
        flash_page_size: 2048,
        sectors: &[],
        read_strategy: DirectRegisterRead,
    },
    // RM0090 section 39, registers are not readable in isolation
    DeviceFamily {
        name: "F4",
        uid_address: Some(0x1FFF_7A10),
        flash_size_address: 0x1FFF_7A22,
        max_transfer_size: MAX_CHUNK,
        flash_page_size: 16 * KIB,
        sectors: F4_SECTORS,
        read_strategy: BlockRead,
    },
    // RM0385 section 41
    DeviceFamily {
        name: "F7",
        uid_address: Some(0x1FF0_F420),
        flash_size_address: 0x1FF0_F442,
        max_transfer_size: MAX_CHUNK,
        flash_page_size: 32 * KIB,
        sectors: F7_SECTORS,
        read_strategy: DirectRegisterRead,
    },
    DeviceFamily {
        name: "G0",
        uid_address: Some(0x1FFF_7590),
        flash_size_address: 0x1FFF_75E0,
        max_transfer_size: MAX_CHUNK,
        flash_page_size: 2048,
        sectors: &[],
        read_strategy: DirectRegisterRead,
    },
    // RM0367, bootloader limits transfers to 128 bytes
    DeviceFamily {
        name: "L0",
        uid_address: Some(0x1FF8_0050),
        flash_size_address: 0x1FF8_007C,
        max_transfer_size: 128,
        flash_page_size: 128,
        sectors: &[],
        read_strategy: BlockRead,
    },
    DeviceFamily {
        name: "L1",
        uid_address: Some(0x1FF8_0050),
        flash_size_address: 0x1FF8_004C,
        max_transfer_size: MAX_CHUNK,
        flash_page_size: 256,
        sectors: &[],
        read_strategy: DirectRegisterRead,
    },
    DeviceFamily {
        name: "L4",
        uid_address: Some(0x1FFF_7590),
        flash_size_address: 0x1FFF_75E0,
        max_transfer_size: MAX_CHUNK,
        flash_page_size: 2048,
        sectors: &[],
        read_strategy: DirectRegisterRead,
    },
];

impl DeviceFamily {
    /// Find a family by tag, e.g. "F1"
    pub fn lookup(name: &str) -> Option<&'static DeviceFamily> {
        FAMILIES.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// 256-byte aligned start of the block holding the identification registers
    pub fn block_address(&self) -> u32 {
        self.uid_address.unwrap_or(self.flash_size_address) & !0xFF
    }

    /// Indices of the pages (or sectors) covering `length` bytes at `address`
    ///
    /// Fails rather than guessing when the range starts below `flash_base`,
    /// runs past the sector map, or needs page indices wider than 16 bits.
    pub fn pages_for_range(
        &self,
        flash_base: u32,
        address: u32,
        length: usize,
    ) -> Result<Vec<u16>, RangeError> {
        if length == 0 {
            return Ok(Vec::new());
        }

        let offset = address
            .checked_sub(flash_base)
            .ok_or(RangeError::BelowFlash {
                address,
                flash_base,
            })?;
        let end = u32::try_from(length - 1)
            .ok()
            .and_then(|n| offset.checked_add(n))
            .ok_or(RangeError::LengthOverflow { address, length })?;

        let (first, last) = if self.sectors.is_empty() {
            (offset / self.flash_page_size, end / self.flash_page_size)
        } else {
            (self.sector_index(offset)?, self.sector_index(end)?)
        };

        (first..=last)
            .map(|p| u16::try_from(p).map_err(|_| RangeError::PageOverflow { page: p }))
            .collect()
    }

    fn sector_index(&self, offset: u32) -> Result<u32, RangeError> {
        let mut end = 0u32;
        for (i, size) in self.sectors.iter().enumerate() {
            end = end.saturating_add(*size);
            if offset < end {
                return Ok(i as u32);
            }
        }
        Err(RangeError::BeyondFlash { offset })
    }
}

/// Outcome of a unique ID lookup
#[derive(Debug, Clone, PartialEq)]
pub enum UidLookup {
    Value([u8; UID_LEN]),
    /// The family has no unique ID register
    NotSupported,
    /// The family is not in the catalog
    AddressUnknown,
}

/// Readable UID string, e.g. `3412-7856-01DEBC9A-78563412`
pub fn format_uid(uid: &UidLookup) -> String {
    let uid = match uid {
        UidLookup::Value(v) => v,
        UidLookup::NotSupported => return "UID not supported in this part".to_string(),
        UidLookup::AddressUnknown => return "UID address unknown".to_string(),
    };

    UID_SWAP
        .iter()
        .map(|part| {
            let bytes: Vec<u8> = part.iter().map(|&i| uid[i]).collect();
            hex::encode_upper(bytes)
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Product line for a GET_ID value (AN2606 bootloader device-dependent parameters)
pub fn chip_name(id: u32) -> Option<&'static str> {
    let name = match id {
        0x412 => "STM32F10x Low-density",
        0x410 => "STM32F10x Medium-density",
        0x420 => "STM32F10x Medium-density value line",
        0x414 => "STM32F10x High-density",
        0x428 => "STM32F10x High-density value line",
        0x430 => "STM3210xx XL-density",
        0x416 => "STM32L1xxx6(8/B) Medium-density ultralow power line",
        0x417 => "STM32L05xxx/06xxx",
        0x411 => "STM32F2xxx",
        0x413 => "STM32F40xxx/41xxx",
        0x419 => "STM32F42xxx/43xxx",
        0x440 => "STM32F05xxx/F030x8",
        0x422 => "STM32F30xxB/C",
        0x415 => "STM32L47xxx/48xxx",
        0x460 => "STM32G07xxx/08xxx",
        0x449 => "STM32F74xxx/75xxx",
        0x451 => "STM32F76xxx/77xxx",
        // AN4872, requires parity none
        0x11103 => "BlueNRG",
        // SweetPeas custom bootloader
        0x801 => "Wiznet W7500",
        _ => return None,
    };
    Some(name)
}

fn slice_uid(block: &[u8], offset: usize) -> Option<[u8; UID_LEN]> {
    let mut uid = [0u8; UID_LEN];
    uid.copy_from_slice(block.get(offset..offset + UID_LEN)?);
    Some(uid)
}

fn slice_flash_size(block: &[u8], offset: usize) -> Option<u16> {
    let b = block.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Read the unique device ID of the configured family
    pub fn get_uid(&mut self) -> Result<UidLookup, Error<E>> {
        let family = match self.family() {
            Some(f) => f,
            None => return Ok(UidLookup::AddressUnknown),
        };
        let address = match family.uid_address {
            Some(a) => a,
            None => return Ok(UidLookup::NotSupported),
        };

        let uid = match family.read_strategy {
            DirectRegisterRead => {
                let data = self.read_memory(address, UID_LEN)?;
                slice_uid(&data, 0)
            }
            BlockRead => {
                let block = self.read_id_block(family)?;
                slice_uid(&block, (address - family.block_address()) as usize)
            }
        };

        uid.map(UidLookup::Value)
            .ok_or(Error::RegisterOutsideBlock { address })
    }

    /// Read the flash size in KiB, `None` if the family is unknown
    pub fn get_flash_size(&mut self) -> Result<Option<u16>, Error<E>> {
        let family = match self.family() {
            Some(f) => f,
            None => return Ok(None),
        };

        let size = match family.read_strategy {
            DirectRegisterRead => {
                let data = self.read_memory(family.flash_size_address, 2)?;
                slice_flash_size(&data, 0)
            }
            BlockRead => {
                let block = self.read_id_block(family)?;
                slice_flash_size(
                    &block,
                    (family.flash_size_address - family.block_address()) as usize,
                )
            }
        };

        size.map(Some).ok_or(Error::RegisterOutsideBlock {
            address: family.flash_size_address,
        })
    }

    /// Flash size (KiB) and unique ID, with a single read on block-read families
    pub fn get_flash_size_and_uid(&mut self) -> Result<(Option<u16>, UidLookup), Error<E>> {
        let family = match self.family() {
            Some(f) => f,
            None => return Ok((None, UidLookup::AddressUnknown)),
        };

        if family.read_strategy == DirectRegisterRead {
            let size = self.get_flash_size()?;
            let uid = self.get_uid()?;
            return Ok((size, uid));
        }

        let block = self.read_id_block(family)?;
        let base = family.block_address();

        let size = slice_flash_size(&block, (family.flash_size_address - base) as usize).ok_or(
            Error::RegisterOutsideBlock {
                address: family.flash_size_address,
            },
        )?;
        let uid = match family.uid_address {
            None => UidLookup::NotSupported,
            Some(a) => slice_uid(&block, (a - base) as usize)
                .map(UidLookup::Value)
                .ok_or(Error::RegisterOutsideBlock { address: a })?,
        };

        Ok((Some(size), uid))
    }

    fn read_id_block(&mut self, family: &DeviceFamily) -> Result<Vec<u8>, Error<E>> {
        let address = family.block_address();
        debug!(
            "Reading {} family identification block at 0x{:08X}",
            family.name, address
        );
        self.read_memory(address, family.max_transfer_size)
    }
}
