//! STM32 Serial Bootloader.
//!
//! Host side of the factory UART bootloader, based on AN3155 (and AN4872 for BlueNRG).
//!
//! A [`Programmer`] owns one serial port for the lifetime of a bootloader session.
//! Call [`Programmer::synchronize`] (or [`Programmer::reset_from_system_memory`]) first,
//! then [`Programmer::get`] to learn the supported commands before erasing.

use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod device;
pub mod error;
pub mod protocol;
pub mod transfer;

pub use device::{chip_name, format_uid, DeviceFamily, ReadStrategy, UidLookup};
pub use error::{DataMismatchError, Error, RangeError};
pub use protocol::{Command, MAX_CHUNK, UART_ACK, UART_NACK, UART_SYNC};
pub use transfer::verify;

use protocol::{
    encode_address, encode_data, encode_extended_pages, encode_length, encode_pages, pad_to_word,
    GLOBAL_ERASE, GLOBAL_MASS_ERASE, MAX_ERASE_PAGES, MAX_EXTENDED_ERASE_PAGES,
};

/// ACK timeout while a global extended erase runs
pub const EXTENDED_ERASE_TIMEOUT_MS: u32 = 30_000;

/// Time the device needs to mass erase after readout unprotect
pub const READOUT_UNPROTECT_SETTLE_MS: u32 = 20_000;

/// Serial port with modem control lines wired to RESET and BOOT0
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// No handshake yet, or the device left the bootloader
    Disconnected,
    /// Synchronization character acknowledged
    Synchronized,
    /// At least one command has been accepted
    Active,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not toggle RESET / BOOT0 lines
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init after reset before sending the sync character
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub init_delay_ms: u32,

    /// Number of synchronization attempts before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2"))]
    pub sync_attempts: u32,

    /// Swap RTS and DTR: use RTS for reset and DTR for boot0
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub swap_rts_dtr: bool,

    /// Make reset active high
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub reset_active_high: bool,

    /// Make boot0 active low
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub boot0_active_low: bool,

    /// Device family for UID and flash size lookups, e.g. F1 for STM32F1xx
    #[cfg_attr(feature = "structopt", structopt(long, short = "f"))]
    pub family: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 5000,
            poll_delay_ms: 1,
            init_delay_ms: 500,
            sync_attempts: 2,
            swap_rts_dtr: false,
            reset_active_high: false,
            boot0_active_low: false,
            family: None,
        }
    }
}

/// Progress callback, called with `(current, total)` chunk counts
pub type Progress = Box<dyn FnMut(usize, usize)>;

/// A bootloader session over a single serial port
pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    timeout_ms: u32,
    family: Option<&'static DeviceFamily>,
    commands: Vec<u8>,
    supports_extended_erase: bool,
    progress: Progress,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        let family = options.family.as_deref().and_then(DeviceFamily::lookup);
        let timeout_ms = options.response_timeout_ms;

        Self {
            state: State::Disconnected,
            options,
            port,
            delay,
            timeout_ms,
            family,
            commands: Vec::new(),
            supports_extended_erase: false,
            progress: Box::new(|_, _| ()),
            _err: PhantomData,
        }
    }

    /// Attach a progress callback used by chunked transfers
    pub fn with_progress(mut self, progress: impl FnMut(usize, usize) + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Response timeout currently in effect
    pub fn timeout(&self) -> u32 {
        self.timeout_ms
    }

    pub fn set_timeout(&mut self, timeout_ms: u32) {
        self.timeout_ms = timeout_ms;
    }

    /// Whether GET advertised the EXTENDED_ERASE command
    pub fn supports_extended_erase(&self) -> bool {
        self.supports_extended_erase
    }

    /// Command codes advertised by the last GET
    pub fn commands(&self) -> &[u8] {
        &self.commands
    }

    /// Select the device family; unknown tags clear the profile
    pub fn set_family(&mut self, family: &str) {
        self.options.family = Some(family.to_string());
        self.family = DeviceFamily::lookup(family);
        if self.family.is_none() {
            warn!("Unknown device family '{}'", family);
        }
    }

    /// Active family profile, if the family tag is known
    pub fn family(&self) -> Option<&'static DeviceFamily> {
        self.family
    }

    /// Family tag as configured, known or not
    pub fn family_tag(&self) -> Option<&str> {
        self.options.family.as_deref()
    }

    /// Largest single READ_MEMORY / WRITE_MEMORY transfer
    pub fn max_transfer_size(&self) -> usize {
        self.family.map(|f| f.max_transfer_size).unwrap_or(MAX_CHUNK)
    }

    /// End the session and hand back the port and delay
    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Reset into system memory (BOOT0 high) and synchronize
    pub fn reset_from_system_memory(&mut self) -> Result<(), Error<E>> {
        self.enable_boot0(true)?;
        self.reset()?;
        self.synchronize()
    }

    /// Reset into user flash (BOOT0 low)
    pub fn reset_from_flash(&mut self) -> Result<(), Error<E>> {
        self.enable_boot0(false)?;
        self.reset()?;
        self.state = State::Disconnected;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), Error<E>> {
        if self.options.no_reset {
            return Ok(());
        }

        debug!("Resetting device");

        self.enable_reset(true)?;
        self.delay.delay_ms(100u32);
        self.enable_reset(false)?;
        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }

    // RS-232 modem lines are inverted, so a logical 1 drives RESET low
    fn enable_reset(&mut self, enable: bool) -> Result<(), Error<E>> {
        let level = enable != self.options.reset_active_high;

        if self.options.swap_rts_dtr {
            self.port.set_rts(level)?;
        } else {
            self.port.set_dtr(level)?;
        }
        Ok(())
    }

    fn enable_boot0(&mut self, enable: bool) -> Result<(), Error<E>> {
        if self.options.no_reset {
            return Ok(());
        }

        let level = if self.options.boot0_active_low {
            enable
        } else {
            !enable
        };

        if self.options.swap_rts_dtr {
            self.port.set_dtr(level)?;
        } else {
            self.port.set_rts(level)?;
        }
        Ok(())
    }

    /// Send the synchronization character until the bootloader answers
    ///
    /// Either ACK or NACK counts: a bootloader that was already synchronized
    /// by an earlier attempt NACKs the stray 0x7F.
    pub fn synchronize(&mut self) -> Result<(), Error<E>> {
        let attempts = self.options.sync_attempts.max(1);

        for attempt in 1..=attempts {
            if attempt > 1 {
                warn!(
                    "No response to synchronization, retrying ({}/{})",
                    attempt, attempts
                );
            }

            debug!("Sending synchronization character");
            self.write_bytes(&[UART_SYNC])?;

            match self.read_bytes(1)?.first() {
                Some(&UART_ACK) => {
                    debug!("Bootloader synchronized");
                    self.state = State::Synchronized;
                    return Ok(());
                }
                Some(&UART_NACK) => {
                    debug!("Bootloader already synchronized (nack)");
                    self.state = State::Synchronized;
                    return Ok(());
                }
                Some(v) => debug!("Unexpected synchronization reply: 0x{:02x}", v),
                None => (),
            }
        }

        error!("Bootloader did not respond to synchronization");
        Err(Error::SyncTimeout { attempts })
    }

    /// Write a command frame and wait for it to be acknowledged
    pub fn issue(&mut self, command: Command, description: &'static str) -> Result<(), Error<E>> {
        debug_assert_ne!(
            self.state,
            State::Disconnected,
            "bootloader command issued before synchronization"
        );
        debug!("Command: {} (0x{:02x})", description, command.code());

        self.write_bytes(&command.frame())?;

        match self.await_ack(description) {
            Ok(()) => {
                self.state = State::Active;
                Ok(())
            }
            Err(Error::Nack { .. }) | Err(Error::UnexpectedReply { .. }) => {
                Err(Error::CommandRejected {
                    command: command.code(),
                    description,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Read one reply byte and require an ACK
    pub fn await_ack(&mut self, context: &'static str) -> Result<(), Error<E>> {
        match self.read_bytes(1)?.first() {
            None => {
                error!("Receive timeout: {}", context);
                Err(Error::Timeout { context })
            }
            Some(&UART_ACK) => {
                trace!("Received bootloader ack");
                Ok(())
            }
            Some(&UART_NACK) => {
                debug!("Received bootloader nack: {}", context);
                Err(Error::Nack { context })
            }
            Some(&byte) => {
                debug!("Received unexpected value: 0x{:02x}", byte);
                Err(Error::UnexpectedReply { byte, context })
            }
        }
    }

    fn write_and_ack(&mut self, context: &'static str, data: &[u8]) -> Result<(), Error<E>> {
        self.write_bytes(data)?;
        self.await_ack(context)
    }

    /// Fetch the bootloader version and the supported command list
    pub fn get(&mut self) -> Result<u8, Error<E>> {
        self.issue(Command::Get, Command::Get.description())?;

        let length = self.read_exact(1, "0x00 length")?[0] as usize;
        let version = self.read_exact(1, "0x00 version")?[0];
        let commands = self.read_exact(length, "0x00 commands")?;
        self.await_ack("0x00 end")?;

        debug!("Bootloader version: 0x{:02x}", version);
        debug!("Available commands: {:02x?}", commands);

        self.supports_extended_erase = commands.contains(&Command::ExtendedErase.code());
        self.commands = commands;

        Ok(version)
    }

    /// Fetch the bootloader version, skipping the read protection option bytes
    pub fn get_version(&mut self) -> Result<u8, Error<E>> {
        self.issue(Command::GetVersion, Command::GetVersion.description())?;

        let version = self.read_exact(1, "0x01 version")?[0];
        let options = self.read_exact(2, "0x01 option bytes")?;
        self.await_ack("0x01 end")?;

        debug!(
            "Bootloader version: 0x{:02x}, option bytes: {:02x?}",
            version, options
        );

        Ok(version)
    }

    /// Fetch the chip (product) ID
    pub fn get_id(&mut self) -> Result<u32, Error<E>> {
        self.issue(Command::GetId, Command::GetId.description())?;

        let length = self.read_exact(1, "0x02 length")?[0] as usize;
        let id = self.read_exact(length + 1, "0x02 id")?;
        self.await_ack("0x02 end")?;

        Ok(id.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
    }

    /// Read up to [`Self::max_transfer_size`] bytes from `address`
    pub fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>, Error<E>> {
        let max = self.max_transfer_size();
        if length > max {
            return Err(Error::LengthExceeded {
                requested: length,
                max,
            });
        }
        if length == 0 {
            return Ok(Vec::new());
        }

        self.issue(Command::ReadMemory, Command::ReadMemory.description())?;
        self.write_and_ack("0x11 address failed", &encode_address(address))?;
        self.write_and_ack("0x11 length failed", &encode_length(length))?;

        self.read_exact(length, "0x11 data")
    }

    /// Write up to [`Self::max_transfer_size`] bytes to `address`
    ///
    /// Data is padded to a word boundary with 0xFF. Empty data sends nothing.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        if data.is_empty() {
            return Ok(());
        }

        let max = self.max_transfer_size();
        if data.len() > max {
            return Err(Error::LengthExceeded {
                requested: data.len(),
                max,
            });
        }

        self.issue(Command::WriteMemory, Command::WriteMemory.description())?;
        self.write_and_ack("0x31 address failed", &encode_address(address))?;

        let padded = pad_to_word(data);
        debug!("{} bytes to write", padded.len());

        self.write_and_ack("0x31 programming failed", &encode_data(&padded))?;
        debug!("Write memory done");

        Ok(())
    }

    /// Jump to the application at `address`; the bootloader session ends here
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        self.issue(Command::Go, Command::Go.description())?;
        self.write_and_ack("0x21 go failed", &encode_address(address))?;

        self.state = State::Disconnected;
        Ok(())
    }

    /// Erase the given pages, or everything when `pages` is `None` or empty
    ///
    /// A global erase goes through EXTENDED_ERASE when the device supports it.
    pub fn erase_memory(&mut self, pages: Option<&[u16]>) -> Result<(), Error<E>> {
        let pages = pages.filter(|p| !p.is_empty());

        if self.supports_extended_erase && pages.is_none() {
            return self.extended_erase_memory(None);
        }

        // Validate before touching the wire
        let payload = match pages {
            None => GLOBAL_ERASE.to_vec(),
            Some(pages) => {
                if pages.len() > MAX_ERASE_PAGES {
                    return Err(Error::PageCountExceeded {
                        count: pages.len(),
                        max: MAX_ERASE_PAGES,
                    });
                }
                encode_pages(&narrow_pages(pages)?)
            }
        };

        self.issue(Command::Erase, Command::Erase.description())?;
        self.write_and_ack("0x43 erase failed", &payload)?;
        debug!("Erase memory done");

        Ok(())
    }

    /// Erase the given pages with two-byte page numbers, or mass erase on `None`
    pub fn extended_erase_memory(&mut self, pages: Option<&[u16]>) -> Result<(), Error<E>> {
        let pages = pages.filter(|p| !p.is_empty());

        let payload = match pages {
            None => GLOBAL_MASS_ERASE.to_vec(),
            Some(pages) if pages.len() > MAX_EXTENDED_ERASE_PAGES => {
                return Err(Error::PageCountExceeded {
                    count: pages.len(),
                    max: MAX_EXTENDED_ERASE_PAGES,
                })
            }
            Some(pages) => encode_extended_pages(pages),
        };

        self.issue(Command::ExtendedErase, Command::ExtendedErase.description())?;
        self.write_bytes(&payload)?;

        warn!("Extended erase (0x44), this can take ten seconds or more");

        let mut session = TimeoutOverride::new(self, EXTENDED_ERASE_TIMEOUT_MS);
        session.await_ack("0x44 erasing failed")?;
        drop(session);

        debug!("Extended erase memory done");
        Ok(())
    }

    /// Enable write protection on the given flash sectors
    pub fn write_protect(&mut self, pages: &[u16]) -> Result<(), Error<E>> {
        if pages.is_empty() {
            return Err(Error::EmptyPageSet);
        }
        if pages.len() > MAX_ERASE_PAGES {
            return Err(Error::PageCountExceeded {
                count: pages.len(),
                max: MAX_ERASE_PAGES,
            });
        }
        let payload = encode_pages(&narrow_pages(pages)?);

        self.issue(Command::WriteProtect, Command::WriteProtect.description())?;
        self.write_and_ack("0x63 write protect failed", &payload)?;
        debug!("Write protect done");

        Ok(())
    }

    /// Disable write protection for all flash sectors
    ///
    /// The device resets itself once the option bytes are written.
    pub fn write_unprotect(&mut self) -> Result<(), Error<E>> {
        self.issue(Command::WriteUnprotect, Command::WriteUnprotect.description())?;
        self.await_ack("0x73 write unprotect failed")?;
        debug!("Write unprotect done");

        Ok(())
    }

    /// Enable readout protection
    pub fn readout_protect(&mut self) -> Result<(), Error<E>> {
        self.issue(Command::ReadoutProtect, Command::ReadoutProtect.description())?;
        self.await_ack("0x82 readout protect failed")?;
        debug!("Read protect done");

        Ok(())
    }

    /// Disable readout protection
    ///
    /// This mass erases the flash and resets the device, so the session is
    /// re-synchronized before returning.
    pub fn readout_unprotect(&mut self) -> Result<(), Error<E>> {
        self.issue(
            Command::ReadoutUnprotect,
            Command::ReadoutUnprotect.description(),
        )?;
        self.await_ack("0x92 readout unprotect failed")?;

        warn!("Mass erase, this may take a while");
        self.delay.delay_ms(READOUT_UNPROTECT_SETTLE_MS);
        debug!("Unprotect / mass erase done, re-synchronizing after device reset");

        self.reset_from_system_memory()
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    /// Read up to `count` bytes, returning short if the response timeout expires
    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, Error<E>> {
        let mut data = Vec::with_capacity(count);
        let poll = self.options.poll_delay_ms.max(1);
        let mut t = 0;

        while data.len() < count {
            match self.port.read() {
                Ok(v) => {
                    data.push(v);
                    continue;
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }

            if t >= self.timeout_ms {
                break;
            }

            self.delay.delay_ms(poll);
            t += poll;
        }

        Ok(data)
    }

    fn read_exact(&mut self, count: usize, context: &'static str) -> Result<Vec<u8>, Error<E>> {
        let data = self.read_bytes(count)?;
        if data.len() < count {
            error!(
                "Receive timeout: {} ({} of {} bytes)",
                context,
                data.len(),
                count
            );
            return Err(Error::Timeout { context });
        }
        Ok(data)
    }
}

/// Legacy page commands carry one byte per page
fn narrow_pages<E>(pages: &[u16]) -> Result<Vec<u8>, Error<E>> {
    pages
        .iter()
        .map(|&page| {
            if page > 0xFF {
                Err(Error::PageIndexOutOfRange { page })
            } else {
                Ok(page as u8)
            }
        })
        .collect()
}

/// Widens the response timeout while held, restoring the previous value on drop
struct TimeoutOverride<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    programmer: &'a mut Programmer<P, D, E>,
    previous: u32,
}

impl<'a, P, D, E> TimeoutOverride<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    fn new(programmer: &'a mut Programmer<P, D, E>, timeout_ms: u32) -> Self {
        let previous = programmer.timeout();
        programmer.set_timeout(timeout_ms);
        Self {
            programmer,
            previous,
        }
    }
}

impl<'a, P, D, E> core::ops::Deref for TimeoutOverride<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    type Target = Programmer<P, D, E>;

    fn deref(&self) -> &Self::Target {
        self.programmer
    }
}

impl<'a, P, D, E> core::ops::DerefMut for TimeoutOverride<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.programmer
    }
}

impl<'a, P, D, E> Drop for TimeoutOverride<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    fn drop(&mut self) {
        self.programmer.set_timeout(self.previous);
    }
}
