#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::{Delay, Serial};

use stm32_uart_loader::linux::Parity;
use stm32_uart_loader::{chip_name, format_uid, verify, Error, Options, Programmer};

type LinuxProgrammer = Programmer<Serial, Delay, IoErrorKind>;

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, short = "p", default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, short = "b", default_value = "115200")]
    baud: usize,

    /// Parity: "even" for STM32, "none" for BlueNRG
    #[structopt(long, short = "P", default_value = "even")]
    parity: Parity,

    /// Erase (note: this is required on previously written memory)
    #[structopt(long, short = "e")]
    erase: bool,

    /// Readout unprotect (mass erases the device)
    #[structopt(long, short = "u")]
    unprotect: bool,

    /// Write file content to flash
    #[structopt(long, short = "w")]
    write: bool,

    /// Verify flash content versus local file
    #[structopt(long, short = "v")]
    verify: bool,

    /// Read from flash and store in local file
    #[structopt(long, short = "r")]
    read: bool,

    /// Length of read
    #[structopt(long, short = "l", parse(try_from_str = parse_u32))]
    length: Option<u32>,

    /// Target address
    #[structopt(long, short = "a", default_value = "0x08000000", parse(try_from_str = parse_u32))]
    address: u32,

    /// Start executing from address (0x08000000, usually)
    #[structopt(long, short = "g", parse(try_from_str = parse_u32))]
    go_address: Option<u32>,

    /// Don't show progress bars
    #[structopt(long, short = "n")]
    no_progress: bool,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    /// Binary data file to write, verify against, or read into
    #[structopt(parse(from_os_str))]
    file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if (o.write || o.verify || o.read) && o.file.is_none() {
        bail!("A data file is required to read, write or verify");
    }
    if o.read && !o.write && o.length.is_none() {
        bail!("Supply --length to read from flash");
    }

    info!("Connecting to serial port {} at {} baud", o.port, o.baud);

    let mut p = Programmer::linux(&o.port, o.baud, o.parity, o.options.clone())
        .with_context(|| {
            format!(
                "Error connecting to serial port {}, is the device connected and powered?",
                o.port
            )
        })?;

    if !o.no_progress {
        let bar = ProgressBar::new(0);
        bar.set_style(ProgressStyle::default_bar().template("{bar:40} {pos}/{len} chunks"));
        p = p.with_progress(move |current, total| {
            bar.set_length(total as u64);
            bar.set_position(current as u64);
            if current == total {
                bar.finish_and_clear();
                bar.reset();
            }
        });
    }

    info!("Activating bootloader");

    if let Err(e) = p.reset_from_system_memory() {
        error!(
            "Can't init into bootloader, ensure that BOOT0 is enabled and reset the device: {}",
            e
        );
        let _ = p.reset_from_flash();
        bail!(e);
    }

    info!("Bootloader connected!");

    let res = run(&mut p, &o);

    // Leave the bootloader regardless of how the session went
    p.reset_from_flash()?;

    res
}

fn run(p: &mut LinuxProgrammer, o: &Args) -> anyhow::Result<()> {
    read_device_id(p)?;
    read_device_uid(p);

    let data = match (&o.file, o.write || o.verify) {
        (Some(f), true) => Some(
            std::fs::read(f).with_context(|| format!("Error reading file {}", f.display()))?,
        ),
        _ => None,
    };

    if o.unprotect {
        if let Err(e) = p.readout_unprotect() {
            bail!("Readout unprotect failed: {}", e);
        }
    }

    if o.erase {
        if let Err(e) = p.erase_memory(None) {
            error!("Erase failed, probably due to readout protection; consider using --unprotect");
            bail!(e);
        }
        info!("Erase done");
    }

    if let (true, Some(data)) = (o.write, &data) {
        info!(
            "Writing {} at 0x{:08X}",
            bytefmt::format(data.len() as u64),
            o.address
        );
        p.write_range(o.address, data)?;
    }

    if let (true, Some(data)) = (o.verify, &data) {
        info!("Verifying {}", bytefmt::format(data.len() as u64));
        let read_data = p.read_range(o.address, data.len())?;

        match verify(&read_data, data) {
            Ok(()) => info!("Verification OK"),
            Err(e) => bail!("Verification FAILED: {}", e),
        }
    }

    if let (true, false, Some(f), Some(length)) = (o.read, o.write, &o.file, o.length) {
        info!("Reading {} at 0x{:08X}", bytefmt::format(length as u64), o.address);
        let read_data = p.read_range(o.address, length as usize)?;
        std::fs::write(f, read_data)
            .with_context(|| format!("Error writing file {}", f.display()))?;
    }

    if let Some(address) = o.go_address {
        info!("Starting application at 0x{:08X}", address);
        p.go(address)?;
    }

    Ok(())
}

fn read_device_id(p: &mut LinuxProgrammer) -> Result<(), Error<IoErrorKind>> {
    let version = p.get()?;
    info!("Bootloader version: 0x{:X}", version);

    let id = p.get_id()?;
    info!(
        "Chip id: 0x{:X} ({})",
        id,
        chip_name(id).unwrap_or("Unknown")
    );

    Ok(())
}

fn read_device_uid(p: &mut LinuxProgrammer) {
    if p.family_tag().is_none() {
        info!("Supply --family to see flash size and device UID, e.g: --family F1");
        return;
    }

    match p.get_flash_size_and_uid() {
        Ok((size, uid)) => {
            info!("Device UID: {}", format_uid(&uid));
            match size {
                Some(kib) => info!("Flash size: {}", bytefmt::format(kib as u64 * 1024)),
                None => info!("Flash size: unknown"),
            }
        }
        Err(e) => warn!("Something was wrong with reading chip family data: {}", e),
    }
}
