//! Test doubles for the serial port and delay.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::convert::Infallible;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use stm32_uart_loader::{Options, Programmer, SerialPort, UART_ACK, UART_NACK};

/// Delay that returns immediately and records the requested time
#[derive(Debug, Default)]
pub struct MockDelay {
    pub elapsed_ms: u64,
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += ms as u64;
    }
}

/// Port replaying canned replies and recording everything written
#[derive(Debug, Default)]
pub struct ScriptedPort {
    pub replies: VecDeque<u8>,
    pub written: Vec<u8>,
    pub lines: Vec<(&'static str, bool)>,
}

impl ScriptedPort {
    pub fn new(replies: &[u8]) -> Self {
        Self {
            replies: replies.iter().cloned().collect(),
            ..Self::default()
        }
    }
}

impl Write<u8> for ScriptedPort {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.written.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for ScriptedPort {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.replies.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl SerialPort<Infallible> for ScriptedPort {
    fn set_rts(&mut self, level: bool) -> Result<(), Infallible> {
        self.lines.push(("rts", level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Infallible> {
        self.lines.push(("dtr", level));
        Ok(())
    }
}

pub type ScriptedProgrammer = Programmer<ScriptedPort, MockDelay, Infallible>;

pub fn options(family: Option<&str>) -> Options {
    Options {
        no_reset: true,
        response_timeout_ms: 100,
        family: family.map(str::to_string),
        ..Options::default()
    }
}

/// Synchronized session replaying `replies`, with the sync exchange cleared from the log
pub fn scripted(replies: &[u8]) -> ScriptedProgrammer {
    scripted_with(options(None), replies)
}

pub fn scripted_with(options: Options, replies: &[u8]) -> ScriptedProgrammer {
    let mut port = ScriptedPort::new(&[UART_ACK]);
    port.replies.extend(replies);

    let mut p = Programmer::new(port, MockDelay::default(), options);
    p.synchronize().expect("synchronize");
    p
}

/// Bytes written after synchronization
pub fn written(p: ScriptedProgrammer) -> Vec<u8> {
    let (port, _) = p.release();
    port.written[1..].to_vec()
}

pub const FLASH_BASE: u32 = 0x0800_0000;

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    ReadAddress,
    ReadLength(u32),
    WriteAddress,
    WriteData(u32),
    Erase,
    ExtendedErase,
}

/// Minimal bootloader: decodes frames and keeps a flash image
#[derive(Debug)]
pub struct SimulatedDevice {
    pub flash: Vec<u8>,
    pub page_size: usize,
    pub commands: Vec<u8>,
    pub chip_id: [u8; 2],
    pub system: Vec<(u32, Vec<u8>)>,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    phase: Phase,
}

impl SimulatedDevice {
    pub fn new(flash_size: usize, page_size: usize, extended_erase: bool) -> Self {
        let erase = if extended_erase { 0x44 } else { 0x43 };
        Self {
            flash: vec![0xFF; flash_size],
            page_size,
            commands: vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, erase, 0x63, 0x73, 0x82, 0x92],
            chip_id: [0x04, 0x13],
            system: Vec::new(),
            rx: Vec::new(),
            tx: VecDeque::new(),
            phase: Phase::Idle,
        }
    }

    /// Map `data` into system memory at `address`
    pub fn with_system_memory(mut self, address: u32, data: Vec<u8>) -> Self {
        self.system.push((address, data));
        self
    }

    fn reply(&mut self, data: &[u8]) {
        self.tx.extend(data);
    }

    fn fetch(&self, address: u32) -> u8 {
        if address >= FLASH_BASE {
            let i = (address - FLASH_BASE) as usize;
            if i < self.flash.len() {
                return self.flash[i];
            }
        }
        for (base, data) in &self.system {
            if address >= *base && ((address - base) as usize) < data.len() {
                return data[(address - base) as usize];
            }
        }
        0
    }

    fn checked(data: &[u8]) -> bool {
        data.iter().fold(0, |acc, b| acc ^ b) == 0
    }

    fn erase_page(&mut self, page: usize) {
        let start = page * self.page_size;
        let end = (start + self.page_size).min(self.flash.len());
        for b in &mut self.flash[start..end] {
            *b = 0xFF;
        }
    }

    fn step(&mut self) {
        let rx = self.rx.clone();
        let consumed = match self.phase {
            Phase::Idle => self.command(&rx),
            Phase::ReadAddress | Phase::WriteAddress if rx.len() >= 5 => {
                let address = u32::from_be_bytes([rx[0], rx[1], rx[2], rx[3]]);
                if !Self::checked(&rx[..5]) {
                    self.reply(&[UART_NACK]);
                    self.phase = Phase::Idle;
                } else {
                    self.reply(&[UART_ACK]);
                    self.phase = match self.phase {
                        Phase::ReadAddress => Phase::ReadLength(address),
                        _ => Phase::WriteData(address),
                    };
                }
                5
            }
            Phase::ReadLength(address) if rx.len() >= 2 => {
                self.phase = Phase::Idle;
                if rx[0] ^ rx[1] != 0xFF {
                    self.reply(&[UART_NACK]);
                } else {
                    self.reply(&[UART_ACK]);
                    for i in 0..=rx[0] as u32 {
                        let b = self.fetch(address + i);
                        self.reply(&[b]);
                    }
                }
                2
            }
            Phase::WriteData(address) if !rx.is_empty() && rx.len() >= rx[0] as usize + 3 => {
                let n = rx[0] as usize + 1;
                self.phase = Phase::Idle;
                if !Self::checked(&rx[..n + 2]) || n % 4 != 0 {
                    self.reply(&[UART_NACK]);
                } else {
                    let start = (address - FLASH_BASE) as usize;
                    self.flash[start..start + n].copy_from_slice(&rx[1..n + 1]);
                    self.reply(&[UART_ACK]);
                }
                n + 2
            }
            Phase::Erase if rx.len() >= 2 && rx[0] == 0xFF => {
                self.phase = Phase::Idle;
                self.flash.iter_mut().for_each(|b| *b = 0xFF);
                self.reply(&[UART_ACK]);
                2
            }
            Phase::Erase if !rx.is_empty() && rx.len() >= rx[0] as usize + 3 => {
                let n = rx[0] as usize + 1;
                self.phase = Phase::Idle;
                for &page in &rx[1..n + 1] {
                    self.erase_page(page as usize);
                }
                self.reply(&[UART_ACK]);
                n + 2
            }
            Phase::ExtendedErase if rx.len() >= 3 && rx[0] == 0xFF && rx[1] == 0xFF => {
                self.phase = Phase::Idle;
                self.flash.iter_mut().for_each(|b| *b = 0xFF);
                self.reply(&[UART_ACK]);
                3
            }
            Phase::ExtendedErase if rx.len() >= 2 => {
                let n = u16::from_be_bytes([rx[0], rx[1]]) as usize + 1;
                if rx.len() < 2 + n * 2 + 1 {
                    return;
                }
                self.phase = Phase::Idle;
                for i in 0..n {
                    let page = u16::from_be_bytes([rx[2 + i * 2], rx[3 + i * 2]]);
                    self.erase_page(page as usize);
                }
                self.reply(&[UART_ACK]);
                2 + n * 2 + 1
            }
            _ => 0,
        };
        self.rx.drain(..consumed);
    }

    fn command(&mut self, rx: &[u8]) -> usize {
        if rx.len() == 1 && rx[0] == 0x7F {
            self.reply(&[UART_ACK]);
            return 1;
        }
        if rx.len() < 2 {
            return 0;
        }
        if rx[0] ^ rx[1] != 0xFF {
            self.reply(&[UART_NACK]);
            return 2;
        }

        self.reply(&[UART_ACK]);
        match rx[0] {
            0x00 => {
                let mut r = vec![self.commands.len() as u8, 0x31];
                r.extend(self.commands.clone());
                r.push(UART_ACK);
                self.reply(&r);
            }
            0x02 => {
                let id = self.chip_id;
                self.reply(&[0x01, id[0], id[1], UART_ACK]);
            }
            0x11 => self.phase = Phase::ReadAddress,
            0x31 => self.phase = Phase::WriteAddress,
            0x43 => self.phase = Phase::Erase,
            0x44 => self.phase = Phase::ExtendedErase,
            _ => (),
        }
        2
    }
}

impl Write<u8> for SimulatedDevice {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.rx.push(word);
        self.step();
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for SimulatedDevice {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.tx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl SerialPort<Infallible> for SimulatedDevice {
    fn set_rts(&mut self, _level: bool) -> Result<(), Infallible> {
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), Infallible> {
        Ok(())
    }
}

pub type SimulatedProgrammer = Programmer<SimulatedDevice, MockDelay, Infallible>;

/// Synchronized session against `device`
pub fn simulated(device: SimulatedDevice, family: Option<&str>) -> SimulatedProgrammer {
    let mut p = Programmer::new(device, MockDelay::default(), options(family));
    p.synchronize().expect("synchronize");
    p
}
