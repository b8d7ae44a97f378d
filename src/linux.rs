use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind as SerialErrorKind, FlowControl,
    SerialDevice as _, SerialPortSettings as _, StopBits,
};

use crate::{Options, Programmer, SerialPort};

/// Port-level read timeout, zero so that only `poll_delay_ms` counts toward the response timeout
pub const PORT_TIMEOUT: Duration = Duration::from_millis(0);

/// Serial line parity
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Parity {
    /// Required by STM32 bootloaders
    Even,
    /// Required by BlueNRG bootloaders
    None,
}

impl FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "even" => Ok(Parity::Even),
            "none" => Ok(Parity::None),
            _ => Err(format!("Parity value not recognized: '{}'", s)),
        }
    }
}

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        SerialErrorKind::Io(kind) => kind,
        SerialErrorKind::NoDevice => IoErrorKind::NotFound,
        SerialErrorKind::InvalidInput => IoErrorKind::InvalidInput,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        parity: Parity,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(match parity {
            Parity::Even => serial_core::Parity::ParityEven,
            Parity::None => serial_core::Parity::ParityNone,
        });

        port.0.write_settings(&settings)?;

        // Reads are polled against the session timeout, the port itself must not block
        port.0.set_timeout(PORT_TIMEOUT)?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
