use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The serial port structure, opened through tokio-serial.
pub mod serial_port;

/// Opening a port and the reading/writing halves of an open port.
pub mod connection;

/// Codecs for encoding/decoding messages to/from wire.
pub(crate) mod codecs;

/// The default baud rate used when a connect request does not name one.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// The default device path used when a connect request does not name one.
pub const DEFAULT_PATH: &str = "/dev/ttyUSB0";

/// Parity checking mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,

    /// Parity bit sets an even number of ones.
    Even,

    /// Parity bit sets an odd number of ones.
    Odd,
}

impl Parity {
    /// Parse the single letter form used by requests: `N`, `E` or `O`.
    /// Lowercase letters and the full names are accepted too.
    pub fn from_letter(letter: &str) -> Result<Self, Error> {
        match letter.trim().to_ascii_uppercase().as_str() {
            "N" | "NONE" => Ok(Self::None),
            "E" | "EVEN" => Ok(Self::Even),
            "O" | "ODD" => Ok(Self::Odd),
            other => Err(Error::InvalidPortConfig(format!(
                "parity must be one of N, E or O, got `{other}`"
            ))),
        }
    }

    /// The single letter form of this parity.
    pub fn letter(&self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// How to open a serial device.
///
/// A connection keeps the settings it was opened with.
/// Changing them means disconnecting and connecting again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortConfig {
    /// The path to the device.
    /// Likely "/dev/ttyUSBx" or "COMx".
    pub path: String,

    /// Line speed.
    pub baud_rate: u32,

    /// Bits per character, 5 through 8.
    pub data_bits: u8,

    /// Parity checking mode.
    pub parity: Parity,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PATH, DEFAULT_BAUD_RATE)
    }
}

impl PortConfig {
    /// Settings for the given path and baud rate, using 8 data bits and no parity.
    pub fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            data_bits: 8,
            parity: Parity::None,
        }
    }

    /// Use these data bits.
    pub fn with_data_bits(mut self, data_bits: u8) -> Self {
        self.data_bits = data_bits;
        self
    }

    /// Use this parity.
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Check that the settings could be applied to a device.
    pub fn validate(&self) -> Result<(), Error> {
        if self.path.trim().is_empty() {
            return Err(Error::InvalidPortConfig("the port path is empty".into()));
        }

        if self.baud_rate == 0 {
            return Err(Error::InvalidPortConfig(
                "the baud rate must be positive".into(),
            ));
        }

        if !(5..=8).contains(&self.data_bits) {
            return Err(Error::InvalidPortConfig(format!(
                "data bits must be between 5 and 8, got {}",
                self.data_bits
            )));
        }

        Ok(())
    }
}

impl Display for PortConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {} baud ({}{}1)",
            self.path,
            self.baud_rate,
            self.data_bits,
            self.parity.letter()
        )
    }
}

/// How the byte stream of a device is cut into lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Framing {
    /// Byte ending each line read from the device.
    /// It is not part of the yielded line.
    pub read_delimiter: u8,

    /// If set, appended to every payload written to the device.
    pub write_delimiter: Option<u8>,

    /// Longest line we buffer while waiting for a delimiter.
    /// Longer input is discarded.
    pub max_line_length: usize,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            read_delimiter: b'\n',
            write_delimiter: None,
            max_line_length: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_is_usb0_9600_8n1() {
        let config = PortConfig::default();

        assert_eq!(config.path, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, 8);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.to_string(), "/dev/ttyUSB0 at 9600 baud (8N1)");
    }

    #[test]
    fn parity_letters() {
        assert_eq!(Parity::from_letter("N").unwrap(), Parity::None);
        assert_eq!(Parity::from_letter("e").unwrap(), Parity::Even);
        assert_eq!(Parity::from_letter("Odd").unwrap(), Parity::Odd);

        let err = Parity::from_letter("X")
            .unwrap_err()
            .try_into_invalid_port_config()
            .unwrap();
        assert!(err.contains("`X`"));
    }

    #[test]
    fn data_bits_out_of_range() {
        for bits in [0, 4, 9] {
            let config = PortConfig::new("COM1", 9600).with_data_bits(bits);
            assert!(matches!(
                config.validate(),
                Err(Error::InvalidPortConfig(_))
            ));
        }

        for bits in 5..=8 {
            PortConfig::new("COM1", 9600)
                .with_data_bits(bits)
                .validate()
                .unwrap();
        }
    }

    #[test]
    fn zero_baud_and_empty_path() {
        assert!(PortConfig::new("COM1", 0).validate().is_err());
        assert!(PortConfig::new("  ", 9600).validate().is_err());
    }
}
