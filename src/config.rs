use std::{path::Path, time::Duration};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    record::RecordPolicy,
    serial::{Framing, Parity, PortConfig},
};

/// The configuration used for running the server.
///
/// Every field may be left out of the file, in which case the default is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port settings used where a connect request leaves them out.
    pub defaults: PortConfig,

    /// Longest single wait for a device line, in milliseconds.
    /// Stopping acquisition never takes much longer than this.
    pub read_timeout_ms: u64,

    /// How many records may queue up between reading the device and
    /// broadcasting to subscribers.
    pub record_queue_capacity: usize,

    /// How device bytes are cut into lines.
    pub framing: Framing,

    /// What to do with device lines which are not records.
    pub records: RecordPolicy,

    /// Paths which are served by a loopback mock instead of a serial port.
    /// Whatever is sent to such a port comes back as a device line.
    pub loopback_ports: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            defaults: PortConfig::default(),
            read_timeout_ms: 1000,
            record_queue_capacity: 64,
            framing: Framing::default(),
            records: RecordPolicy::default(),
            loopback_ports: vec![],
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Not a valid configuration: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            defaults: PortConfig::new("/dev/ttyACM0", 115_200).with_parity(Parity::None),
            read_timeout_ms: 500,
            framing: Framing {
                write_delimiter: Some(b'\n'),
                ..Default::default()
            },
            records: RecordPolicy::KeepRaw,
            loopback_ports: vec!["COM_MOCK".into(), "/dev/ttyLOOP0".into()],
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::InternalIssue(format!("Could not serialize configuration: {e}")))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::BadConfig(format!("Could not read {path:?}: {e}")))?;

        Self::deserialize(&s)
    }

    /// The read timeout as a duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    fn check_nonzero(&self) -> Result<(), Error> {
        if self.read_timeout_ms == 0 {
            return Err(Error::BadConfig(
                "The read timeout must be at least one millisecond.".into(),
            ));
        }

        if self.record_queue_capacity == 0 {
            return Err(Error::BadConfig(
                "The record queue must have room for at least one record.".into(),
            ));
        }

        if self.framing.max_line_length == 0 {
            return Err(Error::BadConfig(
                "The maximum line length must be positive.".into(),
            ));
        }

        Ok(())
    }

    fn check_defaults(&self) -> Result<(), Error> {
        self.defaults.validate().map_err(|e| {
            Error::BadConfig(format!("The default port settings are not usable: {e}"))
        })
    }

    fn check_loopback_ports(&self) -> Result<(), Error> {
        if self
            .loopback_ports
            .iter()
            .any(|path| path.trim().is_empty())
        {
            return Err(Error::BadConfig(
                "Loopback ports need a non-empty path.".into(),
            ));
        }

        let duplicates = self
            .loopback_ports
            .iter()
            .duplicates()
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "Each loopback port may only be listed once. Duplicates: {duplicates:?}"
            )))
        }
    }

    /// Check that the server can run with this configuration.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_nonzero()?;
        self.check_defaults()?;
        self.check_loopback_ports()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn serialize() {
        let c = Config::example();

        println!("{}", c.serialize_pretty().unwrap());
    }

    #[test]
    fn example_survives_serialization() {
        let c = Config::example();

        let back = Config::deserialize(&c.serialize_pretty().unwrap()).unwrap();

        assert_eq!(back, c);
        back.validate().unwrap();
    }

    #[test]
    fn deserialize() {
        let input = r#"
(
    defaults: (
        path: "/dev/ttyUSB1",
        baud_rate: 57600,
        data_bits: 7,
        parity: Even,
    ),
    read_timeout_ms: 250,
    framing: (
        read_delimiter: 13,
        write_delimiter: 10,
    ),
    records: KeepRaw,
    loopback_ports: ["COM_MOCK"],
)"#;
        let c = Config::deserialize(input).unwrap();

        assert_eq!(
            c.defaults,
            PortConfig::new("/dev/ttyUSB1", 57600)
                .with_data_bits(7)
                .with_parity(Parity::Even)
        );
        assert_eq!(c.read_timeout(), Duration::from_millis(250));
        assert_eq!(c.framing.read_delimiter, b'\r');
        assert_eq!(c.framing.write_delimiter, Some(b'\n'));
        assert_eq!(c.framing.max_line_length, 4096);
        assert_eq!(c.record_queue_capacity, 64);
        assert_eq!(c.records, RecordPolicy::KeepRaw);
        c.validate().unwrap();
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let c = Config::deserialize("()").unwrap();

        assert_eq!(c, Config::default());
    }

    #[test]
    fn garbage_is_bad_config() {
        let e = Config::deserialize("(read_timeout_ms: \"soon\")").unwrap_err();

        assert!(e.try_into_bad_config().is_some());
    }

    #[test]
    fn zero_timeout() {
        let c = Config {
            read_timeout_ms: 0,
            ..Default::default()
        };

        let e = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(e.contains("read timeout"));
    }

    #[test]
    fn zero_queue() {
        let c = Config {
            record_queue_capacity: 0,
            ..Default::default()
        };

        assert!(c.validate().is_err());
    }

    #[test]
    fn bad_defaults() {
        let c = Config {
            defaults: PortConfig::new("/dev/ttyUSB0", 9600).with_data_bits(4),
            ..Default::default()
        };

        let e = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(e.contains("data bits"));
    }

    #[test]
    fn duplicate_loopback_ports() {
        let c = Config {
            loopback_ports: vec!["A".into(), "B".into(), "A".into()],
            ..Default::default()
        };

        let e = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(e.contains("\"A\""));
    }

    #[test]
    fn empty_loopback_port() {
        let c = Config {
            loopback_ports: vec!["".into()],
            ..Default::default()
        };

        assert!(c.validate().is_err());
    }
}
