use std::io;

use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

use crate::{
    error::Error,
    serial::{
        connection::{BoxedReader, BoxedWriter, Opener},
        PortConfig,
    },
};

/// Opens real serial devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl Opener for SerialOpener {
    fn open(&self, config: &PortConfig) -> Result<(BoxedReader, BoxedWriter), Error> {
        debug!(%config, "Opening serial port");

        let serial_stream = tokio_serial::new(&config.path, config.baud_rate)
            .data_bits(data_bits(config.data_bits)?)
            .parity(config.parity.into())
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| classify(&config.path, e))?;

        let (reader, writer) = tokio::io::split(serial_stream);

        Ok((Box::new(reader), Box::new(writer)))
    }
}

/// Names of the serial devices present on this machine.
pub fn available_ports() -> Result<Vec<String>, Error> {
    let ports = serialport::available_ports().map_err(|e| {
        warn!(?e, "Could not enumerate serial ports");
        Error::IoFault(e.description)
    })?;

    Ok(ports.into_iter().map(|port| port.port_name).collect())
}

fn data_bits(bits: u8) -> Result<tokio_serial::DataBits, Error> {
    Ok(match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => {
            return Err(Error::InvalidPortConfig(format!(
                "data bits must be between 5 and 8, got {other}"
            )))
        }
    })
}

fn classify(path: &str, error: tokio_serial::Error) -> Error {
    debug!(?error, %path, "Could not open serial port");

    let description = error.description.to_lowercase();

    match error.kind {
        tokio_serial::ErrorKind::NoDevice | tokio_serial::ErrorKind::Io(io::ErrorKind::NotFound) => {
            Error::DeviceNotFound(path.into())
        }
        tokio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            Error::PermissionDenied(path.into())
        }
        _ if description.contains("busy") => Error::AlreadyOpen(path.into()),
        _ if description.contains("denied") => Error::PermissionDenied(path.into()),
        tokio_serial::ErrorKind::InvalidInput => {
            Error::InvalidPortConfig(format!("{path}: {}", error.description))
        }
        _ => Error::IoFault(format!("{path}: {}", error.description)),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn serial_error(kind: tokio_serial::ErrorKind, description: &str) -> tokio_serial::Error {
        tokio_serial::Error::new(kind, description)
    }

    #[test]
    fn missing_device() {
        let e = classify(
            "/dev/ttyUSB9",
            serial_error(tokio_serial::ErrorKind::NoDevice, "no such device"),
        );
        assert_eq!(e, Error::DeviceNotFound("/dev/ttyUSB9".into()));

        let e = classify(
            "COM9",
            serial_error(
                tokio_serial::ErrorKind::Io(io::ErrorKind::NotFound),
                "The system cannot find the file specified.",
            ),
        );
        assert_eq!(e, Error::DeviceNotFound("COM9".into()));
    }

    #[test]
    fn permission_and_busy() {
        let e = classify(
            "/dev/ttyS0",
            serial_error(
                tokio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied),
                "Permission denied",
            ),
        );
        assert_eq!(e, Error::PermissionDenied("/dev/ttyS0".into()));

        let e = classify(
            "/dev/ttyACM0",
            serial_error(tokio_serial::ErrorKind::Unknown, "Device or resource busy"),
        );
        assert_eq!(e, Error::AlreadyOpen("/dev/ttyACM0".into()));

        let e = classify(
            "COM3",
            serial_error(tokio_serial::ErrorKind::Unknown, "Access is denied."),
        );
        assert_eq!(e, Error::PermissionDenied("COM3".into()));
    }

    #[test]
    fn anything_else_is_io_fault() {
        let e = classify(
            "COM4",
            serial_error(tokio_serial::ErrorKind::Unknown, "the line is on fire"),
        );
        assert!(matches!(e, Error::IoFault(description) if description.contains("on fire")));
    }

    #[test]
    fn data_bits_mapping() {
        assert_eq!(data_bits(7).unwrap(), tokio_serial::DataBits::Seven);
        assert!(data_bits(9).is_err());
    }
}
