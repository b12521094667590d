use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    record::OutboundRecord,
    serial::{Parity, PortConfig},
    session::Outcome,
};

/// A request as sent by a client over the websocket.
///
/// The `command` is one of the keywords `CONNECT`, `START`, `STOP` or `DISCONNECT`.
/// Any other text is written to the device as-is.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// The keyword, or a raw payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Device path for `CONNECT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    /// Baud rate for `CONNECT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baudrate: Option<u32>,

    /// Data bits for `CONNECT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub databits: Option<u8>,

    /// Parity letter for `CONNECT`: `N`, `E` or `O`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parity: Option<String>,
}

impl Request {
    /// Connect to the given port at the given baud rate.
    pub fn connect(port: &str, baudrate: u32) -> Self {
        Self {
            command: Some("CONNECT".into()),
            port: Some(port.into()),
            baudrate: Some(baudrate),
            ..Default::default()
        }
    }

    /// Start acquisition.
    pub fn start() -> Self {
        Self::keyword("START")
    }

    /// Stop acquisition.
    pub fn stop() -> Self {
        Self::keyword("STOP")
    }

    /// Close the port.
    pub fn disconnect() -> Self {
        Self::keyword("DISCONNECT")
    }

    /// Write this text to the device.
    pub fn send_raw(payload: &str) -> Self {
        Self::keyword(payload)
    }

    fn keyword(command: &str) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    /// Use these data bits when connecting.
    pub fn with_databits(mut self, databits: u8) -> Self {
        self.databits = Some(databits);
        self
    }

    /// Use this parity when connecting.
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = Some(parity.letter().to_string());
        self
    }

    /// Turn a request into serialized json.
    pub fn serialize(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::InternalIssue(e.to_string()))
    }

    /// Parse a request from a websocket text frame.
    pub fn parse(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|e| Error::BadJson {
            request: text.into(),
            problem: e.to_string(),
        })
    }

    /// Interpret the request.
    /// Port settings not given are taken from `defaults`.
    pub fn into_command(self, defaults: &PortConfig) -> Result<Command, Error> {
        match self.command.as_deref() {
            Some("CONNECT") => {}
            Some("START") => return Ok(Command::Start),
            Some("STOP") => return Ok(Command::Stop),
            Some("DISCONNECT") => return Ok(Command::Disconnect),
            Some("") => return Err(Error::BadUsage("the command is empty".into())),
            Some(raw) => return Ok(Command::SendRaw(raw.to_owned())),
            // Port settings alone also mean connect.
            None if self.port.is_some() || self.baudrate.is_some() => {}
            None => {
                return Err(Error::BadUsage(
                    "a request needs a command, or port settings to connect with".into(),
                ))
            }
        }

        let parity = match self.parity.as_deref() {
            Some(letter) => Parity::from_letter(letter)?,
            None => defaults.parity,
        };

        let config = PortConfig {
            path: self.port.unwrap_or_else(|| defaults.path.clone()),
            baud_rate: self.baudrate.unwrap_or(defaults.baud_rate),
            data_bits: self.databits.unwrap_or(defaults.data_bits),
            parity,
        };
        config.validate()?;

        Ok(Command::Connect(config))
    }
}

/// What a client can ask of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open the device with these settings.
    Connect(PortConfig),

    /// Begin forwarding device lines to subscribers.
    Start,

    /// Stop forwarding, keeping the port open.
    Stop,

    /// Close the port.
    Disconnect,

    /// Write this text to the device.
    SendRaw(String),
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect(config) => write!(f, "CONNECT {config}"),
            Command::Start => write!(f, "START"),
            Command::Stop => write!(f, "STOP"),
            Command::Disconnect => write!(f, "DISCONNECT"),
            Command::SendRaw(payload) => write!(f, "SEND {} bytes", payload.len()),
        }
    }
}

/// Messages fanned out to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A device reading.
    Record(OutboundRecord),

    /// Something happened to the device.
    Status(String),
}

/// The JSON shape of everything the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    /// Records, status lines and command outcomes.
    /// A record is itself JSON encoded into the string.
    Data {
        /// The contents.
        data: String,
    },

    /// A command failed.
    Error {
        /// What went wrong.
        error: String,
    },
}

impl Envelope {
    /// A data envelope.
    pub fn data(data: impl Into<String>) -> Self {
        Self::Data { data: data.into() }
    }

    /// An error envelope.
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    /// Turn an envelope into serialized json.
    pub fn serialize(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::InternalIssue(e.to_string()))
    }

    /// If this is a data envelope holding a record, decode it.
    pub fn record(&self) -> Option<OutboundRecord> {
        match self {
            Envelope::Data { data } => serde_json::from_str(data).ok(),
            Envelope::Error { .. } => None,
        }
    }
}

impl From<&Outbound> for Envelope {
    fn from(outbound: &Outbound) -> Self {
        match outbound {
            Outbound::Record(record) => match serde_json::to_string(record) {
                Ok(data) => Self::data(data),
                Err(e) => Self::error(Error::InternalIssue(e.to_string()).to_string()),
            },
            Outbound::Status(status) => Self::data(status.as_str()),
        }
    }
}

impl From<Result<Outcome, Error>> for Envelope {
    fn from(result: Result<Outcome, Error>) -> Self {
        match result {
            Ok(outcome) => Self::data(outcome.to_string()),
            Err(e) => Self::error(e.to_string()),
        }
    }
}

/// An example connect request.
pub fn example_connect() -> Request {
    Request::connect("/dev/ttyUSB0", 9600)
        .with_databits(8)
        .with_parity(Parity::None)
}

/// An example raw payload request.
pub fn example_send_raw() -> Request {
    Request::send_raw("AT+RST")
}

/// An example of what a record looks like on the wire.
pub fn example_record() -> Result<Envelope, Error> {
    let record = crate::record::RecordFormatter::default()
        .format(r#"{"voltage": 3.3, "current": 0.12}"#)
        .ok_or_else(|| Error::InternalIssue("example record did not format".into()))?;

    Ok(Envelope::from(&Outbound::Record(record)))
}

/// An example of what an error reply looks like on the wire.
pub fn example_error() -> Envelope {
    Envelope::from(Err::<Outcome, _>(Error::NotConnected))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn defaults() -> PortConfig {
        PortConfig::default()
    }

    fn command(json: &str) -> Result<Command, Error> {
        Request::parse(json)?.into_command(&defaults())
    }

    #[test]
    fn keywords() {
        assert_eq!(command(r#"{"command": "START"}"#).unwrap(), Command::Start);
        assert_eq!(command(r#"{"command": "STOP"}"#).unwrap(), Command::Stop);
        assert_eq!(
            command(r#"{"command": "DISCONNECT"}"#).unwrap(),
            Command::Disconnect
        );
    }

    #[test]
    fn keywords_are_case_sensitive() {
        assert_eq!(
            command(r#"{"command": "start"}"#).unwrap(),
            Command::SendRaw("start".into())
        );
    }

    #[test]
    fn connect_fills_in_defaults() {
        let c = command(r#"{"command": "CONNECT", "port": "COM_MOCK"}"#).unwrap();

        assert_eq!(c, Command::Connect(PortConfig::new("COM_MOCK", 9600)));
    }

    #[test]
    fn connect_with_everything() {
        let c = command(
            r#"{"command": "CONNECT", "port": "/dev/ttyACM1", "baudrate": 115200, "databits": 7, "parity": "E"}"#,
        )
        .unwrap();

        assert_eq!(
            c,
            Command::Connect(
                PortConfig::new("/dev/ttyACM1", 115200)
                    .with_data_bits(7)
                    .with_parity(Parity::Even)
            )
        );
    }

    #[test]
    fn port_settings_without_command_connect() {
        let c = command(r#"{"port": "COM7", "baudrate": 19200}"#).unwrap();

        assert_eq!(c, Command::Connect(PortConfig::new("COM7", 19200)));
    }

    #[test]
    fn bad_requests() {
        assert!(matches!(command("{}"), Err(Error::BadUsage(_))));
        assert!(matches!(
            command(r#"{"command": ""}"#),
            Err(Error::BadUsage(_))
        ));
        assert!(matches!(command("hello"), Err(Error::BadJson { .. })));
        assert!(matches!(
            command(r#"{"command": "CONNECT", "databits": 9}"#),
            Err(Error::InvalidPortConfig(_))
        ));
        assert!(matches!(
            command(r#"{"command": "CONNECT", "parity": "M"}"#),
            Err(Error::InvalidPortConfig(_))
        ));
    }

    #[test]
    fn anything_else_is_raw() {
        assert_eq!(
            command(r#"{"command": "AT+RST"}"#).unwrap(),
            Command::SendRaw("AT+RST".into())
        );
    }

    #[test]
    fn envelope_shapes() {
        assert_eq!(
            Envelope::data("Connected").serialize().unwrap(),
            r#"{"data":"Connected"}"#
        );
        assert_eq!(
            example_error().serialize().unwrap(),
            r#"{"error":"Not connected to a serial device"}"#
        );
    }

    #[test]
    fn record_is_json_inside_data() {
        let envelope = example_record().unwrap();

        let record = envelope.record().unwrap();
        assert_eq!(record.get("voltage"), Some(&serde_json::json!(3.3)));
        assert_eq!(Envelope::data("Stopped").record(), None);
    }

    #[test]
    fn request_round_trip_skips_unset_fields() {
        assert_eq!(
            Request::start().serialize().unwrap(),
            r#"{"command":"START"}"#
        );
    }
}
