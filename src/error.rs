use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors thay may occur in this library.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// The serial device does not exist.
    #[error("The serial device `{0}` does not exist")]
    DeviceNotFound(String),

    /// The serial device exists, but we may not open it.
    #[error("Permission denied when opening `{0}`")]
    PermissionDenied(String),

    /// The serial device is held open by someone else.
    #[error("The serial device `{0}` is already open")]
    AlreadyOpen(String),

    /// Reading from or writing to an open port failed.
    #[error("I/O fault: {0}")]
    IoFault(String),

    /// The command needs a connected serial device.
    #[error("Not connected to a serial device")]
    NotConnected,

    /// The requested port settings are not usable.
    #[error("Invalid port configuration: {0}")]
    InvalidPortConfig(String),

    /// A device line could not be turned into a record.
    /// Such lines are dropped, this never reaches a subscriber.
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// Bad json.
    #[error("The request `{request}` could not be deserialized. Problem: {problem}")]
    BadJson {
        /// The problematic request.
        request: String,

        /// The deserialization issue.
        problem: String,
    },

    /// The user did something which is not valid.
    /// For example, sending an empty request.
    #[error("The request did not conform to valid usage. Problem: `{0}`")]
    BadUsage(String),

    /// The configuration file is not valid.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// The subscriber can no longer receive messages.
    #[error("Subscriber is gone")]
    SubscriberGone,

    /// Problems with the websocket connection to the server.
    #[error("Websocket issue: {0}")]
    WebsocketIssue(String),

    /// The server answered a request with an error.
    #[error("The server rejected the request: {0}")]
    Rejected(String),

    /// Something unexpected happened on our side.
    #[error("Internal issue: {0}")]
    InternalIssue(String),
}

impl Error {
    /// Describe an I/O failure on the port at the given path.
    pub(crate) fn io_fault(path: &str, error: &io::Error) -> Self {
        Self::IoFault(format!("{path}: {error}"))
    }

    /// Return the problem description if this is [`Error::BadConfig`].
    pub fn try_into_bad_config(self) -> Option<String> {
        if let Self::BadConfig(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// Return the problem description if this is [`Error::InvalidPortConfig`].
    pub fn try_into_invalid_port_config(self) -> Option<String> {
        if let Self::InvalidPortConfig(v) = self {
            Some(v)
        } else {
            None
        }
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Self::WebsocketIssue(e.to_string())
    }
}
