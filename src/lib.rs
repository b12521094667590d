#![deny(missing_docs)]
//! Serial Relay bridges one serial device to any number of websocket clients.
//!
//! Clients send JSON requests to connect to a port, start and stop acquisition,
//! disconnect, or write raw payloads to the device.
//! While acquiring, every line the device sends is turned into a timestamped
//! record and broadcast to all connected clients.

/// The requests clients send, and the envelopes the server replies with.
pub mod actions;

/// Fan-out to subscribers.
pub mod broadcaster;

/// Code relating to setting up the server which serves websocket clients and HTTP routes.
pub mod server;

/// Clients.
pub mod client;

/// The command line interface.
pub mod cli;

/// Handles incoming websockets.
pub(crate) mod websocket;

/// Mocked serial devices.
pub mod mock;

/// Serial port driver.
pub mod serial;

/// Reading the port in the background.
pub mod read_loop;

/// Turning device lines into records.
pub mod record;

/// The serial session and its state machine.
pub mod session;

/// Relates to config files.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;
