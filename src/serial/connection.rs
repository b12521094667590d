//! An open serial port, split into the half the read loop owns
//! and the half the session writes through.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::{
    error::Error,
    serial::{codecs::lines::LinesCodec, Framing, PortConfig},
};

/// The receiving side of a device, as handed out by an [`Opener`].
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// The transmitting side of a device, as handed out by an [`Opener`].
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Something which can open a device given its settings.
///
/// The device is released once both returned halves are dropped.
pub trait Opener: Send + Sync {
    /// Open the device described by `config`.
    fn open(&self, config: &PortConfig) -> Result<(BoxedReader, BoxedWriter), Error>;
}

/// An open port.
pub struct PortConnection {
    reader: PortReader,
    writer: PortWriter,
}

impl PortConnection {
    /// Validate the settings and open the device through the given opener.
    pub fn open(opener: &dyn Opener, config: &PortConfig, framing: &Framing) -> Result<Self, Error> {
        config.validate()?;

        let (reader, writer) = opener.open(config)?;
        let codec = LinesCodec::from(framing);

        debug!(%config, "Port open");

        Ok(Self {
            reader: PortReader {
                path: config.path.clone(),
                frames: FramedRead::new(reader, codec.clone()),
            },
            writer: PortWriter {
                path: config.path.clone(),
                frames: FramedWrite::new(writer, codec),
                closed: false,
            },
        })
    }

    /// Split into the reading and writing halves.
    pub fn into_split(self) -> (PortReader, PortWriter) {
        (self.reader, self.writer)
    }
}

/// Reads framed lines from a port.
pub struct PortReader {
    path: String,
    frames: FramedRead<BoxedReader, LinesCodec>,
}

impl PortReader {
    /// Wait at most `timeout` for the next line.
    ///
    /// `Ok(None)` means nothing complete arrived in time.
    /// The device going away is an [`Error::IoFault`].
    ///
    /// Cancel safe: dropping the future keeps partially received lines buffered.
    pub async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, Error> {
        match tokio::time::timeout(timeout, self.frames.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(Some(Ok(bytes))) => {
                let text = String::from_utf8_lossy(&bytes);
                let line = text.strip_suffix('\r').unwrap_or(text.as_ref());
                trace!(%line, "Line from port");

                Ok(Some(line.to_owned()))
            }
            Ok(Some(Err(e))) => Err(Error::io_fault(&self.path, &e)),
            Ok(None) => Err(Error::IoFault(format!(
                "{}: the device closed the connection",
                self.path
            ))),
        }
    }

    /// The device path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Writes payloads to a port.
pub struct PortWriter {
    path: String,
    frames: FramedWrite<BoxedWriter, LinesCodec>,
    closed: bool,
}

impl PortWriter {
    /// Write the payload (and the write delimiter, if configured) and flush it.
    ///
    /// A device which does not take the whole payload within `timeout` is an [`Error::IoFault`].
    /// The writer counts as closed afterwards, since the stuck bytes could never be flushed.
    /// Returns how many payload bytes were written.
    pub async fn write(&mut self, bytes: Vec<u8>, timeout: Duration) -> Result<usize, Error> {
        if self.closed {
            return Err(Error::IoFault(format!("{}: the port is closed", self.path)));
        }

        let written = bytes.len();
        match tokio::time::timeout(timeout, self.frames.send(bytes)).await {
            Ok(sent) => sent.map_err(|e| Error::io_fault(&self.path, &e))?,
            Err(_elapsed) => {
                self.closed = true;
                return Err(Error::IoFault(format!(
                    "{}: the device did not take {written} bytes within {timeout:?}",
                    self.path
                )))
            }
        }

        trace!(%written, "Payload flushed to port");

        Ok(written)
    }

    /// Flush and shut down the transmitting side.
    /// Calling this more than once does nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = SinkExt::<Vec<u8>>::close(&mut self.frames).await {
            debug!(?e, path = %self.path, "Problem shutting down port, ignoring");
        }
    }

    /// Whether [`PortWriter::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
