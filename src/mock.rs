//! Mock devices, useful to exercise the relay without actual serial ports.
//!
//! Each opened mock port is one end of an in-memory pipe.
//! The other end is a [`MockDevice`], which plays the part of the hardware:
//! it emits lines towards the relay and sees what the relay writes.
//!
//! A loopback opener instead echoes everything written to the port back as input.

use std::{
    collections::{HashMap, HashSet},
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    task::{Context, Poll},
};

use tokio::io::{
    self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines,
    ReadBuf, ReadHalf, WriteHalf,
};
use tracing::{debug, info_span, trace, Instrument};

use crate::{
    error::Error,
    serial::{
        connection::{BoxedReader, BoxedWriter, Opener},
        serial_port::SerialOpener,
        PortConfig,
    },
};

const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct MockState {
    /// Device ends not yet claimed by a test.
    devices: HashMap<String, DuplexStream>,

    /// Ports the relay currently holds open.
    live: HashMap<String, Weak<()>>,

    /// Paths which refuse to open.
    failures: HashMap<String, Error>,

    /// Successful opens so far.
    opened: usize,
}

/// Opens mock ports.
///
/// Clones share the same set of devices.
#[derive(Debug, Clone)]
pub struct MockOpener {
    state: Arc<Mutex<MockState>>,
    loopback: bool,
    capacity: usize,
}

impl Default for MockOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOpener {
    /// Ports whose device end is handed out via [`MockOpener::device`].
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            loopback: false,
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Ports which echo whatever is written to them.
    pub fn loopback() -> Self {
        Self {
            loopback: true,
            ..Self::new()
        }
    }

    /// Set how many bytes may be in flight in each direction before writers wait.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Make opening `path` fail with the given error from now on.
    pub fn fail_with(&self, path: &str, error: Error) {
        self.lock().failures.insert(path.into(), error);
    }

    /// Claim the device end of the most recently opened port at `path`.
    ///
    /// Returns `None` if the port was never opened, the device was already claimed,
    /// or this is a loopback opener.
    pub fn device(&self, path: &str) -> Option<MockDevice> {
        let stream = self.lock().devices.remove(path)?;
        let (reader, writer) = io::split(stream);

        Some(MockDevice {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    /// How many times a port has been opened successfully.
    pub fn opened(&self) -> usize {
        self.lock().opened
    }

    /// How many ports are open right now.
    pub fn live(&self) -> usize {
        self.lock()
            .live
            .values()
            .filter(|token| token.strong_count() > 0)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Opener for MockOpener {
    fn open(&self, config: &PortConfig) -> Result<(BoxedReader, BoxedWriter), Error> {
        let path = config.path.clone();
        let mut state = self.lock();

        if let Some(error) = state.failures.get(&path) {
            return Err(error.clone());
        }

        if state
            .live
            .get(&path)
            .map_or(false, |token| token.strong_count() > 0)
        {
            return Err(Error::AlreadyOpen(path));
        }

        let (port, device) = io::duplex(self.capacity);

        if self.loopback {
            tokio::spawn(
                async move {
                    let (mut from_relay, mut to_relay) = io::split(device);
                    match io::copy(&mut from_relay, &mut to_relay).await {
                        Ok(bytes) => trace!(%bytes, "Loopback done"),
                        Err(e) => debug!(?e, "Loopback ended"),
                    }
                }
                .instrument(info_span!("Loopback", %path)),
            );
        } else {
            state.devices.insert(path.clone(), device);
        }

        let token = Arc::new(());
        state.live.insert(path.clone(), Arc::downgrade(&token));
        state.opened += 1;

        debug!(%path, loopback = self.loopback, "Mock port open");

        let (reader, writer) = io::split(port);

        Ok((
            Box::new(Tracked {
                inner: reader,
                _token: token.clone(),
            }),
            Box::new(Tracked {
                inner: writer,
                _token: token,
            }),
        ))
    }
}

/// Keeps a port counted as open while either half is alive.
struct Tracked<T> {
    inner: T,
    _token: Arc<()>,
}

impl<T: AsyncRead + Unpin> AsyncRead for Tracked<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Tracked<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// The hardware side of a mock port.
///
/// Dropping it looks like the device being unplugged.
pub struct MockDevice {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl MockDevice {
    /// Send a line, newline appended.
    pub async fn emit_line(&mut self, line: &str) -> io::Result<()> {
        self.emit(format!("{line}\n").as_bytes()).await
    }

    /// Send raw bytes.
    pub async fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    /// The next newline terminated line the relay wrote.
    /// `None` once the relay has closed the port.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.lines.next_line().await
    }
}

/// Opens loopback mocks for a fixed set of paths and real serial ports for the rest.
#[derive(Debug, Clone)]
pub struct ConfiguredOpener {
    loopback_paths: HashSet<String>,
    loopback: MockOpener,
    serial: SerialOpener,
}

impl ConfiguredOpener {
    /// Use loopback mocks for the given paths.
    pub fn new<I, S>(loopback_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            loopback_paths: loopback_paths.into_iter().map(Into::into).collect(),
            loopback: MockOpener::loopback(),
            serial: SerialOpener,
        }
    }
}

impl Opener for ConfiguredOpener {
    fn open(&self, config: &PortConfig) -> Result<(BoxedReader, BoxedWriter), Error> {
        if self.loopback_paths.contains(&config.path) {
            self.loopback.open(config)
        } else {
            self.serial.open(config)
        }
    }
}
