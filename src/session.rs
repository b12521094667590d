//! The one serial session of a running server.
//!
//! The session owns the port connection and applies client commands to it.
//! Everything touching the port is serialized by a single lock;
//! reading happens in a [`ReadLoop`] outside of it.

use std::{
    fmt::Display,
    sync::{Arc, Weak},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    actions::{Command, Outbound},
    broadcaster::Broadcaster,
    config::Config,
    error::Error,
    mock::ConfiguredOpener,
    read_loop::{ReadLoop, ReadSettings},
    record::{RecordFormatter, RecordPolicy},
    serial::{
        connection::{Opener, PortConnection, PortReader, PortWriter},
        Framing, PortConfig,
    },
};

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No port is open.
    Disconnected,

    /// A port is open, records are not forwarded.
    Connected,

    /// A port is open and records are forwarded to subscribers.
    Acquiring,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// What a successful command did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The port was opened.
    Connected(PortConfig),

    /// A port was open already, nothing changed.
    AlreadyConnected(PortConfig),

    /// Acquisition started.
    Acquiring,

    /// Acquisition was running already.
    AlreadyAcquiring,

    /// Acquisition stopped, the port stays open.
    Stopped,

    /// There was no acquisition to stop.
    NotAcquiring,

    /// The port was closed.
    Disconnected,

    /// No port was open.
    AlreadyDisconnected,

    /// This many bytes were written to the device.
    Sent(usize),
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Connected(config) => write!(f, "Connected to {config}"),
            Outcome::AlreadyConnected(config) => write!(f, "Already connected to {config}"),
            Outcome::Acquiring => write!(f, "Acquisition started"),
            Outcome::AlreadyAcquiring => write!(f, "Already acquiring"),
            Outcome::Stopped => write!(f, "Acquisition stopped"),
            Outcome::NotAcquiring => write!(f, "Not acquiring"),
            Outcome::Disconnected => write!(f, "Disconnected"),
            Outcome::AlreadyDisconnected => write!(f, "Already disconnected"),
            Outcome::Sent(bytes) => write!(f, "Sent {bytes} bytes"),
        }
    }
}

/// A snapshot of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// The lifecycle state.
    pub state: ConnectionState,

    /// Settings of the open port, if any.
    pub port: Option<PortConfig>,

    /// How many subscribers are registered.
    pub subscribers: usize,
}

/// Tunables of a session.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    /// Port settings used where a connect request leaves them out.
    pub defaults: PortConfig,

    /// How device bytes are cut into lines.
    pub framing: Framing,

    /// What happens to lines which are not records.
    pub records: RecordPolicy,

    /// Read timeout and queue size of the read loop.
    pub read: ReadSettings,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            defaults: config.defaults.clone(),
            framing: config.framing.clone(),
            records: config.records,
            read: ReadSettings {
                read_timeout: config.read_timeout(),
                queue_capacity: config.record_queue_capacity,
            },
        }
    }
}

struct LiveConnection {
    config: PortConfig,
    writer: PortWriter,

    /// Parked here while not acquiring.
    reader: Option<PortReader>,
    acquisition: Option<ReadLoop>,
}

#[derive(Default)]
struct Slot {
    /// Bumped whenever a read loop starts or the connection goes away,
    /// so a late failure report from an old loop is ignored.
    epoch: u64,
    live: Option<LiveConnection>,
}

impl Slot {
    fn state(&self) -> ConnectionState {
        match &self.live {
            None => ConnectionState::Disconnected,
            Some(live) if live.acquisition.is_some() => ConnectionState::Acquiring,
            Some(_) => ConnectionState::Connected,
        }
    }

    /// Stop reading, close the port.
    /// Returns the settings of the port which was closed.
    async fn teardown(&mut self) -> Option<PortConfig> {
        let mut live = self.live.take()?;
        self.epoch += 1;

        if let Some(mut acquisition) = live.acquisition.take() {
            acquisition.stop().await;
        }
        live.writer.close().await;
        drop(live.reader);

        info!(config = %live.config, "Port closed");
        Some(live.config)
    }

    /// Clean up after a read loop which has died on its own.
    /// Returns a notice for subscribers if the port was lost.
    async fn reap(&mut self) -> Option<String> {
        let live = self.live.as_mut()?;
        let acquisition = live.acquisition.as_mut()?;

        if !acquisition.is_finished() {
            return None;
        }

        match acquisition.stop().await {
            Some(reader) => {
                live.reader = Some(reader);
                live.acquisition = None;
                None
            }
            None => {
                let config = self.teardown().await?;
                Some(lost_notice(&config, "reading failed"))
            }
        }
    }
}

fn lost_notice(config: &PortConfig, reason: impl Display) -> String {
    format!("Disconnected from {}: {reason}", config.path)
}

struct Session {
    opener: Arc<dyn Opener>,
    broadcaster: Broadcaster,
    formatter: RecordFormatter,
    settings: SessionSettings,
    slot: Mutex<Slot>,
}

/// A cheaply cloneable handle to the session.
#[derive(Clone)]
pub struct SessionHandle(Arc<Session>);

impl SessionHandle {
    /// A disconnected session opening ports through `opener`
    /// and fanning out to `broadcaster`'s subscribers.
    pub fn new(
        opener: Arc<dyn Opener>,
        broadcaster: Broadcaster,
        settings: SessionSettings,
    ) -> Self {
        Self(Arc::new(Session {
            opener,
            broadcaster,
            formatter: RecordFormatter::new(settings.records),
            settings,
            slot: Mutex::new(Slot::default()),
        }))
    }

    /// A session set up according to the configuration.
    /// Configured loopback ports are mocked, all other paths are real serial ports.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(ConfiguredOpener::new(config.loopback_ports.iter().cloned())),
            Broadcaster::new(),
            SessionSettings::from(config),
        )
    }

    /// Apply a command.
    pub async fn apply(&self, command: Command) -> Result<Outcome, Error> {
        let span = info_span!("Command", %command);

        async move {
            let mut slot = self.0.slot.lock().await;
            let mut notice = slot.reap().await;

            let result = match command {
                Command::Connect(config) => self.connect(&mut slot, config),
                Command::Start => self.start(&mut slot),
                Command::Stop => match slot.live.as_mut() {
                    None => Ok(Outcome::AlreadyDisconnected),
                    Some(live) => match live.acquisition.take() {
                        None => Ok(Outcome::NotAcquiring),
                        Some(mut acquisition) => match acquisition.stop().await {
                            Some(reader) => {
                                live.reader = Some(reader);
                                Ok(Outcome::Stopped)
                            }
                            None => {
                                if let Some(config) = slot.teardown().await {
                                    notice = Some(lost_notice(&config, "reading failed"));
                                }
                                Ok(Outcome::Disconnected)
                            }
                        },
                    },
                },
                Command::Disconnect => match slot.teardown().await {
                    Some(_) => Ok(Outcome::Disconnected),
                    None => Ok(Outcome::AlreadyDisconnected),
                },
                Command::SendRaw(payload) => match slot.live.as_mut() {
                    None => Err(Error::NotConnected),
                    Some(live) => {
                        // A device which stops draining must not hold the lock forever.
                        let sent = live
                            .writer
                            .write(payload.into_bytes(), self.0.settings.read.read_timeout)
                            .await;

                        match sent {
                            Ok(written) => Ok(Outcome::Sent(written)),
                            Err(e) => {
                                warn!(%e, "Write failed, disconnecting");
                                if let Some(config) = slot.teardown().await {
                                    notice = Some(lost_notice(&config, &e));
                                }
                                Err(e)
                            }
                        }
                    }
                },
            };

            let state = slot.state();
            drop(slot);

            match &result {
                Ok(outcome) => debug!(%outcome, %state, "Applied"),
                Err(e) => debug!(%e, %state, "Refused"),
            }

            self.notify(notice).await;
            result
        }
        .instrument(span)
        .await
    }

    fn connect(&self, slot: &mut Slot, config: PortConfig) -> Result<Outcome, Error> {
        if let Some(live) = &slot.live {
            return Ok(Outcome::AlreadyConnected(live.config.clone()));
        }

        let connection =
            PortConnection::open(self.0.opener.as_ref(), &config, &self.0.settings.framing)?;
        let (reader, writer) = connection.into_split();

        slot.live = Some(LiveConnection {
            config: config.clone(),
            writer,
            reader: Some(reader),
            acquisition: None,
        });
        info!(%config, "Connected");

        Ok(Outcome::Connected(config))
    }

    fn start(&self, slot: &mut Slot) -> Result<Outcome, Error> {
        let Slot { epoch, live } = slot;

        let Some(live) = live.as_mut() else {
            return Err(Error::NotConnected);
        };

        if live.acquisition.is_some() {
            return Ok(Outcome::AlreadyAcquiring);
        }

        let reader = live
            .reader
            .take()
            .ok_or_else(|| Error::InternalIssue("connected without a reader".into()))?;

        *epoch += 1;
        let started_at = *epoch;
        let session = Arc::downgrade(&self.0);

        live.acquisition = Some(ReadLoop::start(
            reader,
            self.0.formatter,
            self.0.settings.read,
            self.0.broadcaster.clone(),
            move |e| report_failure(session, started_at, e),
        ));

        Ok(Outcome::Acquiring)
    }

    /// Where the session is right now.
    pub async fn state(&self) -> ConnectionState {
        let (state, notice) = {
            let mut slot = self.0.slot.lock().await;
            let notice = slot.reap().await;
            (slot.state(), notice)
        };
        self.notify(notice).await;

        state
    }

    /// A snapshot of the session.
    pub async fn status(&self) -> SessionStatus {
        let (state, port, notice) = {
            let mut slot = self.0.slot.lock().await;
            let notice = slot.reap().await;
            let port = slot.live.as_ref().map(|live| live.config.clone());
            (slot.state(), port, notice)
        };
        self.notify(notice).await;

        SessionStatus {
            state,
            port,
            subscribers: self.0.broadcaster.len().await,
        }
    }

    /// Where subscribers register.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.0.broadcaster
    }

    /// Port settings used when a connect request leaves them out.
    pub fn defaults(&self) -> &PortConfig {
        &self.0.settings.defaults
    }

    /// Close the port, if open.
    pub async fn shutdown(&self) {
        if let Some(config) = self.0.slot.lock().await.teardown().await {
            info!(%config, "Port closed at shutdown");
        }
    }

    async fn read_failed(&self, started_at: u64, error: Error) {
        let config = {
            let mut slot = self.0.slot.lock().await;
            if slot.epoch != started_at {
                trace!("Failure of an old read loop, already handled");
                return;
            }
            slot.teardown().await
        };

        if let Some(config) = config {
            self.notify(Some(lost_notice(&config, &error))).await;
        }
    }

    async fn notify(&self, notice: Option<String>) {
        if let Some(notice) = notice {
            warn!(%notice, "Telling subscribers");
            self.0.broadcaster.broadcast(&Outbound::Status(notice)).await;
        }
    }
}

fn report_failure(session: Weak<Session>, started_at: u64, error: Error) {
    let Some(session) = session.upgrade() else {
        return;
    };

    tokio::spawn(
        async move {
            SessionHandle(session).read_failed(started_at, error).await;
        }
        .instrument(info_span!("ReadFailure")),
    );
}
