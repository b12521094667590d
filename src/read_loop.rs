//! Background acquisition: reading lines from the port and handing records to the broadcaster.

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::{
    actions::Outbound,
    broadcaster::Broadcaster,
    error::Error,
    record::{OutboundRecord, RecordFormatter},
    serial::connection::PortReader,
};

/// How the loop reads.
#[derive(Debug, Clone, Copy)]
pub struct ReadSettings {
    /// Longest single wait for a line.
    /// Bounds how long a read may be outstanding.
    pub read_timeout: Duration,

    /// Records buffered between the reader and the broadcaster.
    pub queue_capacity: usize,
}

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            queue_capacity: 64,
        }
    }
}

/// A running acquisition.
///
/// One task reads the port, another broadcasts what it formats.
/// Dropping this cancels both.
pub struct ReadLoop {
    cancel: CancellationToken,
    reader: Option<JoinHandle<Option<PortReader>>>,
    forwarder: Option<JoinHandle<()>>,
}

impl ReadLoop {
    /// Start reading.
    ///
    /// If reading fails, `on_error` is called once and the loop ends.
    pub fn start<F>(
        mut reader: PortReader,
        formatter: RecordFormatter,
        settings: ReadSettings,
        broadcaster: Broadcaster,
        on_error: F,
    ) -> Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (records_tx, mut records_rx) =
            mpsc::channel::<OutboundRecord>(settings.queue_capacity.max(1));

        let span = info_span!("ReadLoop", path = %reader.path());

        let reader_cancel = cancel.clone();
        let reader_task = async move {
            debug!("Reading");

            loop {
                let line = tokio::select! {
                    biased;
                    _ = reader_cancel.cancelled() => break,
                    line = reader.read_line(settings.read_timeout) => line,
                };

                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(%e, "Read failed, stopping");
                        on_error(e);
                        return None;
                    }
                };

                let Some(record) = formatter.format(&line) else {
                    continue;
                };

                tokio::select! {
                    biased;
                    _ = reader_cancel.cancelled() => break,
                    sent = records_tx.send(record) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }

            debug!("Stopped reading");
            Some(reader)
        }
        .instrument(span.clone());

        let forwarder_cancel = cancel.clone();
        let forwarder_task = async move {
            loop {
                let record = tokio::select! {
                    biased;
                    _ = forwarder_cancel.cancelled() => break,
                    record = records_rx.recv() => match record {
                        Some(record) => record,
                        None => break,
                    },
                };

                let delivered = broadcaster.broadcast(&Outbound::Record(record)).await;
                trace!(%delivered, "Record broadcast");
            }
        }
        .instrument(span);

        Self {
            cancel,
            reader: Some(tokio::spawn(reader_task)),
            forwarder: Some(tokio::spawn(forwarder_task)),
        }
    }

    /// Stop reading and wait for both tasks to end.
    ///
    /// Returns the reader, unless reading had failed.
    /// After the first call this returns `None`.
    pub async fn stop(&mut self) -> Option<PortReader> {
        self.cancel.cancel();

        let reader = match self.reader.take() {
            Some(handle) => match handle.await {
                Ok(reader) => reader,
                Err(e) => {
                    warn!(?e, "Reader task did not end cleanly");
                    None
                }
            },
            None => None,
        };

        if let Some(handle) = self.forwarder.take() {
            if let Err(e) = handle.await {
                warn!(?e, "Forwarder task did not end cleanly");
            }
        }

        reader
    }

    /// Whether the reader task has ended, for example because reading failed.
    pub fn is_finished(&self) -> bool {
        self.reader
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }
}

impl Drop for ReadLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        broadcaster::Subscriber,
        mock::MockOpener,
        serial::{
            connection::{PortConnection, PortWriter},
            Framing, PortConfig,
        },
    };

    #[derive(Default)]
    struct Inbox(Mutex<Vec<Outbound>>);

    impl Subscriber for Inbox {
        fn deliver(&self, message: &Outbound) -> Result<(), Error> {
            self.0.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    impl Inbox {
        fn records(&self) -> Vec<OutboundRecord> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|message| match message {
                    Outbound::Record(record) => Some(record.clone()),
                    Outbound::Status(_) => None,
                })
                .collect()
        }
    }

    fn settings() -> ReadSettings {
        ReadSettings {
            read_timeout: Duration::from_millis(50),
            queue_capacity: 4,
        }
    }

    /// The device stays open for as long as either half is alive.
    fn open(opener: &MockOpener, path: &str) -> (PortReader, PortWriter) {
        PortConnection::open(opener, &PortConfig::new(path, 9600), &Framing::default())
            .unwrap()
            .into_split()
    }

    async fn wait_for(inbox: &Inbox, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while inbox.records().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn records_reach_subscribers_and_stop_returns_reader() {
        let opener = MockOpener::new();
        let (reader, _writer) = open(&opener, "COM_LOOP");
        let mut device = opener.device("COM_LOOP").unwrap();

        let broadcaster = Broadcaster::new();
        let inbox = Arc::new(Inbox::default());
        broadcaster.add(&inbox).await;

        let mut read_loop = ReadLoop::start(
            reader,
            RecordFormatter::default(),
            settings(),
            broadcaster,
            |e| panic!("unexpected {e}"),
        );

        device.emit_line("garbage").await.unwrap();
        device.emit_line(r#"{"voltage": 3.3}"#).await.unwrap();
        wait_for(&inbox, 1).await;

        let reader = read_loop.stop().await;
        assert!(reader.is_some());
        assert!(read_loop.stop().await.is_none());

        let records = inbox.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("voltage"), Some(&json!(3.3)));
    }

    #[tokio::test]
    async fn nothing_is_broadcast_after_stop() {
        let opener = MockOpener::new();
        let (reader, _writer) = open(&opener, "COM_QUIET");
        let mut device = opener.device("COM_QUIET").unwrap();

        let broadcaster = Broadcaster::new();
        let inbox = Arc::new(Inbox::default());
        broadcaster.add(&inbox).await;

        let mut read_loop = ReadLoop::start(
            reader,
            RecordFormatter::default(),
            settings(),
            broadcaster,
            |_| {},
        );
        let _reader = read_loop.stop().await;

        device.emit_line(r#"{"current": 1}"#).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(inbox.records().is_empty());
    }

    #[tokio::test]
    async fn failure_calls_on_error_once() {
        let opener = MockOpener::new();
        let (reader, _writer) = open(&opener, "COM_FLAKY");
        let device = opener.device("COM_FLAKY").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut read_loop = ReadLoop::start(
            reader,
            RecordFormatter::default(),
            settings(),
            Broadcaster::new(),
            move |e| tx.send(e).unwrap(),
        );

        drop(device);

        let e = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(e, Error::IoFault(_)));

        assert!(read_loop.stop().await.is_none());
        assert!(read_loop.is_finished());
        assert!(rx.recv().await.is_none());
    }
}
