#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::http::StatusCode;
use color_eyre::Result;
use futures::SinkExt;
use futures::StreamExt;
use serial_relay::{
    actions::{Envelope, Outbound},
    broadcaster::{Broadcaster, Subscriber},
    config::Config,
    error::Error,
    mock::MockOpener,
    read_loop::ReadSettings,
    record::OutboundRecord,
    serial::Framing,
    session::{SessionHandle, SessionSettings},
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::info;

pub const LOOPBACK: &str = "COM_MOCK";

pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// A config where [`LOOPBACK`] echoes newline terminated writes back as device lines.
pub fn loopback_config() -> Config {
    Config {
        read_timeout_ms: READ_TIMEOUT.as_millis() as u64,
        framing: Framing {
            write_delimiter: Some(b'\n'),
            ..Default::default()
        },
        loopback_ports: vec![LOOPBACK.into()],
        ..Default::default()
    }
}

pub async fn start_server_with_config(config: Config) -> u16 {
    let (port_tx, port_rx) = oneshot::channel();
    let session = SessionHandle::from_config(&config);

    tokio::spawn(async move {
        serial_relay::server::run_any_port(config, session, port_tx).await
    });

    port_rx
        .await
        .expect("Server should reply with allocated port")
}

pub async fn start_server() -> u16 {
    start_server_with_config(loopback_config()).await
}

pub async fn connect(port: u16) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    info!("Connecting to server on port {port}");
    let (stream, http_response) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/client")).await?;

    assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

    Ok(stream)
}

pub async fn receive(client: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> Result<Envelope> {
    let response = timeout(Duration::from_secs(5), client.next())
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("Stream closed"))??;

    let response = response.to_text()?;
    let response = serde_json::from_str(response)?;

    Ok(response)
}

pub async fn send_receive(
    client: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    to_send: String,
) -> Result<Envelope> {
    client.send(tungstenite::Message::Text(to_send)).await?;
    receive(client).await
}

/// A mock backed session, settings tuned for quick tests.
pub fn mock_session(opener: &MockOpener) -> SessionHandle {
    SessionHandle::new(
        Arc::new(opener.clone()),
        Broadcaster::new(),
        SessionSettings {
            framing: Framing {
                write_delimiter: Some(b'\n'),
                ..Default::default()
            },
            read: ReadSettings {
                read_timeout: READ_TIMEOUT,
                queue_capacity: 16,
            },
            ..Default::default()
        },
    )
}

/// A subscriber forwarding everything it gets to a channel.
pub struct Collector {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Subscriber for Collector {
    fn deliver(&self, message: &Outbound) -> Result<(), Error> {
        self.tx.send(message.clone()).map_err(|_| Error::SubscriberGone)
    }
}

impl Collector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

/// Counts deliveries, and records any delivered after being told it was removed.
#[derive(Default)]
pub struct Counter {
    pub delivered: Mutex<usize>,
    pub removed: Mutex<bool>,
    pub after_removal: Mutex<usize>,
}

impl Subscriber for Counter {
    fn deliver(&self, _message: &Outbound) -> Result<(), Error> {
        *self.delivered.lock().unwrap() += 1;
        if *self.removed.lock().unwrap() {
            *self.after_removal.lock().unwrap() += 1;
        }
        Ok(())
    }
}

pub async fn next_outbound(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Result<Outbound> {
    timeout(Duration::from_secs(2), rx.recv())
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("Collector closed"))
}

pub async fn next_record(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Result<OutboundRecord> {
    loop {
        if let Outbound::Record(record) = next_outbound(rx).await? {
            return Ok(record);
        }
    }
}

/// Give in-flight work a chance to show up.
pub async fn settle() {
    tokio::time::sleep(READ_TIMEOUT * 2).await;
}
