use std::collections::VecDeque;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};
use tungstenite::protocol::Message;

use crate::{
    actions::{Envelope, Request},
    error::Error,
    record::OutboundRecord,
};

/// A websocket connection to a relay server.
///
/// Records are broadcast to every client at any time, so they may arrive
/// while waiting for the reply to a request.
/// Such records are kept and handed out by [`ClientHandle::next_record`].
pub struct ClientHandle {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending_records: VecDeque<OutboundRecord>,
}

impl ClientHandle {
    /// Connect to the server at the given address and port.
    pub async fn new(address: &str, port: u16) -> Result<Self, Error> {
        let url = format!("ws://{address}:{port}/client");
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;

        info!(%url, "Connected");

        Ok(Self {
            stream,
            pending_records: VecDeque::new(),
        })
    }

    /// Send a request without waiting for the reply.
    pub async fn send(&mut self, request: &Request) -> Result<(), Error> {
        self.send_text(request.serialize()?).await
    }

    /// Send any text frame.
    pub async fn send_text(&mut self, text: String) -> Result<(), Error> {
        trace!(%text, "Sending");
        self.stream.send(Message::Text(text)).await?;

        Ok(())
    }

    /// Wait for the next message from the server, whatever it is.
    pub async fn next_envelope(&mut self) -> Result<Envelope, Error> {
        loop {
            let text = match self.stream.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Error::WebsocketIssue("The server closed the connection".into()))
                }
                Some(Ok(other)) => {
                    debug!(?other, "Ignoring non-text message");
                    continue;
                }
                Some(Err(e)) => return Err(e.into()),
            };

            return serde_json::from_str(&text).map_err(|e| Error::BadJson {
                request: text,
                problem: e.to_string(),
            });
        }
    }

    /// Send a request and wait for its reply.
    ///
    /// An error reply becomes [`Error::Rejected`].
    /// Status notices are not told apart from replies.
    pub async fn request(&mut self, request: &Request) -> Result<String, Error> {
        self.send(request).await?;

        loop {
            let envelope = self.next_envelope().await?;

            if let Some(record) = envelope.record() {
                self.pending_records.push_back(record);
                continue;
            }

            return match envelope {
                Envelope::Data { data } => Ok(data),
                Envelope::Error { error } => Err(Error::Rejected(error)),
            };
        }
    }

    /// Connect the relay to a port.
    pub async fn connect(&mut self, port: &str, baudrate: u32) -> Result<String, Error> {
        self.request(&Request::connect(port, baudrate)).await
    }

    /// Start acquisition.
    pub async fn start(&mut self) -> Result<String, Error> {
        self.request(&Request::start()).await
    }

    /// Stop acquisition.
    pub async fn stop(&mut self) -> Result<String, Error> {
        self.request(&Request::stop()).await
    }

    /// Close the port.
    pub async fn disconnect(&mut self) -> Result<String, Error> {
        self.request(&Request::disconnect()).await
    }

    /// Write a payload to the device.
    pub async fn send_raw(&mut self, payload: &str) -> Result<String, Error> {
        self.request(&Request::send_raw(payload)).await
    }

    /// Wait for the next record, skipping status lines.
    pub async fn next_record(&mut self) -> Result<OutboundRecord, Error> {
        if let Some(record) = self.pending_records.pop_front() {
            return Ok(record);
        }

        loop {
            match self.next_envelope().await? {
                envelope @ Envelope::Data { .. } => match envelope.record() {
                    Some(record) => return Ok(record),
                    None => debug!(?envelope, "Skipping status"),
                },
                Envelope::Error { error } => return Err(Error::Rejected(error)),
            }
        }
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<(), Error> {
        self.stream.close(None).await?;

        Ok(())
    }
}
