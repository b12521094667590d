use std::{net::SocketAddr, sync::Arc};

use tokio::sync::mpsc;

use futures::{sink::Sink, stream::Stream, SinkExt, StreamExt};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, WebSocketUpgrade,
    },
    response::IntoResponse,
    Extension, TypedHeader,
};

use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    actions::{Envelope, Outbound, Request},
    broadcaster::Subscriber,
    error::Error,
    session::{Outcome, SessionHandle},
};

/// A websocket client, as seen by the broadcaster.
/// Deliveries are queued on the outbox which the client's write task drains.
struct WebsocketSubscriber {
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl Subscriber for WebsocketSubscriber {
    fn deliver(&self, message: &Outbound) -> Result<(), Error> {
        self.outbox
            .send(Envelope::from(message))
            .map_err(|_| Error::SubscriberGone)
    }
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(session): Extension<SessionHandle>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}`@`{addr}` connected", user_agent.as_str());
    }

    ws.on_upgrade(move |socket| {
        let span = info_span!("Subscriber", %addr);

        handle_websocket(socket, session).instrument(span)
    })
}

async fn reply_to(request_text: &str, session: &SessionHandle) -> Envelope {
    let command = Request::parse(request_text)
        .and_then(|request| request.into_command(session.defaults()));

    match command {
        Ok(command) => Envelope::from(session.apply(command).await),
        Err(e) => {
            debug!(%e, "Unusable request");
            Envelope::from(Err::<Outcome, _>(e))
        }
    }
}

pub(crate) async fn read<S>(
    mut receiver: S,
    outbox: mpsc::UnboundedSender<Envelope>,
    session: SessionHandle,
) where
    S: Unpin,
    S: Stream<Item = Result<Message, axum::Error>>,
{
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(request_text) => {
                trace!(%request_text, "client request");

                let reply = reply_to(&request_text, &session).await;

                if outbox.send(reply).is_err() {
                    debug!("outbox closed");
                    break;
                }
            }
            Message::Binary(_) => {
                debug!("client sent binary data");
            }
            Message::Ping(_) => {
                debug!("socket ping");
            }
            Message::Pong(_) => {
                debug!("socket pong");
            }
            Message::Close(_) => {
                debug!("client disconnected");
            }
        }
    }

    debug!("no more requests");
}

pub(crate) async fn write(
    mut sender: impl Sink<Message> + Unpin,
    mut receiver: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = receiver.recv().await {
        let text = match envelope.serialize() {
            Ok(text) => text,
            Err(e) => {
                warn!(%e, "Could not serialize, skipping");
                continue;
            }
        };

        if sender.send(Message::Text(text)).await.is_err() {
            debug!("client disconnected");
            return;
        }
        trace!("Envelope flushed");
    }
}

pub(crate) async fn handle_websocket(websocket: WebSocket, session: SessionHandle) {
    let (stream_sender, stream_receiver) = websocket.split();
    let (outbox, outbox_receiver) = mpsc::unbounded_channel::<Envelope>();

    let subscriber = Arc::new(WebsocketSubscriber {
        outbox: outbox.clone(),
    });
    let id = session.broadcaster().add(&subscriber).await;

    let read_handle = tokio::spawn(
        read(stream_receiver, outbox, session.clone()).instrument(info_span!("Read", %id)),
    );
    let write_handle = tokio::spawn(
        write(stream_sender, outbox_receiver).instrument(info_span!("Write", %id)),
    );

    match read_handle.await {
        Ok(()) => debug!("Read task joined"),
        Err(e) => warn!("Read task join error: {e:?}"),
    }

    session.broadcaster().remove(id).await;
    drop(subscriber);

    debug!("Aborting write task");
    // This ensures the underlying TCP connection gets closed,
    // which signals the client that the session is over.
    write_handle.abort();
}
