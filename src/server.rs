use std::net::SocketAddr;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Extension, Json, Router};
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    config::Config, error::Error, serial::serial_port, session::SessionHandle, websocket,
};

/// The default port to run the server on.
pub const DEFAULT_PORT: u16 = 3123;

/// Serve websocket clients and the HTTP routes until the server fails.
///
/// With no `port`, the OS picks one.
/// The port listened on is sent on `allocated_port` if given.
pub async fn serve(
    config: Config,
    session: SessionHandle,
    port: Option<u16>,
    allocated_port: Option<oneshot::Sender<u16>>,
) -> Result<(), Error> {
    config.validate()?;

    let app = Router::new()
        .route("/client", get(websocket::ws_handler))
        .route("/state", get(show_state))
        .route("/ports", get(show_ports))
        .route("/config", get(show_config))
        .route("/version", get(show_version))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Each websocket applies commands to the one session
                .layer(Extension(session))
                // The relay config should be known to the web server
                .layer(Extension(config)),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(0)));
    let server = axum::Server::try_bind(&addr)
        .map_err(|e| Error::InternalIssue(format!("Could not bind to {addr}: {e}")))?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        if port_reply.send(addr.port()).is_err() {
            debug!("Nobody is waiting for the allocated port");
        }
    }

    info!("listening on {}", addr);

    server.await.map_err(|e| {
        warn!(%e, "Server failed");
        Error::InternalIssue(e.to_string())
    })
}

/// Start the server on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(
    config: Config,
    session: SessionHandle,
    allocated_port: oneshot::Sender<u16>,
) -> Result<(), Error> {
    serve(config, session, None, Some(allocated_port)).await
}

/// Start the server on the given port.
pub async fn run_on_port(config: Config, session: SessionHandle, port: u16) -> Result<(), Error> {
    serve(config, session, Some(port), None).await
}

async fn show_state(Extension(session): Extension<SessionHandle>) -> impl IntoResponse {
    Json(session.status().await)
}

async fn show_ports() -> impl IntoResponse {
    match serial_port::available_ports() {
        Ok(ports) => (StatusCode::OK, Json(ports)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn show_config(Extension(config): Extension<Config>) -> impl IntoResponse {
    match config.serialize_pretty() {
        Ok(config) => (StatusCode::OK, config),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn show_version() -> impl IntoResponse {
    format!("Serial Relay v{}\n", env!("CARGO_PKG_VERSION"))
}
