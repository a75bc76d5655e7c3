//! Remote-driver protocol endpoints served on the plugin socket.

use std::{path::Path, sync::Arc};

use anyhow::Context;
use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Request, State},
    http::{Method, StatusCode, Uri},
    routing::{get, post},
    Json, Router,
};
use hyper::{body::Incoming, server::conn::http1};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use tokio::net::UnixListener;
use tower::Service;

use crate::core::driver::Driver;
use crate::core::error::{PluginError, Result};
use crate::core::msg::*;

pub const NETWORK_DRIVER: &str = "NetworkDriver";

#[derive(Clone)]
struct PluginState {
    driver: Arc<Driver>,
    version: Arc<str>,
}

/// A request body decoded as JSON regardless of its content type; the
/// engine does not always send `application/json`.
pub struct PluginRequest<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for PluginRequest<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = PluginError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| PluginError::decode(e.body_text()))?;

        serde_json::from_slice(&body)
            .map(PluginRequest)
            .map_err(PluginError::decode)
    }
}

pub fn router(driver: Arc<Driver>, version: &str) -> Router {
    let state = PluginState {
        driver,
        version: Arc::from(version),
    };

    Router::new()
        .route("/status", get(status))
        .route("/Plugin.Activate", post(activate))
        .route("/NetworkDriver.GetCapabilities", post(capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
        .route("/NetworkDriver.EndpointOperInfo", post(endpoint_info))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(leave))
        .fallback(unhandled)
        .with_state(state)
}

async fn status(State(state): State<PluginState>) -> String {
    format!("netplugin {}\n", state.version)
}

async fn activate() -> Json<HandshakeResponse> {
    debug!("[Daemon]: Handshake");
    Json(HandshakeResponse {
        implements: vec![NETWORK_DRIVER.to_string()],
    })
}

async fn capabilities(State(state): State<PluginState>) -> Json<CapabilitiesResponse> {
    Json(state.driver.capabilities())
}

async fn create_network(
    State(state): State<PluginState>,
    PluginRequest(req): PluginRequest<NetworkRequest>,
) -> Result<Json<EmptyResponse>> {
    state.driver.create_network(req).await.map(Json)
}

async fn delete_network(
    State(state): State<PluginState>,
    PluginRequest(req): PluginRequest<NetworkRequest>,
) -> Result<Json<EmptyResponse>> {
    state.driver.delete_network(req).await.map(Json)
}

async fn create_endpoint(
    State(state): State<PluginState>,
    PluginRequest(req): PluginRequest<CreateEndpointRequest>,
) -> Result<Json<CreateEndpointResponse>> {
    state.driver.create_endpoint(req).await.map(Json)
}

async fn delete_endpoint(
    State(state): State<PluginState>,
    PluginRequest(req): PluginRequest<EndpointRequest>,
) -> Json<EmptyResponse> {
    Json(state.driver.delete_endpoint(req).await)
}

async fn endpoint_info(
    State(state): State<PluginState>,
    PluginRequest(req): PluginRequest<EndpointRequest>,
) -> Json<EndpointInfoResponse> {
    Json(state.driver.endpoint_info(req))
}

async fn join(
    State(state): State<PluginState>,
    PluginRequest(req): PluginRequest<JoinRequest>,
) -> Result<Json<JoinResponse>> {
    state.driver.join(req).await.map(Json)
}

async fn leave(
    State(state): State<PluginState>,
    PluginRequest(req): PluginRequest<EndpointRequest>,
) -> Json<EmptyResponse> {
    Json(state.driver.leave(req).await)
}

async fn unhandled(method: Method, uri: Uri) -> StatusCode {
    warn!("[Daemon]: Unhandled request {} {}", method, uri);
    StatusCode::NOT_FOUND
}

/// Binds `socket_path`, replacing any stale socket left by a previous run.
pub fn bind(socket_path: &Path) -> anyhow::Result<UnixListener> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to remove {}", socket_path.display()))?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    UnixListener::bind(socket_path)
        .with_context(|| format!("failed to listen on {}", socket_path.display()))
}

/// Serves `app` on `listener`, one task per connection. Returns only when
/// accepting fails.
pub async fn serve(listener: UnixListener, app: Router) -> anyhow::Result<()> {
    loop {
        let (stream, _addr) = listener
            .accept()
            .await
            .context("failed to accept connection")?;
        debug!("[Daemon]: Accepted client connection");

        let tower_service = app.clone();
        tokio::spawn(async move {
            let hyper_service =
                hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                    tower_service.clone().call(request)
                });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), hyper_service)
                .await
            {
                if e.is_incomplete_message() {
                    debug!("[Daemon]: Client went away: {}", e);
                } else {
                    error!("[Daemon]: Error serving connection: {}", e);
                }
            }
        });
    }
}

pub async fn run(socket_path: &Path, app: Router) -> anyhow::Result<()> {
    let listener = bind(socket_path)?;
    info!(
        "[Daemon]: Plugin is running and listening on {}",
        socket_path.display()
    );

    serve(listener, app).await
}
