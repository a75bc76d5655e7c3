//! Minimal client for the container engine's HTTP API on its Unix socket.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    pin::Pin,
};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use http_body_util::{BodyExt, Empty};
use hyper::{body::Incoming, Method, Request, Response};
use hyper_util::rt::TokioIo;
use log::debug;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tokio::net::UnixStream;

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// `filters={"type":["container"]}`, url-encoded.
const EVENTS_PATH: &str = "/events?filters=%7B%22type%22%3A%5B%22container%22%5D%7D";

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ContainerConfig {
    #[serde(rename = "Hostname", default)]
    pub hostname: String,
    #[serde(rename = "Domainname", default)]
    pub domainname: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EndpointSettings {
    #[serde(rename = "NetworkID", default)]
    pub network_id: String,
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NetworkSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, EndpointSettings>,
}

/// The subset of a container inspection the watcher cares about.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "Config", default)]
    pub config: ContainerConfig,
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EngineEvent {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
    // Pre-1.22 engines only fill these.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub id: String,
}

impl EngineEvent {
    pub fn container(action: &str, id: &str) -> Self {
        EngineEvent {
            kind: "container".to_string(),
            action: action.to_string(),
            actor: EventActor { id: id.to_string() },
            ..Default::default()
        }
    }

    pub fn is_container(&self) -> bool {
        self.kind.is_empty() || self.kind == "container"
    }

    pub fn action(&self) -> &str {
        if self.action.is_empty() {
            &self.status
        } else {
            &self.action
        }
    }

    pub fn container_id(&self) -> &str {
        if self.actor.id.is_empty() {
            &self.id
        } else {
            &self.actor.id
        }
    }
}

pub type EventStream = BoxStream<'static, anyhow::Result<EngineEvent>>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn inspect(&self, id: &str) -> anyhow::Result<ContainerInfo>;

    /// Subscribes to the engine's container event feed.
    async fn events(&self) -> anyhow::Result<EventStream>;
}

pub struct DockerEngine {
    socket_path: PathBuf,
}

impl DockerEngine {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    async fn get(&self, path: &str) -> anyhow::Result<Response<Incoming>> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "failed to connect to container engine at {}",
                    self.socket_path.display()
                )
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("HTTP handshake failed")?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("[Watcher]: Engine connection closed: {}", e);
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("http://localhost{}", path))
            .header("Host", "localhost")
            .body(Empty::<Bytes>::new())
            .context("failed to build request")?;

        let response = sender
            .send_request(request)
            .await
            .context("failed to send request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .context("failed to read response")?
                .to_bytes();
            anyhow::bail!(
                "engine returned error {}: {}",
                status,
                String::from_utf8_lossy(&body).trim()
            );
        }

        Ok(response)
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn inspect(&self, id: &str) -> anyhow::Result<ContainerInfo> {
        let body = self
            .get(&format!("/containers/{}/json", id))
            .await?
            .into_body()
            .collect()
            .await
            .context("failed to read response")?
            .to_bytes();

        serde_json::from_slice(&body).context("failed to parse container inspection")
    }

    async fn events(&self) -> anyhow::Result<EventStream> {
        let body = Box::pin(self.get(EVENTS_PATH).await?.into_body());

        Ok(json_lines(body).boxed())
    }
}

/// Splits a streamed body into newline-delimited JSON events.
fn json_lines<B>(
    body: Pin<Box<B>>,
) -> impl futures::Stream<Item = anyhow::Result<EngineEvent>> + Send + 'static
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    futures::stream::unfold(
        (body, Vec::<u8>::new(), false),
        |(mut body, mut buf, done)| async move {
            if done {
                return None;
            }

            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let event = serde_json::from_slice::<EngineEvent>(&line)
                        .context("malformed engine event");
                    return Some((event, (body, buf, false)));
                }

                match body.frame().await {
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            buf.extend_from_slice(&data);
                        }
                    }
                    Some(Err(e)) => {
                        let err = anyhow::Error::new(e).context("engine event stream failed");
                        return Some((Err(err), (body, buf, true)));
                    }
                    None => return None,
                }
            }
        },
    )
}
