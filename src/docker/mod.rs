//! Client for the subset of the engine HTTP API this daemon consumes:
//! container listing, inspection, the event long-poll, and the streaming
//! logs endpoint.

mod transport;

use std::collections::HashMap;
use std::path::PathBuf;

use futures::{Stream, StreamExt, TryStreamExt};
use hyper::{Body, Request, StatusCode, Uri};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

use crate::cursor;
use transport::Transport;

#[derive(Debug, Snafu)]
pub enum DockerError {
    #[snafu(display("unsupported DOCKER_HOST {host:?}: expected unix:// or tcp://"))]
    InvalidHost { host: String },

    #[snafu(display("container {id} not found"))]
    NotFound { id: String },

    #[snafu(display("engine returned status {status} for {path}"))]
    Status { status: u16, path: String },

    #[snafu(display("engine request to {path} failed: {source}"))]
    Transport { path: String, source: hyper::Error },

    #[snafu(display("invalid engine request path {path:?}: {source}"))]
    InvalidPath { path: String, source: http::Error },

    #[snafu(display("undecodable engine response from {path}: {source}"))]
    Decode {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("engine event stream broke: {source}"))]
    EventStream { source: LinesCodecError },
}

impl DockerError {
    /// Whether the engine has told us the container no longer exists (or is
    /// in a state it cannot serve): the worker should retire rather than
    /// retry.
    pub fn is_gone(&self) -> bool {
        match self {
            DockerError::NotFound { .. } => true,
            DockerError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Coarse classification used as a metric label.
    pub fn class(&self) -> &'static str {
        match self {
            DockerError::InvalidHost { .. } => "invalid_host",
            DockerError::NotFound { .. } => "not_found",
            DockerError::Status { .. } => "status",
            DockerError::Transport { .. } => "transport",
            DockerError::InvalidPath { .. } => "invalid_path",
            DockerError::Decode { .. } => "decode",
            DockerError::EventStream { .. } => "event_stream",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ContainerInspect {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    /// The image digest, as opposed to `Config.Image` which is its name.
    #[serde(rename = "Image", default)]
    pub image_id: String,
    #[serde(rename = "Config", default)]
    pub config: ContainerConfig,
    #[serde(rename = "State", default)]
    pub state: ContainerState,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Hostname", default)]
    pub hostname: String,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "Tty", default)]
    pub tty: bool,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Status", default)]
    pub status: String,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// One message off the `/events` long-poll. Current engines put the subject
/// id under `Actor.ID`; very old ones used a top-level `ID`. Both are read.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Actor", default)]
    pub actor: Option<EventActor>,
    #[serde(rename = "time", default)]
    pub time: i64,
    #[serde(rename = "timeNano", default)]
    pub time_nano: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
}

impl EventMessage {
    pub fn container_id(&self) -> &str {
        if !self.id.is_empty() {
            &self.id
        } else {
            self.actor.as_ref().map_or("", |actor| actor.id.as_str())
        }
    }

    /// The event's time in canonical cursor form.
    pub fn timestamp(&self) -> String {
        if self.time_nano != 0 {
            cursor::from_unix_nanos(self.time_nano)
        } else {
            cursor::from_unix_nanos(self.time.saturating_mul(1_000_000_000))
        }
    }
}

pub type EventStream =
    std::pin::Pin<Box<dyn Stream<Item = Result<EventMessage, DockerError>> + Send>>;

#[derive(Clone, Debug)]
pub struct Client {
    http: hyper::Client<Transport, Body>,
    authority: String,
}

impl Client {
    /// Build a client from a `DOCKER_HOST` style address: `unix:///path` or
    /// `tcp://host:port` (`http://` is accepted as a synonym for `tcp://`).
    pub fn connect(docker_host: &str) -> Result<Self, DockerError> {
        let (transport, authority) = if let Some(path) = docker_host.strip_prefix("unix://") {
            if path.is_empty() {
                return InvalidHostSnafu { host: docker_host }.fail();
            }
            (
                Transport::Unix {
                    socket: PathBuf::from(path),
                },
                "docker".to_string(),
            )
        } else if let Some(addr) = docker_host
            .strip_prefix("tcp://")
            .or_else(|| docker_host.strip_prefix("http://"))
        {
            let addr = addr.trim_end_matches('/');
            if addr.is_empty() {
                return InvalidHostSnafu { host: docker_host }.fail();
            }
            (Transport::Tcp, addr.to_string())
        } else {
            return InvalidHostSnafu { host: docker_host }.fail();
        };

        let http = hyper::Client::builder().build(transport);
        Ok(Self { http, authority })
    }

    fn uri(&self, path_and_query: &str) -> Result<Uri, DockerError> {
        Uri::builder()
            .scheme("http")
            .authority(self.authority.as_str())
            .path_and_query(path_and_query)
            .build()
            .context(InvalidPathSnafu {
                path: path_and_query,
            })
    }

    async fn get(&self, path_and_query: &str) -> Result<hyper::Response<Body>, DockerError> {
        let uri = self.uri(path_and_query)?;
        let request = Request::get(uri).body(Body::empty()).context(InvalidPathSnafu {
            path: path_and_query,
        })?;
        self.http.request(request).await.context(TransportSnafu {
            path: path_and_query,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path_and_query: &str,
        id: &str,
    ) -> Result<T, DockerError> {
        let response = self.get(path_and_query).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return NotFoundSnafu { id }.fail();
        }
        if !status.is_success() {
            return StatusSnafu {
                status: status.as_u16(),
                path: path_and_query,
            }
            .fail();
        }

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .context(TransportSnafu {
                path: path_and_query,
            })?;
        serde_json::from_slice(&body).context(DecodeSnafu {
            path: path_and_query,
        })
    }

    /// `GET /containers/json`: every running container.
    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        self.get_json("/containers/json", "").await
    }

    /// `GET /containers/{id}/json`.
    pub async fn inspect(&self, id: &str) -> Result<ContainerInspect, DockerError> {
        self.get_json(&format!("/containers/{id}/json"), id).await
    }

    /// `GET /events?since=...`: newline-delimited JSON, one message per
    /// line, held open by the engine indefinitely.
    pub async fn events_since(&self, since: &str) -> Result<EventStream, DockerError> {
        let path = format!("/events?since={since}");
        let response = self.get(&path).await?;
        let status = response.status();
        if !status.is_success() {
            return StatusSnafu {
                status: status.as_u16(),
                path,
            }
            .fail();
        }

        let reader = StreamReader::new(
            response
                .into_body()
                .map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error)),
        );
        let events = FramedRead::new(reader, LinesCodec::new()).map(
            |line| -> Result<EventMessage, DockerError> {
                let line = line.context(EventStreamSnafu)?;
                serde_json::from_str(&line).context(DecodeSnafu { path: "/events" })
            },
        );
        Ok(Box::pin(events))
    }

    /// `GET /containers/{id}/logs`: the framed (or raw tty) log stream,
    /// followed until the engine closes it. `since` is the
    /// `<secs>.<nanos>` form produced by [`cursor::unix_fraction`].
    pub async fn logs_since(&self, id: &str, since: &str) -> Result<Body, DockerError> {
        let path =
            format!("/containers/{id}/logs?since={since}&timestamps=1&follow=1&stdout=1&stderr=1");
        let response = self.get(&path).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return NotFoundSnafu { id }.fail();
        }
        if !status.is_success() {
            return StatusSnafu {
                status: status.as_u16(),
                path,
            }
            .fail();
        }
        Ok(response.into_body())
    }
}
