//! The per-container worker: one long-lived task that tails one
//! container's logs, turns lines into events, and keeps the read cursor.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use regex::{Regex, RegexBuilder};
use serde_json::{json, Map, Value};
use snafu::{ResultExt, Snafu};
use std::sync::LazyLock;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cursor::{self, Cursor, TimestampError};
use crate::docker::{Client, ContainerInspect, DockerError};
use crate::event;
use crate::framing::{FramingError, LogStreamDecoder, StreamLabel};
use crate::internal_events::{
    ContainerTerminated, CountersPrimed, InternalEvent, LastLogEntryAt, LogEntryParseError,
    LogEntryRead, LogEntrySent, ReadException,
};
use crate::sampler::Sampler;
use crate::sink::SinkHandle;
use crate::supervise::{self, BackoffPolicy, Flow};

const LABEL_PREFIX: &str = "org.discourse.mobystash.";

static TRUTHY: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"^(yes|y|1|on|true|t)$")
        .case_insensitive(true)
        .build()
        .unwrap()
});

static FALSY: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"^(no|n|0|off|false|f)$")
        .case_insensitive(true)
        .build()
        .unwrap()
});

pub(crate) fn truthy(value: &str) -> bool {
    TRUTHY.is_match(value)
}

pub(crate) fn falsy(value: &str) -> bool {
    FALSY.is_match(value)
}

#[derive(Debug, Snafu)]
pub enum WorkerError {
    #[snafu(display("{source}"))]
    Docker { source: DockerError },

    #[snafu(display("{source}"))]
    Framing { source: FramingError },

    #[snafu(display("{source}"))]
    Timestamp { source: TimestampError },
}

impl WorkerError {
    fn class(&self) -> &'static str {
        match self {
            WorkerError::Docker { source } => source.class(),
            WorkerError::Framing { .. } => "framing",
            WorkerError::Timestamp { .. } => "timestamp",
        }
    }
}

/// Everything derived from the engine's inspect record and the container's
/// labels; fixed for the lifetime of the worker.
#[derive(Debug)]
pub struct ContainerMetadata {
    pub id: String,
    pub name: String,
    pub tags: Map<String, Value>,
    pub capture_logs: bool,
    pub parse_syslog: bool,
    pub filter_regex: Option<Regex>,
    pub tty: bool,
}

impl ContainerMetadata {
    pub fn from_inspect(inspect: &ContainerInspect) -> Self {
        let name = inspect.name.trim_start_matches('/').to_string();

        let mut capture_logs = true;
        let mut parse_syslog = false;
        let mut filter_regex = None;
        let mut tags = Map::new();

        for (label, value) in &inspect.config.labels {
            let Some(key) = label.strip_prefix(LABEL_PREFIX) else {
                continue;
            };
            match key {
                "disable" => capture_logs = !TRUTHY.is_match(value),
                "parse_syslog" => parse_syslog = TRUTHY.is_match(value),
                "filter_regex" => match Regex::new(value) {
                    Ok(re) => filter_regex = Some(re),
                    Err(error) => warn!(
                        message = "Ignoring unparseable filter_regex label.",
                        container_id = %inspect.id,
                        %error,
                    ),
                },
                _ => {
                    if let Some(path) = key.strip_prefix("tag.") {
                        event::deep_merge(&mut tags, nest(path, value));
                    }
                }
            }
        }

        // Label tags may extend moby.* but the identifying fields always
        // come from the engine.
        event::deep_merge(
            &mut tags,
            match json!({
                "moby": {
                    "name": name,
                    "id": inspect.id,
                    "hostname": inspect.config.hostname,
                    "image": inspect.config.image,
                    "image_id": inspect.image_id,
                }
            }) {
                Value::Object(map) => map,
                _ => unreachable!(),
            },
        );

        Self {
            id: inspect.id.clone(),
            name,
            tags,
            capture_logs,
            parse_syslog,
            filter_regex,
            tty: inspect.config.tty,
        }
    }

    fn streams(&self) -> &'static [StreamLabel] {
        if self.tty {
            &[StreamLabel::Tty]
        } else {
            &[StreamLabel::Stdout, StreamLabel::Stderr]
        }
    }
}

/// Turn a dotted label path into a nested single-leaf object:
/// `a.b.c` + `v` becomes `{"a":{"b":{"c":"v"}}}`.
fn nest(path: &str, value: &str) -> Map<String, Value> {
    let mut current = Value::String(value.to_string());
    for part in path.rsplit('.') {
        let mut map = Map::new();
        map.insert(part.to_string(), current);
        current = Value::Object(map);
    }
    match current {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub struct Worker {
    meta: ContainerMetadata,
    cursor: Cursor,
    docker: Client,
    sink: SinkHandle,
    sampler: Arc<Sampler>,
    token: CancellationToken,
}

impl Worker {
    pub fn new(
        meta: ContainerMetadata,
        cursor: Cursor,
        docker: Client,
        sink: SinkHandle,
        sampler: Arc<Sampler>,
        token: CancellationToken,
    ) -> Self {
        Self {
            meta,
            cursor,
            docker,
            sink,
            sampler,
            token,
        }
    }

    pub async fn run(self) {
        CountersPrimed {
            name: &self.meta.name,
            id: &self.meta.id,
            streams: self.meta.streams(),
        }
        .emit();

        if !self.meta.capture_logs {
            info!(
                message = "Log capture disabled by label.",
                container_name = %self.meta.name,
                container_id = %self.meta.id,
            );
            self.token.cancelled().await;
            return;
        }

        debug!(
            message = "Following container logs.",
            container_name = %self.meta.name,
            container_id = %self.meta.id,
            since = %self.cursor.get(),
        );

        let token = self.token.clone();
        supervise::run_supervised(
            "worker",
            &token,
            BackoffPolicy::default(),
            || self.run_once(),
            |error: &WorkerError| {
                ReadException {
                    name: &self.meta.name,
                    id: &self.meta.id,
                    class: error.class(),
                    error,
                }
                .emit();
            },
        )
        .await;
    }

    /// One pass of the main loop: figure out what state the container is
    /// in and either wait for it to start or follow its log stream.
    async fn run_once(&self) -> Result<Flow, WorkerError> {
        let inspect = match self.docker.inspect(&self.meta.id).await {
            Err(error) if error.is_gone() => return Ok(self.terminated()),
            other => other.context(DockerSnafu)?,
        };

        if !inspect.state.is_running() {
            return self.wait_for_start().await;
        }
        self.follow_logs().await
    }

    fn terminated(&self) -> Flow {
        ContainerTerminated {
            name: &self.meta.name,
            id: &self.meta.id,
        }
        .emit();
        Flow::Finished
    }

    fn since(&self) -> Result<String, WorkerError> {
        let next = cursor::successor(&self.cursor.get()).context(TimestampSnafu)?;
        Ok(cursor::unix_fraction(next))
    }

    /// The container is stopped. Watch the event stream (which also moves
    /// the cursor forward, so a later resume does not replay history) until
    /// something happens to this container, then go around and re-inspect.
    async fn wait_for_start(&self) -> Result<Flow, WorkerError> {
        debug!(
            message = "Container is not running, waiting for it to start.",
            container_name = %self.meta.name,
            container_id = %self.meta.id,
        );

        let mut events = self
            .docker
            .events_since(&self.since()?)
            .await
            .context(DockerSnafu)?;

        while let Some(event) = events.next().await {
            let event = event.context(DockerSnafu)?;
            self.cursor.advance(&event.timestamp());
            if event.kind == "container" && event.container_id() == self.meta.id {
                return Ok(Flow::Continue);
            }
        }
        Ok(Flow::Continue)
    }

    async fn follow_logs(&self) -> Result<Flow, WorkerError> {
        let body = match self.docker.logs_since(&self.meta.id, &self.since()?).await {
            Err(error) if error.is_gone() => return Ok(self.terminated()),
            other => other.context(DockerSnafu)?,
        };

        let reader = StreamReader::new(
            body.map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error)),
        );
        let mut lines = FramedRead::new(reader, LogStreamDecoder::for_tty(self.meta.tty));

        while let Some(item) = lines.next().await {
            let (label, line) = item.context(FramingSnafu)?;
            self.send_event(&line, label).await;
        }

        // The engine closed the stream; re-inspect and pick up from the
        // cursor.
        Ok(Flow::Continue)
    }

    /// Transform one raw log line into an event and hand it to the sink.
    async fn send_event(&self, line: &[u8], label: StreamLabel) {
        LogEntryRead {
            name: &self.meta.name,
            id: &self.meta.id,
            stream: label,
        }
        .emit();

        let text = String::from_utf8_lossy(line);
        let parsed = text
            .split_once(' ')
            .and_then(|(prefix, rest)| cursor::parse(prefix).ok().map(|ts| (ts, rest)));
        let Some((timestamp, message)) = parsed else {
            LogEntryParseError {
                name: &self.meta.name,
                id: &self.meta.id,
                line: &text,
            }
            .emit();
            return;
        };

        let canonical = cursor::format(timestamp);
        self.cursor.advance(&canonical);
        LastLogEntryAt {
            name: &self.meta.name,
            id: &self.meta.id,
            at_unix_seconds: cursor::unix_seconds(timestamp),
        }
        .emit();

        let (message, syslog_fields) = if self.meta.parse_syslog {
            crate::syslog::parse(message)
        } else {
            (message.to_string(), Map::new())
        };

        let Some(sample_metadata) = self.sampler.sample(&message) else {
            return;
        };

        if let Some(filter) = &self.meta.filter_regex {
            if filter.is_match(&message) {
                return;
            }
        }

        let event = event::assemble(
            &message,
            &canonical,
            label.as_str(),
            syslog_fields,
            sample_metadata,
            &self.meta.tags,
        );
        self.sink.send(&event).await;

        LogEntrySent {
            name: &self.meta.name,
            id: &self.meta.id,
            stream: label,
        }
        .emit();
    }
}
