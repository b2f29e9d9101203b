//! Discovery of containers coming and going.
//!
//! One long-poll on the engine's `/events` endpoint feeds the router's
//! queue: a `start` or `create` action becomes `Created`, a `die` becomes
//! `Destroyed`. `die` is the one action every teardown path goes through,
//! so later `destroy`/`kill` notifications would only be duplicates.
//! The watcher keeps its own since-cursor so a reconnect replays at most a
//! sliver of history.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cursor::{self, Cursor};
use crate::docker::{Client, DockerError};
use crate::internal_events::{InternalEvent, MobyEventReceived, WatchException};
use crate::supervise::{self, BackoffPolicy, Flow};

/// What the router hears about the world.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DiscoveryMessage {
    Created(String),
    Destroyed(String),
    Checkpoint,
    Terminate,
}

pub struct Watcher {
    docker: Client,
    queue: mpsc::Sender<DiscoveryMessage>,
    since: Cursor,
}

impl Watcher {
    /// Watch for events that happen after `since`.
    pub fn new(docker: Client, queue: mpsc::Sender<DiscoveryMessage>, since: String) -> Self {
        Self {
            docker,
            queue,
            since: Cursor::new(since),
        }
    }

    pub async fn run(self, token: CancellationToken) {
        supervise::run_supervised(
            "watcher",
            &token.clone(),
            BackoffPolicy::default(),
            || self.watch_once(),
            |error: &DockerError| {
                WatchException {
                    class: error.class(),
                    error,
                }
                .emit();
            },
        )
        .await;
    }

    async fn watch_once(&self) -> Result<Flow, DockerError> {
        let since = cursor::unix_fraction(
            cursor::successor(&self.since.get()).unwrap_or_else(|_| chrono::Utc::now()),
        );
        let mut events = self.docker.events_since(&since).await?;

        while let Some(event) = events.next().await {
            let event = event?;
            MobyEventReceived {
                action: &event.action,
            }
            .emit();
            self.since.advance(&event.timestamp());

            if event.kind != "container" {
                continue;
            }
            let message = match event.action.as_str() {
                "start" | "create" => DiscoveryMessage::Created(event.container_id().to_string()),
                "die" => DiscoveryMessage::Destroyed(event.container_id().to_string()),
                _ => continue,
            };
            debug!(
                message = "Observed container lifecycle event.",
                action = %event.action,
                container_id = %event.container_id(),
            );
            if self.queue.send(message).await.is_err() {
                // Router is gone; nothing left to discover for.
                return Ok(Flow::Finished);
            }
        }

        // The engine closed the long-poll; reconnect from the cursor.
        Ok(Flow::Continue)
    }
}
