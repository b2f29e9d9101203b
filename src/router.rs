//! The router: owns the worker map and reconciles it against what the
//! discovery watcher reports, checkpoints cursors on a timer, and runs the
//! orderly shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cursor::{self, Cursor};
use crate::docker::Client;
use crate::internal_events::{CheckpointWriteError, CheckpointWritten, InternalEvent};
use crate::sampler::Sampler;
use crate::sink::{Sink, SinkHandle};
use crate::state::{self, CursorMap};
use crate::watcher::{DiscoveryMessage, Watcher};
use crate::worker::{ContainerMetadata, Worker};

const QUEUE_DEPTH: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct WorkerHandle {
    cursor: Cursor,
    token: CancellationToken,
    join: JoinHandle<()>,
}

pub struct Router {
    docker: Client,
    sink: SinkHandle,
    sampler: Arc<Sampler>,
    state_file: PathBuf,
    checkpoint_interval: Duration,
    /// Stops the metrics listener (spawned by main) during teardown.
    metrics_token: CancellationToken,
    queue_tx: mpsc::Sender<DiscoveryMessage>,
    queue_rx: mpsc::Receiver<DiscoveryMessage>,
    workers: HashMap<String, WorkerHandle>,
    persisted: CursorMap,
}

impl Router {
    pub fn new(
        docker: Client,
        sink: SinkHandle,
        sampler: Arc<Sampler>,
        state_file: PathBuf,
        checkpoint_interval: Duration,
        metrics_token: CancellationToken,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
        Self {
            docker,
            sink,
            sampler,
            state_file,
            checkpoint_interval,
            metrics_token,
            queue_tx,
            queue_rx,
            workers: HashMap::new(),
            persisted: CursorMap::new(),
        }
    }

    /// A sender for out-of-band messages; the signal handler uses this to
    /// funnel shutdown through the same queue as everything else.
    pub fn queue(&self) -> mpsc::Sender<DiscoveryMessage> {
        self.queue_tx.clone()
    }

    /// Bring the world up, dispatch until terminated, tear the world down.
    pub async fn run(mut self, sink_writer: Sink) -> Result<(), crate::docker::DockerError> {
        self.persisted = state::load(&self.state_file);

        let watcher_token = CancellationToken::new();
        let watcher = Watcher::new(
            self.docker.clone(),
            self.queue_tx.clone(),
            cursor::format(chrono::Utc::now()),
        );
        let watcher_join = tokio::spawn(watcher.run(watcher_token.clone()));

        let sink_token = CancellationToken::new();
        let sink_join = tokio::spawn(sink_writer.run(sink_token.clone()));

        let ticker = {
            let queue = self.queue_tx.clone();
            let period = self.checkpoint_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if queue.send(DiscoveryMessage::Checkpoint).await.is_err() {
                        return;
                    }
                }
            })
        };

        for summary in self.docker.list_containers().await? {
            self.ensure_worker(&summary.id).await;
        }
        info!(
            message = "Startup complete.",
            containers = self.workers.len(),
        );

        while let Some(message) = self.queue_rx.recv().await {
            match message {
                DiscoveryMessage::Created(id) => self.ensure_worker(&id).await,
                DiscoveryMessage::Destroyed(id) => self.retire_worker(&id),
                DiscoveryMessage::Checkpoint => self.checkpoint(),
                DiscoveryMessage::Terminate => {
                    info!(message = "Shutting down.");
                    ticker.abort();
                    watcher_token.cancel();
                    self.shutdown_workers().await;
                    self.checkpoint();
                    sink_token.cancel();
                    if tokio::time::timeout(SHUTDOWN_GRACE, sink_join).await.is_err() {
                        warn!(message = "Sink did not stop within the grace period.");
                    }
                    self.metrics_token.cancel();
                    watcher_join.abort();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Start a worker for `id` unless one exists. A container that
    /// disappears between discovery and inspection is simply skipped; its
    /// `die` event is either already behind us or about to arrive.
    async fn ensure_worker(&mut self, id: &str) {
        if self.workers.contains_key(id) {
            return;
        }

        let inspect = match self.docker.inspect(id).await {
            Ok(inspect) => inspect,
            // Already gone again; its die event will confirm.
            Err(crate::docker::DockerError::NotFound { .. }) => return,
            Err(error) => {
                warn!(
                    message = "Inspect failed, container will be retried on its next event.",
                    container_id = %id,
                    %error,
                );
                return;
            }
        };

        let meta = ContainerMetadata::from_inspect(&inspect);
        let cursor = Cursor::new(self.inherited_cursor(id));
        let token = CancellationToken::new();
        let worker = Worker::new(
            meta,
            cursor.clone(),
            self.docker.clone(),
            self.sink.clone(),
            Arc::clone(&self.sampler),
            token.clone(),
        );
        let join = tokio::spawn(worker.run());

        debug!(message = "Started worker.", container_id = %id);
        self.workers.insert(
            id.to_string(),
            WorkerHandle {
                cursor,
                token,
                join,
            },
        );
    }

    /// A persisted cursor is only trusted if it still parses; anything
    /// else falls back to the epoch and re-ships history rather than
    /// losing lines.
    fn inherited_cursor(&self, id: &str) -> String {
        match self.persisted.get(id) {
            Some(ts) if cursor::parse(ts).is_ok() => ts.clone(),
            Some(ts) => {
                warn!(
                    message = "Discarding unparseable persisted cursor.",
                    container_id = %id,
                    cursor = %ts,
                );
                cursor::EPOCH.to_string()
            }
            None => cursor::EPOCH.to_string(),
        }
    }

    /// Signal the worker and forget it; the task finishes on its own time
    /// so the dispatch loop never blocks on one container.
    fn retire_worker(&mut self, id: &str) {
        if let Some(handle) = self.workers.remove(id) {
            debug!(message = "Retiring worker.", container_id = %id);
            handle.token.cancel();
        }
        self.persisted.remove(id);
    }

    fn checkpoint(&mut self) {
        for (id, handle) in &self.workers {
            self.persisted.insert(id.clone(), handle.cursor.get());
        }
        match state::save(&self.state_file, &self.persisted) {
            Ok(()) => CheckpointWritten {
                containers: self.persisted.len(),
            }
            .emit(),
            Err(error) => CheckpointWriteError { error: &error }.emit(),
        }
    }

    async fn shutdown_workers(&mut self) {
        for handle in self.workers.values() {
            handle.token.cancel();
        }
        let joins: Vec<_> = self
            .workers
            .values_mut()
            .map(|handle| &mut handle.join)
            .collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(joins))
            .await
            .is_err()
        {
            error!(message = "Some workers did not stop within the grace period.");
        }
    }
}
