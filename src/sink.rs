//! The logstash sink: a bounded queue in front of a TCP connection.
//!
//! Workers serialize events into the queue and never touch the socket.
//! The writer task owns the connection, emits one JSON document per line,
//! and reconnects with backoff when the peer goes away; the event being
//! written when a connection drops is re-sent on the next connection, so
//! delivery is at-least-once end to end.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::internal_events::{InternalEvent, SinkConnected, SinkWriteError};
use crate::supervise::BackoffPolicy;

const QUEUE_CAPACITY: usize = 1024;

/// Producer half, cheap to clone into every worker.
#[derive(Clone)]
pub struct SinkHandle {
    queue: mpsc::Sender<Vec<u8>>,
    disconnect: Arc<Notify>,
}

impl SinkHandle {
    /// Queue an event for delivery. Waits only when the queue is full,
    /// which is the natural back-pressure path from a slow sink to the
    /// workers.
    pub async fn send(&self, event: &Map<String, Value>) {
        let mut line = serde_json::to_vec(&Value::Object(event.clone()))
            .expect("event maps always serialize");
        line.push(b'\n');
        // An error here means the writer is gone, which only happens at
        // shutdown; the event is dropped with it.
        let _ = self.queue.send(line).await;
    }

    /// Drop the current connection. The writer reconnects before sending
    /// anything further.
    pub fn force_disconnect(&self) {
        self.disconnect.notify_one();
    }
}

/// Writer half. `run` consumes it on the sink task.
pub struct Sink {
    server: String,
    queue: mpsc::Receiver<Vec<u8>>,
    disconnect: Arc<Notify>,
    backoff: BackoffPolicy,
    /// Lines pulled off the queue but not yet written to a healthy socket.
    pending: VecDeque<Vec<u8>>,
}

pub fn channel(server: impl Into<String>) -> (SinkHandle, Sink) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let disconnect = Arc::new(Notify::new());
    let handle = SinkHandle {
        queue: tx,
        disconnect: Arc::clone(&disconnect),
    };
    let sink = Sink {
        server: server.into(),
        queue: rx,
        disconnect,
        backoff: BackoffPolicy::default(),
        pending: VecDeque::new(),
    };
    (handle, sink)
}

impl Sink {
    /// Run until cancelled, then flush whatever is already queued on a
    /// best-effort basis before returning.
    pub async fn run(mut self, token: CancellationToken) {
        let mut failures: u32 = 0;

        loop {
            let connection = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                connection = TcpStream::connect(&self.server) => connection,
            };

            let mut connection = match connection {
                Ok(connection) => {
                    failures = 0;
                    SinkConnected { peer: &self.server }.emit();
                    connection
                }
                Err(error) => {
                    SinkWriteError { error: &error }.emit();
                    let delay = backoff_delay(&self.backoff, &mut failures);
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            // Write until the connection breaks, a disconnect is forced, or
            // we are shut down.
            loop {
                let line = match self.pending.pop_front() {
                    Some(line) => Some(line),
                    None => tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        _ = self.disconnect.notified() => {
                            debug!(message = "Forced disconnect from logstash.");
                            break;
                        }
                        line = self.queue.recv() => line,
                    },
                };
                let Some(line) = line else {
                    // Shutdown (or producers all gone): drain and leave.
                    self.drain(&mut connection).await;
                    return;
                };

                if let Err(error) = connection.write_all(&line).await {
                    SinkWriteError { error: &error }.emit();
                    self.pending.push_front(line);
                    break;
                }
            }
        }

        info!(message = "Logstash sink stopped.", queued = self.queue.len());
    }

    /// Best-effort flush of everything already queued, on the current
    /// connection only. Used at shutdown; new failures just drop the rest.
    async fn drain(&mut self, connection: &mut TcpStream) {
        self.queue.close();
        while let Some(line) = self.pending.pop_front() {
            if connection.write_all(&line).await.is_err() {
                return;
            }
        }
        while let Ok(line) = self.queue.try_recv() {
            if connection.write_all(&line).await.is_err() {
                return;
            }
        }
        let _ = connection.flush().await;
    }
}

#[cfg(test)]
impl Sink {
    /// Read the queue directly, bypassing the writer; lets tests observe
    /// exactly what producers enqueued.
    pub(crate) async fn recv(&mut self) -> Option<Vec<u8>> {
        self.queue.recv().await
    }

    pub(crate) fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.queue.try_recv().ok()
    }
}

fn backoff_delay(policy: &BackoffPolicy, failures: &mut u32) -> std::time::Duration {
    let delay = policy
        .base
        .saturating_mul(2u32.saturating_pow(*failures))
        .min(policy.cap);
    *failures = failures.saturating_add(1);
    delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn event(text: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("message".into(), json!(text));
        map
    }

    #[tokio::test]
    async fn delivers_events_as_json_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle, sink) = channel(addr.to_string());

        let token = CancellationToken::new();
        let writer = tokio::spawn(sink.run(token.clone()));

        let (mut socket, _) = listener.accept().await.unwrap();
        handle.send(&event("one")).await;
        handle.send(&event("two")).await;

        let mut buf = vec![0u8; 256];
        let mut received = String::new();
        while received.matches('\n').count() < 2 {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "sink closed the connection early");
            received.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        assert_eq!(
            received,
            "{\"message\":\"one\"}\n{\"message\":\"two\"}\n"
        );

        token.cancel();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle, sink) = channel(addr.to_string());

        let token = CancellationToken::new();
        let writer = tokio::spawn(sink.run(token.clone()));

        // First connection is dropped immediately by the peer.
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);

        // Keep producing; writes eventually fail and trigger a reconnect.
        // (The kernel may accept the first write after a peer close.)
        let producer = tokio::spawn({
            let handle = handle.clone();
            async move {
                loop {
                    handle.send(&event("persistent")).await;
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            }
        });

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = String::new();
        let mut buf = vec![0u8; 256];
        while !received.contains("persistent") {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "sink closed the connection early");
            received.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }

        producer.abort();
        token.cancel();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn force_disconnect_makes_a_fresh_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle, sink) = channel(addr.to_string());

        let token = CancellationToken::new();
        let writer = tokio::spawn(sink.run(token.clone()));

        let (_first, _) = listener.accept().await.unwrap();
        handle.force_disconnect();

        handle.send(&event("after reconnect")).await;
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = socket.read(&mut buf).await.unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().contains("after reconnect"));

        token.cancel();
        writer.await.unwrap();
    }
}
