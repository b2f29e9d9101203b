//! Internal observability events.
//!
//! Every occurrence worth counting has a struct here with an `emit` method
//! that issues the metric and, where useful, a log line. Call sites stay
//! free of metric names and label spelling.

use metrics::{counter, gauge};
use tracing::{error, info, warn};

use crate::framing::StreamLabel;

pub trait InternalEvent {
    fn emit(self);
}

pub struct LogEntryRead<'a> {
    pub name: &'a str,
    pub id: &'a str,
    pub stream: StreamLabel,
}

impl InternalEvent for LogEntryRead<'_> {
    fn emit(self) {
        counter!("mobystash_log_entries_read_total",
            "container_name" => self.name.to_string(),
            "container_id" => self.id.to_string(),
            "stream" => self.stream.as_str(),
        )
        .increment(1);
    }
}

pub struct LogEntrySent<'a> {
    pub name: &'a str,
    pub id: &'a str,
    pub stream: StreamLabel,
}

impl InternalEvent for LogEntrySent<'_> {
    fn emit(self) {
        counter!("mobystash_log_entries_sent_total",
            "container_name" => self.name.to_string(),
            "container_id" => self.id.to_string(),
            "stream" => self.stream.as_str(),
        )
        .increment(1);
    }
}

/// Touch every stream-keyed series for a container so collectors see them
/// from zero rather than from the first increment.
pub struct CountersPrimed<'a> {
    pub name: &'a str,
    pub id: &'a str,
    pub streams: &'a [StreamLabel],
}

impl InternalEvent for CountersPrimed<'_> {
    fn emit(self) {
        for stream in self.streams {
            for series in [
                "mobystash_log_entries_read_total",
                "mobystash_log_entries_sent_total",
            ] {
                counter!(series,
                    "container_name" => self.name.to_string(),
                    "container_id" => self.id.to_string(),
                    "stream" => stream.as_str(),
                )
                .increment(0);
            }
        }
    }
}

pub struct LastLogEntryAt<'a> {
    pub name: &'a str,
    pub id: &'a str,
    pub at_unix_seconds: f64,
}

impl InternalEvent for LastLogEntryAt<'_> {
    fn emit(self) {
        gauge!("mobystash_last_log_entry_at_seconds",
            "container_name" => self.name.to_string(),
            "container_id" => self.id.to_string(),
        )
        .set(self.at_unix_seconds);
    }
}

pub struct LogEntryParseError<'a> {
    pub name: &'a str,
    pub id: &'a str,
    pub line: &'a str,
}

impl InternalEvent for LogEntryParseError<'_> {
    fn emit(self) {
        warn!(
            message = "Skipping log line without a parseable timestamp prefix.",
            container_name = %self.name,
            container_id = %self.id,
            line = %self.line,
        );
        counter!("mobystash_log_parse_errors_total",
            "container_name" => self.name.to_string(),
            "container_id" => self.id.to_string(),
        )
        .increment(1);
    }
}

/// A supervised loop body failed and will be retried after backoff.
pub struct ReadException<'a> {
    pub name: &'a str,
    pub id: &'a str,
    pub class: &'static str,
    pub error: &'a dyn std::fmt::Display,
}

impl InternalEvent for ReadException<'_> {
    fn emit(self) {
        warn!(
            message = "Log read failed, will retry.",
            container_name = %self.name,
            container_id = %self.id,
            class = %self.class,
            error = %self.error,
        );
        counter!("mobystash_read_exceptions_total",
            "container_name" => self.name.to_string(),
            "container_id" => self.id.to_string(),
            "class" => self.class,
        )
        .increment(1);
    }
}

/// The discovery event long-poll failed and will be reconnected.
pub struct WatchException<'a> {
    pub class: &'static str,
    pub error: &'a dyn std::fmt::Display,
}

impl InternalEvent for WatchException<'_> {
    fn emit(self) {
        warn!(
            message = "Event watch failed, will reconnect.",
            class = %self.class,
            error = %self.error,
        );
        counter!("mobystash_watch_exceptions_total", "class" => self.class).increment(1);
    }
}

pub struct ContainerTerminated<'a> {
    pub name: &'a str,
    pub id: &'a str,
}

impl InternalEvent for ContainerTerminated<'_> {
    fn emit(self) {
        info!(
            message = "Container is gone, retiring its worker.",
            container_name = %self.name,
            container_id = %self.id,
        );
        counter!("mobystash_containers_terminated_total").increment(1);
    }
}

pub struct MobyEventReceived<'a> {
    pub action: &'a str,
}

impl InternalEvent for MobyEventReceived<'_> {
    fn emit(self) {
        counter!("mobystash_moby_events_total", "action" => self.action.to_string()).increment(1);
    }
}

pub struct CheckpointWritten {
    pub containers: usize,
}

impl InternalEvent for CheckpointWritten {
    fn emit(self) {
        counter!("mobystash_checkpoints_total").increment(1);
        gauge!("mobystash_checkpointed_containers").set(self.containers as f64);
    }
}

pub struct CheckpointWriteError<'a> {
    pub error: &'a dyn std::fmt::Display,
}

impl InternalEvent for CheckpointWriteError<'_> {
    fn emit(self) {
        error!(message = "Failed to write state checkpoint.", error = %self.error);
        counter!("mobystash_checkpoint_errors_total").increment(1);
    }
}

pub struct SinkConnected<'a> {
    pub peer: &'a str,
}

impl InternalEvent for SinkConnected<'_> {
    fn emit(self) {
        info!(message = "Connected to logstash.", peer = %self.peer);
        counter!("mobystash_sink_connects_total").increment(1);
    }
}

pub struct SinkWriteError<'a> {
    pub error: &'a dyn std::fmt::Display,
}

impl InternalEvent for SinkWriteError<'_> {
    fn emit(self) {
        warn!(message = "Write to logstash failed, reconnecting.", error = %self.error);
        counter!("mobystash_sink_write_errors_total").increment(1);
    }
}
