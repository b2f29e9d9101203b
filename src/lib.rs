//! mobystash ships container logs.
//!
//! It attaches to the local container engine, follows the log stream of
//! every running container (and every container that starts later), turns
//! each line into a structured event enriched with container metadata, and
//! forwards the events to logstash. Per-container read cursors are
//! checkpointed to disk so a restart resumes where the previous run left
//! off.
//!
//! The moving parts: a [`router::Router`] owns one [`worker::Worker`] per
//! container, fed by the [`watcher::Watcher`]'s view of the engine's event
//! stream. Each worker decodes the engine's framed log protocol
//! ([`framing`]), optionally extracts syslog fields ([`syslog`]), samples
//! and filters, assembles the event ([`event`]) and queues it on the
//! [`sink`].

pub mod config;
pub mod cursor;
pub mod docker;
pub mod event;
pub mod framing;
pub mod internal_events;
pub mod router;
pub mod sampler;
pub mod sink;
pub mod state;
pub mod supervise;
pub mod syslog;
pub mod watcher;
pub mod worker;
