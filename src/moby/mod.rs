//! Everything that talks to the container runtime.
//!
//! The rest of the crate only sees the [`ContainerRuntime`] trait; the
//! bollard-backed implementation lives in [`docker`].

pub mod chunk;
pub mod docker;
#[cfg(test)]
pub mod fake;
mod raw_logs;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

pub use docker::MobyClient;

/// How long a single read from the runtime may block before it is
/// surfaced as [`RuntimeError::Timeout`].
pub const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3600);

/// The subset of `inspect` data the shipper cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub image_name: String,
    pub hostname: String,
    pub tty: bool,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    Container,
    Other,
}

/// One entry from the runtime's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MobyEvent {
    pub scope: EventScope,
    pub action: String,
    pub id: String,
    /// Seconds since the epoch.
    pub time: i64,
    /// Nanoseconds since the epoch.
    pub time_nano: i64,
}

impl MobyEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.time_nano)
    }
}

pub type LogStream = BoxStream<'static, Result<Bytes, RuntimeError>>;
pub type EventStream = BoxStream<'static, Result<MobyEvent, RuntimeError>>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("timed out waiting on the container runtime")]
    Timeout,
    #[error("socket error: {0}")]
    Transport(String),
    #[error("container runtime API error: {0}")]
    Api(String),
}

impl RuntimeError {
    pub fn class(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport",
            Self::Api(_) => "api",
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// IDs of every currently running container.
    async fn running_containers(&self) -> Result<Vec<String>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;

    /// Follow the runtime's lifecycle events, starting at `since`.
    async fn events_since(&self, since: DateTime<Utc>) -> Result<EventStream, RuntimeError>;

    /// Follow the raw (still multiplexed) log stream of a container, with
    /// timestamps, starting at `since`.
    async fn logs_since(&self, id: &str, since: DateTime<Utc>) -> Result<LogStream, RuntimeError>;
}

/// Render a point in time the way the Engine API's `since` parameter
/// wants it: `<seconds>.<nanoseconds>`.
pub fn format_since(time: DateTime<Utc>) -> String {
    format!("{}.{:09}", time.timestamp(), time.timestamp_subsec_nanos())
}
