//! [`ContainerRuntime`] backed by the Docker Engine API.

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{EventMessage, EventMessageTypeEnum};
use bollard::query_parameters::{
    EventsOptions, EventsOptionsBuilder, InspectContainerOptions, InspectContainerOptionsBuilder,
    ListContainersOptions, ListContainersOptionsBuilder,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;

use super::raw_logs::{self, DockerHost};
use super::{
    ContainerInfo, ContainerRuntime, EventScope, EventStream, LogStream, MobyEvent, READ_TIMEOUT,
    RuntimeError, format_since,
};

#[derive(Debug, Clone)]
pub struct MobyClient {
    docker: Docker,
    host: DockerHost,
}

impl MobyClient {
    /// Connects using `DOCKER_HOST`, or the local unix socket when unset.
    pub fn connect() -> Result<Self, RuntimeError> {
        Self::with_host(DockerHost::from_env()?)
    }

    /// API calls and log streams both go to `host`.
    pub fn with_host(host: DockerHost) -> Result<Self, RuntimeError> {
        let timeout = READ_TIMEOUT.as_secs();
        let docker = match &host {
            DockerHost::Unix(path) => Docker::connect_with_unix(
                &path.to_string_lossy(),
                timeout,
                bollard::API_DEFAULT_VERSION,
            ),
            DockerHost::Tcp(addr) => Docker::connect_with_http(
                &format!("tcp://{addr}"),
                timeout,
                bollard::API_DEFAULT_VERSION,
            ),
        }
        .map_err(to_runtime_error)?;
        Ok(Self { docker, host })
    }
}

fn events_options(since: DateTime<Utc>) -> EventsOptions {
    EventsOptionsBuilder::new().since(&format_since(since)).build()
}

fn to_runtime_error(e: bollard::errors::Error) -> RuntimeError {
    use bollard::errors::Error;
    match e {
        Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        Error::RequestTimeoutError => RuntimeError::Timeout,
        e @ (Error::IOError { .. } | Error::HyperResponseError { .. }) => {
            RuntimeError::Transport(e.to_string())
        }
        e => RuntimeError::Api(e.to_string()),
    }
}

fn to_moby_event(message: EventMessage) -> MobyEvent {
    let scope = match message.typ {
        Some(EventMessageTypeEnum::CONTAINER) => EventScope::Container,
        _ => EventScope::Other,
    };
    let time = message.time.unwrap_or_default();
    MobyEvent {
        scope,
        action: message.action.unwrap_or_default(),
        id: message.actor.and_then(|a| a.id).unwrap_or_default(),
        time,
        time_nano: message
            .time_nano
            .unwrap_or_else(|| time.saturating_mul(1_000_000_000)),
    }
}

#[async_trait]
impl ContainerRuntime for MobyClient {
    async fn running_containers(&self) -> Result<Vec<String>, RuntimeError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(false).build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(to_runtime_error)?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        let info = self
            .docker
            .inspect_container(id, Some(options))
            .await
            .map_err(to_runtime_error)?;

        let config = info.config.unwrap_or_default();
        Ok(ContainerInfo {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info.name.unwrap_or_default(),
            image_id: info.image.unwrap_or_default(),
            image_name: config.image.unwrap_or_default(),
            hostname: config.hostname.unwrap_or_default(),
            tty: config.tty.unwrap_or(false),
            running: info.state.and_then(|s| s.running).unwrap_or(false),
            labels: config.labels.unwrap_or_default(),
        })
    }

    async fn events_since(&self, since: DateTime<Utc>) -> Result<EventStream, RuntimeError> {
        let stream = self
            .docker
            .events(Some(events_options(since)))
            .map(|item| item.map(to_moby_event).map_err(to_runtime_error));
        Ok(stream.boxed())
    }

    async fn logs_since(&self, id: &str, since: DateTime<Utc>) -> Result<LogStream, RuntimeError> {
        raw_logs::stream_logs(&self.host, id, &format_since(since)).await
    }
}
