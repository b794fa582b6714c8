//! Follows the runtime's event stream and tells the system about
//! containers coming and going.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;

use crate::metrics::Metrics;
use crate::moby::{ContainerRuntime, EventScope};
use crate::system::SystemMsg;
use crate::worker::{EventWorker, WorkerError};

pub struct MobyWatcher {
    runtime: Arc<dyn ContainerRuntime>,
    queue: UnboundedSender<SystemMsg>,
    metrics: Arc<Metrics>,
    last_event_time: DateTime<Utc>,
}

impl MobyWatcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        queue: UnboundedSender<SystemMsg>,
        metrics: Arc<Metrics>,
    ) -> Self {
        for kind in ["create", "destroy", "ignored"] {
            metrics.moby_events.with_label_values(&[kind]);
        }
        Self {
            runtime,
            queue,
            metrics,
            last_event_time: Utc::now(),
        }
    }

    #[cfg(test)]
    fn starting_at(mut self, time: DateTime<Utc>) -> Self {
        self.last_event_time = time;
        self
    }
}

#[async_trait]
impl EventWorker for MobyWatcher {
    fn progname(&self) -> String {
        "MobyWatcher".to_string()
    }

    async fn process_events(&mut self) -> Result<(), WorkerError> {
        log::debug!(
            "{}: asking for events since {}",
            self.progname(),
            self.last_event_time
        );

        let mut events = self.runtime.events_since(self.last_event_time).await?;
        while let Some(event) = events.next().await {
            let event = event?;
            self.last_event_time = event.timestamp();
            log::debug!(
                "{}: runtime event@{}: {:?}.{} on {}",
                self.progname(),
                event.time_nano,
                event.scope,
                event.action,
                event.id
            );

            let (msg, kind) = match (event.scope, event.action.as_str()) {
                (EventScope::Container, "create") => (SystemMsg::Created(event.id), "create"),
                (EventScope::Container, "destroy") => (SystemMsg::Destroyed(event.id), "destroy"),
                _ => {
                    self.metrics.moby_events.with_label_values(&["ignored"]).inc();
                    continue;
                }
            };
            self.metrics.moby_events.with_label_values(&[kind]).inc();

            if self.queue.send(msg).is_err() {
                log::debug!("{}: system has gone away", self.progname());
                return Err(WorkerError::Terminate);
            }
        }
        Ok(())
    }

    fn event_exception(&self, error: &WorkerError) {
        self.metrics
            .watch_exceptions
            .with_label_values(&[error.class()])
            .inc();
    }
}
