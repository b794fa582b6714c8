//! In-memory [`ContainerRuntime`] for tests.
//!
//! Streams hand out whatever was queued at call time and then stay open
//! forever, like a followed log or event stream with nothing new to say.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;

use super::{ContainerInfo, ContainerRuntime, EventStream, LogStream, MobyEvent, RuntimeError};

#[derive(Default)]
struct State {
    containers: HashMap<String, ContainerInfo>,
    logs: HashMap<String, Vec<Bytes>>,
    log_failures: HashMap<String, VecDeque<RuntimeError>>,
    events: Vec<MobyEvent>,
    log_requests: Vec<(String, DateTime<Utc>)>,
    event_requests: Vec<DateTime<Utc>>,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_container(&self, info: ContainerInfo) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(info.id.clone(), info);
    }

    pub fn push_log(&self, id: &str, chunk: impl Into<Bytes>) {
        let mut state = self.state.lock().unwrap();
        state
            .logs
            .entry(id.to_string())
            .or_default()
            .push(chunk.into());
    }

    /// The next `logs_since` call for `id` fails with `error`.
    pub fn fail_next_logs(&self, id: &str, error: RuntimeError) {
        let mut state = self.state.lock().unwrap();
        state
            .log_failures
            .entry(id.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn push_event(&self, event: MobyEvent) {
        self.state.lock().unwrap().events.push(event);
    }

    pub fn log_requests(&self) -> Vec<(String, DateTime<Utc>)> {
        self.state.lock().unwrap().log_requests.clone()
    }

    pub fn event_requests(&self) -> Vec<DateTime<Utc>> {
        self.state.lock().unwrap().event_requests.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn running_containers(&self) -> Result<Vec<String>, RuntimeError> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn events_since(&self, since: DateTime<Utc>) -> Result<EventStream, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.event_requests.push(since);
        let events: Vec<_> = state.events.drain(..).map(Ok).collect();
        Ok(stream::iter(events).chain(stream::pending()).boxed())
    }

    async fn logs_since(&self, id: &str, since: DateTime<Utc>) -> Result<LogStream, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.log_requests.push((id.to_string(), since));
        if let Some(error) = state.log_failures.get_mut(id).and_then(|q| q.pop_front()) {
            return Err(error);
        }
        if !state.containers.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        let chunks: Vec<_> = state
            .logs
            .remove(id)
            .unwrap_or_default()
            .into_iter()
            .map(Ok)
            .collect();
        Ok(stream::iter(chunks).chain(stream::pending()).boxed())
    }
}
