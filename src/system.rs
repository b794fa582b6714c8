//! The orchestrator: owns the set of tracked containers and is the only
//! place that changes it.
//!
//! Everything that wants the set changed (the event watcher, the checkpoint
//! timer, signal handlers) posts a [`SystemMsg`] to one queue, and
//! [`System::run`] applies the messages one at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint;
use crate::container::{Container, ContainerTailer};
use crate::metrics::Metrics;
use crate::moby::{ContainerRuntime, RuntimeError};
use crate::sampler::Sampler;
use crate::watcher::MobyWatcher;
use crate::worker;
use crate::writer::LogstashWriter;

const PROGNAME: &str = "System";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMsg {
    Created(String),
    Destroyed(String),
    Checkpoint,
    Terminate,
}

/// What the rest of the process gets to poke the system with.
#[derive(Clone)]
pub struct SystemHandle {
    queue: UnboundedSender<SystemMsg>,
    writer: LogstashWriter,
}

impl SystemHandle {
    pub fn shutdown(&self) {
        log::debug!("{PROGNAME}: received shutdown request");
        if self.queue.send(SystemMsg::Terminate).is_err() {
            log::debug!("{PROGNAME}: already stopped");
        }
    }

    /// Makes the writer drop its connection and resolve the server again.
    pub async fn reconnect(&self) {
        self.writer.force_disconnect().await;
    }
}

/// A background task plus the means to stop it.
struct Task {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Task {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            log::error!("{PROGNAME}: task did not stop cleanly: {e}");
        }
    }
}

struct Tracked {
    container: Arc<Container>,
    task: Task,
}

pub struct Settings {
    pub state_file: PathBuf,
    /// `None` disables the periodic checkpoint; one is still written on
    /// shutdown.
    pub checkpoint_interval: Option<Duration>,
}

pub struct System {
    runtime: Arc<dyn ContainerRuntime>,
    sampler: Arc<Sampler>,
    writer: LogstashWriter,
    metrics: Arc<Metrics>,
    settings: Settings,
    queue: UnboundedSender<SystemMsg>,
    inbox: UnboundedReceiver<SystemMsg>,
    containers: HashMap<String, Tracked>,
    watcher: Option<Task>,
    checkpoint_timer: Option<JoinHandle<()>>,
}

impl System {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        sampler: Arc<Sampler>,
        writer: LogstashWriter,
        metrics: Arc<Metrics>,
        settings: Settings,
    ) -> Self {
        let (queue, inbox) = mpsc::unbounded_channel();
        Self {
            runtime,
            sampler,
            writer,
            metrics,
            settings,
            queue,
            inbox,
            containers: HashMap::new(),
            watcher: None,
            checkpoint_timer: None,
        }
    }

    pub fn handle(&self) -> SystemHandle {
        SystemHandle {
            queue: self.queue.clone(),
            writer: self.writer.clone(),
        }
    }

    /// Starts every component and processes messages until told to
    /// terminate. Only a failure to list the running containers at startup
    /// is reported back; everything after that is logged and survived.
    pub async fn run(mut self) -> Result<(), RuntimeError> {
        log::info!("{PROGNAME}: starting");

        let watcher = MobyWatcher::new(self.runtime.clone(), self.queue.clone(), self.metrics.clone());
        let cancel = CancellationToken::new();
        self.watcher = Some(Task {
            handle: worker::spawn(watcher, cancel.clone()),
            cancel,
        });
        self.writer.run();

        if let Err(e) = self.start_existing_containers().await {
            log::error!("{PROGNAME}: could not list running containers: {e}");
            self.terminate().await;
            return Err(e);
        }
        self.start_checkpoint_timer();

        log::info!("{PROGNAME}: commencing real-time log collection");
        while let Some(msg) = self.inbox.recv().await {
            log::debug!("{PROGNAME}: received message {msg:?}");
            if !self.handle_message(msg).await {
                break;
            }
        }
        Ok(())
    }

    /// Applies one message; `false` once the system has terminated.
    async fn handle_message(&mut self, msg: SystemMsg) -> bool {
        match msg {
            SystemMsg::Created(id) if id.is_empty() => {
                log::error!("{PROGNAME}: SHOULDN'T HAPPEN: creation event without an ID");
            }
            SystemMsg::Created(id) => {
                if self.containers.contains_key(&id) {
                    return true;
                }
                match self.runtime.inspect(&id).await {
                    Ok(info) => self.track(Container::new(&info, None)),
                    Err(RuntimeError::NotFound(_)) => log::debug!(
                        "{PROGNAME}: container {id} disappeared before we could grab its logs"
                    ),
                    Err(e) => log::error!(
                        "{PROGNAME}: failed to inspect new container {id} ({}): {e}",
                        e.class()
                    ),
                }
            }
            SystemMsg::Destroyed(id) => {
                if let Some(tracked) = self.containers.remove(&id) {
                    self.untrack(tracked).await;
                }
            }
            SystemMsg::Checkpoint => self.write_checkpoint(),
            SystemMsg::Terminate => {
                log::info!("{PROGNAME}: terminating");
                self.terminate().await;
                return false;
            }
        }
        true
    }

    async fn start_existing_containers(&mut self) -> Result<(), RuntimeError> {
        log::info!("{PROGNAME}: collecting logs for existing containers");
        let mut cursors = checkpoint::load(&self.settings.state_file);

        for id in self.runtime.running_containers().await? {
            match self.runtime.inspect(&id).await {
                Ok(info) => {
                    let cursor = cursors.remove(&id);
                    self.track(Container::new(&info, cursor));
                }
                Err(RuntimeError::NotFound(_)) => {}
                Err(e) => log::error!(
                    "{PROGNAME}: failed to inspect container {id} ({}): {e}",
                    e.class()
                ),
            }
        }
        Ok(())
    }

    fn track(&mut self, container: Container) {
        let container = Arc::new(container);
        log::info!(
            "{PROGNAME}: tracking {} ({})",
            container.progname(),
            container.name()
        );
        let tailer = ContainerTailer::new(
            container.clone(),
            self.runtime.clone(),
            self.sampler.clone(),
            self.writer.clone(),
            self.metrics.clone(),
        );
        let cancel = CancellationToken::new();
        let handle = worker::spawn(tailer, cancel.clone());
        self.containers.insert(
            container.id().to_string(),
            Tracked {
                container,
                task: Task { cancel, handle },
            },
        );
    }

    async fn untrack(&self, tracked: Tracked) {
        log::info!(
            "{PROGNAME}: no longer tracking {}, last log entry at {}",
            tracked.container.progname(),
            tracked.container.last_log_timestamp()
        );
        tracked.task.stop().await;
        self.metrics
            .forget_container(tracked.container.name(), tracked.container.id());
    }

    fn start_checkpoint_timer(&mut self) {
        let Some(interval) = self.settings.checkpoint_interval else {
            return;
        };
        let queue = self.queue.clone();
        self.checkpoint_timer = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if queue.send(SystemMsg::Checkpoint).is_err() {
                    break;
                }
            }
        }));
    }

    fn write_checkpoint(&self) {
        let state = self
            .containers
            .iter()
            .map(|(id, tracked)| (id.clone(), tracked.container.last_log_time()))
            .collect();
        if let Err(e) = checkpoint::write(&self.settings.state_file, &state) {
            log::error!("{PROGNAME}: checkpoint failed ({}): {e}", e.class());
        }
    }

    async fn terminate(&mut self) {
        if let Some(timer) = self.checkpoint_timer.take() {
            timer.abort();
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }

        for tracked in self.containers.values() {
            tracked.task.cancel.cancel();
        }
        for tracked in self.containers.values_mut() {
            if let Err(e) = (&mut tracked.task.handle).await {
                log::error!("{PROGNAME}: tailer did not stop cleanly: {e}");
            }
        }
        self.write_checkpoint();
        for (_, tracked) in self.containers.drain() {
            self.metrics
                .forget_container(tracked.container.name(), tracked.container.id());
        }

        self.writer.stop().await;
    }
}
