//! Per-container log tailing.
//!
//! A [`Container`] holds what is known about one container, including the
//! cursor (time of the last log line read) that the checkpoint persists.
//! A [`ContainerTailer`] is the worker that follows the container's logs and
//! turns each line into an event for the writer.

pub mod event;
pub mod syslog;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use regex::Regex;
use serde_json::json;

use crate::metrics::Metrics;
use crate::moby::chunk::{ChunkParser, Stream};
use crate::moby::{ContainerInfo, ContainerRuntime, EventScope, RuntimeError};
use crate::sampler::{Sample, Sampler};
use crate::worker::{EventWorker, WorkerError};
use crate::writer::LogstashWriter;
use event::{Event, LogLine, deep_merge, format_timestamp, hashify_tag, parse_log_time};
use syslog::SyslogMessage;

const LABEL_PREFIX: &str = "org.discourse.mobystash.";

fn truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "yes" | "y" | "1" | "on" | "true" | "t"
    )
}

pub struct Container {
    id: String,
    name: String,
    capture_logs: bool,
    parse_syslog: bool,
    filter: Option<Regex>,
    tags: Event,
    last_log_time: Mutex<DateTime<Utc>>,
}

impl Container {
    /// `last_log_time` is the checkpointed cursor, if any.
    pub fn new(info: &ContainerInfo, last_log_time: Option<DateTime<Utc>>) -> Self {
        let name = info.name.trim_start_matches('/').to_string();

        let mut tags = Event::new();
        tags.insert("ecs".to_string(), json!({ "version": "1.8" }));
        tags.insert(
            "container".to_string(),
            json!({
                "id": info.id,
                "name": name,
                "hostname": info.hostname,
                "image": { "id": info.image_id, "name": info.image_name },
            }),
        );

        let mut container = Self {
            id: info.id.clone(),
            name,
            capture_logs: true,
            parse_syslog: false,
            filter: None,
            tags,
            last_log_time: Mutex::new(last_log_time.unwrap_or(DateTime::UNIX_EPOCH)),
        };
        container.parse_labels(&info.labels);
        container
    }

    fn parse_labels(&mut self, labels: &HashMap<String, String>) {
        // Sorted so that overlapping tag labels merge the same way every time.
        let mut labels: Vec<(&String, &String)> = labels.iter().collect();
        labels.sort();

        for (label, value) in labels {
            let Some(setting) = label.strip_prefix(LABEL_PREFIX) else {
                continue;
            };
            match setting {
                "disable" => self.capture_logs = !truthy(value),
                "parse_syslog" => self.parse_syslog = truthy(value),
                "filter_regex" => match Regex::new(value) {
                    Ok(re) => self.filter = Some(re),
                    Err(e) => log::error!(
                        "{}: ignoring invalid filter_regex {value:?}: {e}",
                        self.progname()
                    ),
                },
                _ => {
                    if let Some(path) = setting.strip_prefix("tag.") {
                        deep_merge(&mut self.tags, hashify_tag(path, value));
                    }
                }
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }

    pub fn progname(&self) -> String {
        format!("Container({})", self.short_id())
    }

    pub fn capture_logs(&self) -> bool {
        self.capture_logs
    }

    fn cursor(&self) -> MutexGuard<'_, DateTime<Utc>> {
        match self.last_log_time.lock() {
            Ok(cursor) => cursor,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn last_log_time(&self) -> DateTime<Utc> {
        *self.cursor()
    }

    /// The cursor as an RFC 3339 string with nanoseconds.
    pub fn last_log_timestamp(&self) -> String {
        format_timestamp(self.last_log_time())
    }

    fn set_last_log_time(&self, time: DateTime<Utc>) {
        *self.cursor() = time;
    }

    /// The earliest instant a not-yet-seen line can carry: one nanosecond
    /// past the cursor.
    pub fn next_log_time(&self) -> DateTime<Utc> {
        self.last_log_time() + TimeDelta::nanoseconds(1)
    }
}

pub struct ContainerTailer {
    container: Arc<Container>,
    runtime: Arc<dyn ContainerRuntime>,
    sampler: Arc<Sampler>,
    writer: LogstashWriter,
    metrics: Arc<Metrics>,
}

impl ContainerTailer {
    pub fn new(
        container: Arc<Container>,
        runtime: Arc<dyn ContainerRuntime>,
        sampler: Arc<Sampler>,
        writer: LogstashWriter,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            container,
            runtime,
            sampler,
            writer,
            metrics,
        }
    }

    fn stream_labels<'a>(&'a self, stream: &'a Stream) -> [&'a str; 3] {
        [self.container.name(), self.container.id(), stream.as_ref()]
    }

    async fn follow(&self) -> Result<(), WorkerError> {
        let info = self.runtime.inspect(self.container.id()).await?;
        if !info.running {
            log::debug!(
                "{}: not running; waiting for it to start or be destroyed",
                self.container.progname()
            );
            return self.wait_for_start().await;
        }

        let streams: &[Stream] = if info.tty {
            &[Stream::Tty]
        } else {
            &[Stream::Stdout, Stream::Stderr]
        };
        for stream in streams {
            // Touch the series so they show up as zero before the first line.
            self.metrics
                .log_entries_read
                .with_label_values(&self.stream_labels(stream));
            self.metrics
                .log_entries_sent
                .with_label_values(&self.stream_labels(stream));
        }

        let since = self.container.next_log_time();
        log::debug!(
            "{}: capturing logs from {}",
            self.container.progname(),
            format_timestamp(since)
        );

        let mut logs = self.runtime.logs_since(self.container.id(), since).await?;
        let mut parser = ChunkParser::new(info.tty);
        while let Some(chunk) = logs.next().await {
            let chunk = chunk?;
            parser.feed(&chunk, |line, stream| self.send_event(line, stream))?;
        }
        Ok(())
    }

    async fn wait_for_start(&self) -> Result<(), WorkerError> {
        let since = self.container.next_log_time();
        log::debug!(
            "{}: asking for events from {}",
            self.container.progname(),
            format_timestamp(since)
        );

        let mut events = self.runtime.events_since(since).await?;
        while let Some(event) = events.next().await {
            let event = event?;
            self.container.set_last_log_time(event.timestamp());
            log::debug!(
                "{}: runtime event@{}: {:?}.{} on {}",
                self.container.progname(),
                event.time_nano,
                event.scope,
                event.action,
                event.id
            );
            if event.scope == EventScope::Container && event.id == self.container.id() {
                break;
            }
        }
        Ok(())
    }

    fn send_event(&self, raw: &[u8], stream: Stream) {
        let labels = self.stream_labels(&stream);
        self.metrics.log_entries_read.with_label_values(&labels).inc();

        let raw = String::from_utf8_lossy(raw);
        let line = raw
            .strip_suffix('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .unwrap_or(raw.as_ref());
        let (stamp, message) = line.split_once(' ').unwrap_or((line, ""));

        let time = parse_log_time(stamp);
        self.container.set_last_log_time(time);
        self.metrics
            .last_log_entry_at
            .with_label_values(&labels)
            .set(time.timestamp_micros() as f64 / 1e6);

        let (message, syslog) = match self.container.parse_syslog {
            true => match SyslogMessage::parse(message) {
                Some(parsed) => {
                    let fields = parsed.fields();
                    (parsed.message, Some(fields))
                }
                None => (message.to_string(), None),
            },
            false => (message.to_string(), None),
        };

        let sample = self.sampler.sample(&message);
        if !sample.is_accepted() {
            return;
        }
        let sampling = match &sample {
            Sample::Accepted(meta) => Some(meta),
            _ => None,
        };

        if let Some(filter) = &self.container.filter {
            if filter.is_match(&message) {
                return;
            }
        }

        let event = event::assemble(
            LogLine {
                message,
                stream,
                time,
                syslog,
                sampling,
            },
            &self.container.tags,
        );
        self.writer.send_event(event);
        self.metrics.log_entries_sent.with_label_values(&labels).inc();
    }
}

#[async_trait]
impl EventWorker for ContainerTailer {
    fn progname(&self) -> String {
        self.container.progname()
    }

    async fn process_events(&mut self) -> Result<(), WorkerError> {
        if !self.container.capture_logs() {
            log::debug!("{}: log capture disabled by label", self.progname());
            std::future::pending::<()>().await;
        }

        match self.follow().await {
            Err(WorkerError::Runtime(RuntimeError::NotFound(_))) => {
                log::info!("{}: container has terminated", self.progname());
                Err(WorkerError::Terminate)
            }
            other => other,
        }
    }

    fn event_exception(&self, error: &WorkerError) {
        self.metrics
            .read_exceptions
            .with_label_values(&[self.container.name(), self.container.id(), error.class()])
            .inc();
    }
}
