//! Prometheus metrics, owned by one [`Metrics`] value that `main` builds and
//! hands to every component that records something.

pub mod server;

use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::moby::chunk::Stream;
use crate::worker::WorkerError;

const PREFIX: &str = "logship";

pub struct Metrics {
    registry: Registry,

    pub read_exceptions: IntCounterVec,
    pub log_entries_read: IntCounterVec,
    pub log_entries_sent: IntCounterVec,
    pub last_log_entry_at: GaugeVec,

    pub sampled_entries_sent: IntCounterVec,
    pub sampled_entries_dropped: IntCounterVec,
    pub unsampled_entries: IntCounter,
    pub sample_ratio: GaugeVec,

    pub watch_exceptions: IntCounterVec,
    pub moby_events: IntCounterVec,

    pub writer_received: IntCounter,
    pub writer_sent: IntCounter,
    pub writer_dropped: IntCounter,
    pub writer_queue_size: IntGauge,
    pub writer_queue_max: IntGauge,
    pub writer_last_sent_at: Gauge,
    pub writer_connected: IntGauge,
    pub writer_connect_exceptions: IntCounterVec,
    pub writer_write_exceptions: IntCounterVec,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(PREFIX)
}

const CONTAINER_LABELS: [&str; 2] = ["container_name", "container_id"];
const STREAM_LABELS: [&str; 3] = ["container_name", "container_id", "stream"];

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let read_exceptions = IntCounterVec::new(
            opts(
                "moby_read_exceptions_total",
                "Exceptions encountered while reading container logs",
            ),
            &[CONTAINER_LABELS[0], CONTAINER_LABELS[1], "class"],
        )?;
        let log_entries_read = IntCounterVec::new(
            opts("log_entries_read_total", "Log lines read from containers"),
            &STREAM_LABELS,
        )?;
        let log_entries_sent = IntCounterVec::new(
            opts(
                "log_entries_sent_total",
                "Log lines handed to the writer after sampling and filtering",
            ),
            &STREAM_LABELS,
        )?;
        let last_log_entry_at = GaugeVec::new(
            opts(
                "last_log_entry_at",
                "Unix time of the most recent log line read from a container",
            ),
            &STREAM_LABELS,
        )?;

        let sampled_entries_sent = IntCounterVec::new(
            opts("sampled_entries_sent_total", "Sampled lines that were kept"),
            &["sample_key"],
        )?;
        let sampled_entries_dropped = IntCounterVec::new(
            opts(
                "sampled_entries_dropped_total",
                "Sampled lines that were discarded",
            ),
            &["sample_key"],
        )?;
        let unsampled_entries = IntCounter::with_opts(opts(
            "unsampled_entries_total",
            "Lines that matched no sample key",
        ))?;
        let sample_ratio = GaugeVec::new(
            opts("sample_ratio", "Current sampling ratio for a sample key"),
            &["sample_key"],
        )?;

        let watch_exceptions = IntCounterVec::new(
            opts(
                "moby_watch_exceptions_total",
                "Exceptions encountered while watching runtime events",
            ),
            &["class"],
        )?;
        let moby_events = IntCounterVec::new(
            opts("moby_events_total", "Runtime events seen by the watcher"),
            &["type"],
        )?;

        let writer_received = IntCounter::with_opts(opts(
            "writer_events_received_total",
            "Events submitted to the writer",
        ))?;
        let writer_sent = IntCounter::with_opts(opts(
            "writer_events_written_total",
            "Events written to the log collector",
        ))?;
        let writer_dropped = IntCounter::with_opts(opts(
            "writer_events_dropped_total",
            "Events evicted from a full backlog",
        ))?;
        let writer_queue_size =
            IntGauge::with_opts(opts("writer_queue_size", "Events waiting to be written"))?;
        let writer_queue_max =
            IntGauge::with_opts(opts("writer_queue_max", "Capacity of the writer backlog"))?;
        let writer_last_sent_at = Gauge::with_opts(opts(
            "writer_last_sent_event_arrival",
            "Unix time at which the most recently written event was submitted",
        ))?;
        let writer_connected = IntGauge::with_opts(opts(
            "writer_connected",
            "Whether the writer holds a connection to the log collector",
        ))?;
        let writer_connect_exceptions = IntCounterVec::new(
            opts(
                "writer_connect_exceptions_total",
                "Failed attempts to connect to the log collector",
            ),
            &["class"],
        )?;
        let writer_write_exceptions = IntCounterVec::new(
            opts(
                "writer_write_exceptions_total",
                "Failed writes to the log collector",
            ),
            &["class"],
        )?;

        registry.register(Box::new(read_exceptions.clone()))?;
        registry.register(Box::new(log_entries_read.clone()))?;
        registry.register(Box::new(log_entries_sent.clone()))?;
        registry.register(Box::new(last_log_entry_at.clone()))?;
        registry.register(Box::new(sampled_entries_sent.clone()))?;
        registry.register(Box::new(sampled_entries_dropped.clone()))?;
        registry.register(Box::new(unsampled_entries.clone()))?;
        registry.register(Box::new(sample_ratio.clone()))?;
        registry.register(Box::new(watch_exceptions.clone()))?;
        registry.register(Box::new(moby_events.clone()))?;
        registry.register(Box::new(writer_received.clone()))?;
        registry.register(Box::new(writer_sent.clone()))?;
        registry.register(Box::new(writer_dropped.clone()))?;
        registry.register(Box::new(writer_queue_size.clone()))?;
        registry.register(Box::new(writer_queue_max.clone()))?;
        registry.register(Box::new(writer_last_sent_at.clone()))?;
        registry.register(Box::new(writer_connected.clone()))?;
        registry.register(Box::new(writer_connect_exceptions.clone()))?;
        registry.register(Box::new(writer_write_exceptions.clone()))?;

        Ok(Self {
            registry,
            read_exceptions,
            log_entries_read,
            log_entries_sent,
            last_log_entry_at,
            sampled_entries_sent,
            sampled_entries_dropped,
            unsampled_entries,
            sample_ratio,
            watch_exceptions,
            moby_events,
            writer_received,
            writer_sent,
            writer_dropped,
            writer_queue_size,
            writer_queue_max,
            writer_last_sent_at,
            writer_connected,
            writer_connect_exceptions,
            writer_write_exceptions,
        })
    }

    /// Drops every label set belonging to a container, so that churn does
    /// not grow the exposition without bound.
    pub fn forget_container(&self, name: &str, id: &str) {
        for stream in Stream::ALL {
            let labels = [name, id, stream.as_ref()];
            let _ = self.log_entries_read.remove_label_values(&labels);
            let _ = self.log_entries_sent.remove_label_values(&labels);
            let _ = self.last_log_entry_at.remove_label_values(&labels);
        }
        for class in WorkerError::CLASSES {
            let _ = self.read_exceptions.remove_label_values(&[name, id, class]);
        }
    }

    /// Prometheus text exposition of everything registered.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
