//! Ships events to a logstash-style collector as JSON lines over TCP.
//!
//! [`LogstashWriter::send_event`] never blocks on the network: events go
//! into a bounded backlog that a single background task drains. When the
//! backlog is full the oldest event is thrown away. A failed write puts the
//! event back at the head of the backlog and backs off before reconnecting.

pub mod resolve;
pub mod target;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::container::event::{Event, format_timestamp};
use crate::metrics::Metrics;
use resolve::{Resolve, ServerName};
use target::Target;

const INITIAL_RETRY_WAIT: Duration = Duration::from_millis(500);
const MAX_RETRY_WAIT: Duration = Duration::from_secs(60);
const WRITE_BACKOFF_FACTOR: f64 = 1.1;
const WRITE_JITTER_SECS: f64 = 2.0;
const RESOLVE_RETRY_WAIT: Duration = Duration::from_secs(5);
const RESOLVE_BACKOFF_FACTOR: f64 = 1.5;
const RESOLVE_JITTER_SECS: f64 = 1.0;
const DISCONNECT_RETRY: Duration = Duration::from_millis(100);

enum Outcome {
    Written,
    Failed(String, std::io::Error),
    /// The connection was dropped by [`LogstashWriter::force_disconnect`].
    Disconnected,
}

struct QueuedEvent {
    event: Event,
    arrived: DateTime<Utc>,
}

struct Inner {
    server: ServerName,
    backlog: usize,
    drain_timeout: Duration,
    resolver: Arc<dyn Resolve>,
    metrics: Arc<Metrics>,

    queue: Mutex<VecDeque<QueuedEvent>>,
    queue_ready: Notify,
    terminate: AtomicBool,
    disconnect: Notify,

    target: tokio::sync::Mutex<Option<Target>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<QueuedEvent>> {
        match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.worker.lock() {
            Ok(worker) => worker,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Clone)]
pub struct LogstashWriter {
    inner: Arc<Inner>,
}

impl LogstashWriter {
    pub fn new(
        server: ServerName,
        backlog: usize,
        drain_timeout: Duration,
        resolver: Arc<dyn Resolve>,
        metrics: Arc<Metrics>,
    ) -> Self {
        metrics.writer_queue_max.set(backlog as i64);
        Self {
            inner: Arc::new(Inner {
                server,
                backlog,
                drain_timeout,
                resolver,
                metrics,
                queue: Mutex::new(VecDeque::new()),
                queue_ready: Notify::new(),
                terminate: AtomicBool::new(false),
                disconnect: Notify::new(),
                target: tokio::sync::Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Queues an event for delivery, stamping `@timestamp` if it has none.
    pub fn send_event(&self, mut event: Event) {
        let now = Utc::now();
        if !event.contains_key("@timestamp") {
            event.insert("@timestamp".to_string(), Value::String(format_timestamp(now)));
        }

        let metrics = &self.inner.metrics;
        let mut queue = self.inner.queue();
        queue.push_back(QueuedEvent {
            event,
            arrived: now,
        });
        metrics.writer_received.inc();
        while queue.len() > self.inner.backlog {
            queue.pop_front();
            metrics.writer_dropped.inc();
        }
        metrics.writer_queue_size.set(queue.len() as i64);
        drop(queue);

        self.inner.queue_ready.notify_one();
    }

    /// Starts the background sender. Calling it again while it runs does
    /// nothing.
    pub fn run(&self) {
        let mut worker = self.inner.worker();
        if worker.is_none() {
            self.inner.terminate.store(false, Ordering::SeqCst);
            *worker = Some(tokio::spawn(write_loop(self.inner.clone())));
        }
    }

    /// Lets the sender drain the backlog, giving up after the drain
    /// timeout, then closes the connection. Safe to call more than once.
    pub async fn stop(&self) {
        let handle = self.inner.worker().take();
        if let Some(mut handle) = handle {
            self.inner.terminate.store(true, Ordering::SeqCst);
            self.inner.queue_ready.notify_one();

            match tokio::time::timeout(self.inner.drain_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("LogstashWriter: sender task failed: {e}"),
                Err(_) => {
                    log::warn!(
                        "LogstashWriter: abandoning {} undelivered events after {:?}",
                        self.inner.queue().len(),
                        self.inner.drain_timeout
                    );
                    handle.abort();
                    let _ = handle.await;
                }
            }
            self.inner.terminate.store(false, Ordering::SeqCst);
        }

        let mut slot = self.inner.target.lock().await;
        if let Some(mut target) = slot.take() {
            log::info!("LogstashWriter: closing connection to {}", target.describe_peer());
            target.close();
        }
        self.inner.metrics.writer_connected.set(0);
    }

    /// Drops the current connection, so the next write re-resolves the
    /// server name. A write stuck on a collector that stopped reading is
    /// interrupted and its event goes back to the head of the backlog.
    pub async fn force_disconnect(&self) {
        let mut slot = loop {
            self.inner.disconnect.notify_waiters();
            let locked = tokio::time::timeout(DISCONNECT_RETRY, self.inner.target.lock()).await;
            if let Ok(slot) = locked {
                break slot;
            }
        };
        if let Some(mut target) = slot.take() {
            log::info!("LogstashWriter: forced disconnect from {}", target.describe_peer());
            target.close();
        }
        self.inner.metrics.writer_connected.set(0);
    }

    #[cfg(test)]
    pub fn queued_events(&self) -> Vec<Event> {
        self.inner.queue().iter().map(|q| q.event.clone()).collect()
    }
}

fn jitter(max_secs: f64) -> Duration {
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..max_secs))
}

/// Waits until there is something to send. `false` once a stop was
/// requested and the backlog is empty.
async fn wait_for_event(inner: &Inner) -> bool {
    loop {
        if !inner.queue().is_empty() {
            return true;
        }
        if inner.terminate.load(Ordering::SeqCst) {
            return false;
        }
        inner.queue_ready.notified().await;
    }
}

async fn write_loop(inner: Arc<Inner>) {
    let mut error_wait = INITIAL_RETRY_WAIT;

    while wait_for_event(&inner).await {
        // Connect before popping, so an abandoned connect attempt leaves the
        // event in the backlog.
        ensure_connected(&inner).await;

        let Some(item) = inner.queue().pop_front() else {
            continue;
        };
        let mut line = match serde_json::to_vec(&item.event) {
            Ok(line) => line,
            Err(e) => {
                log::error!("LogstashWriter: dropping unserializable event: {e}");
                inner.metrics.writer_dropped.inc();
                continue;
            }
        };
        line.push(b'\n');

        let outcome = {
            let disconnect = inner.disconnect.notified();
            tokio::pin!(disconnect);
            disconnect.as_mut().enable();

            let mut slot = inner.target.lock().await;
            let outcome = match slot.as_mut() {
                Some(target) => {
                    let written = tokio::select! {
                        result = target.write_line(&line) => Some(result),
                        () = &mut disconnect => None,
                    };
                    match written {
                        Some(Ok(())) => Outcome::Written,
                        Some(Err(e)) => Outcome::Failed(target.describe_peer(), e),
                        None => Outcome::Disconnected,
                    }
                }
                None => Outcome::Disconnected,
            };
            if !matches!(outcome, Outcome::Written) {
                if let Some(mut target) = slot.take() {
                    target.close();
                }
            }
            outcome
        };

        match outcome {
            // Disconnected by force since we connected; go round again.
            Outcome::Disconnected => {
                log::debug!("LogstashWriter: connection dropped before the write finished");
                inner.queue().push_front(item);
            }
            Outcome::Written => {
                let metrics = &inner.metrics;
                metrics.writer_sent.inc();
                metrics.writer_queue_size.set(inner.queue().len() as i64);
                metrics
                    .writer_last_sent_at
                    .set(item.arrived.timestamp_micros() as f64 / 1e6);
                error_wait = INITIAL_RETRY_WAIT;
            }
            Outcome::Failed(peer, e) => {
                log::error!("LogstashWriter: error while writing to {peer}: {e}");
                let class = format!("{:?}", e.kind());
                inner
                    .metrics
                    .writer_write_exceptions
                    .with_label_values(&[class.as_str()])
                    .inc();
                inner.metrics.writer_connected.set(0);
                inner.queue().push_front(item);

                tokio::time::sleep(error_wait + jitter(WRITE_JITTER_SECS)).await;
                error_wait = error_wait.mul_f64(WRITE_BACKOFF_FACTOR).min(MAX_RETRY_WAIT);
            }
        }
    }

    log::debug!("LogstashWriter: sender stopped");
}

/// Returns once the target slot holds a live connection.
async fn ensure_connected(inner: &Inner) {
    let mut retry_delay = RESOLVE_RETRY_WAIT;

    loop {
        {
            let mut slot = inner.target.lock().await;
            match slot.as_mut() {
                Some(target) if target.is_connected() => return,
                Some(target) => {
                    log::error!(
                        "LogstashWriter: connection to {} went away",
                        target.describe_peer()
                    );
                    inner
                        .metrics
                        .writer_write_exceptions
                        .with_label_values(&["NotConnected"])
                        .inc();
                    inner.metrics.writer_connected.set(0);
                    target.close();
                    *slot = None;
                }
                None => {}
            }
        }

        let candidates = inner.server.candidates(inner.resolver.as_ref()).await;
        log::debug!(
            "LogstashWriter: server candidates: {:?}",
            candidates.iter().map(|t| t.to_string()).collect::<Vec<_>>()
        );

        if candidates.is_empty() {
            tokio::time::sleep(RESOLVE_RETRY_WAIT).await;
            continue;
        }

        for mut candidate in candidates {
            log::debug!("LogstashWriter: trying to connect to {candidate}");
            match candidate.connect().await {
                Ok(()) => {
                    log::info!("LogstashWriter: connected to {}", candidate.describe_peer());
                    inner.metrics.writer_connected.set(1);
                    *inner.target.lock().await = Some(candidate);
                    return;
                }
                Err(e) => {
                    log::error!("LogstashWriter: failed to connect to {candidate}: {e}");
                    let class = format!("{:?}", e.kind());
                    inner
                        .metrics
                        .writer_connect_exceptions
                        .with_label_values(&[class.as_str()])
                        .inc();
                    tokio::time::sleep(INITIAL_RETRY_WAIT).await;
                }
            }
        }

        log::debug!("LogstashWriter: could not connect to any server; pausing before retrying");
        tokio::time::sleep(retry_delay + jitter(RESOLVE_JITTER_SECS)).await;
        retry_delay = retry_delay.mul_f64(RESOLVE_BACKOFF_FACTOR).min(MAX_RETRY_WAIT);
    }
}

#[cfg(test)]
mod tests {
    use super::resolve::fake::FakeResolver;
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};
    use tokio::net::TcpListener;

    fn event(n: u64) -> Event {
        let mut e = Event::new();
        e.insert("n".to_string(), json!(n));
        e
    }

    fn writer(server: &str, backlog: usize, drain: Duration) -> LogstashWriter {
        LogstashWriter::new(
            server.parse().unwrap(),
            backlog,
            drain,
            Arc::new(FakeResolver::default()),
            Arc::new(Metrics::new().unwrap()),
        )
    }

    async fn read_json(reader: &mut tokio::io::BufReader<tokio::net::TcpStream>) -> Value {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(10), reader.read_line(&mut line))
            .await
            .expect("timed out waiting for an event")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn test_backlog_keeps_newest_events() {
        let w = writer("127.0.0.1:1", 3, Duration::from_secs(1));
        for n in 0..5 {
            w.send_event(event(n));
        }
        let kept: Vec<Value> = w.queued_events().into_iter().map(|e| e["n"].clone()).collect();
        assert_eq!(kept, vec![json!(2), json!(3), json!(4)]);
        assert_eq!(w.inner.metrics.writer_dropped.get(), 2);
        assert_eq!(w.inner.metrics.writer_received.get(), 5);
        assert_eq!(w.inner.metrics.writer_queue_size.get(), 3);
        assert_eq!(w.inner.metrics.writer_queue_max.get(), 3);
    }

    #[test]
    fn test_timestamp_is_added_when_missing() {
        let w = writer("127.0.0.1:1", 10, Duration::from_secs(1));
        w.send_event(event(1));
        let mut stamped = event(2);
        stamped.insert("@timestamp".to_string(), json!("2018-10-02T08:39:16.458228203Z"));
        w.send_event(stamped);

        let queued = w.queued_events();
        assert!(queued[0]["@timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(queued[1]["@timestamp"], "2018-10-02T08:39:16.458228203Z");
    }

    #[tokio::test]
    async fn test_delivers_json_lines_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let w = writer(&addr.to_string(), 10, Duration::from_secs(5));

        w.send_event(event(1));
        w.send_event(event(2));
        w.run();

        let (socket, _) = listener.accept().await.unwrap();
        let mut reader = tokio::io::BufReader::new(socket);
        assert_eq!(read_json(&mut reader).await["n"], 1);
        assert_eq!(read_json(&mut reader).await["n"], 2);

        w.stop().await;
        assert_eq!(w.inner.metrics.writer_sent.get(), 2);
        assert_eq!(w.inner.metrics.writer_connected.get(), 0);
        // A second stop is harmless.
        w.stop().await;
    }

    #[tokio::test]
    async fn test_reconnects_when_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let w = writer(&addr.to_string(), 10, Duration::from_secs(5));
        w.run();

        w.send_event(event(1));
        let (socket, _) = listener.accept().await.unwrap();
        let mut reader = tokio::io::BufReader::new(socket);
        assert_eq!(read_json(&mut reader).await["n"], 1);
        drop(reader);
        tokio::time::sleep(Duration::from_millis(100)).await;

        w.send_event(event(2));
        let (socket, _) = listener.accept().await.unwrap();
        let mut reader = tokio::io::BufReader::new(socket);
        assert_eq!(read_json(&mut reader).await["n"], 2);

        w.stop().await;
    }

    #[tokio::test]
    async fn test_force_disconnect_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let w = writer(&addr.to_string(), 10, Duration::from_secs(5));
        w.run();

        w.send_event(event(1));
        let (first, _) = listener.accept().await.unwrap();
        let mut first = tokio::io::BufReader::new(first);
        assert_eq!(read_json(&mut first).await["n"], 1);

        w.force_disconnect().await;
        w.send_event(event(2));
        let (second, _) = listener.accept().await.unwrap();
        let mut second = tokio::io::BufReader::new(second);
        assert_eq!(read_json(&mut second).await["n"], 2);

        w.stop().await;
    }

    fn big_event(n: u64, size: usize) -> Event {
        let mut e = event(n);
        e.insert("message".to_string(), json!("x".repeat(size)));
        e
    }

    #[tokio::test]
    async fn test_write_error_redelivers_event_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let w = writer(&addr.to_string(), 10, Duration::from_secs(1));

        // Far more than the socket buffers hold, so the write is still in
        // progress when the collector resets the connection.
        w.send_event(big_event(1, 32 << 20));
        w.send_event(event(2));
        w.run();

        let (mut first, _) = listener.accept().await.unwrap();
        let mut byte = [0u8; 1];
        first.read_exact(&mut byte).await.unwrap();
        // Closing with unread data pending sends a reset.
        drop(first);

        let (second, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
            .await
            .expect("writer did not reconnect")
            .unwrap();
        let mut second = tokio::io::BufReader::new(second);
        let redelivered = read_json(&mut second).await;
        assert_eq!(redelivered["n"], 1);
        assert_eq!(redelivered["message"].as_str().unwrap().len(), 32 << 20);
        assert_eq!(read_json(&mut second).await["n"], 2);

        let exceptions = &w.inner.metrics.writer_write_exceptions;
        let failures = exceptions.with_label_values(&["ConnectionReset"]).get()
            + exceptions.with_label_values(&["BrokenPipe"]).get();
        assert!(failures >= 1);

        w.stop().await;
    }

    #[tokio::test]
    async fn test_force_disconnect_interrupts_stalled_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let w = writer(&addr.to_string(), 10, Duration::from_millis(200));

        w.send_event(big_event(1, 32 << 20));
        w.run();

        // Accept but never read, so the write blocks once the buffers fill.
        let (stalled, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        tokio::time::timeout(Duration::from_secs(3), w.force_disconnect())
            .await
            .expect("force_disconnect waited for the stalled write");
        assert_eq!(w.inner.metrics.writer_sent.get(), 0);

        // The interrupted event is sent again on the next connection.
        let (second, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
            .await
            .expect("writer did not reconnect")
            .unwrap();
        let mut second = tokio::io::BufReader::new(second);
        assert_eq!(read_json(&mut second).await["n"], 1);
        drop(stalled);

        w.stop().await;
    }

    #[tokio::test]
    async fn test_stop_gives_up_on_unreachable_server() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let w = writer(&format!("127.0.0.1:{port}"), 10, Duration::from_millis(200));
        w.run();
        w.send_event(event(1));

        tokio::time::timeout(Duration::from_secs(5), w.stop())
            .await
            .expect("stop did not return");
        assert_eq!(w.queued_events().len(), 1);
        let refused = w
            .inner
            .metrics
            .writer_connect_exceptions
            .with_label_values(&["ConnectionRefused"])
            .get();
        assert!(refused >= 1);
    }

    #[tokio::test]
    async fn test_stop_without_run() {
        let w = writer("127.0.0.1:1", 10, Duration::from_secs(1));
        w.stop().await;
        w.force_disconnect().await;
    }
}
