//! Per-observer event streams.
//!
//! Every subscriber gets its own task and its own bounded queue. The task
//! pushes an initial `status`, relays managed-process output and lifecycle
//! events, tails the most relevant log file and sends a `ping` on every
//! heartbeat. A subscriber that cannot keep up within the send timeout is
//! released; other subscribers are unaffected.
//!
//! All teardown goes through [`Hub::release`], which is idempotent.
use crate::config::{StreamConfig, TailConfig};
use crate::discovery::ProcessDiscovery;
use crate::lifecycle::{Controller, LifecycleEvent, OutputLine, OutputStream};
use crate::registry::LogRegistry;
use crate::retry::backoff_delay;
use crate::status::StatusReport;
use crate::tail::{self, TailChunk, TailHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_stream::Stream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
    File,
}

impl From<OutputStream> for LogSource {
    fn from(stream: OutputStream) -> Self {
        match stream {
            OutputStream::Stdout => LogSource::Stdout,
            OutputStream::Stderr => LogSource::Stderr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub source: LogSource,
    pub content: String,
    pub is_new: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Payload of one SSE message. Serializes to the `data` field only; the
/// event name comes from [`StreamEvent::name`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Status(StatusReport),
    Log(LogEvent),
    Start {
        pid: u32,
    },
    Exit {
        pid: u32,
        code: Option<i32>,
        signal: Option<i32>,
    },
    Ping {
        ts: DateTime<Utc>,
    },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Status(_) => "status",
            StreamEvent::Log(_) => "log",
            StreamEvent::Start { .. } => "start",
            StreamEvent::Exit { .. } => "exit",
            StreamEvent::Ping { .. } => "ping",
        }
    }
}

impl From<LifecycleEvent> for StreamEvent {
    fn from(event: LifecycleEvent) -> Self {
        match event {
            LifecycleEvent::Started { pid } => StreamEvent::Start { pid },
            LifecycleEvent::Exited { pid, code, signal } => StreamEvent::Exit { pid, code, signal },
        }
    }
}

/// An event plus its per-subscription sequence number.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    /// Reconnect hint, set on the first frame only.
    pub retry: Option<Duration>,
    pub event: StreamEvent,
}

struct SubscriptionEntry {
    task: AbortHandle,
    opened_at: DateTime<Utc>,
}

struct HubInner {
    config: StreamConfig,
    tail_config: TailConfig,
    active_window: Duration,
    discovery: Arc<ProcessDiscovery>,
    registry: Arc<LogRegistry>,
    controller: Arc<Controller>,
    subscriptions: Mutex<HashMap<u64, SubscriptionEntry>>,
    next_id: AtomicU64,
}

impl HubInner {
    fn subscriptions(&self) -> MutexGuard<'_, HashMap<u64, SubscriptionEntry>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, id: u64) -> bool {
        let Some(entry) = self.subscriptions().remove(&id) else {
            return false;
        };
        entry.task.abort();
        let open_secs = (Utc::now() - entry.opened_at).num_seconds();
        tracing::debug!(id, open_secs, "subscription released");
        true
    }

    async fn status(&self) -> StatusReport {
        let records = self.discovery.enumerate(false).await;
        StatusReport::new(
            records,
            self.controller.phase(),
            self.controller.managed_pid(),
        )
    }

    /// True while a managed or external agent process is alive.
    async fn agent_active(&self, force_refresh: bool) -> bool {
        self.controller.managed_pid().is_some()
            || !self.discovery.enumerate(force_refresh).await.is_empty()
    }

    /// The active log file most worth tailing: one tied to a live process
    /// if there is one, otherwise the most relevant active file.
    async fn pick_log_file(&self) -> Option<PathBuf> {
        let files = self.registry.list(self.active_window).await;
        let mut active = files.into_iter().filter(|f| f.is_active);
        let first = active.next()?;
        let best = if first.associated_pid.is_some() {
            first
        } else {
            active.find(|f| f.associated_pid.is_some()).unwrap_or(first)
        };
        Some(self.registry.dir().join(&best.filename))
    }

    async fn open_tail(&self) -> Option<TailHandle> {
        let path = self.pick_log_file().await?;
        tracing::debug!(path = %path.display(), "attaching tail");
        Some(tail::spawn(path, &self.tail_config))
    }
}

/// Registry of live subscriptions.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(
        config: &StreamConfig,
        tail_config: &TailConfig,
        active_window: Duration,
        discovery: Arc<ProcessDiscovery>,
        registry: Arc<LogRegistry>,
        controller: Arc<Controller>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config: config.clone(),
                tail_config: tail_config.clone(),
                active_window,
                discovery,
                registry,
                controller,
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a subscription. `attempt` is the client's reconnect count.
    pub fn subscribe(&self, attempt: u32) -> Subscription {
        let config = &self.inner.config;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let retry = backoff_delay(
            Duration::from_millis(config.reconnect_base_ms),
            attempt.min(config.reconnect_max_attempts),
            Duration::from_millis(config.reconnect_max_ms),
        );
        let sink = Sink {
            tx,
            next_id: 1,
            retry: Some(retry),
            timeout: config.send_timeout(),
        };
        let output = self.inner.controller.subscribe_output();
        let events = self.inner.controller.subscribe_events();

        // Registered under the lock so a fast failure cannot release first.
        let mut subscriptions = self.inner.subscriptions();
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.inner),
            id,
            sink,
            output,
            events,
        ));
        subscriptions.insert(
            id,
            SubscriptionEntry {
                task: task.abort_handle(),
                opened_at: Utc::now(),
            },
        );
        drop(subscriptions);
        tracing::debug!(id, attempt, "subscription registered");

        Subscription {
            id,
            rx,
            hub: self.clone(),
        }
    }

    /// Tear down subscription `id`. Returns false if it was already gone.
    pub fn release(&self, id: u64) -> bool {
        self.inner.release(id)
    }

    /// Release every subscription, ending all open streams.
    pub fn close_all(&self) {
        let ids: Vec<u64> = self.inner.subscriptions().keys().copied().collect();
        for id in ids {
            self.inner.release(id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.subscriptions().len()
    }
}

/// The receiving end of a subscription. Dropping it releases the subscription.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Frame>,
    hub: Hub,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.release(self.id);
    }
}

/// The subscriber went away or stopped reading.
#[derive(Debug)]
struct WriteFailure;

struct Sink {
    tx: mpsc::Sender<Frame>,
    next_id: u64,
    retry: Option<Duration>,
    timeout: Duration,
}

impl Sink {
    async fn send(&mut self, event: StreamEvent) -> Result<(), WriteFailure> {
        let frame = Frame {
            id: self.next_id,
            retry: self.retry.take(),
            event,
        };
        self.next_id += 1;
        self.tx
            .send_timeout(frame, self.timeout)
            .await
            .map_err(|_| WriteFailure)
    }
}

async fn next_chunk(tail: &mut Option<TailHandle>) -> Option<TailChunk> {
    match tail {
        Some(handle) => handle.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_subscription(
    hub: Arc<HubInner>,
    id: u64,
    mut sink: Sink,
    mut output: broadcast::Receiver<OutputLine>,
    mut events: broadcast::Receiver<LifecycleEvent>,
) {
    let report = hub.status().await;
    let agent_active = report.running;
    if sink.send(StreamEvent::Status(report)).await.is_err() {
        hub.release(id);
        return;
    }

    // Log files are only followed while some agent is alive.
    let mut tail = if agent_active {
        hub.open_tail().await
    } else {
        None
    };
    let heartbeat_every = hub.config.heartbeat();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    let mut requery_at: Option<Instant> = None;
    let mut output_open = true;
    let mut events_open = true;

    loop {
        let mut attach_tail = false;
        let event = tokio::select! {
            _ = heartbeat.tick() => {
                if tail.is_none() && hub.agent_active(false).await {
                    tail = hub.open_tail().await;
                }
                StreamEvent::Ping { ts: Utc::now() }
            }
            line = output.recv(), if output_open => match line {
                Ok(line) => StreamEvent::Log(LogEvent {
                    source: line.stream.into(),
                    content: line.text,
                    is_new: true,
                    file: None,
                }),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(id, missed, "subscriber lagged behind process output");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    output_open = false;
                    continue;
                }
            },
            event = events.recv(), if events_open => match event {
                Ok(event) => {
                    match event {
                        LifecycleEvent::Started { .. } => attach_tail = tail.is_none(),
                        LifecycleEvent::Exited { .. } => {
                            requery_at = Some(Instant::now() + hub.config.exit_requery());
                        }
                    }
                    event.into()
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(id, missed, "subscriber lagged behind lifecycle events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    events_open = false;
                    continue;
                }
            },
            chunk = next_chunk(&mut tail) => match chunk {
                Some(chunk) => StreamEvent::Log(LogEvent {
                    source: LogSource::File,
                    content: chunk.content,
                    is_new: chunk.is_new,
                    file: tail
                        .as_ref()
                        .and_then(|t| t.path().file_name())
                        .map(|name| name.to_string_lossy().into_owned()),
                }),
                None => {
                    tracing::debug!(id, "tail watcher closed");
                    tail = None;
                    continue;
                }
            },
            _ = tokio::time::sleep_until(requery_at.unwrap_or_else(Instant::now)), if requery_at.is_some() => {
                requery_at = None;
                if !hub.agent_active(true).await && tail.take().is_some() {
                    tracing::debug!(id, "agent gone, tail detached");
                }
                StreamEvent::Status(hub.status().await)
            }
        };

        if sink.send(event).await.is_err() {
            tracing::debug!(id, "write to subscriber failed");
            hub.release(id);
            return;
        }

        // The agent may not have created its log yet; the heartbeat retries.
        if attach_tail {
            tail = hub.open_tail().await;
        }
    }
}
