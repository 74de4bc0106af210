//! Progress reporter: forwards per-update messages off the worker's path.
//!
//! The update worker only ever does a non-blocking enqueue. A separate task
//! appends each message to a local ring buffer (read by log streams and
//! `recent()`), broadcasts it to subscribers, and posts it to the controller
//! when the update came from there. Controller failures back off
//! exponentially; the retry queue is bounded and drops its oldest entry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::controller::{ControllerClient, ProgressMessage};
use crate::update::{UpdateOutcome, UpdateState};
use crate::update_log::UpdateLog;

#[derive(Debug, Clone)]
pub struct ReporterSettings {
    pub queue_capacity: usize,
    pub ring_size: usize,
    pub retry_queue: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl ReporterSettings {
    pub fn from_config(config: &chute_core::config::ReporterConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity.max(1),
            ring_size: config.ring_size.max(1),
            retry_queue: config.retry_queue.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms),
            retry_max: Duration::from_millis(config.retry_max_ms),
        }
    }
}

impl Default for ReporterSettings {
    fn default() -> Self {
        Self::from_config(&chute_core::config::ReporterConfig::default())
    }
}

/// One line in the local ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub seq: u64,
    pub update: String,
    pub time: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug)]
enum Event {
    Message {
        update: String,
        remote: bool,
        time: DateTime<Utc>,
        message: String,
    },
    Completed {
        update: String,
        remote: bool,
        success: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Outbound {
    Message { update: String, message: ProgressMessage },
    Completed { update: String, success: bool },
}

struct Ring {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
}

/// Cheap handle for producers and local readers.
#[derive(Clone)]
pub struct ReporterHandle {
    tx: mpsc::Sender<Event>,
    ring: Arc<RwLock<Ring>>,
    live: broadcast::Sender<LogEntry>,
}

impl ReporterHandle {
    pub fn message(&self, update: &str, remote: bool, message: &str) {
        self.enqueue(Event::Message {
            update: update.to_string(),
            remote,
            time: Utc::now(),
            message: message.to_string(),
        });
    }

    pub fn completed(&self, update: &str, remote: bool, success: bool) {
        self.enqueue(Event::Completed {
            update: update.to_string(),
            remote,
            success,
        });
    }

    fn enqueue(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!(error = %e, "progress queue full, message dropped");
        }
    }

    /// Up to `limit` most recent entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let ring = self.ring.read();
        let skip = ring.entries.len().saturating_sub(limit);
        ring.entries.iter().skip(skip).cloned().collect()
    }

    /// Entries as they are recorded from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live.subscribe()
    }
}

/// Drains the reporter queue. Created by [`spawn`].
pub struct ReporterWorker {
    rx: mpsc::Receiver<Event>,
    ring: Arc<RwLock<Ring>>,
    live: broadcast::Sender<LogEntry>,
    controller: Option<Arc<dyn ControllerClient>>,
    settings: ReporterSettings,
    pending: VecDeque<Outbound>,
    attempts: u32,
    retry_at: Option<Instant>,
    shutdown: broadcast::Receiver<()>,
}

pub fn spawn(
    settings: ReporterSettings,
    controller: Option<Arc<dyn ControllerClient>>,
    shutdown: broadcast::Receiver<()>,
) -> (ReporterHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(settings.queue_capacity);
    let (live, _) = broadcast::channel(settings.ring_size);
    let ring = Arc::new(RwLock::new(Ring {
        entries: VecDeque::with_capacity(settings.ring_size),
        next_seq: 0,
    }));
    let handle = ReporterHandle {
        tx,
        ring: ring.clone(),
        live: live.clone(),
    };
    let worker = ReporterWorker {
        rx,
        ring,
        live,
        controller,
        settings,
        pending: VecDeque::new(),
        attempts: 0,
        retry_at: None,
        shutdown,
    };
    (handle, tokio::spawn(worker.run()))
}

impl ReporterWorker {
    pub async fn run(mut self) {
        tracing::info!(remote = self.controller.is_some(), "progress reporter started");
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                _ = self.shutdown.recv() => {
                    self.flush().await;
                    tracing::info!(pending = self.pending.len(), "progress reporter shutting down");
                    return;
                }

                event = self.rx.recv() => match event {
                    Some(event) => {
                        self.record(event);
                        if self.retry_at.is_none() {
                            self.flush().await;
                        }
                    }
                    None => {
                        self.flush().await;
                        tracing::info!("progress senders dropped, reporter exiting");
                        return;
                    }
                },

                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.flush().await;
                }
            }
        }
    }

    fn record(&mut self, event: Event) {
        match event {
            Event::Message {
                update,
                remote,
                time,
                message,
            } => {
                let entry = {
                    let mut ring = self.ring.write();
                    let entry = LogEntry {
                        seq: ring.next_seq,
                        update: update.clone(),
                        time,
                        message: message.clone(),
                    };
                    ring.next_seq += 1;
                    if ring.entries.len() == self.settings.ring_size {
                        ring.entries.pop_front();
                    }
                    ring.entries.push_back(entry.clone());
                    entry
                };
                // No subscribers is fine.
                let _ = self.live.send(entry);

                if remote {
                    let time = time.timestamp_millis() as f64 / 1000.0;
                    self.push(Outbound::Message {
                        update,
                        message: ProgressMessage { time, message },
                    });
                }
            }
            Event::Completed {
                update,
                remote,
                success,
            } => {
                if remote {
                    self.push(Outbound::Completed { update, success });
                }
            }
        }
    }

    fn push(&mut self, item: Outbound) {
        if self.controller.is_none() {
            return;
        }
        if self.pending.len() >= self.settings.retry_queue {
            self.pending.pop_front();
            tracing::warn!(bound = self.settings.retry_queue, "controller retry queue full, oldest message dropped");
        }
        self.pending.push_back(item);
    }

    /// Send pending items in order until one fails, then schedule a retry.
    async fn flush(&mut self) {
        let Some(controller) = self.controller.clone() else {
            return;
        };
        while let Some(item) = self.pending.front() {
            let result = match item {
                Outbound::Message { update, message } => controller.post_message(update, message).await,
                Outbound::Completed { update, success } => controller.complete(update, *success).await,
            };
            match result {
                Ok(()) => {
                    self.pending.pop_front();
                    self.attempts = 0;
                }
                Err(e) => {
                    let delay = backoff(self.attempts, self.settings.retry_base, self.settings.retry_max);
                    self.attempts = self.attempts.saturating_add(1);
                    self.retry_at = Some(Instant::now() + delay);
                    tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, pending = self.pending.len(), "controller post failed");
                    return;
                }
            }
        }
    }
}

/// `base · 2^attempt`, capped at `max`.
fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

// ── Sink used by updates ──────────────────────────────────────────────────────

/// Where an update's progress goes: the reporter and the update log.
#[derive(Clone, Default)]
pub struct ProgressSink {
    reporter: Option<ReporterHandle>,
    log: Option<UpdateLog>,
}

impl ProgressSink {
    pub fn new(reporter: Option<ReporterHandle>, log: Option<UpdateLog>) -> Self {
        Self { reporter, log }
    }

    pub(crate) fn message(&self, id: u64, key: &str, remote: bool, message: &str) {
        if let Some(log) = &self.log {
            log.append_progress(id, message);
        }
        if let Some(reporter) = &self.reporter {
            reporter.message(key, remote, message);
        }
    }

    pub(crate) fn state(&self, id: u64, state: UpdateState) {
        if let Some(log) = &self.log {
            log.set_state(id, state);
        }
    }

    pub(crate) fn complete(&self, id: u64, key: &str, remote: bool, outcome: &UpdateOutcome) {
        if let Some(log) = &self.log {
            log.finish(id, outcome);
        }
        if let Some(reporter) = &self.reporter {
            reporter.completed(key, remote, outcome.success);
        }
    }
}
