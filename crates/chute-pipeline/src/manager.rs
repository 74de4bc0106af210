//! Update manager: FIFO queue plus the single worker that owns every
//! mutation of the node.
//!
//! `add` validates and enqueues without waiting on execution. The worker
//! takes one update at a time through planning, execution and completion,
//! so the store, the OS config files and the container runtime are only
//! ever touched from one task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use chute_core::HostConfig;

use crate::error::{ErrorKind, PipelineError, Result};
use crate::executor;
use crate::planners::{self, PlanContext, Verdict};
use crate::reporter::{ProgressSink, ReporterHandle};
use crate::steps::devices::detect;
use crate::steps::StepEnv;
use crate::update::{
    Update, UpdateCallback, UpdateClass, UpdateDescriptor, UpdateOutcome, UpdateState,
};
use crate::update_log::{UpdateLog, UpdateSummary};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("update rejected: {0}")]
    Rejected(PipelineError),
    #[error("update queue is full")]
    QueueFull,
    #[error("update manager is shutting down")]
    ShuttingDown,
}

/// Handle on a submitted update.
#[derive(Debug)]
pub struct UpdateTicket {
    pub id: u64,
    pub tok: u64,
    rx: oneshot::Receiver<UpdateOutcome>,
}

impl UpdateTicket {
    /// Wait for the update to reach a terminal state.
    pub async fn wait(self) -> std::result::Result<UpdateOutcome, SubmitError> {
        self.rx.await.map_err(|_| SubmitError::ShuttingDown)
    }
}

#[derive(Debug, Default)]
struct Sequence {
    last_tok: u64,
    next_id: u64,
}

/// Cheap to clone; every clone feeds the same worker.
#[derive(Clone)]
pub struct UpdateManager {
    tx: mpsc::Sender<Update>,
    sequence: Arc<Mutex<Sequence>>,
    log: UpdateLog,
    sink: ProgressSink,
}

impl UpdateManager {
    /// Start the worker. It stops on shutdown or once every manager clone is dropped.
    pub fn spawn(
        env: StepEnv,
        queue_capacity: usize,
        reporter: Option<ReporterHandle>,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let log = UpdateLog::new();
        let manager = Self {
            tx,
            sequence: Arc::new(Mutex::new(Sequence::default())),
            sink: ProgressSink::new(reporter, Some(log.clone())),
            log,
        };
        let worker = UpdateWorker { rx, env, shutdown };
        (manager, tokio::spawn(worker.run()))
    }

    /// Validate and enqueue. Never waits on execution.
    pub fn add(
        &self,
        descriptor: UpdateDescriptor,
        callback: Option<UpdateCallback>,
    ) -> std::result::Result<UpdateTicket, SubmitError> {
        descriptor.validate().map_err(SubmitError::Rejected)?;

        // Held across the send so ids, toks and queue order agree.
        let mut sequence = self.sequence.lock();
        let tok = match descriptor.tok {
            Some(tok) if tok <= sequence.last_tok => {
                return Err(SubmitError::Rejected(PipelineError::Validation(format!(
                    "tok {tok} is not greater than the last accepted tok {}",
                    sequence.last_tok
                ))))
            }
            Some(tok) => tok,
            None => sequence.last_tok + 1,
        };
        let id = sequence.next_id + 1;

        let summary = UpdateSummary {
            id,
            tok,
            class: descriptor.class,
            kind: descriptor.kind,
            name: descriptor.name.clone(),
            state: UpdateState::Queued,
            progress: Vec::new(),
            success: None,
            message: None,
        };
        let (ticket_tx, ticket_rx) = oneshot::channel();
        let update = Update::new(
            id,
            tok,
            descriptor,
            self.sink.clone(),
            callback,
            Some(ticket_tx),
        );

        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => return Err(SubmitError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(SubmitError::ShuttingDown),
        }
        sequence.last_tok = tok;
        sequence.next_id = id;
        self.log.insert(summary);
        drop(sequence);

        tracing::info!(update = id, tok, "update queued");
        Ok(UpdateTicket {
            id,
            tok,
            rx: ticket_rx,
        })
    }

    pub fn log(&self) -> &UpdateLog {
        &self.log
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

pub struct UpdateWorker {
    rx: mpsc::Receiver<Update>,
    env: StepEnv,
    shutdown: broadcast::Receiver<()>,
}

impl UpdateWorker {
    pub async fn run(mut self) {
        tracing::info!("update worker started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    tracing::info!("update worker shutting down");
                    self.drain();
                    return;
                }

                next = self.rx.recv() => {
                    let Some(update) = next else {
                        tracing::info!("update queue closed, worker exiting");
                        return;
                    };
                    self.process(update).await;
                }
            }
        }
    }

    /// Refuse further sends and fail whatever is still queued.
    fn drain(&mut self) {
        self.rx.close();
        let mut drained = 0usize;
        while let Ok(mut update) = self.rx.try_recv() {
            drained += 1;
            finish(&mut update, false, "Update manager is shutting down".to_string());
        }
        if drained > 0 {
            tracing::warn!(drained, "queued updates failed at shutdown");
        }
    }

    async fn process(&self, mut update: Update) {
        let (success, message) = match self.drive(&mut update).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(update = update.id, error = %e, "update hit an internal error");
                (false, e.to_string())
            }
        };
        finish(&mut update, success, message);
    }

    /// Plan and execute. `Err` is reserved for internal invariant violations.
    async fn drive(&self, update: &mut Update) -> Result<(bool, String)> {
        update.set_state(UpdateState::Planning);
        tracing::debug!(update = update.id, class = %update.class(), kind = %update.kind(), name = %update.name(), "planning");

        let ctx = match self.context(update.class()).await {
            Ok(ctx) => ctx,
            Err(e) => return Ok((false, e.to_string())),
        };
        if let Err(e) = update.prepare(&self.env.store) {
            return Ok((false, e.to_string()));
        }
        if let Verdict::Abort(reason) = planners::plan(update, &ctx)? {
            return Ok((false, reason));
        }

        update.set_state(UpdateState::Executing);
        match executor::execute(update, &self.env).await {
            Ok(()) => Ok((true, completion_message(update))),
            Err(e) if e.kind() == ErrorKind::InternalInvariant => Err(e),
            Err(e) => Ok((false, e.to_string())),
        }
    }

    /// Takes the class alone: the update holds a callback that is not `Sync`,
    /// so a borrow of it cannot live across an await.
    async fn context(&self, class: UpdateClass) -> Result<PlanContext> {
        let settings = &self.env.settings;
        let host_config = match HostConfig::load_optional(&settings.host_config)? {
            Some(config) => config,
            None => {
                let devices = detect(&settings.sysfs_root).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "device detection failed");
                    Default::default()
                });
                HostConfig::generate(&devices.ethernet, &devices.wifi)
            }
        };
        let installed_snaps = if class == UpdateClass::Snap {
            crate::error::with_deadline(
                "installer.installed_versions",
                settings.installer_timeout,
                async {
                    self.env
                        .installer
                        .installed_versions()
                        .await
                        .map_err(PipelineError::from)
                },
            )
            .await?
        } else {
            Default::default()
        };
        Ok(PlanContext {
            chutes: self.env.store.list(),
            host_config,
            installed_snaps,
        })
    }
}

/// Complete `update` and run its callback. A panicking callback is logged.
fn finish(update: &mut Update, success: bool, message: String) {
    let id = update.id;
    let outcome = match update.complete(success, message) {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(update = id, error = %e, "update completion failed");
            return;
        }
    };
    tracing::info!(update = id, state = ?outcome.state, success, "update finished");

    if let Some(callback) = update.take_callback() {
        let run = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome)));
        if run.is_err() {
            tracing::error!(update = id, "update callback panicked");
        }
    }
}

fn completion_message(update: &Update) -> String {
    match update.class() {
        UpdateClass::Chute => format!("Chute {} {} completed", update.name(), update.kind()),
        UpdateClass::HostConfig => "Host configuration updated".to_string(),
        UpdateClass::Router => "Factory reset completed".to_string(),
        UpdateClass::Snap => "Install request delivered".to_string(),
    }
}
