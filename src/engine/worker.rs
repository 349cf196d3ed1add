//! Background execution of a transcoder
//!
//! A single blocking task pumps the transcoder until end of stream. Stopping
//! is cooperative: the flag is checked between whole iterations, so a packet
//! that is being processed always completes first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::preview::PreviewTracker;
use crate::engine::transcoder::{PumpStats, StepStatus, Transcoder};
use crate::error::{TranscodeError, TranscodeResult};

/// Externally visible worker state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Running,
    /// Cancellation requested, task still finishing its iteration
    Stopping,
    Completed,
    Cancelled,
    Failed(String),
}

impl WorkerStatus {
    /// True while a background task is alive
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerStatus::Running | WorkerStatus::Stopping)
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed,
}

/// Summary of one background run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub stats: PumpStats,
}

impl RunReport {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Lifecycle controller around a `Transcoder`.
///
/// `shutdown().await` is the disposal path: it stops the run, waits for the
/// task and closes the transcoder. Dropping the worker instead only requests
/// cancellation; a task still in flight finishes its current packet, then
/// closes and releases the transcoder itself.
pub struct TranscodeWorker {
    transcoder: Arc<Mutex<Transcoder>>,
    preview: PreviewTracker,
    cancel: Arc<AtomicBool>,
    status: Arc<watch::Sender<WorkerStatus>>,
    handle: Option<JoinHandle<RunReport>>,
}

impl TranscodeWorker {
    /// Wrap a transcoder whose header has already been written
    pub fn new(transcoder: Transcoder) -> Self {
        let preview = transcoder.preview().clone();
        let (status, _) = watch::channel(WorkerStatus::Idle);
        Self {
            transcoder: Arc::new(Mutex::new(transcoder)),
            preview,
            cancel: Arc::new(AtomicBool::new(false)),
            status: Arc::new(status),
            handle: None,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change
    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status.subscribe()
    }

    pub fn preview(&self) -> &PreviewTracker {
        &self.preview
    }

    /// Run `f` against the transcoder between worker iterations
    pub fn with_transcoder<R>(&self, f: impl FnOnce(&mut Transcoder) -> R) -> TranscodeResult<R> {
        let mut guard = self.transcoder.lock().map_err(|_| TranscodeError::WorkerError {
            message: "transcoder lock poisoned".to_string(),
        })?;
        Ok(f(&mut guard))
    }

    /// Launch the background task. Must be called within a tokio runtime.
    pub fn start(&mut self) -> TranscodeResult<()> {
        let claimed = self.status.send_if_modified(|status| {
            if status.is_active() {
                false
            } else {
                *status = WorkerStatus::Running;
                true
            }
        });
        if !claimed {
            return Err(TranscodeError::AlreadyRunning);
        }

        self.cancel.store(false, Ordering::SeqCst);
        let transcoder = Arc::clone(&self.transcoder);
        let cancel = Arc::clone(&self.cancel);
        let status = Arc::clone(&self.status);

        info!("Starting transcode worker");
        self.handle = Some(tokio::task::spawn_blocking(move || {
            let started_at = Utc::now();
            let result = run_loop(&transcoder, &cancel);
            let stats = transcoder
                .lock()
                .map(|guard| guard.stats().clone())
                .unwrap_or_default();

            let (outcome, error, final_status) = match result {
                Ok(outcome @ RunOutcome::Completed) => (outcome, None, WorkerStatus::Completed),
                Ok(outcome) => (outcome, None, WorkerStatus::Cancelled),
                Err(e) => {
                    error!("Transcode worker failed: {}", e);
                    (RunOutcome::Failed, Some(e.to_string()), WorkerStatus::Failed(e.to_string()))
                }
            };
            info!("Transcode worker finished: {:?}", outcome);
            status.send_replace(final_status);

            // The worker was dropped while running
            if Arc::strong_count(&transcoder) == 1 {
                if let Ok(mut guard) = transcoder.lock() {
                    guard.close();
                }
            }

            RunReport {
                started_at,
                finished_at: Utc::now(),
                outcome,
                error,
                stats,
            }
        }));
        Ok(())
    }

    /// Request cooperative cancellation; returns immediately
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let changed = self.status.send_if_modified(|status| {
            if *status == WorkerStatus::Running {
                *status = WorkerStatus::Stopping;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Stop requested");
        }
    }

    /// Wait for the current run to finish
    pub async fn wait(&mut self) -> TranscodeResult<RunReport> {
        let handle = self.handle.take().ok_or_else(|| TranscodeError::WorkerError {
            message: "worker has not been started".to_string(),
        })?;
        match handle.await {
            Ok(report) => Ok(report),
            Err(e) => {
                let message = format!("worker task failed: {}", e);
                self.status.send_replace(WorkerStatus::Failed(message.clone()));
                Err(TranscodeError::WorkerError { message })
            }
        }
    }

    /// Stop, wait for the task and release the transcoder. Safe to call
    /// more than once and before `start`.
    pub async fn shutdown(&mut self) -> TranscodeResult<Option<RunReport>> {
        self.stop();
        let report = match self.handle.is_some() {
            true => Some(self.wait().await?),
            false => None,
        };
        self.with_transcoder(|transcoder| transcoder.close())?;
        Ok(report)
    }
}

impl Drop for TranscodeWorker {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        let running = self.handle.as_ref().is_some_and(|handle| !handle.is_finished());
        if !running {
            if let Ok(mut guard) = self.transcoder.lock() {
                guard.close();
            }
        }
    }
}

fn run_loop(transcoder: &Mutex<Transcoder>, cancel: &AtomicBool) -> TranscodeResult<RunOutcome> {
    loop {
        if cancel.load(Ordering::SeqCst) {
            info!("Transcode worker cancelled");
            return Ok(RunOutcome::Cancelled);
        }
        let mut guard = transcoder.lock().map_err(|_| TranscodeError::WorkerError {
            message: "transcoder lock poisoned".to_string(),
        })?;
        if guard.is_finished() {
            return Ok(RunOutcome::Completed);
        }
        if guard.step()? == StepStatus::EndOfStream {
            guard.write_trailer()?;
            return Ok(RunOutcome::Completed);
        }
    }
}
