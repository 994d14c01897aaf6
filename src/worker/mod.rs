//! Download workers.
//!
//! A worker receives a [`WorkerContext`] and transfers the files listed in the
//! job's manifest summary. It must call [`WorkerContext::checkpoint`] at every
//! chunk boundary: that is where pause and cancel requests take effect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::WaitForCancellationFuture;

use crate::error::{Error, Result};
use crate::job::channel::StatusSender;
use crate::job::{ControlCommand, JobParams, JobShared, StatusEvent};
use crate::manifest::ManifestSummary;
use crate::session::Session;

pub mod http;

pub use http::HttpWorker;

/// Performs the transfer for one job.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Transfer everything in `ctx.summary()`. Return `Err(Error::Cancelled)`
    /// when a checkpoint reports cancellation.
    async fn run(&self, ctx: &WorkerContext) -> Result<()>;
}

/// The worker's view of its job.
#[derive(Debug)]
pub struct WorkerContext {
    session: Arc<Session>,
    params: JobParams,
    summary: ManifestSummary,
    status: StatusSender,
    control: Mutex<mpsc::Receiver<ControlCommand>>,
    shared: Arc<JobShared>,
    bytes_done: AtomicU64,
    files_done: AtomicU64,
    started: Instant,
}

impl WorkerContext {
    pub(crate) fn new(
        session: Arc<Session>,
        params: JobParams,
        summary: ManifestSummary,
        status: mpsc::Sender<StatusEvent>,
        terminal: oneshot::Sender<StatusEvent>,
        control: mpsc::Receiver<ControlCommand>,
        shared: Arc<JobShared>,
    ) -> Self {
        Self {
            session,
            params,
            summary,
            status: StatusSender::new(status, terminal, Arc::clone(&shared)),
            control: Mutex::new(control),
            shared,
            bytes_done: AtomicU64::new(0),
            files_done: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn params(&self) -> &JobParams {
        &self.params
    }

    pub fn summary(&self) -> &ManifestSummary {
        &self.summary
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::SeqCst)
    }

    pub fn files_done(&self) -> u64 {
        self.files_done.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Resolves once a cancel has been requested; for use in `select!` around I/O.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.shared.cancel_token().cancelled()
    }

    /// Apply pending control commands.
    ///
    /// Returns `Err(Error::Cancelled)` once cancellation was requested. A
    /// pause blocks here until resume or cancel; concurrent callers queue up
    /// behind the paused one.
    pub async fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut control = self.control.lock().await;
        while let Ok(command) = control.try_recv() {
            match command {
                ControlCommand::Pause => self.hold(&mut control).await?,
                ControlCommand::Resume => debug!("worker: resume while not paused"),
                ControlCommand::Cancel => return Err(Error::Cancelled),
            }
        }
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn hold(&self, control: &mut mpsc::Receiver<ControlCommand>) -> Result<()> {
        self.status.acknowledge(StatusEvent::Paused).await?;
        info!("worker: paused {}", self.params.app_name);
        loop {
            tokio::select! {
                biased;
                () = self.cancelled() => return Err(Error::Cancelled),
                command = control.recv() => match command {
                    Some(ControlCommand::Resume) => break,
                    Some(ControlCommand::Pause) => {}
                    // Every control handle is gone; nobody can resume us.
                    Some(ControlCommand::Cancel) | None => return Err(Error::Cancelled),
                },
            }
        }
        self.status.acknowledge(StatusEvent::Resumed).await?;
        info!("worker: resumed {}", self.params.app_name);
        Ok(())
    }

    /// Account for transferred bytes, report progress and honour the bandwidth limit.
    pub async fn advance(&self, bytes: u64) {
        let done = self.bytes_done.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.report();
        if let Some(limit) = self.params.bandwidth_limit {
            let due = Duration::from_secs_f64(done as f64 / limit as f64);
            let elapsed = self.started.elapsed();
            if due > elapsed {
                tokio::select! {
                    () = tokio::time::sleep(due - elapsed) => {}
                    () = self.cancelled() => {}
                }
            }
        }
    }

    /// Mark one file as fully written.
    pub fn file_done(&self) {
        self.files_done.fetch_add(1, Ordering::SeqCst);
        self.report();
    }

    fn report(&self) {
        self.status.progress(StatusEvent::Progress {
            bytes_done: self.bytes_done(),
            bytes_total: self.summary.download_size,
            files_done: self.files_done(),
            files_total: self.summary.files_total(),
        });
    }

    pub(crate) fn finish(&self, outcome: Result<()>) {
        self.status.finish(outcome);
    }
}
