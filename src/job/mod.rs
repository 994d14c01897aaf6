//! Install, update and repair jobs.
//!
//! A [`DownloadJob`] validates its parameters, claims its destination, asks
//! the store for a manifest diff and then drives an injected [`Worker`] on a
//! background task. The caller watches a [`StatusChannel`] and steers the job
//! through a [`ControlChannel`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::manifest::{self, ManifestSummary};
use crate::networking::StoreClient;
use crate::session::{Session, SessionManager};
use crate::worker::{Worker, WorkerContext};

pub mod channel;
pub mod lock;
pub mod params;
mod removal;

pub use channel::{ControlChannel, ControlCommand, StatusChannel, StatusEvent};
pub use lock::{PathLease, PathLocks};
pub use params::{JobKind, JobParams};
pub use removal::uninstall;

const DEFAULT_STATUS_CAPACITY: usize = 64;
const MIN_STATUS_CAPACITY: usize = 4;
const CONTROL_CAPACITY: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Created,
    Analyzing,
    Ready,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Created => "created",
            JobState::Analyzing => "analyzing",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        })
    }
}

/// Collaborators a job is built with.
#[derive(Clone)]
pub struct JobDeps {
    pub client: Arc<dyn StoreClient>,
    pub worker: Arc<dyn Worker>,
    pub locks: PathLocks,
    pub status_capacity: usize,
    /// Told when the store rejects the job's token mid-transfer.
    pub sessions: Option<Arc<SessionManager>>,
}

impl JobDeps {
    pub fn new(client: Arc<dyn StoreClient>, worker: Arc<dyn Worker>, locks: PathLocks) -> Self {
        Self {
            client,
            worker,
            locks,
            status_capacity: DEFAULT_STATUS_CAPACITY,
            sessions: None,
        }
    }

    pub fn with_status_capacity(mut self, capacity: usize) -> Self {
        self.status_capacity = capacity;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }
}

pub(crate) enum CancelRequest {
    /// The job had not started and is now cancelled.
    Finished,
    /// The worker will observe the request at its next chunk boundary.
    Cooperative,
    /// Already requested, or the job already ended.
    Ignored,
}

/// State shared between the job handle, its control handles and its worker.
#[derive(Debug)]
pub(crate) struct JobShared {
    state: Mutex<JobState>,
    cancel: CancellationToken,
    lease: Mutex<Option<PathLease>>,
}

impl JobShared {
    fn new(lease: PathLease) -> Self {
        Self {
            state: Mutex::new(JobState::Created),
            cancel: CancellationToken::new(),
            lease: Mutex::new(Some(lease)),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> JobState {
        *self.lock_state()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Move to `to` if the current state is one of `from`; returns the current state otherwise.
    pub(crate) fn transition(
        &self,
        from: &[JobState],
        to: JobState,
    ) -> std::result::Result<(), JobState> {
        let mut state = self.lock_state();
        if from.contains(&*state) {
            *state = to;
            Ok(())
        } else {
            Err(*state)
        }
    }

    /// Run `f` under the state lock unless the job ended or a cancel was requested.
    pub(crate) fn while_active(&self, f: impl FnOnce()) {
        let state = self.lock_state();
        if !state.is_terminal() && !self.cancel.is_cancelled() {
            f();
        }
    }

    /// Enter a terminal state once. Releases the destination lock.
    pub(crate) fn finish(&self, terminal: JobState) -> bool {
        {
            let mut state = self.lock_state();
            if state.is_terminal() {
                return false;
            }
            *state = terminal;
        }
        self.release_lease();
        true
    }

    pub(crate) fn request_cancel(&self) -> CancelRequest {
        let mut state = self.lock_state();
        if state.is_terminal() || self.cancel.is_cancelled() {
            return CancelRequest::Ignored;
        }
        self.cancel.cancel();
        match *state {
            JobState::Running | JobState::Paused => CancelRequest::Cooperative,
            _ => {
                *state = JobState::Cancelled;
                drop(state);
                self.release_lease();
                CancelRequest::Finished
            }
        }
    }

    fn release_lease(&self) {
        let lease = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(lease);
    }
}

/// One install/update/repair operation.
pub struct DownloadJob {
    session: Arc<Session>,
    params: JobParams,
    deps: JobDeps,
    shared: Arc<JobShared>,
    control: ControlChannel,
    control_rx: Option<mpsc::Receiver<ControlCommand>>,
    summary: Option<ManifestSummary>,
    handle: Option<JoinHandle<()>>,
}

impl DownloadJob {
    /// Validate `params` and claim the destination. No worker is spawned yet.
    ///
    /// # Errors
    /// `InvalidParameters` for bad input (nothing is claimed) and `PathBusy`
    /// when another job owns the destination.
    pub fn create(session: Arc<Session>, params: JobParams, deps: JobDeps) -> Result<Self> {
        params.validate()?;
        let lease = deps.locks.acquire(&params.destination)?;
        info!(
            "job: created {} of {} into {}",
            params.kind,
            params.app_name,
            lease.path().display()
        );

        let shared = Arc::new(JobShared::new(lease));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        Ok(Self {
            session,
            params,
            deps,
            control: ControlChannel::new(control_tx, Arc::clone(&shared)),
            shared,
            control_rx: Some(control_rx),
            summary: None,
            handle: None,
        })
    }

    /// Ask the store what has to be transferred.
    ///
    /// Any failure ends the job as `Failed` and frees the destination. A
    /// rejected token also invalidates the held session when `deps` carries
    /// the session manager.
    pub async fn analyze(&mut self) -> Result<ManifestSummary> {
        if let Err(state) = self
            .shared
            .transition(&[JobState::Created], JobState::Analyzing)
        {
            return Err(self.refused("analyze", state));
        }
        info!("job: analyzing {}", self.params.app_name);

        match self.compute_summary().await {
            Ok(summary) => {
                if let Err(state) = self
                    .shared
                    .transition(&[JobState::Analyzing], JobState::Ready)
                {
                    return Err(self.refused("analyze", state));
                }
                self.summary = Some(summary.clone());
                Ok(summary)
            }
            Err(err) => {
                if err == Error::InvalidCredentials
                    && let Some(sessions) = &self.deps.sessions
                {
                    sessions.invalidate().await;
                }
                if self.shared.finish(JobState::Failed) {
                    warn!("job: analysis of {} failed: {err}", self.params.app_name);
                    Err(err)
                } else {
                    Err(Error::Cancelled)
                }
            }
        }
    }

    async fn compute_summary(&self) -> Result<ManifestSummary> {
        let manifest = self
            .deps
            .client
            .fetch_manifest(&self.session, &self.params)
            .await?;
        if self.shared.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let params = self.params.clone();
        tokio::task::spawn_blocking(move || manifest::diff(&manifest, &params))
            .await
            .map_err(|err| Error::unknown(format!("manifest analysis aborted: {err}")))?
    }

    /// Spawn the worker and hand back the status stream.
    pub fn start(&mut self) -> Result<StatusChannel> {
        let Some(summary) = self.summary.clone() else {
            return Err(self.refused("start", self.shared.state()));
        };
        if let Err(state) = self.shared.transition(&[JobState::Ready], JobState::Running) {
            return Err(self.refused("start", state));
        }
        let Some(control_rx) = self.control_rx.take() else {
            return Err(self.refused("start", JobState::Running));
        };

        let (status_tx, status_rx) =
            mpsc::channel(self.deps.status_capacity.max(MIN_STATUS_CAPACITY));
        let (terminal_tx, terminal_rx) = oneshot::channel();
        let ctx = Arc::new(WorkerContext::new(
            Arc::clone(&self.session),
            self.params.clone(),
            summary,
            status_tx,
            terminal_tx,
            control_rx,
            Arc::clone(&self.shared),
        ));
        let worker = Arc::clone(&self.deps.worker);
        let sessions = self.deps.sessions.clone();
        let app_name = self.params.app_name.clone();
        info!("job: starting {app_name}");

        self.handle = Some(tokio::spawn(async move {
            let run = tokio::spawn({
                let ctx = Arc::clone(&ctx);
                async move { worker.run(&ctx).await }
            });
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(err) => Err(Error::unknown(format!("worker aborted: {err}"))),
            };
            match &outcome {
                Ok(()) => info!("job: {app_name} worker finished"),
                Err(Error::Cancelled) => info!("job: {app_name} cancelled"),
                Err(err) => warn!("job: {app_name} failed: {err}"),
            }
            if let (Err(Error::InvalidCredentials), Some(sessions)) = (&outcome, &sessions) {
                sessions.invalidate().await;
            }
            ctx.finish(outcome);
        }));

        Ok(StatusChannel::new(status_rx, terminal_rx))
    }

    /// A handle for pushing commands; usable in any state.
    pub fn control(&self) -> ControlChannel {
        self.control.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    pub fn params(&self) -> &JobParams {
        &self.params
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The result of the last successful `analyze`.
    pub fn summary(&self) -> Option<&ManifestSummary> {
        self.summary.as_ref()
    }

    /// Wait for the worker task to end and return the final state.
    pub async fn wait(&mut self) -> JobState {
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.await
        {
            warn!("job: supervisor task failed: {err}");
        }
        self.state()
    }

    fn refused(&self, operation: &'static str, state: JobState) -> Error {
        if state == JobState::Cancelled {
            Error::Cancelled
        } else {
            Error::InvalidState {
                operation,
                state: state.to_string(),
            }
        }
    }
}

impl fmt::Debug for DownloadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadJob")
            .field("params", &self.params)
            .field("state", &self.state())
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}
