use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::job::{CancelRequest, JobShared, JobState};

/// Slots kept free for pause/resume acknowledgements.
const RESERVED_SLOTS: usize = 2;

/// Events a running job reports to its caller, in emission order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    Progress {
        bytes_done: u64,
        bytes_total: u64,
        files_done: u64,
        files_total: u64,
    },
    Paused,
    Resumed,
    Completed,
    Cancelled,
    Failed {
        error: Error,
    },
}

impl StatusEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatusEvent::Completed | StatusEvent::Cancelled | StatusEvent::Failed { .. }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Cancel,
}

impl ControlCommand {
    fn verb(self) -> &'static str {
        match self {
            ControlCommand::Pause => "pause",
            ControlCommand::Resume => "resume",
            ControlCommand::Cancel => "cancel",
        }
    }
}

/// Consumer side of a job's status stream. Ends after the terminal event.
///
/// The terminal event travels on its own slot so it is delivered even when
/// nobody drained the queue.
#[derive(Debug)]
pub struct StatusChannel {
    rx: mpsc::Receiver<StatusEvent>,
    terminal: Option<oneshot::Receiver<StatusEvent>>,
}

impl StatusChannel {
    pub(crate) fn new(
        rx: mpsc::Receiver<StatusEvent>,
        terminal: oneshot::Receiver<StatusEvent>,
    ) -> Self {
        Self {
            rx,
            terminal: Some(terminal),
        }
    }

    /// Wait for the next event; `None` once the job has closed the stream.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        if let Some(event) = self.rx.recv().await {
            return Some(event);
        }
        let terminal = self.terminal.take()?;
        terminal.await.ok()
    }

    /// Poll without waiting.
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                let mut terminal = self.terminal.take()?;
                terminal.try_recv().ok()
            }
        }
    }
}

/// Producer side of a job's command stream. Never blocks.
#[derive(Clone, Debug)]
pub struct ControlChannel {
    tx: mpsc::Sender<ControlCommand>,
    shared: Arc<JobShared>,
}

impl ControlChannel {
    pub(crate) fn new(tx: mpsc::Sender<ControlCommand>, shared: Arc<JobShared>) -> Self {
        Self { tx, shared }
    }

    /// Push a command to the job.
    ///
    /// Cancel is monotonic: repeating it, or sending it to a finished job, is a
    /// no-op. Pause and Resume take effect when the worker acknowledges them.
    pub fn send(&self, command: ControlCommand) -> Result<()> {
        if command == ControlCommand::Cancel {
            match self.shared.request_cancel() {
                CancelRequest::Finished => debug!("control: job cancelled before start"),
                CancelRequest::Cooperative => debug!("control: cancel requested"),
                CancelRequest::Ignored => debug!("control: cancel already requested"),
            }
            return Ok(());
        }

        let state = self.shared.state();
        if state.is_terminal() {
            return Err(invalid(command, state));
        }
        if self.shared.is_cancelled() {
            debug!("control: ignoring {} after cancel", command.verb());
            return Ok(());
        }
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::InvalidState {
                operation: command.verb(),
                state: "still processing earlier commands".into(),
            }),
            Err(TrySendError::Closed(_)) => Err(invalid(command, self.shared.state())),
        }
    }

    pub fn pause(&self) -> Result<()> {
        self.send(ControlCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(ControlCommand::Resume)
    }

    pub fn cancel(&self) -> Result<()> {
        self.send(ControlCommand::Cancel)
    }
}

fn invalid(command: ControlCommand, state: JobState) -> Error {
    Error::InvalidState {
        operation: command.verb(),
        state: state.to_string(),
    }
}

/// Worker-side writer for the status stream.
#[derive(Debug)]
pub(crate) struct StatusSender {
    tx: mpsc::Sender<StatusEvent>,
    terminal: Mutex<Option<oneshot::Sender<StatusEvent>>>,
    shared: Arc<JobShared>,
}

impl StatusSender {
    pub(crate) fn new(
        tx: mpsc::Sender<StatusEvent>,
        terminal: oneshot::Sender<StatusEvent>,
        shared: Arc<JobShared>,
    ) -> Self {
        Self {
            tx,
            terminal: Mutex::new(Some(terminal)),
            shared,
        }
    }

    /// Fire-and-forget; dropped when the queue is nearly full or after a cancel request.
    pub(crate) fn progress(&self, event: StatusEvent) {
        self.shared.while_active(|| {
            if self.tx.capacity() <= RESERVED_SLOTS {
                debug!("status: queue full, dropping progress update");
                return;
            }
            let _ = self.tx.try_send(event);
        });
    }

    /// Emit a pause/resume acknowledgement and move the job state with it.
    ///
    /// Waits for queue space, but gives up with `Cancelled` once a cancel is
    /// requested so an undrained queue cannot pin the job.
    pub(crate) async fn acknowledge(&self, event: StatusEvent) -> Result<()> {
        let moved = match event {
            StatusEvent::Paused => self
                .shared
                .transition(&[JobState::Running], JobState::Paused),
            StatusEvent::Resumed => self
                .shared
                .transition(&[JobState::Paused], JobState::Running),
            _ => return Ok(()),
        };
        if moved.is_err() {
            return Ok(());
        }
        tokio::select! {
            biased;
            () = self.shared.cancel_token().cancelled() => Err(Error::Cancelled),
            _ = self.tx.send(event) => Ok(()),
        }
    }

    /// Enter the terminal state, release the destination and report the outcome.
    pub(crate) fn finish(&self, outcome: Result<()>) {
        let (state, event) = match outcome {
            Ok(()) if self.shared.is_cancelled() => (JobState::Cancelled, StatusEvent::Cancelled),
            Ok(()) => (JobState::Completed, StatusEvent::Completed),
            Err(Error::Cancelled) => (JobState::Cancelled, StatusEvent::Cancelled),
            Err(error) => (JobState::Failed, StatusEvent::Failed { error }),
        };
        if !self.shared.finish(state) {
            return;
        }
        let terminal = self
            .terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(terminal) = terminal {
            let _ = terminal.send(event);
        }
    }
}
