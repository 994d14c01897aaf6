//! Session and download orchestration for a game-store launcher.
//!
//! [`SessionManager`] keeps a login session alive, [`DownloadJob`] runs one
//! install/update/repair through an injected [`Worker`], and every failure
//! reaches the caller as an [`Error`].

pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod job;
pub mod manifest;
pub mod networking;
pub mod session;
pub mod storage;
pub mod util;
pub mod worker;

pub use config::LauncherConfig;
pub use engine::{InstallOptions, LauncherEngine};
pub use error::{ClientError, Error, Result, translate};
pub use job::{
    ControlChannel, ControlCommand, DownloadJob, JobDeps, JobKind, JobParams, JobState, PathLocks,
    StatusChannel, StatusEvent, uninstall,
};
pub use manifest::{Manifest, ManifestFile, ManifestSummary, PendingFile};
pub use networking::{HttpStoreClient, StoreClient};
pub use session::{Credentials, Session, SessionManager};
pub use storage::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use worker::{HttpWorker, Worker, WorkerContext};
