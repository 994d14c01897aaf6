use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::config::LauncherConfig;
use crate::error::Result;
use crate::job::{self, DownloadJob, JobDeps, JobKind, JobParams, PathLocks};
use crate::networking::{HttpStoreClient, StoreClient};
use crate::session::{Credentials, Session, SessionManager};
use crate::storage::{CredentialStore, FileCredentialStore};
use crate::worker::{HttpWorker, Worker};

/// Options a caller may set on top of the configured defaults.
#[derive(Clone, Debug, Default)]
pub struct InstallOptions {
    pub destination: Option<PathBuf>,
    pub max_workers: Option<usize>,
    pub include_prefixes: Vec<String>,
    pub exclude_prefixes: Vec<String>,
    pub install_tags: Vec<String>,
    pub bandwidth_limit: Option<u64>,
    pub force: bool,
    pub disable_patching: bool,
    pub disable_delta: bool,
}

/// Wires the session manager and job collaborators from one configuration.
pub struct LauncherEngine {
    config: LauncherConfig,
    sessions: Arc<SessionManager>,
    deps: JobDeps,
}

impl LauncherEngine {
    /// Engine talking to the configured store over HTTP, with credentials on disk.
    pub fn new(config: LauncherConfig) -> Self {
        let client: Arc<dyn StoreClient> = Arc::new(HttpStoreClient::new(
            config.api_base_url.clone(),
            config.request_timeout(),
        ));
        let worker: Arc<dyn Worker> = Arc::new(HttpWorker::new(config.request_timeout()));
        let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::default());
        Self::with_parts(config, client, worker, store)
    }

    pub fn with_parts(
        config: LauncherConfig,
        client: Arc<dyn StoreClient>,
        worker: Arc<dyn Worker>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(Arc::clone(&client), store));
        let deps = JobDeps::new(client, worker, PathLocks::new())
            .with_status_capacity(config.status_queue_capacity)
            .with_sessions(Arc::clone(&sessions));
        Self {
            config,
            sessions,
            deps,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub async fn login(&self, refresh_token: &str) -> Result<Arc<Session>> {
        info!("engine: storing new login");
        self.sessions
            .login(Credentials::from_refresh_token(refresh_token))
            .await
    }

    pub async fn login_with_code(&self, code: &str) -> Result<Arc<Session>> {
        info!("engine: exchanging authorization code");
        self.sessions.login_with_code(code).await
    }

    fn destination_for(&self, app_name: &str, destination: Option<&Path>) -> PathBuf {
        destination.map_or_else(|| self.config.install_dir.join(app_name), Path::to_path_buf)
    }

    /// Build job parameters from the configuration and per-call options.
    pub fn params_for(&self, kind: JobKind, app_name: &str, options: &InstallOptions) -> JobParams {
        let destination = self.destination_for(app_name, options.destination.as_deref());
        let mut params = JobParams::new(app_name, destination);
        params.kind = kind;
        params.max_workers = options.max_workers.unwrap_or(self.config.max_workers);
        params.max_shared_memory_mib = self.config.max_shared_memory_mib;
        params.platform = self.config.platform.clone();
        params.timeout = self.config.request_timeout();
        params.preferred_cdn = self.config.preferred_cdn.clone();
        params.include_prefixes = options.include_prefixes.clone();
        params.exclude_prefixes = options.exclude_prefixes.clone();
        params.install_tags = options.install_tags.clone();
        params.bandwidth_limit = options.bandwidth_limit;
        params.force = options.force;
        params.disable_patching = options.disable_patching;
        params.disable_delta = options.disable_delta;
        params
    }

    /// Authenticate, create the job and analyze it.
    ///
    /// A rejected token during analysis invalidates the held session so the
    /// next call refreshes it.
    pub async fn prepare(&self, params: JobParams) -> Result<DownloadJob> {
        let session = self.sessions.authenticate().await?;
        let mut job = DownloadJob::create(session, params, self.deps.clone())?;
        job.analyze().await?;
        Ok(job)
    }

    /// Remove an installed title, unless a job currently owns its directory.
    pub async fn uninstall(&self, app_name: &str, destination: Option<&Path>) -> Result<()> {
        let destination = self.destination_for(app_name, destination);
        info!("engine: uninstalling {app_name} from {}", destination.display());
        job::uninstall(&self.deps.locks, &destination).await
    }
}
