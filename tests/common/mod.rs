#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use tokio::sync::Semaphore;

use launchkit::{
    ClientError, Credentials, Error, JobDeps, JobParams, Manifest, ManifestFile, PathLocks,
    Session, StatusChannel, StatusEvent, StoreClient, Worker, WorkerContext,
};

/// A credential record expiring `expires_in` from now.
pub fn record(access: &str, refresh: &str, expires_in: TimeDelta) -> Credentials {
    let mut record = Credentials::from_refresh_token(refresh);
    record.access_token = Some(access.into());
    record.expires_at = Some((Utc::now() + expires_in).format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string());
    record.display_name = Some("tester".into());
    record
}

pub fn session(expires_in: TimeDelta) -> Arc<Session> {
    Arc::new(Session::from_credentials(&record("at", "rt", expires_in)).unwrap())
}

/// Store client whose answers are set by the test.
pub struct FakeClient {
    pub start_result: Mutex<Result<Credentials, ClientError>>,
    pub resume_result: Mutex<Result<Credentials, ClientError>>,
    pub manifest_result: Mutex<Result<Manifest, ClientError>>,
    pub code_result: Mutex<Result<Credentials, ClientError>>,
    pub start_calls: AtomicUsize,
    pub code_calls: AtomicUsize,
    pub resume_calls: AtomicUsize,
    pub manifest_calls: AtomicUsize,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            start_result: Mutex::new(Ok(record("fresh-at", "fresh-rt", TimeDelta::hours(8)))),
            resume_result: Mutex::new(Err(ClientError::Rejected("no resume".into()))),
            manifest_result: Mutex::new(Ok(manifest(2, 20))),
            code_result: Mutex::new(Ok(record("code-at", "code-rt", TimeDelta::hours(8)))),
            start_calls: AtomicUsize::new(0),
            code_calls: AtomicUsize::new(0),
            resume_calls: AtomicUsize::new(0),
            manifest_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_start(&self, result: Result<Credentials, ClientError>) {
        *self.start_result.lock().unwrap() = result;
    }

    pub fn set_resume(&self, result: Result<Credentials, ClientError>) {
        *self.resume_result.lock().unwrap() = result;
    }

    pub fn set_code(&self, result: Result<Credentials, ClientError>) {
        *self.code_result.lock().unwrap() = result;
    }

    pub fn set_manifest(&self, result: Result<Manifest, ClientError>) {
        *self.manifest_result.lock().unwrap() = result;
    }

    pub fn network_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
            + self.resume_calls.load(Ordering::SeqCst)
            + self.manifest_calls.load(Ordering::SeqCst)
            + self.code_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreClient for FakeClient {
    async fn resume_session(&self, _credentials: &Credentials) -> Result<Credentials, ClientError> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        self.resume_result.lock().unwrap().clone()
    }

    async fn start_session(&self, _refresh_token: &str) -> Result<Credentials, ClientError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.start_result.lock().unwrap().clone()
    }

    async fn exchange_code(&self, _code: &str) -> Result<Credentials, ClientError> {
        self.code_calls.fetch_add(1, Ordering::SeqCst);
        self.code_result.lock().unwrap().clone()
    }

    async fn fetch_manifest(
        &self,
        _session: &Session,
        _params: &JobParams,
    ) -> Result<Manifest, ClientError> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);
        self.manifest_result.lock().unwrap().clone()
    }
}

/// `files` entries of `size` bytes each.
pub fn manifest(files: usize, size: u64) -> Manifest {
    Manifest {
        app_name: "Sugar".into(),
        build_version: "1.0.0".into(),
        base_url: Some("https://cdn.example/sugar".into()),
        files: (0..files)
            .map(|i| ManifestFile {
                path: format!("Content/file{i}.pak"),
                size,
                sha256: None,
                url: None,
            })
            .collect(),
    }
}

/// Worker that moves one chunk forward per permit added to `steps`.
pub struct SteppedWorker {
    pub steps: Arc<Semaphore>,
    pub chunk: u64,
    pub runs: AtomicUsize,
    pub fail_with: Mutex<Option<Error>>,
}

impl SteppedWorker {
    pub fn new(chunk: u64) -> Arc<Self> {
        Arc::new(Self {
            steps: Arc::new(Semaphore::new(0)),
            chunk,
            runs: AtomicUsize::new(0),
            fail_with: Mutex::new(None),
        })
    }

    pub fn step(&self, chunks: usize) {
        self.steps.add_permits(chunks);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for SteppedWorker {
    async fn run(&self, ctx: &WorkerContext) -> Result<(), Error> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        for file in &ctx.summary().files {
            let mut written = 0;
            while written < file.size {
                tokio::select! {
                    biased;
                    () = ctx.cancelled() => return Err(Error::Cancelled),
                    permit = self.steps.acquire() => permit.unwrap().forget(),
                }
                ctx.checkpoint().await?;
                let n = self.chunk.min(file.size - written);
                ctx.advance(n).await;
                written += n;
            }
            ctx.file_done();
        }
        Ok(())
    }
}

pub fn deps(client: Arc<FakeClient>, worker: Arc<SteppedWorker>, locks: &PathLocks) -> JobDeps {
    JobDeps::new(client, worker, locks.clone())
}

pub fn params(destination: &Path) -> JobParams {
    let mut params = JobParams::new("Sugar", destination);
    params.max_workers = 2;
    params
}

/// Next event, failing the test instead of hanging.
pub async fn next_event(status: &mut StatusChannel) -> Option<StatusEvent> {
    tokio::time::timeout(Duration::from_secs(5), status.recv())
        .await
        .expect("timed out waiting for a status event")
}

/// Every remaining event until the job closes the stream.
pub async fn drain(status: &mut StatusChannel) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    while let Some(event) = next_event(status).await {
        events.push(event);
    }
    events
}
