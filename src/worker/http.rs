use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use log::{debug, info, warn};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::{ClientError, Error, Result};
use crate::manifest::{PendingFile, resolve_local};
use crate::networking::check_status;
use crate::worker::{Worker, WorkerContext};

const PART_SUFFIX: &str = "part";

/// Fetches manifest entries over HTTP, several files at a time.
#[derive(Clone, Debug)]
pub struct HttpWorker {
    client: Client,
}

impl HttpWorker {
    pub fn new(connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(connect_timeout.max(Duration::from_secs(30)))
            .user_agent(concat!("launchkit/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|err| {
                warn!("worker: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }

    async fn fetch(&self, ctx: &WorkerContext, file: &PendingFile) -> Result<()> {
        let dest = resolve_local(&ctx.params().destination, &file.path)?;
        let part = part_path(&dest);
        let result = self.fetch_to(ctx, file, &dest, &part).await;
        if result.is_err() {
            let _ = fs::remove_file(&part).await;
        }
        result
    }

    async fn fetch_to(
        &self,
        ctx: &WorkerContext,
        file: &PendingFile,
        dest: &Path,
        part: &Path,
    ) -> Result<()> {
        ctx.checkpoint().await?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| Error::disk(parent, err))?;
        }

        let request = self
            .client
            .get(&file.url)
            .bearer_auth(ctx.session().access_token());
        let response = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(Error::Cancelled),
            response = request.send() => response.map_err(ClientError::from)?,
        };
        let response = check_status(response).await?;

        let handle = File::create(part)
            .await
            .map_err(|err| ClientError::io(part, &err))?;
        let mut out = BufWriter::with_capacity(ctx.params().write_buffer_size(), handle);
        let mut body = response.bytes_stream();
        let mut hasher = Sha256::new();
        let mut received: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                () = ctx.cancelled() => return Err(Error::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(ClientError::from)?;
            ctx.checkpoint().await?;
            out.write_all(&chunk)
                .await
                .map_err(|err| ClientError::io(part, &err))?;
            hasher.update(&chunk);
            received += chunk.len() as u64;
            ctx.advance(chunk.len() as u64).await;
        }
        out.flush()
            .await
            .map_err(|err| ClientError::io(part, &err))?;
        drop(out);

        if received != file.size {
            return Err(Error::Transport {
                retryable: true,
                message: format!(
                    "download of {} incomplete: received {} of {} bytes",
                    file.path, received, file.size
                ),
            });
        }
        if let Some(expected) = &file.sha256 {
            let actual = format!("{:x}", hasher.finalize());
            if actual != expected.to_lowercase() {
                return Err(Error::Transport {
                    retryable: true,
                    message: format!(
                        "checksum mismatch for {}: expected {expected}, got {actual}",
                        file.path
                    ),
                });
            }
        }

        fs::rename(part, dest)
            .await
            .map_err(|err| Error::disk(dest, err))?;
        ctx.file_done();
        debug!("worker: finished {}", file.path);
        Ok(())
    }
}

#[async_trait]
impl Worker for HttpWorker {
    async fn run(&self, ctx: &WorkerContext) -> Result<()> {
        let summary = ctx.summary();
        info!(
            "worker: fetching {} files ({} bytes) with {} workers",
            summary.files.len(),
            summary.download_size,
            ctx.params().max_workers
        );

        let pending: Vec<_> = summary
            .files
            .iter()
            .map(|file| self.fetch(ctx, file))
            .collect();
        let mut transfers =
            stream::iter(pending).buffer_unordered(ctx.params().max_workers.max(1));
        let mut outcome = Ok(());
        while let Some(result) = transfers.next().await {
            if let Err(err) = result {
                outcome = Err(err);
                break;
            }
        }
        drop(transfers);

        if outcome.is_err() {
            remove_partials(ctx).await;
        }
        outcome
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(PART_SUFFIX);
    dest.with_file_name(name)
}

/// Transfers abandoned mid-flight leave `.part` files behind; sweep them.
async fn remove_partials(ctx: &WorkerContext) {
    for file in &ctx.summary().files {
        if let Ok(dest) = resolve_local(&ctx.params().destination, &file.path) {
            let part = part_path(&dest);
            if fs::remove_file(&part).await.is_ok() {
                debug!("worker: removed partial {}", part.display());
            }
        }
    }
}
