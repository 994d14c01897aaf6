use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::fs;

use crate::env;
use crate::error::{Error, Result};
use crate::session::Credentials;

/// Persistence for the credential record the session layer works from.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Credentials>>;
    async fn save(&self, credentials: &Credentials) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Credential record kept as a JSON file.
#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileCredentialStore {
    fn default() -> Self {
        Self::new(env::credentials_path())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::disk(&self.path, err)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| {
                warn!("credentials: {} is malformed: {err}", self.path.display());
                Error::disk(&self.path, format!("malformed credential record: {err}"))
            })
    }

    async fn save(&self, credentials: &Credentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| Error::disk(parent, err))?;
        }
        let bytes = serde_json::to_vec_pretty(credentials)
            .map_err(|err| Error::unknown(format!("failed to serialize credentials: {err}")))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)
            .await
            .map_err(|err| Error::disk(&tmp, err))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await;
        }
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| Error::disk(&self.path, err))?;
        debug!("credentials: saved to {}", self.path.display());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("credentials: removed {}", self.path.display());
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::disk(&self.path, err)),
        }
    }
}

/// Credential record held in process memory only.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    record: Mutex<Option<Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            record: Mutex::new(credentials),
        }
    }

    /// Snapshot of the stored record.
    pub fn snapshot(&self) -> Option<Credentials> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>> {
        Ok(self.snapshot())
    }

    async fn save(&self, credentials: &Credentials) -> Result<()> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(credentials.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
