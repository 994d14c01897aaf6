use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::env;
use crate::error::{Error, Result};

const API_URL_ENV: &str = "LAUNCHKIT_API_URL";
const DEFAULT_API_URL: &str = "https://api.launchkit.invalid";

/// Launcher settings read from `config.json` in the app directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub api_base_url: String,
    pub install_dir: PathBuf,
    pub max_workers: usize,
    pub max_shared_memory_mib: u64,
    pub request_timeout_secs: u64,
    pub status_queue_capacity: usize,
    pub platform: String,
    pub preferred_cdn: Option<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.into(),
            install_dir: env::games_dir(),
            max_workers: 4,
            max_shared_memory_mib: 0,
            request_timeout_secs: 10,
            status_queue_capacity: 64,
            platform: "Windows".into(),
            preferred_cdn: None,
        }
    }
}

impl LauncherConfig {
    /// Load the config from the default location, then apply environment overrides.
    pub async fn load() -> Result<Self> {
        let mut config = Self::load_from(&env::config_path()).await?;
        if let Ok(url) = std::env::var(API_URL_ENV)
            && !url.trim().is_empty()
        {
            debug!("config: api url overridden by {API_URL_ENV}");
            config.api_base_url = url.trim().to_owned();
        }
        Ok(config)
    }

    /// Read a config file; a missing file yields the defaults.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("config: {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(err) => return Err(Error::disk(path, err)),
        };
        serde_json::from_slice(&bytes).map_err(|err| {
            warn!("config: failed to parse {}: {err}", path.display());
            Error::InvalidParameters(format!("invalid config file {}: {err}", path.display()))
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
