use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_WRITE_BUFFER: usize = 64 * 1024;
const MIN_WRITE_BUFFER: usize = 8 * 1024;
const MAX_WRITE_BUFFER: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JobKind {
    #[default]
    Install,
    Update,
    Repair,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobKind::Install => "install",
            JobKind::Update => "update",
            JobKind::Repair => "repair",
        })
    }
}

/// Everything a download job needs to know about the operation it performs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobParams {
    pub app_name: String,
    pub kind: JobKind,
    pub destination: PathBuf,
    /// Only manifest paths starting with one of these are installed (all when empty).
    pub include_prefixes: Vec<String>,
    pub exclude_prefixes: Vec<String>,
    pub install_tags: Vec<String>,
    pub max_workers: usize,
    /// Write buffer budget across all workers, 0 for the default.
    pub max_shared_memory_mib: u64,
    /// Bytes per second, `None` for unlimited.
    pub bandwidth_limit: Option<u64>,
    pub platform: String,
    pub timeout: Duration,
    pub preferred_cdn: Option<String>,
    pub force: bool,
    pub disable_patching: bool,
    pub disable_delta: bool,
}

impl JobParams {
    pub fn new(app_name: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            app_name: app_name.into(),
            kind: JobKind::Install,
            destination: destination.into(),
            include_prefixes: Vec::new(),
            exclude_prefixes: Vec::new(),
            install_tags: Vec::new(),
            max_workers: 4,
            max_shared_memory_mib: 0,
            bandwidth_limit: None,
            platform: "Windows".into(),
            timeout: Duration::from_secs(10),
            preferred_cdn: None,
            force: false,
            disable_patching: false,
            disable_delta: false,
        }
    }

    pub fn is_repair(&self) -> bool {
        self.kind == JobKind::Repair
    }

    /// Check the parameters without touching anything on disk.
    pub fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(Error::InvalidParameters("target app name is empty".into()));
        }
        if self.max_workers == 0 {
            return Err(Error::InvalidParameters(
                "concurrency limit must be at least 1".into(),
            ));
        }
        if self.bandwidth_limit == Some(0) {
            return Err(Error::InvalidParameters(
                "bandwidth limit must be positive".into(),
            ));
        }
        if self.platform.trim().is_empty() {
            return Err(Error::InvalidParameters("platform is empty".into()));
        }
        check_destination(&self.destination)
    }

    /// Per-file write buffer derived from the shared memory budget.
    pub fn write_buffer_size(&self) -> usize {
        if self.max_shared_memory_mib == 0 {
            return DEFAULT_WRITE_BUFFER;
        }
        let budget = self.max_shared_memory_mib.saturating_mul(1024 * 1024);
        let per_worker = budget / self.max_workers.max(1) as u64;
        usize::try_from(per_worker)
            .unwrap_or(MAX_WRITE_BUFFER)
            .clamp(MIN_WRITE_BUFFER, MAX_WRITE_BUFFER)
    }
}

/// The destination must be a writable directory, or creatable below one.
fn check_destination(destination: &Path) -> Result<()> {
    if destination.as_os_str().is_empty() {
        return Err(Error::InvalidParameters("destination path is empty".into()));
    }
    let mut ancestor = destination;
    loop {
        match fs::metadata(ancestor) {
            Ok(meta) if !meta.is_dir() => {
                return Err(Error::InvalidParameters(format!(
                    "{} is not a directory",
                    ancestor.display()
                )));
            }
            Ok(meta) if meta.permissions().readonly() => {
                return Err(Error::InvalidParameters(format!(
                    "{} is not writable",
                    ancestor.display()
                )));
            }
            Ok(_) => return Ok(()),
            Err(err)
                if err.kind() == std::io::ErrorKind::NotFound && ancestor != Path::new(".") =>
            {
                ancestor = match ancestor.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent,
                    _ => Path::new("."),
                };
            }
            Err(err) => {
                return Err(Error::InvalidParameters(format!(
                    "cannot inspect {}: {err}",
                    ancestor.display()
                )));
            }
        }
    }
}
