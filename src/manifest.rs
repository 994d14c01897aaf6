use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::job::{JobKind, JobParams};

/// One file as listed by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Required files for one build of a title.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub app_name: String,
    pub build_version: String,
    #[serde(default)]
    pub base_url: Option<String>,
    pub files: Vec<ManifestFile>,
}

/// A file the worker has to fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingFile {
    pub path: String,
    pub size: u64,
    pub sha256: Option<String>,
    pub url: String,
}

/// Outcome of analysing a manifest against the destination directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestSummary {
    pub app_name: String,
    pub build_version: String,
    pub files: Vec<PendingFile>,
    /// Bytes the worker will transfer.
    pub download_size: u64,
    /// Size of every selected file once installed.
    pub install_size: u64,
    /// Selected files already present and intact.
    pub up_to_date: usize,
}

impl ManifestSummary {
    pub fn files_total(&self) -> u64 {
        self.files.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Whether a manifest path passes the include/exclude prefix filters.
pub fn is_selected(path: &str, include: &[String], exclude: &[String]) -> bool {
    let path = path.to_lowercase();
    let included = include.is_empty()
        || include
            .iter()
            .any(|prefix| path.starts_with(&prefix.to_lowercase()));
    included
        && !exclude
            .iter()
            .any(|prefix| path.starts_with(&prefix.to_lowercase()))
}

/// Filter the manifest and compare it with what is already on disk.
///
/// Blocking: stats and possibly hashes local files.
pub fn diff(manifest: &Manifest, params: &JobParams) -> Result<ManifestSummary> {
    let verify_hashes = params.kind == JobKind::Repair;
    let mut summary = ManifestSummary {
        app_name: manifest.app_name.clone(),
        build_version: manifest.build_version.clone(),
        files: Vec::new(),
        download_size: 0,
        install_size: 0,
        up_to_date: 0,
    };

    for entry in &manifest.files {
        if !is_selected(&entry.path, &params.include_prefixes, &params.exclude_prefixes) {
            continue;
        }
        let local = resolve_local(&params.destination, &entry.path)?;
        summary.install_size += entry.size;

        if !params.force && is_intact(&local, entry, verify_hashes)? {
            summary.up_to_date += 1;
            continue;
        }

        let url = source_url(entry, manifest.base_url.as_deref())?;
        summary.download_size += entry.size;
        summary.files.push(PendingFile {
            path: entry.path.clone(),
            size: entry.size,
            sha256: entry.sha256.clone(),
            url,
        });
    }

    info!(
        "manifest: {} {}: {} files to fetch ({} bytes), {} up to date",
        summary.app_name,
        summary.build_version,
        summary.files.len(),
        summary.download_size,
        summary.up_to_date
    );
    Ok(summary)
}

/// Join a manifest path onto the destination, refusing anything that escapes it.
pub fn resolve_local(destination: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.as_os_str().is_empty() {
        return Err(Error::unknown(format!(
            "manifest entry {} escapes the install directory",
            relative.display()
        )));
    }
    Ok(destination.join(relative))
}

/// Lowercase hex sha256 of a file.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn is_intact(local: &Path, entry: &ManifestFile, verify_hash: bool) -> Result<bool> {
    let meta = match fs::metadata(local) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(Error::disk(local, err)),
    };
    if !meta.is_file() || meta.len() != entry.size {
        return Ok(false);
    }
    match (&entry.sha256, verify_hash) {
        (Some(expected), true) => {
            let actual = sha256_file(local).map_err(|err| Error::disk(local, err))?;
            let intact = actual == expected.to_lowercase();
            if !intact {
                debug!("manifest: checksum mismatch for {}", local.display());
            }
            Ok(intact)
        }
        _ => Ok(true),
    }
}

fn source_url(entry: &ManifestFile, base_url: Option<&str>) -> Result<String> {
    if let Some(url) = entry.url.as_deref().filter(|u| !u.is_empty()) {
        return Ok(url.to_owned());
    }
    match base_url {
        Some(base) if !base.is_empty() => Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            entry.path.trim_start_matches('/')
        )),
        _ => Err(Error::unknown(format!(
            "manifest entry {} has no download source",
            entry.path
        ))),
    }
}
