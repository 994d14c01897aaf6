use std::path::Path;

use log::info;
use tokio::fs;

use crate::error::{Error, Result};
use crate::job::PathLocks;

/// Delete an install directory while holding its path lock.
///
/// Fails with `PathBusy` while a job owns the directory. A directory that is
/// already gone counts as uninstalled.
pub async fn uninstall(locks: &PathLocks, destination: &Path) -> Result<()> {
    if destination.parent().is_none() || destination.as_os_str().is_empty() {
        return Err(Error::InvalidParameters(format!(
            "refusing to remove {}",
            destination.display()
        )));
    }
    let lease = locks.acquire(destination)?;

    match fs::metadata(destination).await {
        Ok(meta) if !meta.is_dir() => {
            return Err(Error::InvalidParameters(format!(
                "{} is not a directory",
                destination.display()
            )));
        }
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("uninstall: {} already removed", destination.display());
            return Ok(());
        }
        Err(err) => return Err(Error::disk(destination, err)),
    }

    fs::remove_dir_all(destination)
        .await
        .map_err(|err| Error::disk(destination, err))?;
    info!("uninstall: removed {}", lease.path().display());
    Ok(())
}
