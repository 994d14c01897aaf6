use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::error::{Error, Result};

/// Destination paths currently claimed by a job.
#[derive(Clone, Debug, Default)]
pub struct PathLocks {
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path` for one job, failing fast if another job owns it.
    pub fn acquire(&self, path: &Path) -> Result<PathLease> {
        let key = normalize(path);
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(key.clone()) {
            return Err(Error::PathBusy(key));
        }
        debug!("path lock: acquired {}", key.display());
        Ok(PathLease {
            locks: self.clone(),
            path: key,
        })
    }

    pub fn is_held(&self, path: &Path) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&normalize(path))
    }
}

/// Releases its path when dropped.
#[derive(Debug)]
pub struct PathLease {
    locks: PathLocks,
    path: PathBuf,
}

impl PathLease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathLease {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
        debug!("path lock: released {}", self.path.display());
    }
}

/// Absolute, symlink-resolved form of `path`. Components that do not exist
/// yet are appended to the canonical form of their deepest existing ancestor.
fn normalize(path: &Path) -> PathBuf {
    let lexical = lexical_absolute(path);
    let mut existing = lexical.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return missing
                .iter()
                .rev()
                .fold(canonical, |acc, name| acc.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_owned());
                existing = parent;
            }
            _ => return lexical,
        }
    }
}

fn lexical_absolute(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_on_same_path_is_busy() {
        let locks = PathLocks::new();
        let dir = tempfile::tempdir().unwrap();
        let _lease = locks.acquire(dir.path()).unwrap();

        let again = dir.path().join(".");
        assert!(matches!(locks.acquire(&again), Err(Error::PathBusy(_))));
    }

    #[test]
    fn dropping_the_lease_frees_the_path() {
        let locks = PathLocks::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-yet-created");

        let lease = locks.acquire(&path).unwrap();
        assert!(locks.is_held(&path));
        drop(lease);
        assert!(!locks.is_held(&path));
        locks.acquire(&path).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn missing_path_under_symlinked_parent_shares_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        let link = dir.path().join("link");
        std::fs::create_dir(&real).unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let locks = PathLocks::new();

        let _lease = locks.acquire(&link.join("Sugar")).unwrap();
        assert!(matches!(
            locks.acquire(&real.join("Sugar")),
            Err(Error::PathBusy(_))
        ));

        std::fs::create_dir(real.join("Sugar")).unwrap();
        assert!(locks.is_held(&real.join("Sugar")));
        assert!(locks.is_held(&link.join("Sugar/.")));
    }
}
