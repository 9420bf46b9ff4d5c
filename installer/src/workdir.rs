//! The transient build directory as a scoped, exclusive resource.
//!
//! [`WorkDir`] holds an exclusive lock for as long as it lives, so a second
//! run against the same directory fails fast instead of racing writes into
//! the same tree. [`InterruptGuard`] removes every registered directory when
//! the process is interrupted, so no half-built tree survives to be mistaken
//! for a finished one.

use crate::error::{InstallerError, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::sync::{Arc, Mutex};

/// Exit status used after an interrupt, as shells report for SIGINT.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Directories to remove if the process is interrupted.
#[derive(Debug, Clone, Default)]
pub struct InterruptGuard {
    dirs: Arc<Mutex<Vec<Utf8PathBuf>>>,
}

impl InterruptGuard {
    /// Create a guard with nothing registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a SIGINT/SIGTERM handler that removes every registered
    /// directory and exits with [`INTERRUPTED_EXIT_CODE`].
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::SignalHandler`] if a handler is already
    /// installed or cannot be registered.
    pub fn install(&self) -> Result<()> {
        let guard = self.clone();
        ctrlc::set_handler(move || {
            let removed = guard.cleanup();
            warn!("interrupted; removed {removed} work directory tree(s)");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        })
        .map_err(|e| InstallerError::SignalHandler {
            reason: e.to_string(),
        })
    }

    /// Remove `path` on interrupt.
    pub fn register(&self, path: &Utf8Path) {
        if let Ok(mut dirs) = self.dirs.lock() {
            dirs.push(path.to_owned());
        }
    }

    /// Stop tracking `path`.
    pub fn unregister(&self, path: &Utf8Path) {
        if let Ok(mut dirs) = self.dirs.lock() {
            dirs.retain(|d| d != path);
        }
    }

    /// Paths currently registered.
    #[must_use]
    pub fn registered(&self) -> Vec<Utf8PathBuf> {
        self.dirs.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Remove every registered directory and return how many existed.
    #[must_use]
    pub fn cleanup(&self) -> usize {
        let dirs = match self.dirs.lock() {
            Ok(mut dirs) => std::mem::take(&mut *dirs),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        dirs.iter()
            .filter(|dir| match std::fs::remove_dir_all(dir) {
                Ok(()) => true,
                Err(e) => {
                    debug!("could not remove {dir}: {e}");
                    false
                }
            })
            .count()
    }
}

/// An exclusively locked build directory.
///
/// Call [`WorkDir::finish`] after a successful run to remove it. Dropping a
/// `WorkDir` without finishing keeps the directory for inspection and
/// releases the lock.
#[derive(Debug)]
pub struct WorkDir {
    root: Utf8PathBuf,
    guard: InterruptGuard,
    _lock: File,
}

impl WorkDir {
    /// Lock `<root>.lock`, create `root`, and register it with `guard`.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::WorkDirBusy`] when another process holds
    /// the lock, or an I/O error when the directory cannot be created.
    pub fn acquire(root: &Utf8Path, guard: &InterruptGuard) -> Result<Self> {
        let lock_path = lock_path(root);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        match lock.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                return Err(InstallerError::WorkDirBusy {
                    path: root.to_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        std::fs::create_dir_all(root)?;
        guard.register(root);
        debug!("acquired work directory {root}");
        Ok(Self {
            root: root.to_owned(),
            guard: guard.clone(),
            _lock: lock,
        })
    }

    /// Root of the directory.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.root
    }

    /// Remove the directory and release the lock.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be removed.
    pub fn finish(self) -> Result<()> {
        self.guard.unregister(&self.root);
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        let lock_path = lock_path(&self.root);
        drop(self);
        if let Err(e) = std::fs::remove_file(&lock_path) {
            debug!("could not remove {lock_path}: {e}");
        }
        Ok(())
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        self.guard.unregister(&self.root);
    }
}

fn lock_path(root: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{}.lock", root.as_str().trim_end_matches('/')))
}
