//! Placing a verified module into the host's module directory.
//!
//! The module is copied next to its destination under a temporary name and
//! then renamed, so the host never sees a partially written module.

use crate::error::{InstallerError, Result};
use crate::verify::{CompatibilityResult, CompatibilityStatus};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Installs modules into one directory.
#[derive(Debug, Clone)]
pub struct Stager {
    target_dir: Utf8PathBuf,
}

impl Stager {
    /// Create a stager for `target_dir`.
    #[must_use]
    pub fn new(target_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            target_dir: target_dir.into(),
        }
    }

    /// Directory modules are installed into.
    #[must_use]
    pub fn target_dir(&self) -> &Utf8Path {
        &self.target_dir
    }

    /// Ensure the target directory exists and is writable.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Install`] if the directory cannot be created
    /// or written to.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.target_dir).map_err(|e| self.install_error(&e))?;
        let probe = self.target_dir.join(".modsec-installer-write-test");
        fs::write(&probe, b"test").map_err(|e| self.install_error(&e))?;
        if let Err(e) = fs::remove_file(&probe) {
            log::debug!("could not remove {probe}: {e}");
        }
        Ok(())
    }

    /// Install `module` if, and only if, `verdict` says it is compatible.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Install`] for a module that was not verified
    /// compatible, or when copying fails.
    pub fn stage(&self, module: &Utf8Path, verdict: &CompatibilityResult) -> Result<Utf8PathBuf> {
        if verdict.status != CompatibilityStatus::Compatible {
            return Err(InstallerError::Install {
                path: self.target_dir.clone(),
                reason: format!("{module} was not verified compatible ({:?})", verdict.status),
            });
        }
        let file_name = module.file_name().ok_or_else(|| InstallerError::Install {
            path: module.to_owned(),
            reason: "module path has no file name".to_owned(),
        })?;
        let dest = self.target_dir.join(file_name);
        let partial = self.target_dir.join(format!(".{file_name}.partial"));

        fs::copy(module, &partial).map_err(|e| InstallerError::Install {
            path: dest.clone(),
            reason: format!("failed to copy {module}: {e}"),
        })?;
        if let Err(e) = fs::rename(&partial, &dest) {
            if let Err(cleanup) = fs::remove_file(&partial) {
                log::debug!("could not remove {partial}: {cleanup}");
            }
            return Err(InstallerError::Install {
                path: dest,
                reason: e.to_string(),
            });
        }
        Ok(dest)
    }

    fn install_error(&self, err: &std::io::Error) -> InstallerError {
        InstallerError::Install {
            path: self.target_dir.clone(),
            reason: err.to_string(),
        }
    }
}
