//! Idempotent initialisation of nested repository dependencies.
//!
//! After a complete check the initializer stamps the repository with a digest
//! of its `.gitmodules`. A later call on the same, unmodified tree sees the
//! stamp and the populated submodule directories and returns without starting
//! a single subprocess, which keeps repeated cache hits cheap.

use crate::error::{InstallerError, Result};
use crate::git::{GitClient, SubmoduleState};
use crate::resolver::RetryPolicy;
use camino::Utf8Path;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Stamp file written inside `.git` once every submodule is present.
pub const STAMP_FILE: &str = "modsec-submodules.stamp";

/// What [`SubmoduleInitializer::ensure`] found or did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmoduleReport {
    /// The repository declares no submodules.
    NoDeclarations,
    /// A matching stamp proved the tree complete; nothing was run.
    Stamped,
    /// Not a git checkout, but every declared path is already populated
    /// (release archives ship submodule sources inline).
    Vendored,
    /// Status was checked, nothing needed initialising; stamp written.
    Verified,
    /// These submodules were initialised; stamp written.
    Initialized {
        /// Paths that were updated.
        paths: Vec<String>,
    },
}

impl SubmoduleReport {
    /// Whether this call changed the tree (stamp or submodule contents), so
    /// a cached copy of it is now stale.
    #[must_use]
    pub const fn changed_tree(&self) -> bool {
        matches!(self, Self::Verified | Self::Initialized { .. })
    }
}

/// Extract `path = ...` values from a `.gitmodules` document.
///
/// # Examples
///
/// ```
/// use modsec_installer::submodule::declared_paths;
///
/// let text = "[submodule \"others/libinjection\"]\n\tpath = others/libinjection\n\turl = https://x.test/l.git\n";
/// assert_eq!(declared_paths(text), ["others/libinjection"]);
/// ```
#[must_use]
pub fn declared_paths(gitmodules: &str) -> Vec<String> {
    gitmodules
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            (key.trim() == "path").then(|| value.trim().to_owned())
        })
        .filter(|path| !path.is_empty())
        .collect()
}

/// Ensures nested repository dependencies are checked out.
pub struct SubmoduleInitializer<'a> {
    git: GitClient<'a>,
    retry: RetryPolicy,
}

impl<'a> SubmoduleInitializer<'a> {
    /// Create an initializer using `git` that tries each update once.
    #[must_use]
    pub fn new(git: GitClient<'a>) -> Self {
        Self {
            git,
            retry: RetryPolicy::new(1, Duration::ZERO),
        }
    }

    /// Retry failed `git submodule update` runs according to `retry`.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ensure every declared submodule of `repo` is initialised.
    ///
    /// Returns `true` once the tree is complete.
    ///
    /// # Errors
    ///
    /// See [`SubmoduleInitializer::ensure`].
    pub fn ensure_initialized(&self, repo: &Utf8Path) -> Result<bool> {
        self.ensure(repo).map(|_| true)
    }

    /// Ensure every declared submodule of `repo` is initialised and report
    /// what that took.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Submodule`] when submodules remain
    /// uninitialised after an update, or when a non-git tree lacks their
    /// sources. Git failures propagate as [`InstallerError::Git`].
    pub fn ensure(&self, repo: &Utf8Path) -> Result<SubmoduleReport> {
        let gitmodules = repo.join(".gitmodules");
        let contents = match std::fs::read_to_string(&gitmodules) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SubmoduleReport::NoDeclarations);
            }
            Err(e) => return Err(e.into()),
        };
        let declared = declared_paths(&contents);
        if declared.is_empty() {
            return Ok(SubmoduleReport::NoDeclarations);
        }

        let populated = declared.iter().all(|p| is_populated(&repo.join(p)));
        let git_dir = repo.join(".git");
        if !git_dir.is_dir() {
            return if populated {
                Ok(SubmoduleReport::Vendored)
            } else {
                Err(InstallerError::Submodule {
                    repo: repo.to_owned(),
                    reason: "tree is not a git checkout and its submodule sources are missing"
                        .to_owned(),
                })
            };
        }

        let digest = format!("{:x}", Sha256::digest(contents.as_bytes()));
        let stamp = git_dir.join(STAMP_FILE);
        if populated && std::fs::read_to_string(&stamp).is_ok_and(|s| s.trim() == digest) {
            debug!("submodules of {repo} already initialised");
            return Ok(SubmoduleReport::Stamped);
        }

        let pending = self.uninitialised(repo)?;
        if pending.is_empty() {
            std::fs::write(&stamp, &digest)?;
            return Ok(SubmoduleReport::Verified);
        }

        info!("initialising {} submodule(s) in {repo}", pending.len());
        self.update_with_retry(repo, &pending)?;

        let still_pending = self.uninitialised(repo)?;
        if !still_pending.is_empty() {
            return Err(InstallerError::Submodule {
                repo: repo.to_owned(),
                reason: format!("still uninitialised after update: {}", still_pending.join(", ")),
            });
        }
        std::fs::write(&stamp, &digest)?;
        Ok(SubmoduleReport::Initialized { paths: pending })
    }

    fn update_with_retry(&self, repo: &Utf8Path, pending: &[String]) -> Result<()> {
        let attempts = self.retry.attempts();
        let mut attempt = 1;
        loop {
            match self.git.submodule_update(repo, pending) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < attempts => {
                    warn!("submodule update in {repo} failed (attempt {attempt}/{attempts}): {err}");
                    attempt += 1;
                    let delay = self.retry.delay_before(attempt);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn uninitialised(&self, repo: &Utf8Path) -> Result<Vec<String>> {
        Ok(self
            .git
            .submodule_status(repo)?
            .into_iter()
            .filter(|s| s.state == SubmoduleState::Uninitialized)
            .map(|s| s.path)
            .collect())
    }
}

fn is_populated(dir: &Utf8Path) -> bool {
    dir.read_dir_utf8()
        .is_ok_and(|mut entries| entries.next().is_some())
}
