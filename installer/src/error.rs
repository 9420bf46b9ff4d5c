//! Error types for the ModSecurity installer.
//!
//! Each variant names the artifact or path that failed and, where a human can
//! act on it, carries a concrete remediation command in its message.

use crate::fallback::{AttemptFailure, render_failures};
use crate::native_build::{AttemptRecord, render_attempts};
use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors that can occur during the installation pipeline.
#[derive(Debug, Error)]
pub enum InstallerError {
    /// One mirror could not supply an artifact. Retried and absorbed by the
    /// resolver; only surfaces inside [`InstallerError::AllMirrorsFailed`].
    #[error("mirror {url} unavailable: {reason}")]
    MirrorUnavailable {
        /// Mirror URL.
        url: String,
        /// Description of the failure.
        reason: String,
    },

    /// Every mirror for an artifact failed.
    #[error(
        "all mirrors failed for {artifact}:{}\nretry later, or place a local copy in the cache with --cache-dir",
        render_failures(.failures)
    )]
    AllMirrorsFailed {
        /// Artifact identity (`kind version`).
        artifact: String,
        /// Per-mirror failure reasons, in priority order.
        failures: Vec<AttemptFailure>,
    },

    /// The detected compiler is older than the build requires.
    #[error("{compiler} {found} is too old; version {minimum} or newer is required (C++17); install a newer toolchain, e.g. dnf install -y gcc-toolset-11 or apt-get install -y g++")]
    ToolchainTooOld {
        /// Compiler that was probed.
        compiler: String,
        /// Version string that was detected.
        found: String,
        /// Minimum acceptable version.
        minimum: String,
    },

    /// No usable compiler could be found.
    #[error("no C++ compiler found (tried {tried}); install one, e.g. dnf install -y gcc-c++ or apt-get install -y build-essential")]
    ToolchainMissing {
        /// Compilers that were probed.
        tried: String,
    },

    /// A native build exhausted its retries.
    #[error(
        "build of {artifact} failed after {} attempt(s):{}",
        .attempts.len(),
        render_attempts(.attempts)
    )]
    BuildFailure {
        /// Artifact that was being built.
        artifact: String,
        /// Full history of attempts, oldest first.
        attempts: Vec<AttemptRecord>,
    },

    /// The host binary's configure arguments could not be parsed.
    #[error("host build configuration unavailable: {reason}; the module cannot be built without the exact configure arguments of the running host binary")]
    HostConfigUnavailable {
        /// Why the configuration could not be used.
        reason: String,
    },

    /// The host binary could not be probed.
    #[error("failed to probe host binary {binary}: {reason}; pass --nginx-binary with the path of the running nginx")]
    HostProbe {
        /// Binary that was probed.
        binary: Utf8PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// The host rejected the module for a reason other than ABI mismatch.
    #[error("host configuration test rejected {module}: {diagnostic}")]
    ConfigError {
        /// Module under test.
        module: Utf8PathBuf,
        /// Tail of the host's diagnostic output.
        diagnostic: String,
    },

    /// A build step reported success but its artifact is absent.
    #[error("expected build output {path} was not produced")]
    ModuleNotProduced {
        /// Path that should exist.
        path: Utf8PathBuf,
    },

    /// An artifact specification is malformed.
    #[error("invalid artifact specification for {artifact}: {reason}")]
    InvalidArtifactSpec {
        /// Artifact identity or offending value.
        artifact: String,
        /// Description of the problem.
        reason: String,
    },

    /// The configuration file could not be read or parsed.
    #[error("invalid configuration at {path}: {reason}")]
    InvalidConfig {
        /// Path to the configuration file.
        path: Utf8PathBuf,
        /// Description of the parse error.
        reason: String,
    },

    /// A cache operation failed.
    #[error("cache {operation} failed at {path}: {reason}")]
    Cache {
        /// Operation that failed (get, put, invalidate, clear).
        operation: &'static str,
        /// Cache path involved.
        path: Utf8PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// Git clone or submodule operation failed.
    #[error("git {operation} failed: {message}")]
    Git {
        /// The git operation that failed.
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// Nested repository dependencies could not be initialised.
    #[error("submodules of {repo} could not be initialised: {reason}; remove the cached checkout with --force and retry")]
    Submodule {
        /// Repository root.
        repo: Utf8PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// An external command could not be run to completion.
    #[error("command `{program}` failed: {reason}")]
    Command {
        /// Program that was invoked.
        program: String,
        /// Description of the failure.
        reason: String,
    },

    /// Another installer run holds the work directory.
    #[error("work directory {path} is in use by another installer run; wait for it to finish or choose another with --work-dir")]
    WorkDirBusy {
        /// Contested work directory.
        path: Utf8PathBuf,
    },

    /// The interrupt handler could not be installed.
    #[error("failed to install interrupt handler: {reason}")]
    SignalHandler {
        /// Description of the failure.
        reason: String,
    },

    /// Copying the verified module into place failed.
    #[error("failed to install module to {path}: {reason}")]
    Install {
        /// Destination path.
        path: Utf8PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// The package manager could not install prerequisites.
    #[error("failed to install packages {packages}: {message}")]
    DependencyInstall {
        /// Space-separated package names.
        packages: String,
        /// Description of the failure.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Test stub received an unexpected or mismatched command invocation.
    #[cfg(any(test, feature = "test-support"))]
    #[error("stub mismatch: {message}")]
    StubMismatch {
        /// Description of what was expected versus what was received.
        message: String,
    },
}

impl InstallerError {
    /// Build a [`InstallerError::Cache`] from an I/O error.
    pub(crate) fn cache(
        operation: &'static str,
        path: impl Into<Utf8PathBuf>,
        err: &std::io::Error,
    ) -> Self {
        Self::Cache {
            operation,
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

/// Result type alias using [`InstallerError`].
pub type Result<T> = std::result::Result<T, InstallerError>;
