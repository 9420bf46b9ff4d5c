//! Installation of development packages named by build diagnostics.
//!
//! Packages are installed one at a time so a single unavailable package does
//! not prevent the others. The caller decides what a partial result means.

use crate::environment::PackageFamily;
use crate::error::Result;
use crate::exec::{CommandExecutor, Invocation};
use log::{info, warn};
use std::time::Duration;

const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Result of installing a set of packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Every package was installed.
    Success,
    /// Some packages failed.
    Partial {
        /// Packages that could not be installed.
        failed: Vec<String>,
    },
    /// No package could be installed.
    Failure {
        /// Packages that could not be installed.
        failed: Vec<String>,
    },
}

impl InstallOutcome {
    fn from_failures(requested: usize, failed: Vec<String>) -> Self {
        if failed.is_empty() {
            Self::Success
        } else if failed.len() < requested {
            Self::Partial { failed }
        } else {
            Self::Failure { failed }
        }
    }
}

/// Installs operating system packages.
#[cfg_attr(test, mockall::automock)]
pub trait PackageInstaller {
    /// Install each of `packages`, independently.
    ///
    /// # Errors
    ///
    /// Returns an error only when the package manager cannot be run at all;
    /// per-package failures are reported through [`InstallOutcome`].
    fn install(&self, packages: &[String]) -> Result<InstallOutcome>;
}

/// Installs packages with the distribution's package manager.
pub struct SystemPackageInstaller<'a> {
    executor: &'a dyn CommandExecutor,
    family: PackageFamily,
}

impl<'a> SystemPackageInstaller<'a> {
    /// Create an installer for `family`.
    #[must_use]
    pub const fn new(executor: &'a dyn CommandExecutor, family: PackageFamily) -> Self {
        Self { executor, family }
    }

    /// Package manager to use: `dnf` falling back to `yum` on RHEL,
    /// `apt-get` on Debian.
    fn manager(&self) -> Option<&'static str> {
        match self.family {
            PackageFamily::Rhel => Some(if self.is_available("dnf") { "dnf" } else { "yum" }),
            PackageFamily::Debian => Some("apt-get"),
            PackageFamily::Unknown => None,
        }
    }

    fn is_available(&self, program: &str) -> bool {
        self.executor
            .run(&Invocation::new(program).arg("--version"))
            .is_ok_and(|o| o.status.success())
    }
}

impl PackageInstaller for SystemPackageInstaller<'_> {
    fn install(&self, packages: &[String]) -> Result<InstallOutcome> {
        if packages.is_empty() {
            return Ok(InstallOutcome::Success);
        }
        let Some(manager) = self.manager() else {
            warn!(
                "unknown distribution; install these packages manually: {}",
                packages.join(" ")
            );
            return Ok(InstallOutcome::Failure {
                failed: packages.to_vec(),
            });
        };

        let mut failed = Vec::new();
        for package in packages {
            info!("installing {package} with {manager}");
            let invocation = Invocation::new(manager)
                .args(["install", "-y", package.as_str()])
                .env("DEBIAN_FRONTEND", "noninteractive")
                .timeout(INSTALL_TIMEOUT);
            let output = self.executor.run(&invocation)?;
            if !output.status.success() {
                warn!("{manager} could not install {package}");
                failed.push(package.clone());
            }
        }
        Ok(InstallOutcome::from_failures(packages.len(), failed))
    }
}
