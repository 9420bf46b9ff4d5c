//! Immutable description of the machine the pipeline runs on.
//!
//! [`EnvironmentProfile`] is built once per run and passed by reference into
//! every component. Nothing in the pipeline re-detects the operating system
//! or re-reads configuration after that point.

use crate::config::InstallerConfig;
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use std::num::NonZeroUsize;

/// Package manager family of the running distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFamily {
    /// RHEL, CentOS, Rocky, Alma, Fedora (`dnf`/`yum`, `-devel` packages).
    Rhel,
    /// Debian, Ubuntu (`apt-get`, `-dev` packages).
    Debian,
    /// Anything else; package suggestions are omitted.
    Unknown,
}

impl PackageFamily {
    /// Classify an `/etc/os-release` document by its `ID` and `ID_LIKE`.
    ///
    /// # Examples
    ///
    /// ```
    /// use modsec_installer::environment::PackageFamily;
    ///
    /// let text = "NAME=\"Rocky Linux\"\nID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n";
    /// assert_eq!(PackageFamily::from_os_release(text), PackageFamily::Rhel);
    /// ```
    #[must_use]
    pub fn from_os_release(text: &str) -> Self {
        let ids: Vec<String> = text
            .lines()
            .filter_map(|line| {
                line.strip_prefix("ID=")
                    .or_else(|| line.strip_prefix("ID_LIKE="))
            })
            .flat_map(|value| {
                value
                    .trim()
                    .trim_matches('"')
                    .split_whitespace()
                    .map(str::to_ascii_lowercase)
                    .collect::<Vec<_>>()
            })
            .collect();
        let any = |names: &[&str]| ids.iter().any(|id| names.contains(&id.as_str()));
        if any(&["rhel", "centos", "fedora", "rocky", "almalinux", "ol", "amzn"]) {
            Self::Rhel
        } else if any(&["debian", "ubuntu"]) {
            Self::Debian
        } else {
            Self::Unknown
        }
    }

    /// Detect the family from files under `root` (normally `/`).
    #[must_use]
    pub fn detect(root: &Utf8Path) -> Self {
        let etc = root.join("etc");
        if let Ok(text) = std::fs::read_to_string(etc.join("os-release")) {
            let family = Self::from_os_release(&text);
            if family != Self::Unknown {
                return family;
            }
        }
        if etc.join("redhat-release").exists() || etc.join("centos-release").exists() {
            Self::Rhel
        } else if etc.join("debian_version").exists() {
            Self::Debian
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for PackageFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rhel => "rhel",
            Self::Debian => "debian",
            Self::Unknown => "unknown",
        })
    }
}

/// Everything the pipeline knows about its environment, fixed for one run.
#[derive(Debug, Clone)]
pub struct EnvironmentProfile {
    family: PackageFamily,
    config: InstallerConfig,
    cache_root: Utf8PathBuf,
    work_root: Utf8PathBuf,
    jobs: NonZeroUsize,
}

impl EnvironmentProfile {
    /// Assemble a profile. Parallel jobs come from the build policy, or the
    /// machine's available parallelism when unset.
    #[must_use]
    pub fn new(
        family: PackageFamily,
        config: InstallerConfig,
        cache_root: Utf8PathBuf,
        work_root: Utf8PathBuf,
    ) -> Self {
        let jobs = config
            .build
            .jobs
            .and_then(NonZeroUsize::new)
            .or_else(|| std::thread::available_parallelism().ok())
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            family,
            config,
            cache_root,
            work_root,
            jobs,
        }
    }

    /// Package manager family.
    #[must_use]
    pub const fn family(&self) -> PackageFamily {
        self.family
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Root of the artifact cache.
    #[must_use]
    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    /// Root of the transient build directory.
    #[must_use]
    pub fn work_root(&self) -> &Utf8Path {
        &self.work_root
    }

    /// Parallel make jobs.
    #[must_use]
    pub const fn jobs(&self) -> NonZeroUsize {
        self.jobs
    }
}
