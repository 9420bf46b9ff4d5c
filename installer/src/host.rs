//! Probing the installed host binary.
//!
//! The module must be compiled against the exact version and configure
//! arguments of the running server, so both are read from the binary itself
//! rather than assumed.

use crate::config::HostPolicy;
use crate::configure_args::{ConfigureArg, option_value, parse_configure_args};
use crate::error::{InstallerError, Result};
use crate::exec::{CommandExecutor, Invocation, combined_text, describe_status, tail_lines};
use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const CONFIGURE_PREFIX: &str = "configure arguments:";
/// Module directory of a host built with the default prefix.
pub const DEFAULT_MODULE_DIR: &str = "/usr/local/nginx/modules";

/// `major.minor.patch` of the host binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostVersion {
    major: u32,
    minor: u32,
    patch: u32,
}

impl HostVersion {
    /// Read the version from `-V` output (`nginx version: nginx/1.24.0`).
    ///
    /// Only the first three components are kept, so distributions that
    /// append their own (`openresty/1.21.4.1`) map to the upstream release.
    ///
    /// # Examples
    ///
    /// ```
    /// use modsec_installer::host::HostVersion;
    ///
    /// let version = HostVersion::from_version_output("nginx version: nginx/1.24.0\n");
    /// assert_eq!(version.map(|v| v.to_string()), Some("1.24.0".to_owned()));
    /// ```
    #[must_use]
    pub fn from_version_output(text: &str) -> Option<Self> {
        let line = text.lines().find(|l| l.contains("version:"))?;
        let (_, rest) = line.split_once('/')?;
        let token = rest.split_whitespace().next()?;
        token.parse().ok()
    }
}

impl FromStr for HostVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.trim().split('.').map(str::parse::<u32>);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch))) => Ok(Self {
                major,
                minor,
                patch,
            }),
            _ => Err(format!("`{s}` is not a major.minor.patch version")),
        }
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What the pipeline knows about the running host binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinaryProfile {
    /// Upstream version.
    pub version: HostVersion,
    /// `configure arguments:` exactly as printed.
    pub raw_configure_args: String,
    /// Path of the binary.
    pub binary_path: Utf8PathBuf,
    /// Directory verified modules are installed into.
    pub module_install_dir: Utf8PathBuf,
}

impl HostBinaryProfile {
    /// Parsed configure arguments.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::HostConfigUnavailable`] if the raw string
    /// cannot be parsed.
    pub fn configure_args(&self) -> Result<Vec<ConfigureArg>> {
        parse_configure_args(&self.raw_configure_args)
    }
}

/// Reads [`HostBinaryProfile`]s from host binaries.
pub struct HostProbe<'a> {
    executor: &'a dyn CommandExecutor,
    policy: &'a HostPolicy,
}

impl<'a> HostProbe<'a> {
    /// Create a probe using the binary locations and module directories of
    /// `policy`.
    #[must_use]
    pub const fn new(executor: &'a dyn CommandExecutor, policy: &'a HostPolicy) -> Self {
        Self { executor, policy }
    }

    /// The explicitly configured binary, else the first candidate on disk.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::HostProbe`] when no candidate exists.
    pub fn discover_binary(&self) -> Result<Utf8PathBuf> {
        if let Some(binary) = &self.policy.binary {
            return Ok(binary.clone());
        }
        self.policy
            .binary_candidates
            .iter()
            .find(|candidate| candidate.is_file())
            .cloned()
            .ok_or_else(|| InstallerError::HostProbe {
                binary: self
                    .policy
                    .binary_candidates
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Utf8PathBuf::from("nginx")),
                reason: format!(
                    "no host binary found (searched {})",
                    self.policy
                        .binary_candidates
                        .iter()
                        .map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            })
    }

    /// Run `<binary> -V` and build a profile from its output.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::HostProbe`] if the binary cannot be run or
    /// prints no version, and [`InstallerError::HostConfigUnavailable`] if
    /// its configure arguments are missing or unparseable.
    pub fn probe(&self, binary: &Utf8Path) -> Result<HostBinaryProfile> {
        let invocation = Invocation::new(binary.as_str())
            .arg("-V")
            .timeout(PROBE_TIMEOUT);
        let output = self
            .executor
            .run(&invocation)
            .map_err(|e| probe_error(binary, e.to_string()))?;
        let text = combined_text(&output);
        if !output.status.success() {
            return Err(probe_error(
                binary,
                format!("{}: {}", describe_status(&output), tail_lines(&text, 5)),
            ));
        }

        let version = HostVersion::from_version_output(&text).ok_or_else(|| {
            probe_error(
                binary,
                format!("no parseable version in -V output: {}", tail_lines(&text, 5)),
            )
        })?;
        let raw_configure_args = text
            .lines()
            .find_map(|line| line.trim().strip_prefix(CONFIGURE_PREFIX))
            .map(|raw| raw.trim().to_owned())
            .ok_or_else(|| InstallerError::HostConfigUnavailable {
                reason: format!("{binary} -V printed no `{CONFIGURE_PREFIX}` line"),
            })?;
        let args = parse_configure_args(&raw_configure_args)?;
        let module_install_dir = self.module_dir(&args);
        debug!("host {binary} is version {version}; modules go to {module_install_dir}");

        Ok(HostBinaryProfile {
            version,
            raw_configure_args,
            binary_path: binary.to_owned(),
            module_install_dir,
        })
    }

    fn module_dir(&self, args: &[ConfigureArg]) -> Utf8PathBuf {
        if let Some(dir) = option_value(args, "--modules-path") {
            return Utf8PathBuf::from(dir);
        }
        if let Some(prefix) = option_value(args, "--prefix") {
            return Utf8Path::new(prefix).join("modules");
        }
        self.policy
            .module_dirs
            .iter()
            .find(|dir| dir.is_dir())
            .cloned()
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_MODULE_DIR))
    }
}

fn probe_error(binary: &Utf8Path, reason: String) -> InstallerError {
    InstallerError::HostProbe {
        binary: binary.to_owned(),
        reason,
    }
}
