//! Post-build ABI check of a module against the host binary.
//!
//! The host's configuration test mode is pointed at a throwaway
//! configuration that does nothing but load the module. The live
//! configuration is never read. A module the host rejects as binary
//! incompatible is renamed out of the way rather than deleted.

use crate::error::Result;
use crate::exec::{CommandExecutor, Invocation, combined_text, tail_lines};
use crate::host::HostBinaryProfile;
use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};
use std::time::Duration;

/// Suffix appended to quarantined modules.
pub const QUARANTINE_SUFFIX: &str = ".incompatible";

const VERIFY_TIMEOUT: Duration = Duration::from_secs(60);
const DIAGNOSTIC_LINES: usize = 10;

/// Verdict of a configuration test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityStatus {
    /// The host loaded the module.
    Compatible,
    /// The host reported an ABI mismatch; the module was quarantined.
    BinaryIncompatible,
    /// The host rejected the configuration for another reason.
    ConfigError,
}

/// Outcome of [`CompatibilityVerifier::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityResult {
    /// Verdict.
    pub status: CompatibilityStatus,
    /// Tail of the host's output; empty when compatible.
    pub diagnostic: String,
    /// New location of a quarantined module.
    pub quarantined: Option<Utf8PathBuf>,
}

/// Runs configuration tests against the host binary.
pub struct CompatibilityVerifier<'a> {
    executor: &'a dyn CommandExecutor,
    incompatible_marker: &'a str,
}

impl<'a> CompatibilityVerifier<'a> {
    /// Create a verifier. `incompatible_marker` is the substring the host
    /// prints when a module was built for a different binary.
    #[must_use]
    pub const fn new(executor: &'a dyn CommandExecutor, incompatible_marker: &'a str) -> Self {
        Self {
            executor,
            incompatible_marker,
        }
    }

    /// Test whether `profile`'s binary can load `module`.
    ///
    /// The synthetic configuration lives in a temporary directory that is
    /// removed on every return path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the temporary configuration cannot be written
    /// or a quarantine rename fails, and [`crate::error::InstallerError::Command`]
    /// if the host binary cannot be run at all.
    pub fn verify(&self, module: &Utf8Path, profile: &HostBinaryProfile) -> Result<CompatibilityResult> {
        let scratch = tempfile::Builder::new().prefix("modsec-verify-").tempdir()?;
        let prefix = Utf8Path::from_path(scratch.path()).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "temporary path is not UTF-8")
        })?;
        std::fs::create_dir_all(prefix.join("logs"))?;
        let conf = prefix.join("nginx.conf");
        std::fs::write(&conf, synthetic_config(module, prefix))?;

        let invocation = Invocation::new(profile.binary_path.as_str())
            .args(["-t", "-q", "-p"])
            .arg(format!("{prefix}/"))
            .arg("-c")
            .arg(conf.as_str())
            .timeout(VERIFY_TIMEOUT);
        let output = self.executor.run(&invocation)?;
        if output.status.success() {
            info!("{module} loads into {}", profile.binary_path);
            return Ok(CompatibilityResult {
                status: CompatibilityStatus::Compatible,
                diagnostic: String::new(),
                quarantined: None,
            });
        }

        let text = combined_text(&output);
        let diagnostic = tail_lines(&text, DIAGNOSTIC_LINES);
        if !text.contains(self.incompatible_marker) {
            return Ok(CompatibilityResult {
                status: CompatibilityStatus::ConfigError,
                diagnostic,
                quarantined: None,
            });
        }

        let quarantined = quarantine(module)?;
        warn!("{module} is not binary compatible with {}; moved to {quarantined}", profile.binary_path);
        Ok(CompatibilityResult {
            status: CompatibilityStatus::BinaryIncompatible,
            diagnostic,
            quarantined: Some(quarantined),
        })
    }
}

/// Minimal configuration that loads `module` and nothing else.
#[must_use]
pub fn synthetic_config(module: &Utf8Path, prefix: &Utf8Path) -> String {
    format!(
        "load_module {module};\n\
         pid {prefix}/nginx.pid;\n\
         error_log {prefix}/logs/error.log;\n\
         events {{}}\n\
         http {{}}\n"
    )
}

/// Rename `module` to `<name>.incompatible` in place.
///
/// # Errors
///
/// Returns an I/O error if the rename fails.
pub fn quarantine(module: &Utf8Path) -> Result<Utf8PathBuf> {
    let target = Utf8PathBuf::from(format!("{module}{QUARANTINE_SUFFIX}"));
    if target.exists() {
        std::fs::remove_file(&target)?;
    }
    std::fs::rename(module, &target)?;
    Ok(target)
}
