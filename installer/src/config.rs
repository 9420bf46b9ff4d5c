//! Installer configuration.
//!
//! Configuration is an optional TOML document. Every field has a default, so
//! an absent file, an empty file, or a partial file all yield a complete
//! [`InstallerConfig`].
//!
//! ```toml
//! [versions]
//! modsecurity = "3.0.14"
//!
//! [[mirrors.connector]]
//! url = "https://mirror.example/ModSecurity-nginx.git"
//! kind = "git"
//!
//! [fetch]
//! attempts_per_mirror = 2
//! ```

use crate::artifact::{ArtifactKind, ArtifactSpec, Mirror};
use crate::error::{InstallerError, Result};
use crate::toolchain::{CompilerRequirement, CompilerVersion};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::time::Duration;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "modsec-installer.toml";

/// Artifact kind of the ModSecurity library source.
pub const KIND_MODSECURITY: &str = "modsecurity";
/// Artifact kind of the nginx connector source.
pub const KIND_CONNECTOR: &str = "connector";
/// Artifact kind of the nginx source tree.
pub const KIND_NGINX: &str = "nginx";

/// Complete installer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerConfig {
    /// Artifact versions.
    pub versions: Versions,
    /// Ordered mirrors per artifact kind.
    pub mirrors: MirrorTable,
    /// Network fetch behaviour.
    pub fetch: FetchPolicy,
    /// Native build behaviour.
    pub build: BuildPolicy,
    /// Host binary integration.
    pub host: HostPolicy,
}

/// Versions of the artifacts the pipeline acquires.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Versions {
    /// ModSecurity library version.
    pub modsecurity: String,
    /// nginx connector version.
    pub connector: String,
}

impl Default for Versions {
    fn default() -> Self {
        Self {
            modsecurity: "3.0.14".to_owned(),
            connector: "1.0.3".to_owned(),
        }
    }
}

/// Ordered mirror lists, one per artifact kind.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorTable {
    /// Mirrors for the ModSecurity library.
    pub modsecurity: Vec<Mirror>,
    /// Mirrors for the nginx connector.
    pub connector: Vec<Mirror>,
    /// Mirrors for the nginx source tree.
    pub nginx: Vec<Mirror>,
}

impl Default for MirrorTable {
    fn default() -> Self {
        Self {
            modsecurity: vec![
                Mirror::git("https://gitee.com/supine-win/ModSecurity.git"),
                Mirror::git("https://gitee.com/mirrors/ModSecurity.git"),
                Mirror::git("https://github.com/SpiderLabs/ModSecurity.git"),
                Mirror::archive(
                    "https://github.com/SpiderLabs/ModSecurity/releases/download/v{version}/modsecurity-v{version}.tar.gz",
                ),
            ],
            connector: vec![
                Mirror::git("https://gitee.com/supine-win/ModSecurity-nginx.git"),
                Mirror::git("https://gitee.com/mirrors/ModSecurity-nginx.git"),
                Mirror::git("https://github.com/owasp-modsecurity/ModSecurity-nginx.git"),
                Mirror::archive(
                    "https://gitee.com/supine-win/ModSecurity-nginx/archive/refs/tags/modsecurity-nginx-v{version}.tar.gz",
                ),
                Mirror::archive(
                    "https://github.com/SpiderLabs/ModSecurity-nginx/releases/download/v{version}/modsecurity-nginx-v{version}.tar.gz",
                ),
            ],
            nginx: vec![
                Mirror::archive("https://nginx.org/download/nginx-{version}.tar.gz"),
                Mirror::archive("http://nginx.org/download/nginx-{version}.tar.gz"),
            ],
        }
    }
}

/// Network fetch behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchPolicy {
    /// Attempts per mirror before moving to the next one.
    pub attempts_per_mirror: u32,
    /// Base delay between attempts; attempt `n` waits `n * base`.
    pub retry_delay_secs: u64,
    /// Upper bound for one git clone.
    pub git_timeout_secs: u64,
    /// Upper bound for one archive download.
    pub download_timeout_secs: u64,
    /// `git clone --depth`; zero clones full history.
    pub clone_depth: u32,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts_per_mirror: 3,
            retry_delay_secs: 2,
            git_timeout_secs: 180,
            download_timeout_secs: 180,
            clone_depth: 2,
        }
    }
}

impl FetchPolicy {
    /// Git clone timeout.
    #[must_use]
    pub const fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    /// Download timeout.
    #[must_use]
    pub const fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Base back-off delay.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Native build behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Compilers probed in order.
    pub compilers: Vec<String>,
    /// Minimum compiler version (C++17 support).
    pub minimum_compiler: CompilerVersion,
    /// Parallel make jobs; defaults to the available parallelism.
    pub jobs: Option<usize>,
    /// Installation prefix of the ModSecurity library.
    pub install_prefix: Utf8PathBuf,
}

impl Default for BuildPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            compilers: vec!["g++".to_owned(), "gcc".to_owned(), "c++".to_owned()],
            minimum_compiler: CompilerVersion::new(7, 0, 0),
            jobs: None,
            install_prefix: Utf8PathBuf::from("/usr/local/modsecurity"),
        }
    }
}

impl BuildPolicy {
    /// Compilers to probe and the oldest acceptable version.
    #[must_use]
    pub fn compiler_requirement(&self) -> CompilerRequirement {
        CompilerRequirement::new(self.compilers.clone(), self.minimum_compiler)
    }
}

/// Host binary integration settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostPolicy {
    /// Explicit host binary; discovered from `binary_candidates` if unset.
    pub binary: Option<Utf8PathBuf>,
    /// Locations searched for the host binary.
    pub binary_candidates: Vec<Utf8PathBuf>,
    /// File name of the built dynamic module.
    pub module_filename: String,
    /// Module directories tried when the host does not report one.
    pub module_dirs: Vec<Utf8PathBuf>,
    /// Substring the host prints when a module's ABI does not match.
    pub incompatible_marker: String,
}

impl Default for HostPolicy {
    fn default() -> Self {
        Self {
            binary: None,
            binary_candidates: vec![
                Utf8PathBuf::from("/usr/sbin/nginx"),
                Utf8PathBuf::from("/usr/local/nginx/sbin/nginx"),
                Utf8PathBuf::from("/www/server/nginx/sbin/nginx"),
            ],
            module_filename: "ngx_http_modsecurity_module.so".to_owned(),
            module_dirs: vec![
                Utf8PathBuf::from("/usr/lib64/nginx/modules"),
                Utf8PathBuf::from("/usr/lib/nginx/modules"),
                Utf8PathBuf::from("/usr/local/nginx/modules"),
            ],
            incompatible_marker: "is not binary compatible".to_owned(),
        }
    }
}

impl InstallerConfig {
    /// Load configuration from `path`, or defaults when `path` is `None`
    /// and no file exists in the working directory.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::InvalidConfig`] if an explicitly requested
    /// file is missing, or any file cannot be parsed.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        match path {
            Some(explicit) => Self::from_file(explicit),
            None => {
                let implicit = Utf8Path::new(CONFIG_FILE_NAME);
                if implicit.is_file() {
                    Self::from_file(implicit)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Utf8Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| InstallerError::InvalidConfig {
                path: path.to_owned(),
                reason: e.to_string(),
            })?;
        Self::parse(&contents).map_err(|reason| InstallerError::InvalidConfig {
            path: path.to_owned(),
            reason,
        })
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns the parser's message when the document is invalid.
    pub fn parse(contents: &str) -> std::result::Result<Self, String> {
        toml::from_str(contents).map_err(|e| e.message().to_owned())
    }

    /// Mirrors configured for `kind`, if the kind is known.
    #[must_use]
    pub fn mirrors_for(&self, kind: &str) -> Option<&[Mirror]> {
        match kind {
            KIND_MODSECURITY => Some(&self.mirrors.modsecurity),
            KIND_CONNECTOR => Some(&self.mirrors.connector),
            KIND_NGINX => Some(&self.mirrors.nginx),
            _ => None,
        }
    }

    /// Build the artifact spec for `kind` at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::InvalidArtifactSpec`] if the kind is unknown
    /// or has no mirrors configured.
    pub fn artifact(&self, kind: &str, version: &str) -> Result<ArtifactSpec> {
        let mirrors = self
            .mirrors_for(kind)
            .ok_or_else(|| InstallerError::InvalidArtifactSpec {
                artifact: format!("{kind} {version}"),
                reason: "unknown artifact kind".to_owned(),
            })?;
        ArtifactSpec::new(ArtifactKind::new(kind), version, mirrors.to_vec())
    }
}
