//! Artifact identities and their mirror lists.
//!
//! An [`ArtifactSpec`] names one versioned unit the pipeline fetches, together
//! with the ordered mirrors that can supply it. The `kind` and `version` pair
//! identifies a cache slot.

use crate::error::{InstallerError, Result};
use serde::Deserialize;
use std::fmt;

/// Placeholder substituted with the artifact version inside mirror URLs.
pub const VERSION_PLACEHOLDER: &str = "{version}";

/// A semantic artifact kind such as `modsecurity` or `nginx`.
///
/// The kind doubles as the first directory level inside the cache, so it is
/// restricted to characters that are safe in a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKind(String);

impl ArtifactKind {
    /// Create a new artifact kind.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the kind as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ArtifactKind {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ArtifactKind {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a mirror delivers its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorKind {
    /// A git repository, cloned recursively.
    Git,
    /// A downloadable archive (`.tar.gz`, `.tar.zst`, `.tar`, `.zip`).
    Archive,
}

impl fmt::Display for MirrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Git => f.write_str("git"),
            Self::Archive => f.write_str("archive"),
        }
    }
}

/// One network location offering an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Mirror {
    /// URL, optionally containing `{version}`.
    pub url: String,
    /// Delivery mechanism.
    pub kind: MirrorKind,
    /// Optional branch or tag passed to `git clone --branch`.
    #[serde(default)]
    pub reference: Option<String>,
}

impl Mirror {
    /// A git mirror without a pinned reference.
    #[must_use]
    pub fn git(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: MirrorKind::Git,
            reference: None,
        }
    }

    /// An archive mirror.
    #[must_use]
    pub fn archive(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: MirrorKind::Archive,
            reference: None,
        }
    }

    /// Return a copy with `{version}` substituted in the URL and reference.
    #[must_use]
    pub fn for_version(&self, version: &str) -> Self {
        Self {
            url: self.url.replace(VERSION_PLACEHOLDER, version),
            kind: self.kind,
            reference: self
                .reference
                .as_ref()
                .map(|r| r.replace(VERSION_PLACEHOLDER, version)),
        }
    }
}

impl fmt::Display for Mirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.kind)
    }
}

/// A named, versioned artifact and the mirrors that supply it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    kind: ArtifactKind,
    version: String,
    mirrors: Vec<Mirror>,
}

impl ArtifactSpec {
    /// Build a spec, substituting the version into every mirror.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::InvalidArtifactSpec`] when the mirror list is
    /// empty or the kind or version cannot be used as a path component.
    ///
    /// # Examples
    ///
    /// ```
    /// use modsec_installer::artifact::{ArtifactSpec, Mirror};
    ///
    /// let spec = ArtifactSpec::new(
    ///     "nginx",
    ///     "1.24.0",
    ///     vec![Mirror::archive("https://nginx.org/download/nginx-{version}.tar.gz")],
    /// )?;
    /// assert!(spec.mirrors()[0].url.ends_with("nginx-1.24.0.tar.gz"));
    /// # Ok::<(), modsec_installer::error::InstallerError>(())
    /// ```
    pub fn new(
        kind: impl Into<ArtifactKind>,
        version: impl Into<String>,
        mirrors: Vec<Mirror>,
    ) -> Result<Self> {
        let kind = kind.into();
        let version = version.into();
        validate_component("kind", kind.as_str())?;
        validate_component("version", &version)?;
        if mirrors.is_empty() {
            return Err(InstallerError::InvalidArtifactSpec {
                artifact: format!("{kind} {version}"),
                reason: "at least one mirror is required".to_owned(),
            });
        }
        let mirrors = mirrors.iter().map(|m| m.for_version(&version)).collect();
        Ok(Self {
            kind,
            version,
            mirrors,
        })
    }

    /// Artifact kind.
    #[must_use]
    pub fn kind(&self) -> &ArtifactKind {
        &self.kind
    }

    /// Artifact version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Mirrors in priority order.
    #[must_use]
    pub fn mirrors(&self) -> &[Mirror] {
        &self.mirrors
    }
}

impl fmt::Display for ArtifactSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.version)
    }
}

fn validate_component(field: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(InstallerError::InvalidArtifactSpec {
            artifact: value.to_owned(),
            reason: format!("{field} must be a non-empty path-safe name"),
        })
    }
}
