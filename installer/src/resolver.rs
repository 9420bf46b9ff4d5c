//! Artifact resolution: cache first, then mirrors in priority order.
//!
//! Each mirror gets a bounded number of attempts with a linearly growing
//! delay. A mirror that keeps failing is logged and skipped; only when every
//! mirror has failed does resolution fail, carrying each mirror's reason.

use crate::archive::{extract_archive, verify_archive};
use crate::artifact::{ArtifactSpec, Mirror, MirrorKind};
use crate::cache::{CacheStore, copy_tree};
use crate::download::Downloader;
use crate::error::{InstallerError, Result};
use crate::fallback::{AttemptFailure, first_success};
use crate::git::GitClient;
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info, warn};
use std::fmt;
use std::time::Duration;

/// Fetches one mirror's artifact into an empty scratch directory.
#[cfg_attr(test, mockall::automock)]
pub trait MirrorFetcher {
    /// Fetch `mirror` into `dest_dir` and return the fetched file or
    /// repository directory. The result must already be verified: a corrupt
    /// archive or incomplete clone is an error, never a success.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::MirrorUnavailable`] (or any other error) when
    /// the mirror cannot supply a usable artifact.
    fn fetch(&self, mirror: &Mirror, dest_dir: &Utf8Path) -> Result<Utf8PathBuf>;
}

/// Fetches git mirrors with `git clone` and archive mirrors over HTTP.
pub struct NetworkFetcher<'a> {
    git: GitClient<'a>,
    downloader: &'a dyn Downloader,
    clone_depth: u32,
}

impl<'a> NetworkFetcher<'a> {
    /// Create a fetcher.
    #[must_use]
    pub fn new(git: GitClient<'a>, downloader: &'a dyn Downloader, clone_depth: u32) -> Self {
        Self {
            git,
            downloader,
            clone_depth,
        }
    }
}

impl MirrorFetcher for NetworkFetcher<'_> {
    fn fetch(&self, mirror: &Mirror, dest_dir: &Utf8Path) -> Result<Utf8PathBuf> {
        let unavailable = |reason: String| InstallerError::MirrorUnavailable {
            url: mirror.url.clone(),
            reason,
        };
        let dest = dest_dir.join(artifact_file_name(&mirror.url, mirror.kind));
        match mirror.kind {
            MirrorKind::Git => {
                self.git
                    .clone_repository(
                        &mirror.url,
                        mirror.reference.as_deref(),
                        self.clone_depth,
                        &dest,
                    )
                    .map_err(|e| unavailable(e.to_string()))?;
                if !dest.join(".git").exists() {
                    return Err(unavailable("clone finished without a .git directory".to_owned()));
                }
            }
            MirrorKind::Archive => {
                let bytes = self
                    .downloader
                    .download(&mirror.url, dest.as_std_path())
                    .map_err(|e| unavailable(e.to_string()))?;
                debug!("downloaded {bytes} bytes from {}", mirror.url);
                verify_archive(&dest)
                    .map_err(|e| unavailable(format!("integrity check failed: {e}")))?;
            }
        }
        Ok(dest)
    }
}

/// Derive a local file name from a mirror URL.
///
/// # Examples
///
/// ```
/// use modsec_installer::artifact::MirrorKind;
/// use modsec_installer::resolver::artifact_file_name;
///
/// assert_eq!(
///     artifact_file_name("https://gitee.com/x/ModSecurity.git", MirrorKind::Git),
///     "ModSecurity"
/// );
/// assert_eq!(
///     artifact_file_name("https://nginx.org/download/nginx-1.24.0.tar.gz?x=1", MirrorKind::Archive),
///     "nginx-1.24.0.tar.gz"
/// );
/// ```
#[must_use]
pub fn artifact_file_name(url: &str, kind: MirrorKind) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let last = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && *s != "." && *s != "..");
    match (last, kind) {
        (Some(name), MirrorKind::Git) => name.strip_suffix(".git").unwrap_or(name).to_owned(),
        (Some(name), MirrorKind::Archive) => name.to_owned(),
        (None, MirrorKind::Git) => "repository".to_owned(),
        (None, MirrorKind::Archive) => "archive".to_owned(),
    }
}

/// Attempts per mirror and the delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// At least one attempt is always made. Attempt `n` (counting from one)
    /// is preceded by a delay of `(n - 1) * base_delay`.
    #[must_use]
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Attempts per mirror.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before attempt `attempt` (one-based).
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_sub(1))
    }
}

/// Where a resolved artifact came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    /// Served from the cache without network access.
    Cache,
    /// Fetched from the mirror with this URL.
    Mirror(String),
}

impl fmt::Display for ResolvedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache => f.write_str("cache"),
            Self::Mirror(url) => f.write_str(url),
        }
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Local path of the artifact (inside the cache unless caching failed).
    pub path: Utf8PathBuf,
    /// Origin of the artifact.
    pub source: ResolvedSource,
    /// Mirrors that failed before the winning one.
    pub failures: Vec<AttemptFailure>,
}

/// A resolved artifact materialised as a private source tree.
#[derive(Debug, Clone)]
pub struct Checkout {
    /// Root of the source tree.
    pub root: Utf8PathBuf,
    /// How the artifact was obtained.
    pub resolved: Resolved,
}

/// Resolves artifacts through the cache and an ordered mirror list.
pub struct SourceResolver<'a> {
    cache: &'a CacheStore,
    fetcher: &'a dyn MirrorFetcher,
    scratch_root: Utf8PathBuf,
    retry: RetryPolicy,
}

impl<'a> SourceResolver<'a> {
    /// Create a resolver. Fetches land in `scratch_root` before being cached.
    #[must_use]
    pub fn new(
        cache: &'a CacheStore,
        fetcher: &'a dyn MirrorFetcher,
        scratch_root: impl Into<Utf8PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cache,
            fetcher,
            scratch_root: scratch_root.into(),
            retry,
        }
    }

    /// Return a local path for `spec`, from the cache or the first mirror
    /// that delivers a verified artifact.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::AllMirrorsFailed`] with every mirror's
    /// failure reason when no mirror succeeds.
    pub fn resolve(&self, spec: &ArtifactSpec) -> Result<Resolved> {
        match self.cache.get(spec.kind(), spec.version()) {
            Ok(Some(entry)) => {
                debug!("{spec} served from cache at {}", entry.path);
                return Ok(Resolved {
                    path: entry.path,
                    source: ResolvedSource::Cache,
                    failures: Vec::new(),
                });
            }
            Ok(None) => {}
            Err(err) => warn!("cache unavailable for {spec}, fetching instead: {err}"),
        }

        let found = first_success(
            spec.mirrors().iter().enumerate(),
            |(_, mirror)| mirror.url.clone(),
            |(index, mirror)| self.fetch_with_retry(spec, *index, mirror),
        )
        .map_err(|failures| InstallerError::AllMirrorsFailed {
            artifact: spec.to_string(),
            failures,
        })?;

        let mirror_url = spec
            .mirrors()
            .get(found.index)
            .map(|m| m.url.clone())
            .unwrap_or_default();
        info!("fetched {spec} from {mirror_url}");

        let path = match self.cache.put(spec.kind(), spec.version(), &found.value) {
            Ok(entry) => {
                if let Some(attempt_dir) = found.value.parent() {
                    remove_quietly(attempt_dir);
                }
                entry.path
            }
            Err(err) => {
                warn!("could not cache {spec}, continuing without cache: {err}");
                found.value
            }
        };

        Ok(Resolved {
            path,
            source: ResolvedSource::Mirror(mirror_url),
            failures: found.failures,
        })
    }

    /// Resolve `spec` and materialise it as a fresh tree at `dest`.
    ///
    /// Archives are extracted (unwrapping a single top-level directory);
    /// repositories are copied so the cached copy is never built in.
    ///
    /// # Errors
    ///
    /// Propagates resolution errors. If a cached archive cannot be extracted
    /// the cache entry is invalidated before the error is returned.
    pub fn checkout(&self, spec: &ArtifactSpec, dest: &Utf8Path) -> Result<Checkout> {
        let resolved = self.resolve(spec)?;
        if dest.exists() {
            std::fs::remove_dir_all(dest)?;
        }
        let root = if resolved.path.is_file() {
            match extract_archive(&resolved.path, dest) {
                Ok(root) => root,
                Err(err) => {
                    if resolved.source == ResolvedSource::Cache {
                        self.cache.invalidate(spec.kind(), spec.version())?;
                    }
                    return Err(InstallerError::Cache {
                        operation: "extract",
                        path: resolved.path.clone(),
                        reason: format!("{err}; the entry has been discarded, rerun to fetch it again"),
                    });
                }
            }
        } else {
            copy_tree(&resolved.path, dest)?;
            dest.to_owned()
        };
        Ok(Checkout { root, resolved })
    }

    /// Drop the cached copy of `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Cache`] if the entry cannot be removed.
    pub fn invalidate(&self, spec: &ArtifactSpec) -> Result<()> {
        self.cache.invalidate(spec.kind(), spec.version())
    }

    fn fetch_with_retry(
        &self,
        spec: &ArtifactSpec,
        index: usize,
        mirror: &Mirror,
    ) -> std::result::Result<Utf8PathBuf, String> {
        let mut last_reason = String::new();
        for attempt in 1..=self.retry.attempts() {
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            let attempt_dir = self.scratch_root.join(format!(
                "{}-{}-m{index}-a{attempt}",
                spec.kind(),
                spec.version()
            ));
            remove_quietly(&attempt_dir);
            if let Err(err) = std::fs::create_dir_all(&attempt_dir) {
                return Err(format!("cannot create scratch directory {attempt_dir}: {err}"));
            }
            match self.fetcher.fetch(mirror, &attempt_dir) {
                Ok(path) => return Ok(path),
                Err(err) => {
                    warn!(
                        "mirror {} failed for {spec} (attempt {attempt}/{}): {err}",
                        mirror.url,
                        self.retry.attempts()
                    );
                    remove_quietly(&attempt_dir);
                    last_reason = err.to_string();
                }
            }
        }
        Err(format!(
            "{last_reason} (after {} attempt(s))",
            self.retry.attempts()
        ))
    }
}

fn remove_quietly(dir: &Utf8Path) {
    if dir.exists() {
        if let Err(err) = std::fs::remove_dir_all(dir) {
            debug!("could not remove scratch directory {dir}: {err}");
        }
    }
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;
