//! Directory resolution for platform-specific paths.
//!
//! The installer keeps its artifact cache under the user's cache directory.
//! [`BaseDirs`] lets tests substitute a fixed location.

use camino::Utf8PathBuf;

/// Name of the cache subdirectory owned by the installer.
pub const CACHE_DIR_NAME: &str = "modsec-installer";

/// Fallback cache root when no platform cache directory is available.
pub const FALLBACK_CACHE_ROOT: &str = "/var/cache/modsec-installer";

/// Default transient build root.
pub const DEFAULT_WORK_DIR: &str = "/tmp/modsecurity_build";

/// Source of platform base directories.
pub trait BaseDirs {
    /// The user cache directory (`$XDG_CACHE_HOME` or `~/.cache` on Linux).
    fn cache_dir(&self) -> Option<Utf8PathBuf>;
}

/// Resolves base directories from the running system via `directories-next`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBaseDirs;

impl BaseDirs for SystemBaseDirs {
    fn cache_dir(&self) -> Option<Utf8PathBuf> {
        let dirs = directories_next::BaseDirs::new()?;
        Utf8PathBuf::try_from(dirs.cache_dir().to_path_buf()).ok()
    }
}

/// The cache root used when `--cache-dir` is not given.
#[must_use]
pub fn default_cache_root(dirs: &dyn BaseDirs) -> Utf8PathBuf {
    dirs.cache_dir().map_or_else(
        || Utf8PathBuf::from(FALLBACK_CACHE_ROOT),
        |base| base.join(CACHE_DIR_NAME),
    )
}
