//! Artifact cache keyed by kind and version.
//!
//! Layout: `<root>/<kind>/<version>/<entry>` plus a `.entry.json` sidecar.
//! New entries are assembled in a hidden temporary directory inside the slot
//! and renamed into place, so a reader never observes a half-written entry.
//! An entry that is missing, empty, or fails its recorded checksum is a miss.

use crate::artifact::ArtifactKind;
use crate::error::{InstallerError, Result};
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

const METADATA_FILE: &str = ".entry.json";
const TEMP_PREFIX: &str = ".tmp-";

/// A present, non-empty cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Artifact version.
    pub version: String,
    /// Path of the cached file or directory.
    pub path: Utf8PathBuf,
    /// Total size of regular files in the entry. Always non-zero.
    pub size_bytes: u64,
    /// When the entry was stored.
    pub created_at: SystemTime,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMetadata {
    name: String,
    size_bytes: u64,
    created_at_secs: u64,
    #[serde(default)]
    sha256: Option<String>,
}

/// Cache of downloaded archives and cloned repositories.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Utf8PathBuf,
}

impl CacheStore {
    /// Create a store rooted at `root`. Nothing is touched on disk until the
    /// first `put`.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Directory holding the entry for `kind` and `version`.
    #[must_use]
    pub fn slot_dir(&self, kind: &ArtifactKind, version: &str) -> Utf8PathBuf {
        self.root.join(kind.as_str()).join(version)
    }

    /// Look up an entry. Missing, empty, or corrupt entries are `None`.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Cache`] when the slot exists but cannot be
    /// read.
    pub fn get(&self, kind: &ArtifactKind, version: &str) -> Result<Option<CacheEntry>> {
        let slot = self.slot_dir(kind, version);
        let metadata = read_metadata(&slot);
        let Some(path) = locate_entry(&slot, metadata.as_ref())? else {
            return Ok(None);
        };

        let size_bytes =
            entry_size(&path).map_err(|e| InstallerError::cache("get", path.clone(), &e))?;
        if size_bytes == 0 {
            debug!("ignoring empty cache entry {path}");
            return Ok(None);
        }

        if let Some(expected) = metadata.as_ref().and_then(|m| m.sha256.as_deref()) {
            let actual = sha256_file(&path).map_err(|e| InstallerError::cache("get", path.clone(), &e))?;
            if actual != expected {
                warn!("cache entry {path} does not match its recorded checksum; treating as a miss");
                return Ok(None);
            }
        }

        let created_at = metadata
            .as_ref()
            .map(|m| UNIX_EPOCH + Duration::from_secs(m.created_at_secs))
            .or_else(|| fs::metadata(&path).and_then(|m| m.modified()).ok())
            .unwrap_or(UNIX_EPOCH);

        Ok(Some(CacheEntry {
            kind: kind.clone(),
            version: version.to_owned(),
            path,
            size_bytes,
            created_at,
        }))
    }

    /// Copy `source` into the cache, replacing any existing entry.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Cache`] if the copy or rename fails, or if
    /// `source` is empty.
    pub fn put(&self, kind: &ArtifactKind, version: &str, source: &Utf8Path) -> Result<CacheEntry> {
        let slot = self.slot_dir(kind, version);
        fs::create_dir_all(&slot).map_err(|e| InstallerError::cache("put", slot.clone(), &e))?;

        let name = source.file_name().unwrap_or("artifact").to_owned();
        let staging = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(&slot)
            .map_err(|e| InstallerError::cache("put", slot.clone(), &e))?;
        let staging_dir = Utf8Path::from_path(staging.path()).ok_or_else(|| InstallerError::Cache {
            operation: "put",
            path: slot.clone(),
            reason: "temporary path is not valid UTF-8".to_owned(),
        })?;
        let staged = staging_dir.join(&name);

        copy_tree(source, &staged).map_err(|e| InstallerError::cache("put", source, &e))?;
        let size_bytes =
            entry_size(&staged).map_err(|e| InstallerError::cache("put", staged.clone(), &e))?;
        if size_bytes == 0 {
            return Err(InstallerError::Cache {
                operation: "put",
                path: source.to_owned(),
                reason: "refusing to cache an empty artifact".to_owned(),
            });
        }
        let sha256 = if staged.is_file() {
            Some(sha256_file(&staged).map_err(|e| InstallerError::cache("put", staged.clone(), &e))?)
        } else {
            None
        };

        remove_visible_entries(&slot).map_err(|e| InstallerError::cache("put", slot.clone(), &e))?;
        let dest = slot.join(&name);
        fs::rename(&staged, &dest).map_err(|e| InstallerError::cache("put", dest.clone(), &e))?;

        let created_at = SystemTime::now();
        let metadata = EntryMetadata {
            name,
            size_bytes,
            created_at_secs: created_at
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
            sha256,
        };
        write_metadata(&slot, staging_dir, &metadata)
            .map_err(|e| InstallerError::cache("put", slot.clone(), &e))?;
        debug!("cached {kind} {version} at {dest} ({size_bytes} bytes)");

        Ok(CacheEntry {
            kind: kind.clone(),
            version: version.to_owned(),
            path: dest,
            size_bytes,
            created_at,
        })
    }

    /// Remove the entry for `kind` and `version`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Cache`] if the slot exists but cannot be
    /// removed.
    pub fn invalidate(&self, kind: &ArtifactKind, version: &str) -> Result<()> {
        let slot = self.slot_dir(kind, version);
        remove_dir_if_present(&slot).map_err(|e| InstallerError::cache("invalidate", slot, &e))
    }

    /// Remove every entry and recreate an empty root.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Cache`] if the root cannot be removed or
    /// recreated.
    pub fn clear(&self) -> Result<()> {
        remove_dir_if_present(&self.root)
            .and_then(|()| fs::create_dir_all(&self.root))
            .map_err(|e| InstallerError::cache("clear", self.root.clone(), &e))
    }
}

fn read_metadata(slot: &Utf8Path) -> Option<EntryMetadata> {
    let text = fs::read_to_string(slot.join(METADATA_FILE)).ok()?;
    match serde_json::from_str(&text) {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            warn!("ignoring unreadable cache metadata in {slot}: {err}");
            None
        }
    }
}

fn write_metadata(slot: &Utf8Path, staging_dir: &Utf8Path, metadata: &EntryMetadata) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(metadata).map_err(io::Error::other)?;
    let tmp = staging_dir.join(METADATA_FILE);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, slot.join(METADATA_FILE))
}

/// Find the visible entry in `slot`, preferring the name recorded in the
/// metadata. Hidden names (temporary copies, the sidecar) never count.
fn locate_entry(slot: &Utf8Path, metadata: Option<&EntryMetadata>) -> Result<Option<Utf8PathBuf>> {
    if let Some(recorded) = metadata.map(|m| slot.join(&m.name)) {
        if recorded.exists() {
            return Ok(Some(recorded));
        }
    }
    let entries = match slot.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(InstallerError::cache("get", slot, &e)),
    };
    let mut visible = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| InstallerError::cache("get", slot, &e))?;
        if !entry.file_name().starts_with('.') {
            visible.push(entry.into_path());
        }
    }
    visible.sort();
    Ok(visible.into_iter().next())
}

fn remove_visible_entries(slot: &Utf8Path) -> io::Result<()> {
    for entry in slot.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_name().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
    }
    match fs::remove_file(slot.join(METADATA_FILE)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn remove_dir_if_present(dir: &Utf8Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Sum of regular file sizes under `path` (or the file's own size).
pub(crate) fn entry_size(path: &Utf8Path) -> io::Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_file() {
            total = total.saturating_add(entry.metadata().map_err(io::Error::other)?.len());
        }
    }
    Ok(total)
}

/// Copy a file or directory tree, preserving symlinks.
pub(crate) fn copy_tree(source: &Utf8Path, dest: &Utf8Path) -> io::Result<()> {
    if source.is_file() {
        fs::copy(source, dest)?;
        return fs::File::open(dest)?.sync_all();
    }
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let target = dest.as_std_path().join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &std::path::Path, target: &std::path::Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(link)?, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &std::path::Path, target: &std::path::Path) -> io::Result<()> {
    fs::copy(link, target).map(|_| ())
}

/// Streaming SHA-256 of a file, as lowercase hex.
pub(crate) fn sha256_file(path: &Utf8Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(buffer.get(..read).unwrap_or_default());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
