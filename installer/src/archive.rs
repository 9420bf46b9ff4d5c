//! Archive integrity checks and extraction.
//!
//! Supports gzip, zstd, and uncompressed tarballs plus zip files. Every entry
//! path is validated before anything is written, guarding against path
//! traversal (zip-slip). Tar link entries must point inside the archive, and
//! tar entries are unpacked with `unpack_in`, which refuses to write through
//! a symlink that leaves the destination.

use camino::{Utf8Path, Utf8PathBuf};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

/// Errors arising from archive verification or extraction.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// I/O error, including truncated or corrupt compressed streams.
    #[error("archive I/O error: {0}")]
    Io(#[from] io::Error),

    /// A path in the archive attempts to traverse outside the destination.
    #[error("path traversal detected: {path}")]
    PathTraversal {
        /// The offending path from the archive entry.
        path: String,
    },

    /// The archive contains no entries.
    #[error("archive contains no files")]
    EmptyArchive,

    /// The file is not a recognised archive.
    #[error("{path} is not a recognised archive")]
    UnknownFormat {
        /// The file that was inspected.
        path: Utf8PathBuf,
    },

    /// The zip container is malformed.
    #[error("corrupt zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Supported archive encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// `.tar.gz` / `.tgz`
    TarGz,
    /// `.tar.zst`
    TarZst,
    /// `.tar`
    Tar,
    /// `.zip`
    Zip,
}

impl ArchiveFormat {
    /// Guess the format from a file or URL name.
    ///
    /// # Examples
    ///
    /// ```
    /// use modsec_installer::archive::ArchiveFormat;
    ///
    /// assert_eq!(ArchiveFormat::from_name("nginx-1.24.0.tar.gz"), Some(ArchiveFormat::TarGz));
    /// assert_eq!(ArchiveFormat::from_name("ModSecurity.git"), None);
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar.zst") {
            Some(Self::TarZst)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }

    /// Identify the format by its leading magic bytes, falling back to the
    /// file name.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError::UnknownFormat`] if neither the content nor
    /// the name is recognised, or an I/O error if the file cannot be read.
    pub fn detect(path: &Utf8Path) -> Result<Self, ExtractionError> {
        let mut head = [0u8; 512];
        let mut file = File::open(path)?;
        let mut filled = 0;
        while filled < head.len() {
            let read = file.read(head.get_mut(filled..).unwrap_or_default())?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        let head = head.get(..filled).unwrap_or_default();

        if head.starts_with(&[0x1f, 0x8b]) {
            Ok(Self::TarGz)
        } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Ok(Self::TarZst)
        } else if head.starts_with(b"PK\x03\x04") {
            Ok(Self::Zip)
        } else if head.get(257..262) == Some(b"ustar".as_slice()) {
            Ok(Self::Tar)
        } else {
            path.file_name()
                .and_then(Self::from_name)
                .filter(|_| filled > 0)
                .ok_or_else(|| ExtractionError::UnknownFormat {
                    path: path.to_owned(),
                })
        }
    }
}

/// Read every entry of the archive at `path` without writing anything.
///
/// Returns the number of entries. A downloaded file that fails here must be
/// treated as a failed fetch.
///
/// # Errors
///
/// Returns an error for unknown formats, corrupt or truncated streams, path
/// traversal, or an empty archive.
pub fn verify_archive(path: &Utf8Path) -> Result<usize, ExtractionError> {
    let count = match ArchiveFormat::detect(path)? {
        ArchiveFormat::Zip => {
            let mut archive = zip::ZipArchive::new(BufReader::new(File::open(path)?))?;
            for index in 0..archive.len() {
                let mut file = archive.by_index(index)?;
                if file.enclosed_name().is_none() {
                    return Err(ExtractionError::PathTraversal {
                        path: file.name().to_owned(),
                    });
                }
                io::copy(&mut file, &mut io::sink())?;
            }
            archive.len()
        }
        format => {
            let mut archive = open_tar(path, format)?;
            let mut count = 0;
            for entry in archive.entries()? {
                let mut entry = entry?;
                validate_tar_entry(&entry)?;
                io::copy(&mut entry, &mut io::sink())?;
                count += 1;
            }
            count
        }
    };
    if count == 0 {
        return Err(ExtractionError::EmptyArchive);
    }
    Ok(count)
}

/// Extract the archive at `path` into `dest` and return the source root.
///
/// Upstream release archives wrap everything in one top-level directory
/// (`nginx-1.24.0/`); when that is the case the returned path is that
/// directory, otherwise it is `dest` itself.
///
/// # Errors
///
/// Returns an error for unknown formats, corrupt streams, path traversal,
/// empty archives, or I/O failures while writing.
pub fn extract_archive(path: &Utf8Path, dest: &Utf8Path) -> Result<Utf8PathBuf, ExtractionError> {
    std::fs::create_dir_all(dest)?;
    let written = match ArchiveFormat::detect(path)? {
        ArchiveFormat::Zip => extract_zip(path, dest)?,
        format => extract_tar(path, format, dest)?,
    };
    if written == 0 {
        return Err(ExtractionError::EmptyArchive);
    }
    single_top_level_dir(dest)
}

fn open_tar(path: &Utf8Path, format: ArchiveFormat) -> Result<tar::Archive<Box<dyn Read>>, ExtractionError> {
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarGz => Box::new(flate2::read::GzDecoder::new(file)),
        ArchiveFormat::TarZst => Box::new(zstd::Decoder::with_buffer(file)?),
        ArchiveFormat::Tar | ArchiveFormat::Zip => Box::new(file),
    };
    Ok(tar::Archive::new(reader))
}

fn extract_tar(path: &Utf8Path, format: ArchiveFormat, dest: &Utf8Path) -> Result<usize, ExtractionError> {
    let mut archive = open_tar(path, format)?;
    archive.set_preserve_permissions(true);
    let mut written = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if kind.is_pax_global_extensions() || kind.is_pax_local_extensions() {
            continue;
        }
        let entry_path = validate_tar_entry(&entry)?;
        if !entry.unpack_in(dest.as_std_path())? {
            return Err(ExtractionError::PathTraversal {
                path: entry_path.display().to_string(),
            });
        }
        written += 1;
    }
    Ok(written)
}

fn extract_zip(path: &Utf8Path, dest: &Utf8Path) -> Result<usize, ExtractionError> {
    let mut archive = zip::ZipArchive::new(BufReader::new(File::open(path)?))?;
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let relative = file
            .enclosed_name()
            .ok_or_else(|| ExtractionError::PathTraversal {
                path: file.name().to_owned(),
            })?;
        let dest_path = dest.as_std_path().join(relative);
        if file.is_dir() {
            std::fs::create_dir_all(&dest_path)?;
            continue;
        }
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest_path)?;
        io::copy(&mut file, &mut out)?;
        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest_path, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(archive.len())
}

fn single_top_level_dir(dest: &Utf8Path) -> Result<Utf8PathBuf, ExtractionError> {
    let mut entries = dest.read_dir_utf8()?;
    let first = entries.next().transpose()?;
    let second = entries.next().transpose()?;
    match (first, second) {
        (Some(only), None) if only.file_type()?.is_dir() => Ok(only.into_path()),
        _ => Ok(dest.to_owned()),
    }
}

/// Validate that an entry path does not escape the destination directory
/// via `..` components or absolute paths.
fn validate_entry_path(path: &Path) -> Result<(), ExtractionError> {
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
    if escapes {
        return Err(ExtractionError::PathTraversal {
            path: path.display().to_string(),
        });
    }
    Ok(())
}

/// Validate a tar entry's own path and, for symlinks and hard links, the
/// path it points at. Returns the entry path.
fn validate_tar_entry<R: Read>(entry: &tar::Entry<'_, R>) -> Result<PathBuf, ExtractionError> {
    let path = entry.path()?.into_owned();
    validate_entry_path(&path)?;
    let kind = entry.header().entry_type();
    if !(kind.is_symlink() || kind.is_hard_link()) {
        return Ok(path);
    }
    let target = entry
        .link_name()?
        .map(std::borrow::Cow::into_owned)
        .unwrap_or_default();
    // Symlinks resolve from the link's directory, hard links from the root.
    let base = if kind.is_symlink() {
        path.parent().unwrap_or_else(|| Path::new(""))
    } else {
        Path::new("")
    };
    if target.as_os_str().is_empty() || link_escapes(base, &target) {
        return Err(ExtractionError::PathTraversal {
            path: format!("{} -> {}", path.display(), target.display()),
        });
    }
    Ok(path)
}

/// Whether `target`, resolved lexically from `base`, leaves the archive root.
fn link_escapes(base: &Path, target: &Path) -> bool {
    if target.is_absolute() {
        return true;
    }
    let mut depth = base
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return true;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return true,
        }
    }
    false
}
