//! Dated file cache for downloaded reference datasets
//!
//! Provides a `DatedCache` that keeps downloaded files named
//! `YYYYMMDD_name.ext` in a directory, answers freshness questions by the date
//! prefix embedded in the filename, and evicts older versions once a newer one
//! has been written.

use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffix used for files that are still being written
pub const PARTIAL_SUFFIX: &str = ".part";

/// A file in the cache directory whose name carries a date prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    /// Full path to the file
    pub path: PathBuf,
    /// The `YYYYMMDD` prefix, compared lexically
    pub date: String,
}

/// Manages a directory of dated files for one or more datasets
///
/// Datasets sharing a directory are told apart by extension: every operation
/// takes the extension (without the dot, case-insensitive) of the dataset it
/// works on.
#[derive(Debug, Clone)]
pub struct DatedCache {
    /// Directory where cached files are stored
    dir: PathBuf,
}

impl DatedCache {
    /// Creates a cache rooted at `dir`
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path a file with the given name would have
    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Ensures the cache directory exists
    pub fn ensure_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Lists every dated file with the given extension
    ///
    /// Files without an 8-digit prefix and partially written files are
    /// skipped. A missing directory yields an empty list.
    pub fn list(&self, extension: &str) -> std::io::Result<Vec<CachedFile>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !has_extension(name, extension) {
                continue;
            }
            if let Some(date) = date_prefix(name) {
                files.push(CachedFile {
                    path: entry.path(),
                    date: date.to_string(),
                });
            }
        }
        files.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.path.cmp(&b.path)));
        Ok(files)
    }

    /// Returns the newest file of the dataset, if any
    pub fn latest(&self, extension: &str) -> std::io::Result<Option<CachedFile>> {
        Ok(self.list(extension)?.pop())
    }

    /// Returns the newest file whose date is greater than or equal to `date`
    ///
    /// A hit means a download dated `date` would not be any fresher than what
    /// is already on disk.
    pub fn fresh_as_of(&self, extension: &str, date: &str) -> std::io::Result<Option<CachedFile>> {
        Ok(self
            .latest(extension)?
            .filter(|file| file.date.as_str() >= date))
    }

    /// Deletes every file of the dataset dated strictly before `date`
    ///
    /// Deletion failures are logged and skipped; a stale file may linger but
    /// never blocks the caller. Returns the paths that were removed.
    pub fn evict_older_than(&self, extension: &str, date: &str) -> std::io::Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for file in self.list(extension)? {
            if file.date.as_str() >= date {
                continue;
            }
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    debug!(path = %file.path.display(), "evicted stale cached file");
                    removed.push(file.path);
                }
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "could not delete stale cached file");
                }
            }
        }
        Ok(removed)
    }
}

/// Extracts the leading `YYYYMMDD` prefix of a file name
///
/// Only the first eight characters are inspected and they must form a valid
/// calendar date.
pub fn date_prefix(file_name: &str) -> Option<&str> {
    let prefix = file_name.get(..8)?;
    if !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(prefix, "%Y%m%d").ok()?;
    Some(prefix)
}

/// Returns the extension of a file name, without the dot
pub fn extension_of(file_name: &str) -> Option<&str> {
    Path::new(file_name).extension().and_then(|ext| ext.to_str())
}

fn has_extension(file_name: &str, extension: &str) -> bool {
    if file_name.ends_with(PARTIAL_SUFFIX) {
        return false;
    }
    extension_of(file_name).is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}
