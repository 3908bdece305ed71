//! Contains the logic for extracting the payload archive onto a volume.
//!
//! Payload archives are produced by general-purpose zip tools, which are
//! inconsistent about nesting everything under one synthetic top-level
//! folder. Extraction therefore runs in two passes:
//! 1.  The archive is listed and an [`ExtractionPlan`] is built, which
//!     records the common root folder shared by all entries, if any.
//! 2.  The archive is re-opened and every entry the plan accepts is streamed
//!     to the destination with that root folder stripped.
//!
//! Hidden entries (any path segment starting with `.`) and macOS resource
//! fork metadata (`__MACOSX/`) are never written.
use crate::error::ExtractionError;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Prefix of the resource-fork folder macOS Archive Utility adds to zips.
pub const METADATA_MARKER: &str = "__MACOSX/";

/// Leading character of hidden files and folders.
pub const HIDDEN_MARKER: char = '.';

/// One entry of the payload archive, as listed in the central directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path inside the archive, `/`-separated. Directory entries end with `/`.
    pub relative_path: String,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub is_directory: bool,
}

/// Why an entry is not written to the destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The common root folder itself.
    Root,
    Metadata,
    Hidden,
    /// The path is absolute or would escape the destination.
    Unsafe,
}

/// What extraction does with one entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    Skip(SkipReason),
    Directory(PathBuf),
    File(PathBuf),
}

/// The result of the first pass over an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractionPlan {
    /// The shared first path segment including its trailing `/`, e.g. `pkg/`.
    pub common_root_prefix: Option<String>,
    /// All entries, in archive order.
    pub entries: Vec<ArchiveEntry>,
}

pub fn is_metadata(path: &str) -> bool {
    path.starts_with(METADATA_MARKER)
}

pub fn is_hidden(path: &str) -> bool {
    path.split('/')
        .any(|segment| segment.starts_with(HIDDEN_MARKER))
}

/// Finds the first path segment shared by every entry, as `segment/`.
///
/// Empty names and metadata entries are ignored. Returns `None` if nothing
/// is left, or if any entry sits at the top level or under a different
/// folder.
pub fn detect_common_root<'a, I>(paths: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut root: Option<&str> = None;
    for path in paths {
        if path.is_empty() || is_metadata(path) {
            continue;
        }
        let (first, _) = path.split_once('/')?;
        if first.is_empty() {
            return None;
        }
        match root {
            None => root = Some(first),
            Some(r) if r == first => {}
            Some(_) => return None,
        }
    }
    root.map(|r| format!("{r}/"))
}

impl ExtractionPlan {
    pub fn from_entries(entries: Vec<ArchiveEntry>) -> Self {
        let common_root_prefix =
            detect_common_root(entries.iter().map(|e| e.relative_path.as_str()));
        Self {
            common_root_prefix,
            entries,
        }
    }

    /// Decides where `path` goes below the destination root, if anywhere.
    pub fn disposition(&self, path: &str, is_directory: bool) -> Disposition {
        let root = self.common_root_prefix.as_deref();
        if path.is_empty() || root.is_some_and(|r| path == r || path == r.trim_end_matches('/')) {
            return Disposition::Skip(SkipReason::Root);
        }
        if is_metadata(path) {
            return Disposition::Skip(SkipReason::Metadata);
        }
        if is_hidden(path) {
            return Disposition::Skip(SkipReason::Hidden);
        }

        let stripped = root.and_then(|r| path.strip_prefix(r)).unwrap_or(path);
        let Some(relative) = safe_relative_path(stripped) else {
            return Disposition::Skip(SkipReason::Unsafe);
        };
        if relative.as_os_str().is_empty() {
            return Disposition::Skip(SkipReason::Root);
        }

        if is_directory || path.ends_with('/') {
            Disposition::Directory(relative)
        } else {
            Disposition::File(relative)
        }
    }

    /// Number of regular files that extraction would write.
    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    self.disposition(&e.relative_path, e.is_directory),
                    Disposition::File(_)
                )
            })
            .count()
    }

    /// Total uncompressed bytes of the files that extraction would write.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    self.disposition(&e.relative_path, e.is_directory),
                    Disposition::File(_)
                )
            })
            .map(|e| e.uncompressed_size)
            .sum()
    }
}

// Rejects absolute paths, drive prefixes and `..`; drops empty and `.` segments.
fn safe_relative_path(path: &str) -> Option<PathBuf> {
    if path.starts_with('/') || path.contains(':') {
        return None;
    }
    let mut out = PathBuf::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            s => out.push(s),
        }
    }
    Some(out)
}

fn open(archive: &Path) -> Result<ZipArchive<File>, ExtractionError> {
    if !archive.is_file() {
        return Err(ExtractionError::ArchiveNotFound(archive.to_path_buf()));
    }
    let file = File::open(archive).map_err(|source| ExtractionError::Io {
        path: archive.to_path_buf(),
        source,
    })?;
    ZipArchive::new(file).map_err(|source| ExtractionError::Open {
        path: archive.to_path_buf(),
        source,
    })
}

// Some Windows tools write `\` separators.
fn normalize_name(name: &str) -> String {
    name.replace('\\', "/")
}

/// Lists every entry of `archive`, directories included.
pub fn list_entries(archive: &Path) -> Result<Vec<ArchiveEntry>, ExtractionError> {
    let mut zip = open(archive)?;
    let mut entries = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let file = zip
            .by_index_raw(index)
            .map_err(|source| ExtractionError::Entry { index, source })?;
        let relative_path = normalize_name(file.name());
        entries.push(ArchiveEntry {
            is_directory: file.is_dir() || relative_path.ends_with('/'),
            relative_path,
            uncompressed_size: file.size(),
            compressed_size: file.compressed_size(),
        });
    }
    Ok(entries)
}

/// First pass: lists `archive` and detects its common root folder.
pub fn plan(archive: &Path) -> Result<ExtractionPlan, ExtractionError> {
    let plan = ExtractionPlan::from_entries(list_entries(archive)?);
    debug!(
        entries = plan.entries.len(),
        root = plan.common_root_prefix.as_deref().unwrap_or("<none>"),
        "planned extraction of {}",
        archive.display()
    );
    Ok(plan)
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ExtractionError + '_ {
    move |source| ExtractionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Extracts `archive` below `destination_root`.
///
/// # Arguments
///
/// * `archive` - Path to the zip archive.
/// * `destination_root` - Directory the entries are written to. Created if missing.
/// * `running` - Checked before each entry. If it is `false` the extraction
///   stops with [`ExtractionError::Cancelled`]; a file being written is
///   always finished first.
/// * `on_progress` - Called after each entry with the number of entries
///   processed so far and the total number of entries.
///
/// # Errors
///
/// Fails if the archive is missing or unreadable, if any file cannot be
/// written (the remaining entries are not attempted), on cancellation, or
/// with [`ExtractionError::NoValidFiles`] when no file was written at all.
///
/// Returns the number of files written.
pub fn extract<F>(
    archive: &Path,
    destination_root: &Path,
    running: &AtomicBool,
    mut on_progress: F,
) -> Result<u32, ExtractionError>
where
    F: FnMut(usize, usize),
{
    let plan = plan(archive)?;
    let total = plan.entries.len();

    let mut zip = open(archive)?;
    fs::create_dir_all(destination_root).map_err(io_error(destination_root))?;

    let mut files_extracted: u32 = 0;
    for index in 0..zip.len() {
        if !running.load(Ordering::SeqCst) {
            return Err(ExtractionError::Cancelled);
        }

        let mut entry = zip
            .by_index(index)
            .map_err(|source| ExtractionError::Entry { index, source })?;
        let name = normalize_name(entry.name());

        match plan.disposition(&name, entry.is_dir()) {
            Disposition::Skip(SkipReason::Unsafe) => {
                warn!("Skipping archive entry with unsafe path: {name}");
            }
            Disposition::Skip(reason) => debug!(?reason, "skipping {name}"),
            Disposition::Directory(relative) => {
                let path = destination_root.join(relative);
                fs::create_dir_all(&path).map_err(io_error(&path))?;
            }
            Disposition::File(relative) => {
                let path = destination_root.join(relative);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(io_error(parent))?;
                }
                // The handle is dropped, and so closed, on success and on error alike.
                let mut out = BufWriter::new(File::create(&path).map_err(io_error(&path))?);
                io::copy(&mut entry, &mut out).map_err(io_error(&path))?;
                out.flush().map_err(io_error(&path))?;
                files_extracted += 1;
            }
        }

        on_progress(index + 1, total);
    }

    if files_extracted == 0 {
        return Err(ExtractionError::NoValidFiles);
    }

    info!(
        "Extracted {} files from {} to {}",
        files_extracted,
        archive.display(),
        destination_root.display()
    );
    Ok(files_extracted)
}
