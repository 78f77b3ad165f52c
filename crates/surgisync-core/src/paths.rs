//! Path handling that survives flaky network shares.
//!
//! Every filesystem touch-point in the sync goes through [`PathAccess`]. Its
//! methods never hand raw I/O errors back to the caller: failures are logged
//! and surface as `false` / `None`, so one unreachable file cannot abort a
//! whole batch.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::PathSettings;

/// Suffix of in-flight copies; renamed into place once complete.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Check whether a configured location refers to a network share.
pub fn is_network_path(raw: &str) -> bool {
    let s = strip_quotes(raw);
    let lower = s.to_lowercase();
    s.starts_with("\\\\")
        || s.starts_with("//")
        || lower.starts_with("smb://")
        || lower.starts_with("cifs://")
}

fn strip_quotes(raw: &str) -> &str {
    raw.trim().trim_matches(|c| c == '"' || c == '\'')
}

/// Turn a configured path string into a usable path.
pub fn normalize(raw: &str) -> PathBuf {
    let s = strip_quotes(raw);
    if cfg!(windows) {
        return PathBuf::from(s);
    }
    // \\server\share\dir reaches us from Windows-authored configs
    if s.starts_with("\\\\") {
        return PathBuf::from(s.replace('\\', "/"));
    }
    PathBuf::from(s)
}

/// Location of `path` relative to `root`, with `root` itself mapping to "".
pub fn relative_to(path: &Path, root: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .ok()
        .or_else(|| pathdiff::diff_paths(path, root))
        .unwrap_or_else(|| PathBuf::from(path.file_name().unwrap_or_default()))
}

/// Existence/stat/copy capability over one storage location.
pub trait PathAccess {
    /// Whether the path exists. Unreachable counts as absent.
    fn exists(&self, path: &Path) -> bool;
    /// Size of a regular file, `None` when absent or unreachable.
    fn file_size(&self, path: &Path) -> Option<u64>;
    /// Copy `src` to `dst`, creating parent directories. Reports success.
    fn copy_file(&self, src: &Path, dst: &Path) -> bool;
    /// Remove a file: `Ok(true)` when deleted, `Ok(false)` when already
    /// absent. Any other failure is returned so callers can keep tracking it.
    fn remove_file(&self, path: &Path) -> io::Result<bool>;
    fn is_network(&self) -> bool;
}

/// Pick the implementation for a root path string.
pub fn access_for(root: &str, settings: &PathSettings) -> Box<dyn PathAccess> {
    if settings.force_network || is_network_path(root) {
        Box::new(NetworkAccess::new(
            settings.network_probe_attempts,
            Duration::from_millis(settings.network_probe_delay_ms),
        ))
    } else {
        Box::new(LocalAccess)
    }
}

/// Plain local filesystem access.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalAccess;

impl PathAccess for LocalAccess {
    fn exists(&self, path: &Path) -> bool {
        match path.try_exists() {
            Ok(found) => found,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot check path");
                false
            }
        }
    }

    fn file_size(&self, path: &Path) -> Option<u64> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            Ok(_) => None,
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot stat file");
                None
            }
        }
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> bool {
        match copy_via_partial(src, dst) {
            Ok(bytes) => {
                debug!(src = %src.display(), dst = %dst.display(), bytes, "Copied");
                true
            }
            Err(e) => {
                warn!(src = %src.display(), dst = %dst.display(), error = %e, "Copy failed");
                false
            }
        }
    }

    fn remove_file(&self, path: &Path) -> io::Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot remove file");
                Err(e)
            }
        }
    }

    fn is_network(&self) -> bool {
        false
    }
}

/// Network share access: transient errors are retried a bounded number of
/// times before the path is reported as unavailable.
#[derive(Debug, Clone)]
pub struct NetworkAccess {
    attempts: u32,
    delay: Duration,
}

impl NetworkAccess {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds, fails with NotFound, or attempts run out.
    fn probe<T>(&self, what: &str, path: &Path, op: impl Fn() -> io::Result<T>) -> io::Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(e),
                Err(e) if attempt >= self.attempts => {
                    warn!(path = %path.display(), error = %e, attempts = attempt, "Network {} failed", what);
                    return Err(e);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, attempt, "Network {} failed, retrying", what);
                    thread::sleep(self.delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl PathAccess for NetworkAccess {
    fn exists(&self, path: &Path) -> bool {
        self.probe("probe", path, || path.try_exists()).unwrap_or(false)
    }

    fn file_size(&self, path: &Path) -> Option<u64> {
        match self.probe("stat", path, || fs::metadata(path)) {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        }
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> bool {
        match self.probe("copy", src, || copy_via_partial(src, dst)) {
            Ok(bytes) => {
                debug!(src = %src.display(), dst = %dst.display(), bytes, "Copied from share");
                true
            }
            Err(e) => {
                warn!(src = %src.display(), error = %e, "Copy from share failed");
                false
            }
        }
    }

    fn remove_file(&self, path: &Path) -> io::Result<bool> {
        match self.probe("remove", path, || fs::remove_file(path)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_network(&self) -> bool {
        true
    }
}

/// `dst` with [`PARTIAL_SUFFIX`] appended to its file name.
pub fn partial_path(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().unwrap_or_default().to_os_string();
    name.push(PARTIAL_SUFFIX);
    dst.with_file_name(name)
}

/// Copy into a sibling temp file, carry the source mtime over, then rename.
/// A crash never leaves a truncated file under the final name.
fn copy_via_partial(src: &Path, dst: &Path) -> io::Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = partial_path(dst);
    let result = (|| -> io::Result<u64> {
        let bytes = fs::copy(src, &temp)?;
        if let Ok(meta) = fs::metadata(src) {
            let mtime = filetime::FileTime::from_last_modification_time(&meta);
            filetime::set_file_mtime(&temp, mtime).ok();
        }
        fs::rename(&temp, dst)?;
        Ok(bytes)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Recursively collect files under `root` whose name passes `accept`,
/// sorted by path. Unreadable entries are logged and skipped.
pub fn collect_files(root: &Path, accept: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.ends_with(PARTIAL_SUFFIX) || !accept(&name) {
            continue;
        }
        files.push(entry.into_path());
    }
    files
}
