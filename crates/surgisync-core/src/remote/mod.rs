//! Object stores the anonymized copies are published to.

#[cfg(feature = "azure")]
pub mod azure;
pub mod directory;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::{UploadBackend, UploadSettings};
use crate::paths::normalize;
use crate::upload::UploadManager;

pub use directory::DirectoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("request failed: {0}")]
    Http(String),

    #[error("HTTP {status} for {what}")]
    Status { status: u16, what: String },

    #[error("invalid object key {0:?}")]
    InvalidKey(String),

    #[error("store not configured: {0}")]
    Config(String),
}

/// A flat key space of immutable objects.
pub trait ObjectStore {
    /// Human-readable location, for logs and `list-remote`.
    fn describe(&self) -> String;
    /// Create or replace `key` with the contents of `local`.
    fn put_file(&self, local: &Path, key: &str) -> Result<(), StoreError>;
    /// Size of `key`, `None` when it does not exist.
    fn object_size(&self, key: &str) -> Result<Option<u64>, StoreError>;
    /// Every key starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// `<prefix>/<relative_dir>/<name>` with forward slashes and no empty or
/// `.` segments.
pub fn remote_key(prefix: &str, relative_dir: &str, name: &str) -> String {
    prefix
        .split(['/', '\\'])
        .chain(relative_dir.split(['/', '\\']))
        .chain(std::iter::once(name))
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether this run can publish, decided once at startup.
pub enum UploadCapability {
    Disabled,
    /// Upload was requested but cannot work; the reason is reported once.
    Unavailable(String),
    Ready(UploadManager),
}

impl UploadCapability {
    pub fn resolve(settings: &UploadSettings) -> Self {
        if !settings.enabled {
            return Self::Disabled;
        }
        let capability = match settings.backend {
            UploadBackend::Directory => resolve_directory(settings),
            UploadBackend::Azure => resolve_azure(settings),
        };
        match &capability {
            Self::Ready(manager) => info!(store = %manager.describe(), "Upload enabled"),
            Self::Unavailable(reason) => warn!(reason = %reason, "Upload requested but unavailable"),
            Self::Disabled => {}
        }
        capability
    }

    pub fn manager(&self) -> Option<&UploadManager> {
        match self {
            Self::Ready(manager) => Some(manager),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

impl fmt::Display for UploadCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Unavailable(reason) => write!(f, "unavailable ({})", reason),
            Self::Ready(manager) => write!(f, "ready ({})", manager.describe()),
        }
    }
}

impl fmt::Debug for UploadCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadCapability({})", self)
    }
}

fn resolve_directory(settings: &UploadSettings) -> UploadCapability {
    if settings.directory.trim().is_empty() {
        return UploadCapability::Unavailable("upload.directory is not set".into());
    }
    let store = DirectoryStore::new(normalize(&settings.directory));
    UploadCapability::Ready(UploadManager::new(Box::new(store), settings))
}

#[cfg(feature = "azure")]
fn resolve_azure(settings: &UploadSettings) -> UploadCapability {
    match azure::AzureBlobStore::from_settings(settings) {
        Ok(store) => {
            if let Err(e) = store.ensure_container() {
                warn!(error = %e, "Cannot verify or create the container, uploads may fail");
            }
            UploadCapability::Ready(UploadManager::new(Box::new(store), settings))
        }
        Err(e) => UploadCapability::Unavailable(e.to_string()),
    }
}

#[cfg(not(feature = "azure"))]
fn resolve_azure(_settings: &UploadSettings) -> UploadCapability {
    UploadCapability::Unavailable("built without the `azure` feature".into())
}
