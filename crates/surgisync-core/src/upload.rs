use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::UploadSettings;
use crate::remote::{remote_key, ObjectStore, StoreError};

/// Delivers anonymized copies to an [`ObjectStore`] with bounded retries
/// and size verification. Store errors never escape [`UploadManager::upload`].
pub struct UploadManager {
    store: Box<dyn ObjectStore>,
    prefix: String,
    verify: bool,
    max_retries: u32,
    retry_delay: Duration,
}

impl UploadManager {
    pub fn new(store: Box<dyn ObjectStore>, settings: &UploadSettings) -> Self {
        Self {
            store,
            prefix: settings.prefix.clone(),
            verify: settings.verify_upload,
            max_retries: settings.max_retries.max(1),
            retry_delay: Duration::from_secs(settings.retry_delay_secs),
        }
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    pub fn remote_key(&self, relative_dir: &str, anonymous_name: &str) -> String {
        remote_key(&self.prefix, relative_dir, anonymous_name)
    }

    /// Upload `local` as `key`, retrying up to the configured attempt count.
    /// With verification on, an attempt only counts once the remote size
    /// equals the local size.
    pub fn upload(&self, local: &Path, key: &str) -> bool {
        let local_size = match fs::metadata(local) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %local.display(), error = %e, "Cannot read file to upload");
                return false;
            }
        };

        for attempt in 1..=self.max_retries {
            match self.attempt(local, key, local_size) {
                Ok(()) => {
                    info!(key, bytes = local_size, attempt, "Uploaded");
                    return true;
                }
                Err(reason) => {
                    warn!(key, attempt, max = self.max_retries, reason = %reason, "Upload attempt failed");
                    if attempt < self.max_retries {
                        thread::sleep(self.retry_delay);
                    }
                }
            }
        }
        warn!(key, path = %local.display(), "Upload gave up");
        false
    }

    fn attempt(&self, local: &Path, key: &str, local_size: u64) -> Result<(), String> {
        self.store.put_file(local, key).map_err(|e| e.to_string())?;
        if !self.verify {
            return Ok(());
        }
        match self.store.object_size(key) {
            Ok(Some(size)) if size == local_size => Ok(()),
            Ok(Some(size)) => Err(format!("size mismatch: local {} remote {}", local_size, size)),
            Ok(None) => Err("object missing after upload".to_string()),
            Err(e) => Err(format!("verification failed: {}", e)),
        }
    }

    /// Whether `key` already exists remotely. Lookup errors count as absent.
    pub fn is_uploaded(&self, key: &str) -> bool {
        match self.store.object_size(key) {
            Ok(found) => {
                debug!(key, present = found.is_some(), "Presence check");
                found.is_some()
            }
            Err(e) => {
                warn!(key, error = %e, "Presence check failed");
                false
            }
        }
    }

    /// Keys under the configured prefix.
    pub fn list_remote(&self) -> Result<Vec<String>, StoreError> {
        let prefix = remote_key(&self.prefix, "", "");
        let prefix = if prefix.is_empty() {
            prefix
        } else {
            format!("{}/", prefix)
        };
        self.store.list(&prefix)
    }
}
