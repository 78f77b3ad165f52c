pub mod anonymize;
pub mod case_sheet;
pub mod clip;
pub mod config;
pub mod mapping;
pub mod paths;
pub mod remote;
pub mod sync;
pub mod upload;
pub mod video;

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub use anonymize::{Anonymizer, HashAlgorithm};
pub use case_sheet::{CaseSheetDetector, CaseSheetWindow};
pub use config::{ConfigError, SyncConfig, DEFAULT_CONFIG_FILENAME};
pub use mapping::{AnonymizationMethod, MappingError, MappingStore, VideoRecord};
pub use remote::{ObjectStore, StoreError, UploadCapability};
pub use sync::{
    CleanupStats, DryRunReport, LookupMatch, PlannedFile, SourceProbe, SyncEngine, SyncStats,
    UploadStats,
};
pub use upload::UploadManager;
pub use video::{FfmpegTools, VideoError, VideoTools};

/// Progress sink: `(stage, current, total, message)`, `current` zero-based.
pub type ProgressCallback<'a> = dyn Fn(&str, u64, u64, &str) + Send + Sync + 'a;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Forwards at most one report per 200ms, plus the final one.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback<'a>,
    last_emit: Mutex<Option<Instant>>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback<'a>) -> Self {
        Self {
            inner,
            last_emit: Mutex::new(None),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock().unwrap_or_else(|e| e.into_inner());
            if last.is_some_and(|t| t.elapsed() < PROGRESS_INTERVAL) {
                return;
            }
            *last = Some(Instant::now());
        }
        (self.inner)(stage, current, total, message);
    }
}
