//! The sync run: enumerate sources, anonymize what is new, publish, and
//! remember what was done so nothing is processed twice.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::anonymize::Anonymizer;
use crate::case_sheet::CaseSheetDetector;
use crate::clip::clip_video;
use crate::config::SyncConfig;
use crate::mapping::{now, AnonymizationMethod, MappingStore, VideoRecord};
use crate::paths::{access_for, collect_files, is_network_path, normalize, relative_to, PathAccess};
use crate::remote::UploadCapability;
use crate::upload::UploadManager;
use crate::video::{FfmpegTools, VideoTools};
use crate::{ProgressCallback, ThrottledProgress};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub processed: u64,
    pub skipped: u64,
    pub errored: u64,
    pub uploaded: u64,
    pub upload_failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub entries_removed: u64,
    pub files_removed: u64,
    /// Orphans kept because their anonymized copy could not be deleted
    pub errors: u64,
    /// Set when the run was refused because the source root was unreachable
    pub source_unreachable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub uploaded: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedFile {
    pub source: String,
    pub anonymous_name: String,
    pub destination: PathBuf,
    /// The destination is occupied and would be adopted rather than written
    pub destination_exists: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DryRunReport {
    pub source_reachable: bool,
    pub planned: Vec<PlannedFile>,
    pub skipped: u64,
    pub pending_uploads: u64,
    pub upload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LookupMatch {
    pub source: String,
    pub record: VideoRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceProbe {
    pub path: String,
    pub network: bool,
    pub reachable: bool,
    pub matching_files: u64,
}

/// How one catch-up upload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CatchUp {
    Uploaded,
    AlreadyPresent,
    Failed,
}

pub struct SyncEngine {
    config: SyncConfig,
    source_root: PathBuf,
    destination_root: PathBuf,
    mapping: MappingStore,
    source: Box<dyn PathAccess>,
    destination: Box<dyn PathAccess>,
    video: Box<dyn VideoTools>,
    upload: UploadCapability,
    anonymizer: Anonymizer,
    detector: CaseSheetDetector,
}

/// Mapping key of a source file.
fn source_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Relative directory as stored in records: "." for the root.
fn relative_dir_string(relative_path: &Path) -> String {
    match relative_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_string_lossy().into_owned(),
        _ => ".".to_string(),
    }
}

impl SyncEngine {
    /// Production wiring: ffmpeg tools, mapping from disk, upload resolved
    /// from the settings.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let mapping = MappingStore::load(&config.mapping_file)
            .with_context(|| format!("Failed to load mapping {}", config.mapping_file.display()))?;
        let video = Box::new(FfmpegTools::new(config.video.clone()));
        let upload = UploadCapability::resolve(&config.upload);
        Ok(Self::with_parts(config, mapping, video, upload))
    }

    pub fn with_parts(
        config: SyncConfig,
        mapping: MappingStore,
        video: Box<dyn VideoTools>,
        upload: UploadCapability,
    ) -> Self {
        let source = access_for(&config.source_directory, &config.paths);
        let destination = access_for(&config.destination_directory, &config.paths);
        let anonymizer = Anonymizer::from_config(&config.salt, &config.hash_algorithm);
        let detector = CaseSheetDetector::from_settings(&config.case_sheet);
        Self {
            source_root: normalize(&config.source_directory),
            destination_root: normalize(&config.destination_directory),
            config,
            mapping,
            source,
            destination,
            video,
            upload,
            anonymizer,
            detector,
        }
    }

    pub fn mapping(&self) -> &MappingStore {
        &self.mapping
    }

    pub fn upload_capability(&self) -> &UploadCapability {
        &self.upload
    }

    fn source_files(&self) -> Vec<PathBuf> {
        collect_files(&self.source_root, |name| self.config.accepts(name))
    }

    /// Process every source file not yet in the mapping, then save it.
    pub fn run_sync(&mut self, progress: &ProgressCallback<'_>) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        if !self.source.exists(&self.source_root) {
            error!(source = %self.source_root.display(), "Source directory is not reachable");
            stats.errored = 1;
            return Ok(stats);
        }

        let files = self.source_files();
        let total = files.len() as u64;
        info!(
            source = %self.source_root.display(),
            files = total,
            known = self.mapping.len(),
            upload = %self.upload,
            "Starting sync"
        );
        let tp = ThrottledProgress::new(progress);
        for (i, path) in files.iter().enumerate() {
            tp.report("sync", i as u64, total, &file_name_of(path));
            self.process_file(path, &mut stats);
        }

        self.mapping
            .save()
            .with_context(|| format!("Failed to save mapping {}", self.mapping.path().display()))?;
        info!(
            processed = stats.processed,
            skipped = stats.skipped,
            errored = stats.errored,
            uploaded = stats.uploaded,
            upload_failed = stats.upload_failed,
            "Sync finished"
        );
        Ok(stats)
    }

    fn process_file(&mut self, path: &Path, stats: &mut SyncStats) {
        let key = source_key(path);
        if self.mapping.contains(&key) {
            debug!(source = %key, "Already processed");
            stats.skipped += 1;
            self.count_catch_up(&key, stats);
            return;
        }
        if !self.source.exists(path) {
            warn!(source = %key, "Source file is no longer reachable");
            stats.errored += 1;
            return;
        }

        let original_name = file_name_of(path);
        let relative_path = relative_to(path, &self.source_root);
        let relative_dir = relative_dir_string(&relative_path);
        let anonymous_name = self.anonymizer.anonymous_name(&original_name);
        let destination = self
            .destination_root
            .join(relative_path.parent().unwrap_or(Path::new("")))
            .join(&anonymous_name);
        let source_size = self.source.file_size(path);

        let mut record = VideoRecord {
            original_name,
            anonymous_name,
            relative_path: relative_path.to_string_lossy().into_owned(),
            relative_dir,
            processed_at: now(),
            file_size: source_size.unwrap_or(0),
            clip_start_seconds: None,
            anonymization_method: AnonymizationMethod::Copied,
            uploaded: false,
            uploaded_at: None,
            extra: Default::default(),
        };

        if self.destination.exists(&destination) {
            let dest_size = self.destination.file_size(&destination);
            if source_size.is_none() || source_size != dest_size {
                record.anonymization_method = AnonymizationMethod::Clipped;
            }
            record.file_size = source_size.or(dest_size).unwrap_or(0);
            info!(
                source = %key,
                destination = %destination.display(),
                method = ?record.anonymization_method,
                "Destination already exists, adopting it"
            );
            self.mapping.insert(key.clone(), record);
            stats.processed += 1;
            self.count_catch_up(&key, stats);
            return;
        }

        let clip_start = self.detect_case_sheet(path);
        let clipped = clip_start
            .is_some_and(|start| clip_video(self.video.as_ref(), path, &destination, start));
        if clipped {
            record.anonymization_method = AnonymizationMethod::Clipped;
            record.clip_start_seconds = clip_start;
        } else {
            if clip_start.is_some() {
                info!(source = %key, "Clipping failed, copying in full");
            }
            if !self.destination.copy_file(path, &destination) {
                error!(source = %key, destination = %destination.display(), "Copy failed");
                stats.errored += 1;
                return;
            }
        }
        info!(
            source = %key,
            anonymous_name = %record.anonymous_name,
            method = ?record.anonymization_method,
            "Anonymized"
        );

        if let Some(manager) = self.upload.manager() {
            let remote = manager.remote_key(&record.relative_dir, &record.anonymous_name);
            if manager.upload(&destination, &remote) {
                record.mark_uploaded(now());
                stats.uploaded += 1;
            } else {
                stats.upload_failed += 1;
            }
        }
        self.mapping.insert(key, record);
        stats.processed += 1;
    }

    /// Clip start in seconds, or `None` when there is no case sheet or the
    /// detection could not run.
    fn detect_case_sheet(&self, path: &Path) -> Option<f64> {
        if !self.config.case_sheet.enabled {
            return None;
        }
        let variances = match self
            .video
            .sample_sharpness(path, self.config.case_sheet.max_samples)
        {
            Ok(v) => v,
            Err(e) => {
                warn!(source = %path.display(), error = %e, "Case sheet detection failed");
                return None;
            }
        };
        let window = self.detector.detect(&variances)?;
        info!(
            source = %path.display(),
            start = window.start,
            end = window.end,
            "Case sheet detected"
        );
        Some(window.clip_start_seconds())
    }

    fn count_catch_up(&mut self, key: &str, stats: &mut SyncStats) {
        match self.catch_up_upload(key) {
            Some(CatchUp::Uploaded | CatchUp::AlreadyPresent) => stats.uploaded += 1,
            Some(CatchUp::Failed) => stats.upload_failed += 1,
            None => {}
        }
    }

    /// Publish a known record that has not reached the store yet. `None`
    /// when upload is off or the record is already uploaded.
    fn catch_up_upload(&mut self, key: &str) -> Option<CatchUp> {
        let manager: &UploadManager = self.upload.manager()?;
        let record = self.mapping.get(key).filter(|r| !r.uploaded)?;
        let local = record.destination_in(&self.destination_root);
        let remote = manager.remote_key(&record.relative_dir, &record.anonymous_name);

        let outcome = if manager.is_uploaded(&remote) {
            info!(key = %remote, "Already in the store, marking uploaded");
            CatchUp::AlreadyPresent
        } else if !self.destination.exists(&local) {
            warn!(source = %key, artifact = %local.display(), "Anonymized copy is missing, cannot upload");
            CatchUp::Failed
        } else if manager.upload(&local, &remote) {
            CatchUp::Uploaded
        } else {
            CatchUp::Failed
        };

        if outcome != CatchUp::Failed {
            if let Some(record) = self.mapping.get_mut(key) {
                record.mark_uploaded(now());
            }
        }
        Some(outcome)
    }

    /// Drop records whose source is gone, along with their anonymized copy.
    pub fn cleanup_orphans(&mut self) -> Result<CleanupStats> {
        let mut stats = CleanupStats::default();
        if !self.source.exists(&self.source_root) {
            error!(
                source = %self.source_root.display(),
                "Source directory is not reachable, refusing orphan cleanup"
            );
            stats.source_unreachable = true;
            return Ok(stats);
        }

        for key in self.mapping.sources() {
            if self.source.exists(Path::new(&key)) {
                continue;
            }
            let Some(artifact) = self
                .mapping
                .get(&key)
                .map(|record| record.destination_in(&self.destination_root))
            else {
                continue;
            };
            match self.destination.remove_file(&artifact) {
                Ok(removed) => {
                    if removed {
                        stats.files_removed += 1;
                    }
                    self.mapping.remove(&key);
                    stats.entries_removed += 1;
                    info!(source = %key, artifact = %artifact.display(), "Removed orphan");
                }
                Err(e) => {
                    // Record kept while its copy is still on disk
                    warn!(
                        source = %key,
                        artifact = %artifact.display(),
                        error = %e,
                        "Cannot delete anonymized copy, keeping its record"
                    );
                    stats.errors += 1;
                }
            }
        }

        if stats.entries_removed > 0 {
            self.mapping
                .save()
                .with_context(|| format!("Failed to save mapping {}", self.mapping.path().display()))?;
        }
        info!(
            entries = stats.entries_removed,
            files = stats.files_removed,
            errors = stats.errors,
            "Orphan cleanup finished"
        );
        Ok(stats)
    }

    /// What `run_sync` would do, without touching anything.
    pub fn dry_run(&self) -> DryRunReport {
        let mut report = DryRunReport {
            upload: self.upload.to_string(),
            pending_uploads: self.mapping.pending_uploads().len() as u64,
            ..DryRunReport::default()
        };
        if !self.source.exists(&self.source_root) {
            return report;
        }
        report.source_reachable = true;

        for path in self.source_files() {
            let key = source_key(&path);
            if self.mapping.contains(&key) {
                report.skipped += 1;
                continue;
            }
            let relative_path = relative_to(&path, &self.source_root);
            let anonymous_name = self.anonymizer.anonymous_name(&file_name_of(&path));
            let destination = self
                .destination_root
                .join(relative_path.parent().unwrap_or(Path::new("")))
                .join(&anonymous_name);
            report.planned.push(PlannedFile {
                source: key,
                anonymous_name,
                destination_exists: self.destination.exists(&destination),
                destination,
            });
        }
        report
    }

    /// Upload every record that has not reached the store, then save.
    pub fn upload_only(&mut self, progress: &ProgressCallback<'_>) -> Result<UploadStats> {
        if !self.upload.is_ready() {
            bail!("Upload is {}", self.upload);
        }
        let mut stats = UploadStats {
            skipped: (self.mapping.len() - self.mapping.pending_uploads().len()) as u64,
            ..UploadStats::default()
        };
        let pending = self.mapping.pending_uploads();
        let total = pending.len() as u64;
        let tp = ThrottledProgress::new(progress);
        for (i, key) in pending.iter().enumerate() {
            tp.report("upload", i as u64, total, key);
            match self.catch_up_upload(key) {
                Some(CatchUp::Uploaded) => stats.uploaded += 1,
                Some(CatchUp::AlreadyPresent) | None => stats.skipped += 1,
                Some(CatchUp::Failed) => stats.failed += 1,
            }
        }

        self.mapping
            .save()
            .with_context(|| format!("Failed to save mapping {}", self.mapping.path().display()))?;
        info!(
            uploaded = stats.uploaded,
            failed = stats.failed,
            skipped = stats.skipped,
            "Upload-only run finished"
        );
        Ok(stats)
    }

    pub fn list_remote(&self) -> Result<Vec<String>> {
        let Some(manager) = self.upload.manager() else {
            bail!("Upload is {}", self.upload);
        };
        manager
            .list_remote()
            .with_context(|| format!("Failed to list {}", manager.describe()))
    }

    /// Records whose anonymized name is `anonymous_name`.
    pub fn lookup(&self, anonymous_name: &str) -> Vec<LookupMatch> {
        self.mapping
            .find_by_anonymous_name(anonymous_name)
            .map(|(source, record)| LookupMatch {
                source: source.clone(),
                record: record.clone(),
            })
            .collect()
    }

    pub fn probe_source(&self) -> SourceProbe {
        let reachable = self.source.exists(&self.source_root);
        let matching_files = if reachable {
            self.source_files().len() as u64
        } else {
            0
        };
        SourceProbe {
            path: self.source_root.display().to_string(),
            network: self.source.is_network() || is_network_path(&self.config.source_directory),
            reachable,
            matching_files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{UploadBackend, UploadSettings};
    use crate::remote::{DirectoryStore, ObjectStore, StoreError};
    use crate::video::VideoError;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::fs;
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};

    /// Sharpness per file name; files without an entry fail detection.
    #[derive(Default)]
    struct FakeVideo {
        sharpness: HashMap<String, Vec<f64>>,
        duration: f64,
    }

    impl VideoTools for FakeVideo {
        fn sample_sharpness(&self, path: &Path, _: usize) -> Result<Vec<f64>, VideoError> {
            self.sharpness
                .get(&file_name_of(path))
                .cloned()
                .ok_or_else(|| VideoError::NoVideoStream(path.to_path_buf()))
        }

        fn duration(&self, _: &Path) -> Result<f64, VideoError> {
            Ok(self.duration)
        }

        fn transcode_segment(&self, _: &Path, dst: &Path, start: f64, _: f64) -> Result<(), VideoError> {
            fs::write(dst, format!("clipped@{}", start))?;
            Ok(())
        }
    }

    struct RejectingStore;

    impl ObjectStore for RejectingStore {
        fn describe(&self) -> String {
            "rejecting".into()
        }

        fn put_file(&self, _: &Path, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Status {
                status: 503,
                what: "put".into(),
            })
        }

        fn object_size(&self, _: &str) -> Result<Option<u64>, StoreError> {
            Ok(None)
        }

        fn list(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Ok(vec![])
        }
    }

    /// Accepts every put but always reports a one-byte object.
    struct TruncatingStore {
        puts: Rc<Cell<u32>>,
    }

    impl ObjectStore for TruncatingStore {
        fn describe(&self) -> String {
            "truncating".into()
        }

        fn put_file(&self, _: &Path, _: &str) -> Result<(), StoreError> {
            self.puts.set(self.puts.get() + 1);
            Ok(())
        }

        fn object_size(&self, _: &str) -> Result<Option<u64>, StoreError> {
            Ok(Some(1))
        }

        fn list(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Ok(vec![])
        }
    }

    struct Fixture {
        dir: TempDir,
        config: SyncConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            fs::create_dir_all(dir.path().join("src")).unwrap();
            let config = SyncConfig {
                source_directory: dir.path().join("src").to_string_lossy().into_owned(),
                destination_directory: dir.path().join("out").to_string_lossy().into_owned(),
                mapping_file: dir.path().join("hash_mappings.json"),
                salt: "test-salt".into(),
                ..SyncConfig::default()
            };
            Self { dir, config }
        }

        fn src(&self) -> PathBuf {
            self.dir.path().join("src")
        }

        fn bucket(&self) -> PathBuf {
            self.dir.path().join("bucket")
        }

        fn add_source(&self, relative: &str, content: &[u8]) -> PathBuf {
            let path = self.src().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            path
        }

        fn upload_settings(&self) -> UploadSettings {
            UploadSettings {
                enabled: true,
                backend: UploadBackend::Directory,
                directory: self.bucket().to_string_lossy().into_owned(),
                max_retries: 2,
                retry_delay_secs: 0,
                ..UploadSettings::default()
            }
        }

        fn engine(&self, video: FakeVideo, upload: UploadCapability) -> SyncEngine {
            let mapping = MappingStore::load(&self.config.mapping_file).unwrap();
            SyncEngine::with_parts(self.config.clone(), mapping, Box::new(video), upload)
        }

        fn directory_upload(&self) -> UploadCapability {
            let settings = self.upload_settings();
            UploadCapability::Ready(UploadManager::new(
                Box::new(DirectoryStore::new(self.bucket())),
                &settings,
            ))
        }

        fn rejecting_upload(&self) -> UploadCapability {
            UploadCapability::Ready(UploadManager::new(Box::new(RejectingStore), &self.upload_settings()))
        }

        fn truncating_upload(&self, puts: Rc<Cell<u32>>) -> UploadCapability {
            UploadCapability::Ready(UploadManager::new(
                Box::new(TruncatingStore { puts }),
                &self.upload_settings(),
            ))
        }
    }

    fn quiet(_: &str, _: u64, _: u64, _: &str) {}

    fn anon(fx: &Fixture, name: &str) -> String {
        Anonymizer::from_config(&fx.config.salt, &fx.config.hash_algorithm).anonymous_name(name)
    }

    fn slate_then_footage() -> Vec<f64> {
        let mut v = vec![5.0; 15];
        v.extend(std::iter::repeat(100.0).take(15));
        v
    }

    #[test]
    fn test_copy_then_idempotent_rerun() {
        let fx = Fixture::new();
        let src = fx.add_source("or1/123456_chole.mp4", b"raw footage");
        fx.add_source("notes.txt", b"ignored");

        let mut engine = fx.engine(FakeVideo::default(), UploadCapability::Disabled);
        let stats = engine.run_sync(&quiet).unwrap();
        assert_eq!(
            stats,
            SyncStats {
                processed: 1,
                ..SyncStats::default()
            }
        );

        let name = anon(&fx, "123456_chole.mp4");
        let dest = fx.dir.path().join("out/or1").join(&name);
        assert_eq!(fs::read(&dest).unwrap(), b"raw footage");

        let record = engine.mapping().get(&source_key(&src)).unwrap().clone();
        assert_eq!(record.original_name, "123456_chole.mp4");
        assert_eq!(record.relative_dir, "or1");
        assert_eq!(record.anonymization_method, AnonymizationMethod::Copied);
        assert_eq!(record.clip_start_seconds, None);
        assert_eq!(record.file_size, 11);
        assert!(!record.uploaded);

        // A fresh engine reads the saved mapping and leaves everything alone
        fs::write(&dest, b"tampered").unwrap();
        let mut engine = fx.engine(FakeVideo::default(), UploadCapability::Disabled);
        let stats = engine.run_sync(&quiet).unwrap();
        assert_eq!(
            stats,
            SyncStats {
                skipped: 1,
                ..SyncStats::default()
            }
        );
        assert_eq!(fs::read(&dest).unwrap(), b"tampered");
        assert_eq!(engine.mapping().get(&source_key(&src)), Some(&record));
    }

    #[test]
    fn test_case_sheet_is_clipped() {
        let fx = Fixture::new();
        let src = fx.add_source("case_654321.mp4", b"slate+footage");
        let video = FakeVideo {
            sharpness: HashMap::from([("case_654321.mp4".to_string(), slate_then_footage())]),
            duration: 30.0,
        };
        let mut engine = fx.engine(video, UploadCapability::Disabled);
        assert_eq!(engine.run_sync(&quiet).unwrap().processed, 1);

        let record = engine.mapping().get(&source_key(&src)).unwrap();
        assert_eq!(record.anonymization_method, AnonymizationMethod::Clipped);
        assert_eq!(record.clip_start_seconds, Some(15.0));
        assert_eq!(record.relative_dir, ".");
        let dest = fx.dir.path().join("out").join(&record.anonymous_name);
        assert_eq!(fs::read_to_string(dest).unwrap(), "clipped@15");
    }

    #[test]
    fn test_clip_failure_falls_back_to_copy() {
        let fx = Fixture::new();
        let src = fx.add_source("case_654321.mp4", b"short");
        // Case sheet found but the video is shorter than the clip start
        let video = FakeVideo {
            sharpness: HashMap::from([("case_654321.mp4".to_string(), slate_then_footage())]),
            duration: 10.0,
        };
        let mut engine = fx.engine(video, UploadCapability::Disabled);
        engine.run_sync(&quiet).unwrap();

        let record = engine.mapping().get(&source_key(&src)).unwrap();
        assert_eq!(record.anonymization_method, AnonymizationMethod::Copied);
        assert_eq!(record.clip_start_seconds, None);
        let dest = fx.dir.path().join("out").join(&record.anonymous_name);
        assert_eq!(fs::read(dest).unwrap(), b"short");
    }

    #[test]
    fn test_detection_disabled_copies() {
        let mut fx = Fixture::new();
        fx.config.case_sheet.enabled = false;
        let src = fx.add_source("case_654321.mp4", b"as is");
        let video = FakeVideo {
            sharpness: HashMap::from([("case_654321.mp4".to_string(), slate_then_footage())]),
            duration: 30.0,
        };
        let mut engine = fx.engine(video, UploadCapability::Disabled);
        engine.run_sync(&quiet).unwrap();
        let record = engine.mapping().get(&source_key(&src)).unwrap();
        assert_eq!(record.anonymization_method, AnonymizationMethod::Copied);
    }

    #[test]
    fn test_upload_on_first_sight() {
        let fx = Fixture::new();
        let src = fx.add_source("or2/111111.mp4", b"payload");
        let mut engine = fx.engine(FakeVideo::default(), fx.directory_upload());
        let stats = engine.run_sync(&quiet).unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.uploaded, 1);

        let record = engine.mapping().get(&source_key(&src)).unwrap();
        assert!(record.uploaded);
        assert!(record.uploaded_at.is_some());
        let object = fx.bucket().join("videos/or2").join(&record.anonymous_name);
        assert_eq!(fs::read(object).unwrap(), b"payload");
        assert_eq!(
            engine.list_remote().unwrap(),
            vec![format!("videos/or2/{}", record.anonymous_name)]
        );
    }

    #[test]
    fn test_failed_upload_is_caught_up_later() {
        let fx = Fixture::new();
        let src = fx.add_source("or2/222222.mp4", b"payload");

        let mut engine = fx.engine(FakeVideo::default(), fx.rejecting_upload());
        let stats = engine.run_sync(&quiet).unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.upload_failed, 1);
        assert!(!engine.mapping().get(&source_key(&src)).unwrap().uploaded);

        let mut engine = fx.engine(FakeVideo::default(), fx.directory_upload());
        let stats = engine.run_sync(&quiet).unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.uploaded, 1);
        let record = engine.mapping().get(&source_key(&src)).unwrap().clone();
        assert!(record.uploaded);
        assert!(fx.bucket().join("videos/or2").join(&record.anonymous_name).exists());

        // Once uploaded nothing further happens
        let mut engine = fx.engine(FakeVideo::default(), fx.directory_upload());
        let stats = engine.run_sync(&quiet).unwrap();
        assert_eq!(stats.uploaded, 0);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_size_mismatch_leaves_record_not_uploaded() {
        let fx = Fixture::new();
        let src = fx.add_source("or3/777777.mp4", b"full payload");
        let puts = Rc::new(Cell::new(0));

        let mut engine = fx.engine(FakeVideo::default(), fx.truncating_upload(puts.clone()));
        let stats = engine.run_sync(&quiet).unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.uploaded, 0);
        assert_eq!(stats.upload_failed, 1);
        assert_eq!(puts.get(), fx.upload_settings().max_retries);

        let record = engine.mapping().get(&source_key(&src)).unwrap();
        assert!(!record.uploaded);
        assert_eq!(record.uploaded_at, None);

        // Persisted as pending
        let engine = fx.engine(FakeVideo::default(), UploadCapability::Disabled);
        assert_eq!(engine.mapping().pending_uploads().len(), 1);
    }

    #[test]
    fn test_catch_up_marks_objects_already_present() {
        let fx = Fixture::new();
        let src = fx.add_source("333333.mp4", b"payload");
        let mut engine = fx.engine(FakeVideo::default(), UploadCapability::Disabled);
        engine.run_sync(&quiet).unwrap();
        let name = engine.mapping().get(&source_key(&src)).unwrap().anonymous_name.clone();

        // The object reached the store by other means; local copy is gone
        fs::create_dir_all(fx.bucket().join("videos")).unwrap();
        fs::write(fx.bucket().join("videos").join(&name), b"payload").unwrap();
        fs::remove_file(fx.dir.path().join("out").join(&name)).unwrap();

        let mut engine = fx.engine(FakeVideo::default(), fx.directory_upload());
        let stats = engine.run_sync(&quiet).unwrap();
        assert_eq!(stats.uploaded, 1);
        assert!(engine.mapping().get(&source_key(&src)).unwrap().uploaded);
    }

    #[test]
    fn test_existing_destination_is_adopted() {
        let fx = Fixture::new();
        let src = fx.add_source("or1/444444.mp4", b"0123456789");
        let dest = fx.dir.path().join("out/or1").join(anon(&fx, "444444.mp4"));
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, b"01234").unwrap();

        let mut engine = fx.engine(FakeVideo::default(), fx.directory_upload());
        let stats = engine.run_sync(&quiet).unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.uploaded, 1);
        assert_eq!(fs::read(&dest).unwrap(), b"01234");

        let record = engine.mapping().get(&source_key(&src)).unwrap();
        assert_eq!(record.anonymization_method, AnonymizationMethod::Clipped);
        assert_eq!(record.clip_start_seconds, None);
        assert_eq!(record.file_size, 10);
        assert!(record.uploaded);
    }

    #[test]
    fn test_orphan_cleanup() {
        let fx = Fixture::new();
        let keep = fx.add_source("555555.mp4", b"keep");
        let gone = fx.add_source("666666.mp4", b"gone");
        let mut engine = fx.engine(FakeVideo::default(), UploadCapability::Disabled);
        engine.run_sync(&quiet).unwrap();
        let gone_artifact = engine
            .mapping()
            .get(&source_key(&gone))
            .unwrap()
            .destination_in(&fx.dir.path().join("out"));
        assert!(gone_artifact.exists());

        fs::remove_file(&gone).unwrap();
        let stats = engine.cleanup_orphans().unwrap();
        assert_eq!(stats.entries_removed, 1);
        assert_eq!(stats.files_removed, 1);
        assert!(!gone_artifact.exists());
        assert!(engine.mapping().contains(&source_key(&keep)));
        assert!(!engine.mapping().contains(&source_key(&gone)));

        // The removal was persisted and a sync afterwards has nothing to do
        let mut engine = fx.engine(FakeVideo::default(), UploadCapability::Disabled);
        assert_eq!(engine.mapping().len(), 1);
        let stats = engine.run_sync(&quiet).unwrap();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.skipped, 1);
        assert_eq!(engine.cleanup_orphans().unwrap(), CleanupStats::default());
    }

    #[test]
    fn test_undeletable_artifact_keeps_its_record() {
        let fx = Fixture::new();
        let gone = fx.add_source("888888.mp4", b"gone");
        let mut engine = fx.engine(FakeVideo::default(), UploadCapability::Disabled);
        engine.run_sync(&quiet).unwrap();
        let artifact = engine
            .mapping()
            .get(&source_key(&gone))
            .unwrap()
            .destination_in(&fx.dir.path().join("out"));

        // A non-empty directory where the copy was cannot be removed as a file
        fs::remove_file(&artifact).unwrap();
        fs::create_dir_all(artifact.join("locked")).unwrap();
        fs::remove_file(&gone).unwrap();

        let stats = engine.cleanup_orphans().unwrap();
        assert_eq!(stats.entries_removed, 0);
        assert_eq!(stats.files_removed, 0);
        assert_eq!(stats.errors, 1);
        assert!(artifact.exists());
        assert!(engine.mapping().contains(&source_key(&gone)));

        // Once the obstruction is gone the retry succeeds
        fs::remove_dir_all(&artifact).unwrap();
        let stats = engine.cleanup_orphans().unwrap();
        assert_eq!(stats.entries_removed, 1);
        assert_eq!(stats.files_removed, 0);
        assert_eq!(stats.errors, 0);
        assert!(!engine.mapping().contains(&source_key(&gone)));
    }

    #[test]
    fn test_unreachable_source_root() {
        let mut fx = Fixture::new();
        fx.config.source_directory = fx.dir.path().join("missing").to_string_lossy().into_owned();
        fs::write(&fx.config.mapping_file, r#"{"/elsewhere/a.mp4": {
            "original_name": "a.mp4", "anonymous_name": "video_0000000000000000.mp4",
            "processed_at": "2025-01-01T00:00:00"}}"#)
        .unwrap();

        let mut engine = fx.engine(FakeVideo::default(), UploadCapability::Disabled);
        let stats = engine.run_sync(&quiet).unwrap();
        assert_eq!(stats.errored, 1);
        assert_eq!(stats.processed, 0);

        let cleanup = engine.cleanup_orphans().unwrap();
        assert!(cleanup.source_unreachable);
        assert_eq!(engine.mapping().len(), 1);

        let probe = engine.probe_source();
        assert!(!probe.reachable);
        assert_eq!(probe.matching_files, 0);
        assert!(!engine.dry_run().source_reachable);
    }

    #[test]
    fn test_shared_identifier_collides_on_one_artifact() {
        let fx = Fixture::new();
        let first = fx.add_source("a_777777.mp4", b"first capture");
        let second = fx.add_source("b_777777.mp4", b"second capture, longer");

        let mut engine = fx.engine(FakeVideo::default(), UploadCapability::Disabled);
        let stats = engine.run_sync(&quiet).unwrap();
        assert_eq!(stats.processed, 2);

        let a = engine.mapping().get(&source_key(&first)).unwrap().clone();
        let b = engine.mapping().get(&source_key(&second)).unwrap().clone();
        assert_eq!(a.anonymous_name, b.anonymous_name);
        assert_eq!(a.anonymization_method, AnonymizationMethod::Copied);
        // The second source adopted the first one's artifact
        assert_eq!(b.anonymization_method, AnonymizationMethod::Clipped);
        let shared = a.destination_in(&fx.dir.path().join("out"));
        assert_eq!(fs::read(&shared).unwrap(), b"first capture");

        // Removing either source takes the shared artifact with it
        fs::remove_file(&first).unwrap();
        let stats = engine.cleanup_orphans().unwrap();
        assert_eq!(stats.entries_removed, 1);
        assert!(!shared.exists());
        assert!(engine.mapping().contains(&source_key(&second)));
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let fx = Fixture::new();
        fx.add_source("888888.mp4", b"x");
        let engine = fx.engine(FakeVideo::default(), UploadCapability::Disabled);
        let report = engine.dry_run();
        assert!(report.source_reachable);
        assert_eq!(report.planned.len(), 1);
        assert_eq!(report.planned[0].anonymous_name, anon(&fx, "888888.mp4"));
        assert!(!report.planned[0].destination_exists);
        assert_eq!(report.upload, "disabled");
        assert!(!report.planned[0].destination.exists());
        assert!(!fx.config.mapping_file.exists());
    }

    #[test]
    fn test_upload_only() {
        let fx = Fixture::new();
        let present = fx.add_source("or1/121212.mp4", b"present");
        let lost = fx.add_source("or1/343434.mp4", b"lost");
        let mut engine = fx.engine(FakeVideo::default(), UploadCapability::Disabled);
        engine.run_sync(&quiet).unwrap();
        assert!(engine.upload_only(&quiet).is_err());
        assert!(engine.list_remote().is_err());

        let lost_artifact = engine
            .mapping()
            .get(&source_key(&lost))
            .unwrap()
            .destination_in(&fx.dir.path().join("out"));
        fs::remove_file(lost_artifact).unwrap();

        let mut engine = fx.engine(FakeVideo::default(), fx.directory_upload());
        let stats = engine.upload_only(&quiet).unwrap();
        assert_eq!(
            stats,
            UploadStats {
                uploaded: 1,
                failed: 1,
                skipped: 0
            }
        );
        assert!(engine.mapping().get(&source_key(&present)).unwrap().uploaded);
        assert!(!engine.mapping().get(&source_key(&lost)).unwrap().uploaded);

        let mut engine = fx.engine(FakeVideo::default(), fx.directory_upload());
        let stats = engine.upload_only(&quiet).unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_lookup_and_probe() {
        let fx = Fixture::new();
        let src = fx.add_source("or3/909090_lap.mp4", b"x");
        fx.add_source("or3/readme.txt", b"x");
        let mut engine = fx.engine(FakeVideo::default(), UploadCapability::Disabled);
        engine.run_sync(&quiet).unwrap();

        let name = anon(&fx, "909090_lap.mp4");
        let hits = engine.lookup(&name);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, source_key(&src));
        assert_eq!(hits[0].record.original_name, "909090_lap.mp4");
        assert!(engine.lookup("video_ffffffffffffffff.mp4").is_empty());

        let probe = engine.probe_source();
        assert!(probe.reachable);
        assert!(!probe.network);
        assert_eq!(probe.matching_files, 1);
    }
}
