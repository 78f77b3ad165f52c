use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("cannot read mapping file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mapping file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot write mapping file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How the anonymized copy was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymizationMethod {
    #[default]
    Copied,
    Clipped,
}

/// One processed source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub original_name: String,
    pub anonymous_name: String,
    /// Source-root-relative path of the capture
    #[serde(default)]
    pub relative_path: String,
    /// Source-root-relative directory, mirrored under the destination root
    #[serde(default)]
    pub relative_dir: String,
    #[serde(alias = "processed_date")]
    pub processed_at: NaiveDateTime,
    #[serde(default)]
    pub file_size: u64,
    /// `None` when nothing was trimmed
    #[serde(default)]
    pub clip_start_seconds: Option<f64>,
    #[serde(default)]
    pub anonymization_method: AnonymizationMethod,
    #[serde(default, alias = "azure_uploaded")]
    pub uploaded: bool,
    #[serde(default, alias = "azure_upload_date", alias = "upload_date")]
    pub uploaded_at: Option<NaiveDateTime>,
    /// Keys this version does not know about, written back untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl VideoRecord {
    /// Relative directory as a path; "" and "." both mean the root.
    pub fn relative_dir_path(&self) -> PathBuf {
        match self.relative_dir.as_str() {
            "" | "." => PathBuf::new(),
            dir => PathBuf::from(dir),
        }
    }

    /// Where the anonymized artifact lives under `destination_root`.
    pub fn destination_in(&self, destination_root: &Path) -> PathBuf {
        destination_root
            .join(self.relative_dir_path())
            .join(&self.anonymous_name)
    }

    pub fn mark_uploaded(&mut self, at: NaiveDateTime) {
        self.uploaded = true;
        self.uploaded_at = Some(at);
    }
}

/// Local wall-clock time, the timestamp format of the mapping file.
pub fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Persisted source path -> [`VideoRecord`] ledger. A key present here is
/// never processed again; only orphan cleanup removes keys.
#[derive(Debug, Clone)]
pub struct MappingStore {
    path: PathBuf,
    records: BTreeMap<String, VideoRecord>,
}

impl MappingStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            records: BTreeMap::new(),
        }
    }

    /// Load the ledger. A missing file is an empty ledger; an unreadable or
    /// corrupt one is an error, never silently replaced.
    pub fn load(path: &Path) -> Result<Self, MappingError> {
        if !path.exists() {
            return Ok(Self::new(path.to_path_buf()));
        }
        let file = File::open(path).map_err(|source| MappingError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let records = serde_json::from_reader(BufReader::new(file)).map_err(|source| {
            MappingError::Corrupt {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    /// Write to a temp file first, then rename over the ledger.
    pub fn save(&self) -> Result<(), MappingError> {
        let write_err = |source| MappingError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let temp = self.path.with_extension("json.tmp");
        let file = File::create(&temp).map_err(write_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.records)
            .map_err(|e| write_err(e.into()))?;
        writer.flush().map_err(write_err)?;
        drop(writer);
        fs::rename(&temp, &self.path).map_err(write_err)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, source: &str) -> bool {
        self.records.contains_key(source)
    }

    pub fn get(&self, source: &str) -> Option<&VideoRecord> {
        self.records.get(source)
    }

    pub fn get_mut(&mut self, source: &str) -> Option<&mut VideoRecord> {
        self.records.get_mut(source)
    }

    pub fn insert(&mut self, source: String, record: VideoRecord) -> Option<VideoRecord> {
        self.records.insert(source, record)
    }

    pub fn remove(&mut self, source: &str) -> Option<VideoRecord> {
        self.records.remove(source)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VideoRecord)> {
        self.records.iter()
    }

    /// Source keys, cloned so callers may mutate the store while walking them.
    pub fn sources(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    /// Sources whose anonymized copy has not reached the object store.
    pub fn pending_uploads(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, r)| !r.uploaded)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Reverse lookup from an anonymous name to the records behind it.
    pub fn find_by_anonymous_name<'a>(
        &'a self,
        anonymous_name: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a VideoRecord)> + 'a {
        self.records
            .iter()
            .filter(move |(_, r)| r.anonymous_name == anonymous_name)
    }
}
