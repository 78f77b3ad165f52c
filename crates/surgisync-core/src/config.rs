use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default configuration filename, looked up in the working directory
pub const DEFAULT_CONFIG_FILENAME: &str = "video_sync_config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_source_directory() -> String {
    "./source_videos".to_string()
}

fn default_destination_directory() -> String {
    "./anonymized_videos".to_string()
}

fn default_mapping_file() -> PathBuf {
    PathBuf::from("hash_mappings.json")
}

fn default_supported_formats() -> Vec<String> {
    [".mp4", ".avi", ".mov", ".mkv"].iter().map(|s| s.to_string()).collect()
}

fn default_hash_algorithm() -> String {
    "sha256".to_string()
}

fn default_salt() -> String {
    "surgical_video_salt_2025".to_string()
}

/// Whole-run configuration. Built once, passed by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_source_directory")]
    pub source_directory: String,
    #[serde(default = "default_destination_directory")]
    pub destination_directory: String,
    #[serde(default = "default_mapping_file", alias = "hash_mapping_file")]
    pub mapping_file: PathBuf,
    #[serde(default = "default_supported_formats")]
    pub supported_formats: Vec<String>,
    /// One of `md5`, `sha1`, `sha256`. Anything else falls back to sha256.
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,
    #[serde(default = "default_salt")]
    pub salt: String,
    #[serde(default)]
    pub case_sheet: CaseSheetSettings,
    #[serde(default, alias = "azure_blob_settings", alias = "upload_settings")]
    pub upload: UploadSettings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub video: VideoSettings,
    #[serde(default)]
    pub logging: LogSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_directory: default_source_directory(),
            destination_directory: default_destination_directory(),
            mapping_file: default_mapping_file(),
            supported_formats: default_supported_formats(),
            hash_algorithm: default_hash_algorithm(),
            salt: default_salt(),
            case_sheet: CaseSheetSettings::default(),
            upload: UploadSettings::default(),
            paths: PathSettings::default(),
            video: VideoSettings::default(),
            logging: LogSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseSheetSettings {
    pub enabled: bool,
    /// Mean smoothed Laplacian variance below which a window counts as a slate
    pub variance_threshold: f64,
    /// Window length in samples (one sample per second)
    pub window_size: usize,
    /// Upper bound on sampled frames per video
    pub max_samples: usize,
    pub smoothing_sigma: f64,
}

impl Default for CaseSheetSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            variance_threshold: 12.0,
            window_size: 15,
            max_samples: 1000,
            smoothing_sigma: 2.0,
        }
    }
}

/// Which object store the upload manager talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadBackend {
    Azure,
    /// A mounted directory tree used as the bucket
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub enabled: bool,
    pub backend: UploadBackend,
    /// Azure connection string carrying `BlobEndpoint` and `SharedAccessSignature`
    pub connection_string: String,
    /// Container URL with a SAS query string; takes precedence over `connection_string`
    pub container_url: String,
    pub container_name: String,
    /// Root of the `directory` backend
    pub directory: String,
    #[serde(alias = "blob_prefix")]
    pub prefix: String,
    pub verify_upload: bool,
    pub max_retries: u32,
    #[serde(alias = "retry_delay")]
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: UploadBackend::Azure,
            connection_string: String::new(),
            container_url: String::new(),
            container_name: "surgical-videos-anonymized".to_string(),
            directory: String::new(),
            prefix: "videos/".to_string(),
            verify_upload: true,
            max_retries: 3,
            retry_delay_secs: 30,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// How many times a network probe is retried on a transient error
    pub network_probe_attempts: u32,
    pub network_probe_delay_ms: u64,
    /// Treat the source as a network share even if the path looks local (mounted shares)
    pub force_network: bool,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            network_probe_attempts: 3,
            network_probe_delay_ms: 500,
            force_network: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub video_codec: String,
    pub audio_codec: String,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    /// Log file path; empty disables file output
    pub file: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: "video_sync.log".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load and validate a config document. Any failure is fatal for the run.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SyncConfig =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_directory.trim().is_empty() {
            return Err(ConfigError::Invalid("source_directory is empty".into()));
        }
        if self.destination_directory.trim().is_empty() {
            return Err(ConfigError::Invalid("destination_directory is empty".into()));
        }
        if self.mapping_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("mapping_file is empty".into()));
        }
        if self.supported_formats.is_empty() {
            return Err(ConfigError::Invalid("supported_formats is empty".into()));
        }
        if self.case_sheet.window_size == 0 {
            return Err(ConfigError::Invalid("case_sheet.window_size must be > 0".into()));
        }
        let sigma = self.case_sheet.smoothing_sigma;
        if sigma.is_nan() || sigma <= 0.0 {
            return Err(ConfigError::Invalid("case_sheet.smoothing_sigma must be > 0".into()));
        }
        if self.upload.max_retries == 0 {
            return Err(ConfigError::Invalid("upload.max_retries must be >= 1".into()));
        }
        Ok(())
    }

    /// Lowercased extensions with a leading dot.
    pub fn extensions(&self) -> Vec<String> {
        self.supported_formats
            .iter()
            .map(|e| {
                let e = e.trim().to_lowercase();
                if e.starts_with('.') {
                    e
                } else {
                    format!(".{}", e)
                }
            })
            .collect()
    }

    /// Whether a file name carries one of the accepted extensions.
    pub fn accepts(&self, file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        self.extensions().iter().any(|ext| lower.ends_with(ext.as_str()))
    }
}
