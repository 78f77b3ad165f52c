use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use md5::Md5;
use regex::Regex;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

/// A run of exactly six digits: the medical record number in a capture name.
static MRN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^0-9])([0-9]{6})(?:[^0-9]|$)").unwrap());

/// Hex characters of the digest kept in the anonymous name
const NAME_HASH_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Parse a configured name. `None` for anything outside md5/sha1/sha256.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "md5" => Some(Self::Md5),
            "sha1" | "sha-1" => Some(Self::Sha1),
            "sha256" | "sha-256" => Some(Self::Sha256),
            _ => None,
        }
    }

    pub fn hex_digest(&self, input: &[u8]) -> String {
        match self {
            Self::Md5 => hex::encode(Md5::digest(input)),
            Self::Sha1 => hex::encode(Sha1::digest(input)),
            Self::Sha256 => hex::encode(Sha256::digest(input)),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        })
    }
}

/// Extract the six-digit record identifier from a filename, if any.
pub fn extract_identifier(filename: &str) -> Option<&str> {
    MRN_RE
        .captures(filename)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Maps capture filenames to anonymous ones. Pure: same filename, salt and
/// algorithm always give the same name.
#[derive(Debug, Clone)]
pub struct Anonymizer {
    salt: String,
    algorithm: HashAlgorithm,
}

impl Anonymizer {
    pub fn new(salt: impl Into<String>, algorithm: HashAlgorithm) -> Self {
        Self {
            salt: salt.into(),
            algorithm,
        }
    }

    /// Build from the configured algorithm name, falling back to SHA-256.
    pub fn from_config(salt: &str, algorithm_name: &str) -> Self {
        let algorithm = HashAlgorithm::parse(algorithm_name).unwrap_or_else(|| {
            warn!(algorithm = algorithm_name, "Unknown hash algorithm, using sha256");
            HashAlgorithm::Sha256
        });
        Self::new(salt, algorithm)
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// `video_<16 hex>` plus the original extension.
    ///
    /// The hash key is the record identifier when the name carries one, so
    /// re-exports of the same case map to the same anonymous name. Two
    /// different captures sharing an identifier therefore collide.
    pub fn anonymous_name(&self, original_filename: &str) -> String {
        let name: String = original_filename.nfc().collect();
        let key = extract_identifier(&name).unwrap_or(&name);
        let digest = self.algorithm.hex_digest(format!("{}{}", key, self.salt).as_bytes());
        let ext = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        format!("video_{}{}", &digest[..NAME_HASH_LEN], ext)
    }
}
