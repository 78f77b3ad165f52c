//! Azure Blob Storage over its REST API, authenticated with a SAS token.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use reqwest::blocking::{Body, Client, Response};
use reqwest::header::CONTENT_LENGTH;
use reqwest::StatusCode;
use tracing::{debug, info};

use super::{ObjectStore, StoreError};
use crate::config::UploadSettings;

const API_VERSION: &str = "2021-08-06";

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<Name>([^<]*)</Name>").unwrap());
static NEXT_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<NextMarker>([^<]*)</NextMarker>").unwrap());

#[derive(Debug, Clone)]
pub struct AzureBlobStore {
    client: Client,
    /// `https://<account>.blob.core.windows.net/<container>`, no trailing slash
    container_url: String,
    /// SAS query string without the leading `?`
    sas: String,
}

fn parse_connection_string(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Container URL and SAS from the settings. A container SAS URL wins over a
/// connection string.
fn endpoint_and_sas(settings: &UploadSettings) -> Result<(String, String), StoreError> {
    let url = settings.container_url.trim();
    if !url.is_empty() {
        return match url.split_once('?') {
            Some((base, sas)) if !sas.is_empty() => {
                Ok((base.trim_end_matches('/').to_string(), sas.to_string()))
            }
            _ => Err(StoreError::Config("container_url carries no SAS token".into())),
        };
    }

    if settings.connection_string.trim().is_empty() {
        return Err(StoreError::Config(
            "neither container_url nor connection_string is set".into(),
        ));
    }
    let parts = parse_connection_string(&settings.connection_string);
    let sas = match parts.get("SharedAccessSignature") {
        Some(sas) if !sas.is_empty() => sas.trim_start_matches('?').to_string(),
        _ if parts.contains_key("AccountKey") => {
            return Err(StoreError::Config(
                "account-key connection strings are not supported, use a SAS".into(),
            ))
        }
        _ => return Err(StoreError::Config("connection string has no SharedAccessSignature".into())),
    };
    let endpoint = match (parts.get("BlobEndpoint"), parts.get("AccountName")) {
        (Some(endpoint), _) => endpoint.trim_end_matches('/').to_string(),
        (None, Some(account)) => {
            let protocol = parts
                .get("DefaultEndpointsProtocol")
                .map(String::as_str)
                .unwrap_or("https");
            let suffix = parts
                .get("EndpointSuffix")
                .map(String::as_str)
                .unwrap_or("core.windows.net");
            format!("{}://{}.blob.{}", protocol, account, suffix)
        }
        (None, None) => {
            return Err(StoreError::Config(
                "connection string has neither BlobEndpoint nor AccountName".into(),
            ))
        }
    };
    if settings.container_name.trim().is_empty() {
        return Err(StoreError::Config("container_name is empty".into()));
    }
    Ok((format!("{}/{}", endpoint, settings.container_name.trim()), sas))
}

/// Unreserved characters stay literal; `/` separates virtual directories.
const BLOB_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Query values escape `/` as well.
const QUERY_VALUE: &AsciiSet = &BLOB_PATH.add(b'/');

fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, BLOB_PATH).to_string()
}

fn encode_query(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

static ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(lt|gt|quot|apos|amp|#x[0-9A-Fa-f]+|#[0-9]+);").unwrap());

/// Decode the predefined entities and numeric character references in one
/// pass. Unknown or invalid references are kept verbatim.
fn unescape_xml(s: &str) -> String {
    ENTITY_RE
        .replace_all(s, |c: &regex::Captures| {
            let entity = &c[1];
            let decoded = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => match entity.strip_prefix("#x") {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => entity[1..].parse::<u32>().ok(),
                }
                .and_then(char::from_u32),
            };
            decoded.map_or_else(|| c[0].to_string(), String::from)
        })
        .into_owned()
}

fn http_err(e: reqwest::Error) -> StoreError {
    StoreError::Http(e.to_string())
}

fn expect_success(response: Response, what: &str) -> Result<Response, StoreError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(StoreError::Status {
            status: response.status().as_u16(),
            what: what.to_string(),
        })
    }
}

impl AzureBlobStore {
    pub fn from_settings(settings: &UploadSettings) -> Result<Self, StoreError> {
        let (container_url, sas) = endpoint_and_sas(settings)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(http_err)?;
        Ok(Self {
            client,
            container_url,
            sas,
        })
    }

    fn blob_url(&self, key: &str) -> String {
        format!("{}/{}?{}", self.container_url, encode_key(key), self.sas)
    }

    fn container_op_url(&self, extra: &str) -> String {
        format!("{}?restype=container{}&{}", self.container_url, extra, self.sas)
    }

    /// Create the container if it is missing. Returns whether it was created.
    pub fn ensure_container(&self) -> Result<bool, StoreError> {
        let response = self
            .client
            .get(self.container_op_url(""))
            .header("x-ms-version", API_VERSION)
            .send()
            .map_err(http_err)?;
        if response.status().is_success() {
            return Ok(false);
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(StoreError::Status {
                status: response.status().as_u16(),
                what: "container properties".into(),
            });
        }

        let response = self
            .client
            .put(self.container_op_url(""))
            .header("x-ms-version", API_VERSION)
            .header(CONTENT_LENGTH, 0)
            .send()
            .map_err(http_err)?;
        match response.status() {
            StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => {
                info!(container = %self.container_url, "Created container");
                Ok(true)
            }
            status => Err(StoreError::Status {
                status: status.as_u16(),
                what: "create container".into(),
            }),
        }
    }
}

impl ObjectStore for AzureBlobStore {
    fn describe(&self) -> String {
        format!("azure {}", self.container_url)
    }

    fn put_file(&self, local: &Path, key: &str) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: local.to_path_buf(),
            source,
        };
        let file = File::open(local).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        debug!(key, bytes = len, "PUT blob");
        let response = self
            .client
            .put(self.blob_url(key))
            .header("x-ms-version", API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .body(Body::sized(file, len))
            .send()
            .map_err(http_err)?;
        expect_success(response, key)?;
        Ok(())
    }

    fn object_size(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let response = self
            .client
            .head(self.blob_url(key))
            .header("x-ms-version", API_VERSION)
            .send()
            .map_err(http_err)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success(response, key)?;
        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| StoreError::Http(format!("no Content-Length for {}", key)))?;
        Ok(Some(size))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut marker = String::new();
        loop {
            let extra = format!(
                "&comp=list&prefix={}&marker={}",
                encode_query(prefix),
                encode_query(&marker)
            );
            let response = self
                .client
                .get(self.container_op_url(&extra))
                .header("x-ms-version", API_VERSION)
                .send()
                .map_err(http_err)?;
            let body = expect_success(response, "list blobs")?
                .text()
                .map_err(http_err)?;
            let (page, next) = parse_list_page(&body);
            keys.extend(page);
            match next {
                Some(next) => marker = next,
                None => break,
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Blob names and the continuation marker of one `List Blobs` page.
fn parse_list_page(xml: &str) -> (Vec<String>, Option<String>) {
    let names = NAME_RE
        .captures_iter(xml)
        .map(|c| unescape_xml(&c[1]))
        .collect();
    let next = NEXT_MARKER_RE
        .captures(xml)
        .map(|c| unescape_xml(&c[1]))
        .filter(|m| !m.is_empty());
    (names, next)
}
