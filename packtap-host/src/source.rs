//! Where a pack's module bytes come from

use packtap_api::{BYPASS_HEADER, BYPASS_VALUE};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors resolving a module source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read module {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to fetch module {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Module fetch {url} returned status {status}")]
    Status { url: String, status: u16 },
}

/// Byte source of a pack module
#[derive(Clone)]
pub enum ModuleSource {
    /// Module bytes already in memory
    Bytes(Vec<u8>),
    /// A `.wasm` file on disk
    File(PathBuf),
    /// A remote module fetched over HTTP(S)
    Url(String),
}

impl fmt::Debug for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            ModuleSource::File(path) => write!(f, "File({})", path.display()),
            ModuleSource::Url(url) => write!(f, "Url({})", url),
        }
    }
}

impl From<Vec<u8>> for ModuleSource {
    fn from(bytes: Vec<u8>) -> Self {
        ModuleSource::Bytes(bytes)
    }
}

impl From<PathBuf> for ModuleSource {
    fn from(path: PathBuf) -> Self {
        ModuleSource::File(path)
    }
}

impl ModuleSource {
    /// Load the module bytes
    ///
    /// Remote fetches carry the bypass header so they are never intercepted.
    pub async fn resolve(&self, client: &reqwest::Client) -> Result<Vec<u8>, SourceError> {
        match self {
            ModuleSource::Bytes(bytes) => Ok(bytes.clone()),
            ModuleSource::File(path) => {
                tokio::fs::read(path).await.map_err(|source| SourceError::Io {
                    path: path.clone(),
                    source,
                })
            }
            ModuleSource::Url(url) => {
                let http = |source| SourceError::Http {
                    url: url.clone(),
                    source,
                };

                let response = client
                    .get(url)
                    .header(BYPASS_HEADER, BYPASS_VALUE)
                    .send()
                    .await
                    .map_err(http)?;

                let status = response.status();
                if !status.is_success() {
                    return Err(SourceError::Status {
                        url: url.clone(),
                        status: status.as_u16(),
                    });
                }

                let bytes = response.bytes().await.map_err(http)?;
                Ok(bytes.to_vec())
            }
        }
    }
}
