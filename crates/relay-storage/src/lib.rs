//! Durable watermark storage + HTTP fetch utilities for the relay.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use relay_core::WatermarkState;
use reqwest::header::{HeaderMap, LINK};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "relay-storage";

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state file io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path} is not valid state json: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Watermark persistence. Without a path the store is a no-op and state lives only in memory.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    path: Option<PathBuf>,
}

impl StateStore {
    pub fn in_memory() -> Self {
        Self { path: None }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_durable(&self) -> bool {
        self.path.is_some()
    }

    /// Reads the persisted state. `Ok(None)` when no path is configured or the file does not exist.
    pub async fn load(&self) -> Result<Option<WatermarkState>, StateStoreError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };

        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateStoreError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StateStoreError::Parse {
                path: path.clone(),
                source,
            })
    }

    /// Boot-time load. Unreadable or malformed files are logged and treated as absent,
    /// in which case the seed state is used.
    pub async fn load_or(&self, seed: WatermarkState) -> WatermarkState {
        match self.load().await {
            Ok(Some(state)) => state,
            Ok(None) => seed,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable state file");
                seed
            }
        }
    }

    /// Overwrites the state file wholesale using a temp file and atomic rename.
    pub async fn save(&self, state: &WatermarkState) -> Result<(), StateStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(state)?;
        let io_err = |source| StateStoreError::Io {
            path: path.clone(),
            source,
        };

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".state.{}.tmp", Uuid::new_v4()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, path).await
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(err));
        }
        debug!(path = %path.display(), seen = state.seen_count(), "state persisted");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Shared reqwest client for the source and the chat sink.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub next_url: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("unexpected response body from {url}: {message}")]
    Decode { url: String, message: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Single GET with an optional bearer credential. Any non-success status is an error
    /// carrying the response body; no retries are attempted.
    pub async fn get(
        &self,
        url: &str,
        bearer: Option<&str>,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let mut request = self.client.get(url);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body,
                });
            }

            let next_url = next_link(resp.headers());
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), has_next = next_url.is_some(), "page fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                next_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Extracts the `rel="next"` target from the response's `Link` headers.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(parse_next_link)
}

/// Parses an RFC 8288 style `Link` header value and returns the `next` relation URL.
pub fn parse_next_link(header: &str) -> Option<String> {
    let mut rest = header;
    while let Some(open) = rest.find('<') {
        let after_open = &rest[open + 1..];
        let close = after_open.find('>')?;
        let url = &after_open[..close];
        let tail = &after_open[close + 1..];
        let params_end = tail.find('<').unwrap_or(tail.len());
        if tail[..params_end].split(';').any(is_next_relation) {
            return Some(url.trim().to_string());
        }
        rest = &tail[params_end..];
    }
    None
}

fn is_next_relation(param: &str) -> bool {
    let Some((key, value)) = param.split_once('=') else {
        return false;
    };
    let value = value.trim().trim_end_matches(',').trim().trim_matches('"');
    key.trim().eq_ignore_ascii_case("rel")
        && value
            .split_whitespace()
            .any(|rel| rel.eq_ignore_ascii_case("next"))
}
