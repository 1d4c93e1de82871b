use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use super::TransferError;
use crate::session::SessionDescriptor;

const NOT_FOUND_PREFIX: &str = "Not found:";

/// `download?filepath=<path>&minion=<session id>` under the relay base URL.
pub fn download_url(
    base: &Url,
    descriptor: &SessionDescriptor,
    remote_path: &str,
) -> Result<Url, TransferError> {
    let remote_path = remote_path.trim();
    if remote_path.is_empty() {
        return Err(TransferError::InvalidUrl("remote path is required".into()));
    }
    let mut url = base
        .join("download")
        .map_err(|err| TransferError::InvalidUrl(err.to_string()))?;
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("filepath", remote_path)
        .append_pair("minion", descriptor.id());
    Ok(url)
}

/// Local file name for a remote path: its last component.
pub fn local_name(remote_path: &str) -> Option<&str> {
    remote_path
        .trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
}

pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new() -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    /// Streams the remote file into `dest`. The relay answers a missing file
    /// with a plain-text `Not found: <path>` body rather than a 404, which is
    /// reported as `TransferError::NotFound` and leaves no local file behind.
    pub async fn fetch(&self, url: &Url, remote_path: &str, dest: &Path) -> Result<u64, TransferError> {
        debug!(target: "shellrelay::download", url = %url, dest = %dest.display(), "requesting file");
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::DownloadRejected {
                status: status.as_u16(),
            });
        }

        let is_binary = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/octet-stream"));
        if !is_binary {
            let body = response.bytes().await?;
            if body.starts_with(NOT_FOUND_PREFIX.as_bytes()) {
                return Err(TransferError::NotFound(remote_path.to_string()));
            }
            let mut file = File::create(dest).await?;
            file.write_all(&body).await?;
            file.flush().await?;
            return Ok(body.len() as u64);
        }

        let mut file = File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(dest).await;
                    return Err(err.into());
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        info!(
            target: "shellrelay::download",
            remote = %remote_path,
            bytes = written,
            "download complete"
        );
        Ok(written)
    }
}

/// Where to save `remote_path` when the caller did not choose a path.
pub fn default_destination(remote_path: &str) -> Result<PathBuf, TransferError> {
    local_name(remote_path)
        .map(PathBuf::from)
        .ok_or_else(|| TransferError::InvalidUrl(format!("'{remote_path}' has no file name")))
}
