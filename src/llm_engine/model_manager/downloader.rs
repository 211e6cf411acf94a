//! Model file download logic

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;

use crate::llm_engine::provider::{LlmError, LlmResult};
use super::types::{DownloadProgress, DownloadStatus};

/// Suffix of the in-progress download file next to the destination
const PARTIAL_SUFFIX: &str = "part";

/// Downloads model files into a flat local directory
pub struct FileFetcher {
    client: Client,
    models_dir: PathBuf,
}

impl FileFetcher {
    pub fn new(models_dir: PathBuf, timeout: Duration) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, models_dir })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Local destination for a remote filename
    pub fn destination(&self, filename: &str) -> PathBuf {
        self.models_dir.join(filename)
    }

    /// Materialize `filename` locally, downloading it from `url` if needed.
    ///
    /// Returns immediately, without invoking `on_progress`, when the file is
    /// already present. Progress fractions are non-decreasing and end at
    /// exactly 1.0. A failed transfer leaves no partial file behind.
    pub async fn fetch<F>(&self, filename: &str, url: &str, on_progress: F) -> LlmResult<PathBuf>
    where
        F: Fn(DownloadProgress) + Send,
    {
        let dest_path = self.destination(filename);

        if tokio::fs::try_exists(&dest_path).await.unwrap_or(false) {
            log::info!("{} already present at {:?}, skipping download", filename, dest_path);
            return Ok(dest_path);
        }

        tokio::fs::create_dir_all(&self.models_dir)
            .await
            .map_err(|e| LlmError::Storage(format!("Failed to create models directory: {}", e)))?;

        let temp_path = partial_path(&dest_path);
        let result = async {
            let downloaded = self.transfer(filename, url, &temp_path, &on_progress).await?;
            tokio::fs::rename(&temp_path, &dest_path)
                .await
                .map_err(|e| LlmError::Storage(format!("Failed to move downloaded file: {}", e)))?;
            Ok::<u64, LlmError>(downloaded)
        }
        .await;

        let downloaded = match result {
            Ok(downloaded) => downloaded,
            Err(e) => {
                log::warn!("Download of {} failed: {}", filename, e);
                if let Err(rm) = tokio::fs::remove_file(&temp_path).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("Failed to remove partial file {:?}: {}", temp_path, rm);
                    }
                }
                return Err(e);
            }
        };

        on_progress(DownloadProgress {
            filename: filename.to_string(),
            downloaded_bytes: downloaded,
            total_bytes: Some(downloaded),
            fraction: 1.0,
            status: DownloadStatus::Complete,
        });

        log::info!("Downloaded {} to {:?}", filename, dest_path);
        Ok(dest_path)
    }

    /// Stream `url` into `temp_path`, returning the number of bytes written
    async fn transfer<F>(
        &self,
        filename: &str,
        url: &str,
        temp_path: &Path,
        on_progress: &F,
    ) -> LlmResult<u64>
    where
        F: Fn(DownloadProgress) + Send,
    {
        log::info!("Starting download of {} from {}", filename, url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LlmError::Network(format!("Failed to start download: {}", e)))?;

        if !response.status().is_success() {
            return Err(LlmError::Network(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        let total_bytes = response.content_length().filter(|len| *len > 0);

        let mut file = tokio::fs::File::create(temp_path)
            .await
            .map_err(|e| LlmError::Storage(format!("Failed to create temp file: {}", e)))?;

        let mut downloaded: u64 = 0;
        let mut last_fraction = 0.0_f64;
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| LlmError::Network(format!("Download error: {}", e)))?;

            file.write_all(&chunk)
                .await
                .map_err(|e| LlmError::Storage(format!("Failed to write chunk: {}", e)))?;

            downloaded += chunk.len() as u64;
            perf_trace!("{}: {} bytes received", filename, downloaded);

            // Without a content length only the final 1.0 is reported
            if let Some(total) = total_bytes {
                let fraction = progress_fraction(downloaded, total).max(last_fraction);
                last_fraction = fraction;
                on_progress(DownloadProgress {
                    filename: filename.to_string(),
                    downloaded_bytes: downloaded,
                    total_bytes,
                    fraction,
                    status: DownloadStatus::Downloading,
                });
            }
        }

        file.flush()
            .await
            .map_err(|e| LlmError::Storage(format!("Failed to flush file: {}", e)))?;
        drop(file);

        Ok(downloaded)
    }
}

/// Fraction of `total` completed, clamped to [0, 1]
fn progress_fraction(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (downloaded as f64 / total as f64).clamp(0.0, 1.0)
}

fn partial_path(dest_path: &Path) -> PathBuf {
    let mut name = dest_path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    dest_path.with_file_name(name)
}
