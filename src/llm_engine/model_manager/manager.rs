//! LLM Model Manager - registry lookups, downloads and local model files

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::AppConfig;
use crate::llm_engine::provider::{LlmError, LlmResult};
use super::downloader::FileFetcher;
use super::registry::{ModelRegistry, GGUF_EXTENSION};
use super::types::{DownloadProgress, ModelFile};

/// Manages GGUF model discovery, downloads and local storage
pub struct LlmModelManager {
    registry: ModelRegistry,
    fetcher: FileFetcher,
}

impl LlmModelManager {
    /// Create a new model manager
    pub fn new(config: &AppConfig) -> LlmResult<Self> {
        let models_dir = config.models_dir.clone();

        if !models_dir.exists() {
            if let Err(e) = std::fs::create_dir_all(&models_dir) {
                log::warn!("Could not create models directory {:?}: {}", models_dir, e);
            }
        }

        Ok(Self {
            registry: ModelRegistry::new(&config.registry)?,
            fetcher: FileFetcher::new(
                models_dir,
                Duration::from_secs(config.download_timeout_secs),
            )?,
        })
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        self.fetcher.models_dir()
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Get path to a model file
    pub fn model_path(&self, filename: &str) -> PathBuf {
        self.fetcher.destination(filename)
    }

    /// Check if a model file is present locally.
    /// Probe failures only affect UI affordance, so they are logged and read as "no".
    pub async fn is_downloaded(&self, filename: &str) -> bool {
        match tokio::fs::try_exists(self.model_path(filename)).await {
            Ok(exists) => exists,
            Err(e) => {
                log::warn!("Error checking file existence for {}: {}", filename, e);
                false
            }
        }
    }

    /// Filenames of the GGUF models in the models directory
    pub async fn local_models(&self) -> LlmResult<Vec<String>> {
        let mut models = Vec::new();

        let mut entries = match tokio::fs::read_dir(self.models_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(models),
            Err(e) => {
                return Err(LlmError::Storage(format!(
                    "Failed to read models directory: {}",
                    e
                )))
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LlmError::Storage(format!("Failed to read models directory: {}", e)))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(GGUF_EXTENSION) {
                models.push(name);
            }
        }

        models.sort();
        Ok(models)
    }

    /// List a model's registry files with their local download state
    pub async fn model_files(&self, display_name: &str) -> LlmResult<Vec<ModelFile>> {
        let repo_id = self.registry.repo_for(display_name)?.to_string();
        let filenames = self.registry.list_gguf_files(display_name).await?;

        let mut files = Vec::with_capacity(filenames.len());
        for filename in filenames {
            let downloaded = self.is_downloaded(&filename).await;
            files.push(ModelFile {
                display_name: display_name.to_string(),
                repo_id: repo_id.clone(),
                local_path: self.model_path(&filename),
                filename,
                downloaded,
            });
        }
        Ok(files)
    }

    /// Download a model file unless it is already present.
    /// Returns the path to the local file.
    pub async fn download_model<F>(
        &self,
        display_name: &str,
        filename: &str,
        on_progress: F,
    ) -> LlmResult<PathBuf>
    where
        F: Fn(DownloadProgress) + Send,
    {
        let url = self.registry.download_url(display_name, filename)?;
        self.fetcher.fetch(filename, &url, on_progress).await
    }

    /// Delete a downloaded model
    pub async fn delete_model(&self, filename: &str) -> LlmResult<()> {
        let path = self.model_path(filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                log::info!("Deleted model {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LlmError::Storage(format!("Failed to delete model: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use tempfile::tempdir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager_in(dir: &Path, base_url: Option<String>) -> LlmModelManager {
        let mut config = AppConfig {
            models_dir: dir.to_path_buf(),
            ..AppConfig::default()
        };
        if let Some(base_url) = base_url {
            config.registry = RegistryConfig {
                base_url,
                ..RegistryConfig::default()
            };
        }
        LlmModelManager::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_local_models_lists_only_gguf() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.gguf"), b"x").unwrap();
        std::fs::write(dir.path().join("a.gguf"), b"x").unwrap();
        std::fs::write(dir.path().join("a.gguf.part"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let manager = manager_in(dir.path(), None);
        assert_eq!(manager.local_models().await.unwrap(), vec!["a.gguf", "b.gguf"]);
    }

    #[tokio::test]
    async fn test_delete_model() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.gguf"), b"x").unwrap();
        let manager = manager_in(dir.path(), None);

        assert!(manager.is_downloaded("a.gguf").await);
        manager.delete_model("a.gguf").await.unwrap();
        assert!(!manager.is_downloaded("a.gguf").await);
        // Deleting twice is fine
        manager.delete_model("a.gguf").await.unwrap();
    }

    #[tokio::test]
    async fn test_model_files_probe_local_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "siblings": [
                    {"rfilename": "a.Q4_K_S.gguf"},
                    {"rfilename": "a.F16.gguf"},
                    {"rfilename": "readme.md"}
                ]
            })))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.F16.gguf"), b"x").unwrap();
        let manager = manager_in(dir.path(), Some(server.uri()));

        let files = manager.model_files("Llama-3.2-1B-Instruct").await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].filename, "a.Q4_K_S.gguf");
        assert!(!files[0].downloaded);
        assert_eq!(files[1].filename, "a.F16.gguf");
        assert!(files[1].downloaded);
        assert_eq!(files[1].repo_id, "bartowski/Llama-3.2-1B-Instruct-GGUF");
        assert_eq!(files[1].local_path, dir.path().join("a.F16.gguf"));

        // State is re-probed on every call
        std::fs::remove_file(dir.path().join("a.F16.gguf")).unwrap();
        let files = manager.model_files("Llama-3.2-1B-Instruct").await.unwrap();
        assert!(files.iter().all(|f| !f.downloaded));
    }

    #[tokio::test]
    async fn test_download_unknown_model() {
        let dir = tempdir().unwrap();
        let manager = manager_in(dir.path(), None);
        let err = manager
            .download_model("Nope", "x.gguf", |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::UnknownModel("Nope".to_string()));
    }
}
