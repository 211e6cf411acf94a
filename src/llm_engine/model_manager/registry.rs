//! Model Registry client - resolves display names and lists GGUF files

use reqwest::Client;
use serde::Deserialize;

use crate::config::RegistryConfig;
use crate::llm_engine::provider::{LlmError, LlmResult};
use super::types::CatalogEntry;

/// Weight-file extension accepted from the registry listing
pub const GGUF_EXTENSION: &str = ".gguf";

/// Registry model info response (only the fields we need)
#[derive(Debug, Deserialize)]
struct RegistryModelInfo {
    #[serde(default)]
    siblings: Option<Vec<RegistrySibling>>,
}

#[derive(Debug, Deserialize)]
struct RegistrySibling {
    rfilename: String,
}

/// Default display-name table
pub fn default_catalog() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry::new("Llama-3.2-1B-Instruct", "bartowski/Llama-3.2-1B-Instruct-GGUF"),
        CatalogEntry::new("Qwen2-0.5B-Instruct", "Qwen/Qwen2-0.5B-Instruct-GGUF"),
        CatalogEntry::new(
            "DeepSeek-R1-Distill-Qwen-1.5B",
            "bartowski/DeepSeek-R1-Distill-Qwen-1.5B-GGUF",
        ),
        CatalogEntry::new("SmolLM2-1.7B-Instruct", "bartowski/SmolLM2-1.7B-Instruct-GGUF"),
    ]
}

/// Keep only weight files, preserving registry order
pub fn filter_gguf_files<I, S>(files: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    files
        .into_iter()
        .map(Into::into)
        .filter(|name| name.ends_with(GGUF_EXTENSION))
        .collect()
}

/// Client for the remote model registry
pub struct ModelRegistry {
    client: Client,
    base_url: String,
    catalog: Vec<CatalogEntry>,
}

impl ModelRegistry {
    pub fn new(config: &RegistryConfig) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            catalog: config.models.clone(),
        })
    }

    /// Display names in catalog order
    pub fn display_names(&self) -> Vec<String> {
        self.catalog.iter().map(|e| e.display_name.clone()).collect()
    }

    /// Get the repository ID for a display name
    pub fn repo_for(&self, display_name: &str) -> LlmResult<&str> {
        self.catalog
            .iter()
            .find(|e| e.display_name == display_name)
            .map(|e| e.repo_id.as_str())
            .ok_or_else(|| LlmError::UnknownModel(display_name.to_string()))
    }

    /// Download URL for a file in the model's repository
    pub fn download_url(&self, display_name: &str, filename: &str) -> LlmResult<String> {
        let repo_id = self.repo_for(display_name)?;
        Ok(format!("{}/{}/resolve/main/{}", self.base_url, repo_id, filename))
    }

    /// List the GGUF files published for a model. An empty list is valid.
    pub async fn list_gguf_files(&self, display_name: &str) -> LlmResult<Vec<String>> {
        let repo_id = self.repo_for(display_name)?;
        let url = format!("{}/api/models/{}", self.base_url, repo_id);

        log::info!("Fetching file listing for {} from {}", display_name, url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LlmError::Registry(format!("Cannot reach registry: {}", e)))?;

        if !response.status().is_success() {
            return Err(LlmError::Registry(format!(
                "Registry returned status {} for {}",
                response.status(),
                repo_id
            )));
        }

        let info: RegistryModelInfo = response
            .json()
            .await
            .map_err(|e| LlmError::Registry(format!("Invalid registry response: {}", e)))?;

        let siblings = info.siblings.ok_or_else(|| {
            LlmError::Registry(format!("Registry response for {} has no file listing", repo_id))
        })?;

        let files = filter_gguf_files(siblings.into_iter().map(|s| s.rfilename));
        log::info!("Found {} GGUF file(s) in {}", files.len(), repo_id);
        Ok(files)
    }
}
