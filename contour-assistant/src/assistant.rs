//! Host-facing facade: startup wiring plus the model management actions
//! behind the assistant settings page.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::Value;

use crate::catalog::CatalogEntry;
use crate::chat::{ChatBridge, CredentialPrompt};
use crate::config::{
    register_defaults, BackendConfig, BackendKind, ConfigStore, API_KEY_SECRET, BACKEND_OPTION, BASE_URL_OPTION,
    LLAMA_MODEL_PATH_OPTION,
};
use crate::downloader::{DownloadProgress, Downloader};
use crate::error::ConfigError;
use crate::loader::{LoadTicket, ModelLoader};
use crate::model_store::{is_probably_model, ModelStore};

/// Make sure a usable local model path is configured when one is needed.
///
/// A stale path is cleared. When no path remains and the local backend is
/// selected, or the remote backend has no API key, `find` is asked for a
/// model file. A found model is configured, and the backend switches to
/// local when there is no API key. Nothing happens when a base URL is set.
///
/// Returns the newly configured path, if any.
pub fn ensure_local_model_configured<F>(store: &dyn ConfigStore, find: F) -> Result<Option<PathBuf>, ConfigError>
where
    F: FnOnce() -> Option<PathBuf>,
{
    if !store.get_string(BASE_URL_OPTION).is_empty() {
        return Ok(None);
    }

    let mut path = store.get_string(LLAMA_MODEL_PATH_OPTION);
    if !path.is_empty() && !std::path::Path::new(&path).exists() {
        log::info!("Configured model no longer exists, clearing: {}", path);
        store.set_option(LLAMA_MODEL_PATH_OPTION, Value::from(""))?;
        path.clear();
    }
    if !path.is_empty() {
        return Ok(None);
    }

    let backend = BackendKind::parse(&store.get_string(BACKEND_OPTION));
    let has_key = store.get_nonempty_secret(API_KEY_SECRET).is_some();
    if backend == BackendKind::Remote && has_key {
        return Ok(None);
    }

    let Some(found) = find() else {
        return Ok(None);
    };
    log::info!("Using local model: {}", found.display());
    store.set_option(LLAMA_MODEL_PATH_OPTION, Value::from(found.to_string_lossy().into_owned()))?;
    if !has_key {
        store.set_option(BACKEND_OPTION, Value::from(BackendKind::Local.as_str()))?;
    }
    Ok(Some(found))
}

/// Options, model files, loader and chat bridge wired together.
pub struct Assistant {
    config: Arc<dyn ConfigStore>,
    models: ModelStore,
    loader: Arc<ModelLoader>,
    bridge: ChatBridge,
}

impl Assistant {
    pub fn new(config: Arc<dyn ConfigStore>, models: ModelStore, loader: Arc<ModelLoader>) -> Self {
        let bridge = ChatBridge::new(config.clone(), loader.clone());
        Self {
            config,
            models,
            loader,
            bridge,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn CredentialPrompt>) -> Self {
        self.bridge = self.bridge.with_prompt(prompt);
        self
    }

    pub fn bridge(&self) -> &ChatBridge {
        &self.bridge
    }

    pub fn models(&self) -> &ModelStore {
        &self.models
    }

    pub fn loader(&self) -> &Arc<ModelLoader> {
        &self.loader
    }

    /// Register defaults, pick up a local model if one is needed, and start
    /// preloading it.
    pub fn startup(&self) -> Result<Option<LoadTicket>, ConfigError> {
        register_defaults(&*self.config)?;
        ensure_local_model_configured(&*self.config, || self.models.find_local_model())?;

        let config = BackendConfig::read(&*self.config);
        if config.backend != BackendKind::Local {
            return Ok(None);
        }
        Ok(self.reload())
    }

    /// Load the configured model. While another load is running the
    /// request is queued behind it and the current model keeps serving.
    pub fn reload(&self) -> Option<LoadTicket> {
        let config = BackendConfig::read(&*self.config);
        let path = config.model_path?;
        match self
            .loader
            .queue_background_load(&path, &config.chat_format, &Value::from(config.context_window))
        {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                log::warn!("Not loading {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Download a catalog model, make it the configured local model and
    /// start loading it.
    pub async fn install_model<F>(&self, downloader: &Downloader, entry: &CatalogEntry, on_progress: F) -> Result<PathBuf>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        log::info!("Installing {} from {}", entry.display_name, entry.repo);
        let path = downloader
            .download_entry(&self.models, entry, false, on_progress)
            .await?;
        self.config
            .set_option(LLAMA_MODEL_PATH_OPTION, Value::from(path.to_string_lossy().into_owned()))?;
        self.config
            .set_option(BACKEND_OPTION, Value::from(BackendKind::Local.as_str()))?;
        self.reload();
        Ok(path)
    }

    /// Point the model path at a file listed in the store.
    pub fn select_model(&self, file_name: &str) -> Result<PathBuf> {
        let path = self.models.artifact_path(file_name);
        if !self.models.contains(&path) || !is_probably_model(&path) {
            bail!(
                "{} is not a model in {}",
                file_name,
                self.models.resolve_directory().display()
            );
        }
        self.config
            .set_option(LLAMA_MODEL_PATH_OPTION, Value::from(path.to_string_lossy().into_owned()))?;
        self.reload();
        Ok(path)
    }

    /// Delete the configured model file if it lives in the store. On
    /// success the path is cleared and the model unloaded.
    pub fn delete_configured_model(&self) -> Result<bool> {
        let Some(path) = BackendConfig::read(&*self.config).model_path else {
            return Ok(false);
        };
        if !self.models.delete(&path) {
            return Ok(false);
        }
        self.config.set_option(LLAMA_MODEL_PATH_OPTION, Value::from(""))?;
        self.loader.unload();
        Ok(true)
    }

    /// Fill an empty model path with the store's only artifact.
    pub fn prefill_model_path(&self) -> Result<Option<PathBuf>, ConfigError> {
        if !self.config.get_string(LLAMA_MODEL_PATH_OPTION).is_empty() {
            return Ok(None);
        }
        let Some(path) = self.models.single_artifact() else {
            return Ok(None);
        };
        self.config
            .set_option(LLAMA_MODEL_PATH_OPTION, Value::from(path.to_string_lossy().into_owned()))?;
        Ok(Some(path))
    }
}
