// Chat bridge - routes each completion to the local model or a remote API
// Readiness is checked against current options; nothing is cached between calls

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use super::local::{build_local_messages, run_local};
use super::remote::{missing_credential, run_remote, RemoteClient, RemoteRequest};
use super::{ChatChunk, ChatConversation, ChatMessage, ChatStream, LocalModel};
use crate::config::{BackendConfig, BackendKind, ConfigStore};
use crate::error::{LoadError, ReadinessError};
use crate::loader::ModelLoader;

/// Host hook for collecting remote credentials.
pub trait CredentialPrompt: Send + Sync {
    /// Called when the remote backend has no API key. Implementations may
    /// ask the user and store the key before returning.
    fn request_credentials(&self, config: &dyn ConfigStore);
}

/// Never prompts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompt;

impl CredentialPrompt for NoPrompt {
    fn request_credentials(&self, _config: &dyn ConfigStore) {}
}

/// Where the local model stands for the configured path
enum LocalState {
    Ready(Arc<dyn LocalModel>),
    Loading,
    Failed(String),
}

/// How one completion request is served
enum Route {
    Immediate(ChatChunk),
    Local {
        model: Arc<dyn LocalModel>,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
    },
    Remote {
        config: BackendConfig,
        request: RemoteRequest,
    },
}

/// Completion entry point for the host's chat view.
pub struct ChatBridge {
    config: Arc<dyn ConfigStore>,
    loader: Arc<ModelLoader>,
    prompt: Arc<dyn CredentialPrompt>,
}

impl ChatBridge {
    pub fn new(config: Arc<dyn ConfigStore>, loader: Arc<ModelLoader>) -> Self {
        Self {
            config,
            loader,
            prompt: Arc::new(NoPrompt),
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn CredentialPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn loader(&self) -> &Arc<ModelLoader> {
        &self.loader
    }

    /// Check whether a completion can be served with the current options.
    ///
    /// Configuration problems (see [`ReadinessError::is_configuration`]) need
    /// the user to change settings; the rest clear up on their own or after a
    /// reload.
    pub fn is_ready(&self) -> Result<(), ReadinessError> {
        let mut config = BackendConfig::read(&*self.config);

        match config.backend {
            BackendKind::Remote => {
                if missing_credential(&config) {
                    self.prompt.request_credentials(&*self.config);
                    config = BackendConfig::read(&*self.config);
                    if missing_credential(&config) {
                        return Err(ReadinessError::MissingCredential);
                    }
                }
            }
            BackendKind::Local => {
                if let Some(path) = &config.model_path {
                    return match self.local_state(path, &config) {
                        LocalState::Ready(_) => Ok(()),
                        LocalState::Loading => Err(ReadinessError::StillLoading),
                        LocalState::Failed(e) => Err(ReadinessError::ModelLoadFailed(e)),
                    };
                }
                if config.base_url.is_none() {
                    return Err(ReadinessError::MissingModel);
                }
            }
        }

        RemoteClient::new(&config)
            .map(|_| ())
            .map_err(|e| ReadinessError::Setup(e.to_string()))
    }

    /// Start a completion for `conversation`.
    ///
    /// Returns immediately; the work runs on the Tokio runtime this is called
    /// from. The stream always ends with exactly one final chunk, and
    /// failures arrive as a final chunk flagged as an internal error.
    pub fn complete(&self, conversation: &ChatConversation) -> ChatStream {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::error!("Chat completion requested outside of a Tokio runtime");
            return ChatStream::once(ChatChunk::error(
                "Error: no async runtime is running. See frontend.log for details.",
            ));
        };

        let config = BackendConfig::read(&*self.config);
        match self.route(conversation, config) {
            Route::Immediate(chunk) => ChatStream::once(chunk),
            Route::Local {
                model,
                messages,
                max_tokens,
            } => {
                log::info!("Local chat: {} messages, max_tokens={}", messages.len(), max_tokens);
                let (sink, stream) = ChatStream::channel();
                runtime.spawn_blocking(move || run_local(model, messages, max_tokens, sink));
                stream
            }
            Route::Remote { config, request } => {
                let (sink, stream) = ChatStream::channel();
                runtime.spawn(run_remote(config, request, sink));
                stream
            }
        }
    }

    /// Generation runs to completion; dropping the stream stops delivery.
    pub fn cancel(&self) {}

    fn route(&self, conversation: &ChatConversation, config: BackendConfig) -> Route {
        if conversation.messages.is_empty() {
            return Route::Immediate(ChatChunk::done());
        }

        if config.backend == BackendKind::Local {
            if let Some(path) = config.model_path.as_deref() {
                return match self.local_state(path, &config) {
                    LocalState::Ready(model) => Route::Local {
                        model,
                        messages: build_local_messages(conversation, &config.instructions),
                        max_tokens: config.local_max_tokens(),
                    },
                    LocalState::Loading => Route::Immediate(ChatChunk::error(
                        "Model is still loading. Try again in a moment.",
                    )),
                    LocalState::Failed(e) => {
                        Route::Immediate(ChatChunk::error(format!("Model failed to load: {}", e)))
                    }
                };
            }
        }

        match RemoteRequest::from_conversation(conversation, &config) {
            Some(request) => Route::Remote { config, request },
            None => Route::Immediate(ChatChunk::done()),
        }
    }

    /// Served handle, load error, or loading. Starts a load when nothing has
    /// been requested yet. A configured file that has gone missing fails
    /// even while an earlier model is still loaded.
    fn local_state(&self, path: &Path, config: &BackendConfig) -> LocalState {
        if !path.is_file() {
            return LocalState::Failed(LoadError::NotAFile(path.to_path_buf()).to_string());
        }
        if let Some(model) = self.loader.get_handle() {
            return LocalState::Ready(model);
        }
        if let Some(error) = self.loader.get_error() {
            return LocalState::Failed(error);
        }
        if self.loader.is_loading() {
            return LocalState::Loading;
        }

        match self.loader.start_background_load(
            path,
            &config.chat_format,
            &Value::from(config.context_window),
        ) {
            Ok(_) | Err(LoadError::AlreadyLoading) => LocalState::Loading,
            Err(e) => LocalState::Failed(e.to_string()),
        }
    }
}
