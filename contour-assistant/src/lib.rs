//! Local model management and chat backend for the Contour assistant.
//!
//! The host provides a [`config::ConfigStore`] and renders [`chat::ChatChunk`]s;
//! everything between (finding and downloading GGUF files, loading them in the
//! background, routing completions to the local model or a remote API) lives
//! here.

pub mod assistant;
pub mod catalog;
pub mod chat;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod loader;
pub mod model_store;

#[cfg(test)]
mod test_support;

pub use assistant::{ensure_local_model_configured, Assistant};
pub use chat::{ChatBridge, ChatChunk, ChatConversation, ChatStream, ConversationMessage};
pub use config::{BackendConfig, ConfigStore, JsonFileConfig, MemoryConfig};
pub use downloader::{DownloadProgress, Downloader};
pub use error::{ChatError, ConfigError, DownloadError, LoadError, ReadinessError};
pub use loader::{LoadStatus, ModelLoader};
pub use model_store::{ModelArtifact, ModelStore};
