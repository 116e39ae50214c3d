//! Named assistant options and the key-value stores they live in.
//!
//! The host owns persistence. This module only knows option names, their
//! defaults, and how to read a consistent snapshot for one chat request.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

pub const BACKEND_OPTION: &str = "assistant.backend";
pub const MODEL_OPTION: &str = "assistant.model";
pub const BASE_URL_OPTION: &str = "assistant.base_url";
pub const LLAMA_MODEL_PATH_OPTION: &str = "assistant.llama_model_path";
pub const LLAMA_CHAT_FORMAT_OPTION: &str = "assistant.llama_chat_format";
pub const LLAMA_N_CTX_OPTION: &str = "assistant.llama_n_ctx";
pub const MAX_TOKENS_OPTION: &str = "assistant.max_tokens";
pub const THINKING_OPTION: &str = "assistant.thinking";
pub const INSTRUCTIONS_OPTION: &str = "assistant.instructions";
pub const API_KEY_SECRET: &str = "assistant_api_key";

pub const DEFAULT_MODEL: &str = "openai:gpt-4o-mini";
pub const DEFAULT_CHAT_FORMAT: &str = "llama-2";
pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful programming coach. Be concise and clear.";

pub const DEFAULT_CONTEXT_WINDOW: u32 = 4096;
pub const MIN_CONTEXT_WINDOW: u32 = 512;
pub const MAX_CONTEXT_WINDOW: u32 = 65536;

/// Response cap for local generation when `max_tokens` is 0
pub const DEFAULT_LOCAL_MAX_TOKENS: u32 = 2048;

/// Generic host key-value store for options and secrets.
pub trait ConfigStore: Send + Sync {
    fn get_option(&self, key: &str) -> Option<Value>;
    fn set_option(&self, key: &str, value: Value) -> Result<(), ConfigError>;
    fn get_secret(&self, key: &str) -> Option<String>;
    fn set_secret(&self, key: &str, value: &str) -> Result<(), ConfigError>;

    /// String option, trimmed; empty when unset.
    fn get_string(&self, key: &str) -> String {
        match self.get_option(key) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    /// Secret with empty values treated as absent.
    fn get_nonempty_secret(&self, key: &str) -> Option<String> {
        self.get_secret(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ConfigData {
    #[serde(default)]
    options: BTreeMap<String, Value>,
    #[serde(default)]
    secrets: BTreeMap<String, String>,
}

/// In-memory store, for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryConfig {
    data: RwLock<ConfigData>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfig {
    fn get_option(&self, key: &str) -> Option<Value> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.options.get(key).cloned()
    }

    fn set_option(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.options.insert(key.to_string(), value);
        Ok(())
    }

    fn get_secret(&self, key: &str) -> Option<String> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.secrets.get(key).cloned()
    }

    fn set_secret(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.secrets.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// JSON file store. Every write rewrites the whole file.
#[derive(Debug)]
pub struct JsonFileConfig {
    path: PathBuf,
    data: RwLock<ConfigData>,
}

impl JsonFileConfig {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => ConfigData::default(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigData::default(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        log::debug!("Loaded assistant configuration from {}", path.display());
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, data: &ConfigData) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl ConfigStore for JsonFileConfig {
    fn get_option(&self, key: &str) -> Option<Value> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.options.get(key).cloned()
    }

    fn set_option(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.options.insert(key.to_string(), value);
        self.persist(&data)
    }

    fn get_secret(&self, key: &str) -> Option<String> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.secrets.get(key).cloned()
    }

    fn set_secret(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.secrets.insert(key.to_string(), value.to_string());
        self.persist(&data)
    }
}

/// Write every default that is not already present.
pub fn register_defaults(store: &dyn ConfigStore) -> Result<(), ConfigError> {
    let defaults: [(&str, Value); 9] = [
        (BACKEND_OPTION, Value::from(BackendKind::Remote.as_str())),
        (MODEL_OPTION, Value::from(DEFAULT_MODEL)),
        (BASE_URL_OPTION, Value::from("")),
        (LLAMA_MODEL_PATH_OPTION, Value::from("")),
        (LLAMA_CHAT_FORMAT_OPTION, Value::from(DEFAULT_CHAT_FORMAT)),
        (LLAMA_N_CTX_OPTION, Value::from(DEFAULT_CONTEXT_WINDOW)),
        (MAX_TOKENS_OPTION, Value::from(0)),
        (THINKING_OPTION, Value::from("")),
        (INSTRUCTIONS_OPTION, Value::from(DEFAULT_INSTRUCTIONS)),
    ];
    for (key, value) in defaults {
        if store.get_option(key).is_none() {
            store.set_option(key, value)?;
        }
    }
    Ok(())
}

/// Which completion backend serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process GGUF model
    Local,
    /// Hosted API or OpenAI-compatible endpoint
    Remote,
}

impl BackendKind {
    /// Anything other than "local" selects the remote backend.
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("local") {
            Self::Local
        } else {
            Self::Remote
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "api",
        }
    }
}

/// Clamp a configured context window into the supported range.
///
/// Non-numeric input yields the default of 4096 tokens.
pub fn normalize_context_window(value: &Value) -> u32 {
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) => n.clamp(MIN_CONTEXT_WINDOW as i64, MAX_CONTEXT_WINDOW as i64) as u32,
        None => DEFAULT_CONTEXT_WINDOW,
    }
}

/// Max response tokens; 0 means "provider default".
pub fn normalize_max_tokens(value: &Value) -> u32 {
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed
        .filter(|n| *n > 0)
        .map(|n| n.min(u32::MAX as i64) as u32)
        .unwrap_or(0)
}

/// Instructions followed by the optional scratchpad text.
pub fn system_instructions(instructions: &str, thinking: &str) -> String {
    let thinking = thinking.trim();
    if thinking.is_empty() {
        instructions.to_string()
    } else {
        format!("{}\n\n{}", instructions, thinking).trim().to_string()
    }
}

/// Snapshot of every option one chat request depends on.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub backend: BackendKind,
    pub model: String,
    pub base_url: Option<String>,
    pub model_path: Option<PathBuf>,
    pub chat_format: String,
    pub context_window: u32,
    pub max_tokens: u32,
    /// Instructions plus thinking text; may be empty
    pub instructions: String,
    pub api_key: Option<String>,
}

impl BackendConfig {
    pub fn read(store: &dyn ConfigStore) -> Self {
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };

        let backend = match store.get_option(BACKEND_OPTION) {
            Some(Value::String(s)) => BackendKind::parse(&s),
            _ => BackendKind::Remote,
        };
        let model = match store.get_option(MODEL_OPTION) {
            None => DEFAULT_MODEL.to_string(),
            Some(_) => store.get_string(MODEL_OPTION),
        };
        let chat_format =
            non_empty(store.get_string(LLAMA_CHAT_FORMAT_OPTION)).unwrap_or_else(|| DEFAULT_CHAT_FORMAT.to_string());
        let context_window = store
            .get_option(LLAMA_N_CTX_OPTION)
            .map(|v| normalize_context_window(&v))
            .unwrap_or(DEFAULT_CONTEXT_WINDOW);
        let max_tokens = store
            .get_option(MAX_TOKENS_OPTION)
            .map(|v| normalize_max_tokens(&v))
            .unwrap_or(0);

        Self {
            backend,
            model,
            base_url: non_empty(store.get_string(BASE_URL_OPTION)),
            model_path: non_empty(store.get_string(LLAMA_MODEL_PATH_OPTION)).map(PathBuf::from),
            chat_format,
            context_window,
            max_tokens,
            instructions: system_instructions(
                &store.get_string(INSTRUCTIONS_OPTION),
                &store.get_string(THINKING_OPTION),
            ),
            api_key: store.get_nonempty_secret(API_KEY_SECRET),
        }
    }

    /// Max tokens for the in-process model.
    pub fn local_max_tokens(&self) -> u32 {
        if self.max_tokens > 0 {
            self.max_tokens
        } else {
            DEFAULT_LOCAL_MAX_TOKENS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_window_normalization() {
        assert_eq!(normalize_context_window(&json!(0)), 512);
        assert_eq!(normalize_context_window(&json!(-5)), 512);
        assert_eq!(normalize_context_window(&json!("abc")), 4096);
        assert_eq!(normalize_context_window(&json!(999999)), 65536);
        assert_eq!(normalize_context_window(&json!(8192)), 8192);
        assert_eq!(normalize_context_window(&json!(" 2048 ")), 2048);
        assert_eq!(normalize_context_window(&json!(null)), 4096);
        assert_eq!(normalize_context_window(&json!(1024.7)), 1024);
    }

    #[test]
    fn max_tokens_normalization() {
        assert_eq!(normalize_max_tokens(&json!(0)), 0);
        assert_eq!(normalize_max_tokens(&json!(-3)), 0);
        assert_eq!(normalize_max_tokens(&json!("x")), 0);
        assert_eq!(normalize_max_tokens(&json!("512")), 512);
        assert_eq!(normalize_max_tokens(&json!(300)), 300);
    }

    #[test]
    fn thinking_is_appended_to_instructions() {
        assert_eq!(system_instructions("Be brief.", ""), "Be brief.");
        assert_eq!(
            system_instructions("Be brief.", "  Think first. "),
            "Be brief.\n\nThink first."
        );
        assert_eq!(system_instructions("", "Think first."), "Think first.");
    }

    #[test]
    fn backend_kind_parse() {
        assert_eq!(BackendKind::parse("local"), BackendKind::Local);
        assert_eq!(BackendKind::parse(" LOCAL "), BackendKind::Local);
        assert_eq!(BackendKind::parse("api"), BackendKind::Remote);
        assert_eq!(BackendKind::parse("something"), BackendKind::Remote);
    }

    #[test]
    fn defaults_do_not_override_existing_values() {
        let store = MemoryConfig::new();
        store.set_option(MODEL_OPTION, json!("groq:llama3")).unwrap();
        register_defaults(&store).unwrap();

        assert_eq!(store.get_string(MODEL_OPTION), "groq:llama3");
        assert_eq!(store.get_string(BACKEND_OPTION), "api");
        assert_eq!(store.get_option(LLAMA_N_CTX_OPTION), Some(json!(4096)));
        assert_eq!(store.get_string(INSTRUCTIONS_OPTION), DEFAULT_INSTRUCTIONS);
    }

    #[test]
    fn backend_config_snapshot() {
        let store = MemoryConfig::new();
        register_defaults(&store).unwrap();
        store.set_option(BACKEND_OPTION, json!("local")).unwrap();
        store.set_option(LLAMA_N_CTX_OPTION, json!("abc")).unwrap();
        store.set_option(LLAMA_CHAT_FORMAT_OPTION, json!("")).unwrap();
        store.set_option(THINKING_OPTION, json!("Plan before answering.")).unwrap();
        store.set_secret(API_KEY_SECRET, "  ").unwrap();

        let config = BackendConfig::read(&store);
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.base_url, None);
        assert_eq!(config.model_path, None);
        assert_eq!(config.chat_format, DEFAULT_CHAT_FORMAT);
        assert_eq!(config.context_window, 4096);
        assert_eq!(config.local_max_tokens(), DEFAULT_LOCAL_MAX_TOKENS);
        assert_eq!(config.api_key, None);
        assert!(config.instructions.ends_with("\n\nPlan before answering."));
    }

    #[test]
    fn json_file_config_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("assistant.json");

        let store = JsonFileConfig::open(&path).unwrap();
        store.set_option(BASE_URL_OPTION, json!("http://localhost:8080/v1")).unwrap();
        store.set_secret(API_KEY_SECRET, "sk-test").unwrap();

        let reopened = JsonFileConfig::open(&path).unwrap();
        assert_eq!(reopened.get_string(BASE_URL_OPTION), "http://localhost:8080/v1");
        assert_eq!(reopened.get_nonempty_secret(API_KEY_SECRET).as_deref(), Some("sk-test"));
    }

    #[test]
    fn json_file_config_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assistant.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(JsonFileConfig::open(&path), Err(ConfigError::Json(_))));
    }
}
