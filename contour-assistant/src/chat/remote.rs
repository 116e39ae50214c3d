// Remote completion path - hosted APIs and OpenAI-compatible endpoints
// Responses are streamed as server-sent events and forwarded chunk by chunk

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};

use super::{with_context, ChatChunk, ChatConversation, ChatMessage, ChunkSink, ConversationMessage, Role};
use crate::config::{BackendConfig, DEFAULT_INSTRUCTIONS};
use crate::error::ChatError;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Anthropic requires max_tokens on every request
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 2048;
/// Key sent to custom endpoints that do not check one
const PLACEHOLDER_API_KEY: &str = "not-needed";

/// Remote provider, selected by the prefix of the model identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
    Groq,
    OpenRouter,
    Ollama,
    /// OpenAI-compatible server at the configured base URL
    Custom,
}

impl Provider {
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.trim().to_lowercase().as_str() {
            "openai" => Some(Self::OpenAI),
            "anthropic" | "claude" => Some(Self::Anthropic),
            "groq" => Some(Self::Groq),
            "openrouter" => Some(Self::OpenRouter),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAI => "OpenAI",
            Self::Anthropic => "Anthropic",
            Self::Groq => "Groq",
            Self::OpenRouter => "OpenRouter",
            Self::Ollama => "Ollama",
            Self::Custom => "Custom OpenAI",
        }
    }

    /// Conventional environment variable holding this provider's key
    pub fn key_env_var(&self) -> Option<&'static str> {
        match self {
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::Groq => Some("GROQ_API_KEY"),
            Self::OpenRouter => Some("OPENROUTER_API_KEY"),
            Self::Ollama | Self::Custom => None,
        }
    }

    fn default_endpoint(&self) -> &'static str {
        match self {
            Self::OpenAI => "https://api.openai.com/v1/chat/completions",
            Self::Anthropic => "https://api.anthropic.com/v1/messages",
            Self::Groq => "https://api.groq.com/openai/v1/chat/completions",
            Self::OpenRouter => "https://openrouter.ai/api/v1/chat/completions",
            Self::Ollama => "http://localhost:11434/v1/chat/completions",
            Self::Custom => "",
        }
    }
}

/// Where and as whom a remote request is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub provider: Provider,
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl RemoteTarget {
    /// Resolve provider, endpoint and key from the configured options.
    pub fn from_config(config: &BackendConfig) -> Result<Self, ChatError> {
        if let Some(base_url) = &config.base_url {
            let model = match split_model(&config.model) {
                Ok((Some(_), name)) => name.to_string(),
                _ => config.model.clone(),
            };
            return Ok(Self {
                provider: Provider::Custom,
                model: if model.is_empty() { "local".to_string() } else { model },
                endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
                api_key: Some(
                    config
                        .api_key
                        .clone()
                        .unwrap_or_else(|| PLACEHOLDER_API_KEY.to_string()),
                ),
            });
        }

        let (provider, model) = match split_model(&config.model)? {
            (Some(provider), name) => (provider, name.to_string()),
            (None, name) => (Provider::OpenAI, name.to_string()),
        };
        if model.is_empty() {
            return Err(ChatError::UnknownProvider(config.model.clone()));
        }
        let api_key = resolve_api_key(provider, config.api_key.as_deref());
        if api_key.is_none() && provider != Provider::Ollama {
            return Err(ChatError::MissingCredential(provider.name()));
        }
        Ok(Self {
            provider,
            model,
            endpoint: provider.default_endpoint().to_string(),
            api_key,
        })
    }
}

/// "provider:model" → (provider, model); a bare name has no provider.
fn split_model(model: &str) -> Result<(Option<Provider>, &str), ChatError> {
    let model = model.trim();
    match model.split_once(':') {
        Some((prefix, name)) => match Provider::from_prefix(prefix) {
            Some(provider) => Ok((Some(provider), name.trim())),
            None => Err(ChatError::UnknownProvider(prefix.to_string())),
        },
        None => Ok((None, model)),
    }
}

/// Configured secret, else the provider's environment variable.
pub fn resolve_api_key(provider: Provider, configured: Option<&str>) -> Option<String> {
    configured
        .map(str::to_string)
        .or_else(|| {
            provider
                .key_env_var()
                .and_then(|var| std::env::var(var).ok())
        })
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

/// True when the target needs an API key and none is configured or
/// exported. Unknown providers report false and fail later during setup.
pub fn missing_credential(config: &BackendConfig) -> bool {
    if config.api_key.is_some() || config.base_url.is_some() {
        return false;
    }
    match split_model(&config.model) {
        Ok((Some(Provider::Ollama), _)) => false,
        Ok((provider, _)) => resolve_api_key(provider.unwrap_or(Provider::OpenAI), None).is_none(),
        Err(_) => false,
    }
}

/// One remote completion: system text, prior turns, and the new prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
    pub system: String,
    pub history: Vec<ChatMessage>,
    pub prompt: String,
    /// 0 leaves the limit to the provider
    pub max_tokens: u32,
}

impl RemoteRequest {
    /// The latest message becomes the prompt (with context prepended); the
    /// earlier ones become history.
    pub fn from_conversation(conversation: &ChatConversation, config: &BackendConfig) -> Option<Self> {
        let (last, earlier) = conversation.messages.split_last()?;
        let prompt = match conversation.context_text() {
            Some(context) => with_context(context, &last.content),
            None => last.content.clone(),
        };
        let system = if config.instructions.is_empty() {
            DEFAULT_INSTRUCTIONS.to_string()
        } else {
            config.instructions.clone()
        };
        Some(Self {
            system,
            history: build_message_history(earlier).unwrap_or_default(),
            prompt,
            max_tokens: config.max_tokens,
        })
    }

    fn openai_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::new(Role::System, self.system.as_str()));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::new(Role::User, self.prompt.as_str()));
        messages
    }

    fn anthropic_messages(&self) -> Vec<ChatMessage> {
        let mut messages = self.history.clone();
        messages.push(ChatMessage::new(Role::User, self.prompt.as_str()));
        messages
    }
}

/// Prior turns as request/response messages. System turns and empty
/// assistant turns are skipped; `None` when nothing is left.
pub fn build_message_history(messages: &[ConversationMessage]) -> Option<Vec<ChatMessage>> {
    let history: Vec<ChatMessage> = messages
        .iter()
        .filter_map(|m| match m.role.as_str() {
            "user" => Some(ChatMessage::new(Role::User, m.content.as_str())),
            "assistant" if !m.content.is_empty() => Some(ChatMessage::new(Role::Assistant, m.content.as_str())),
            _ => None,
        })
        .collect();
    if history.is_empty() {
        None
    } else {
        Some(history)
    }
}

// OpenAI-compatible streaming request
#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

// Anthropic messages API streaming request
#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    ContentBlockDelta { delta: AnthropicDelta },
    MessageStop,
    Error { error: AnthropicError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(default)]
    message: String,
}

/// What one server-sent event contributes to the response
#[derive(Debug, PartialEq, Eq)]
enum StreamEvent {
    Text(String),
    Done,
    Skip,
}

fn parse_openai_event(data: &str) -> Result<StreamEvent, ChatError> {
    if data == "[DONE]" {
        return Ok(StreamEvent::Done);
    }
    let chunk: OpenAiChunk = serde_json::from_str(data).map_err(|e| ChatError::Stream(e.to_string()))?;
    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(ChatError::Stream(message));
    }
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    Ok(if text.is_empty() {
        StreamEvent::Skip
    } else {
        StreamEvent::Text(text)
    })
}

fn parse_anthropic_event(data: &str) -> Result<StreamEvent, ChatError> {
    let event: AnthropicEvent = serde_json::from_str(data).map_err(|e| ChatError::Stream(e.to_string()))?;
    match event {
        AnthropicEvent::ContentBlockDelta { delta } => Ok(match delta.text {
            Some(text) if !text.is_empty() => StreamEvent::Text(text),
            _ => StreamEvent::Skip,
        }),
        AnthropicEvent::MessageStop => Ok(StreamEvent::Done),
        AnthropicEvent::Error { error } => Err(ChatError::Stream(error.message)),
        AnthropicEvent::Other => Ok(StreamEvent::Skip),
    }
}

/// Splits a byte stream into the payloads of `data:` lines.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(data) = line.trim_end_matches(&['\r', '\n'][..]).strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

/// HTTP client bound to one resolved target
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: Client,
    target: RemoteTarget,
}

impl RemoteClient {
    /// Resolve the target and build the HTTP client; any failure here is a
    /// setup problem rather than a request failure.
    pub fn new(config: &BackendConfig) -> Result<Self, ChatError> {
        let target = RemoteTarget::from_config(config)?;
        let http = Client::builder()
            .use_rustls_tls()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(ChatError::Client)?;
        Ok(Self { http, target })
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn headers(&self) -> Result<header::HeaderMap, ChatError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("text/event-stream"));
        match (&self.target.provider, &self.target.api_key) {
            (Provider::Anthropic, Some(key)) => {
                headers.insert("x-api-key", key.parse()?);
                headers.insert("anthropic-version", header::HeaderValue::from_static(ANTHROPIC_VERSION));
            }
            (_, Some(key)) => {
                headers.insert(header::AUTHORIZATION, format!("Bearer {}", key).parse()?);
            }
            (_, None) => {}
        }
        Ok(headers)
    }

    /// Stream the completion into `sink`, one chunk per non-empty text
    /// increment. Stops early, without error, when the consumer goes away.
    pub(crate) async fn stream_into(&self, request: &RemoteRequest, sink: &ChunkSink) -> Result<(), ChatError> {
        let anthropic = self.target.provider == Provider::Anthropic;
        let body = if anthropic {
            serde_json::to_value(AnthropicRequest {
                model: &self.target.model,
                system: &request.system,
                messages: request.anthropic_messages(),
                max_tokens: if request.max_tokens > 0 {
                    request.max_tokens
                } else {
                    ANTHROPIC_DEFAULT_MAX_TOKENS
                },
                stream: true,
            })
        } else {
            serde_json::to_value(OpenAiRequest {
                model: &self.target.model,
                messages: request.openai_messages(),
                stream: true,
                max_tokens: Some(request.max_tokens).filter(|m| *m > 0),
            })
        };
        let body = body.map_err(|e| ChatError::Stream(e.to_string()))?;

        log::info!(
            "LLM request to {}: model={}",
            self.target.provider.name(),
            self.target.model
        );

        let response = self
            .http
            .post(&self.target.endpoint)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ChatError::Api {
                status,
                body: body.trim().to_string(),
            });
        }

        let mut decoder = SseDecoder::default();
        let mut stream = response.bytes_stream();
        while let Some(bytes) = stream.next().await {
            for data in decoder.push(&bytes?) {
                let event = if anthropic {
                    parse_anthropic_event(&data)?
                } else {
                    parse_openai_event(&data)?
                };
                match event {
                    StreamEvent::Text(text) => {
                        if !sink.send(ChatChunk::text(text)).await {
                            log::debug!("Consumer went away, dropping remote stream");
                            return Ok(());
                        }
                    }
                    StreamEvent::Done => return Ok(()),
                    StreamEvent::Skip => {}
                }
            }
        }
        Ok(())
    }
}

/// Async worker for the remote route. Always finishes the stream with
/// exactly one final chunk.
pub(crate) async fn run_remote(config: BackendConfig, request: RemoteRequest, sink: ChunkSink) {
    let client = match RemoteClient::new(&config) {
        Ok(client) => client,
        Err(e) => {
            log::error!("Remote chat setup failed: {}", e);
            sink.send(ChatChunk::error(format!(
                "Setup error: {}. Check the assistant backend settings.",
                e
            )))
            .await;
            return;
        }
    };

    let last = match client.stream_into(&request, &sink).await {
        Ok(()) => ChatChunk::done(),
        Err(e) => {
            log::error!("Remote chat failed: {}", e);
            ChatChunk::error(format!(
                "Error: {}. Check your model and API key or base URL.",
                e
            ))
        }
    };
    sink.send(last).await;
}
