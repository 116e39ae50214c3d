// Prompt templates for in-process chat models
// Each GGUF family expects its own turn markers and stop sequences

use std::fmt;

use super::{ChatMessage, Role};

/// Turn layout of a model family, selected by the chat-format option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatFormat {
    Llama2,
    Llama3,
    ChatMl,
    MistralInstruct,
    Zephyr,
    Alpaca,
    Gemma,
}

impl ChatFormat {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "llama-2" | "llama2" => Some(Self::Llama2),
            "llama-3" | "llama3" => Some(Self::Llama3),
            "chatml" | "qwen" => Some(Self::ChatMl),
            "mistral-instruct" | "mistral" => Some(Self::MistralInstruct),
            "zephyr" => Some(Self::Zephyr),
            "alpaca" => Some(Self::Alpaca),
            "gemma" | "gemma3" => Some(Self::Gemma),
            _ => None,
        }
    }

    /// Like [`ChatFormat::from_tag`], falling back to llama-2.
    pub fn from_tag_or_default(tag: &str) -> Self {
        Self::from_tag(tag).unwrap_or_else(|| {
            log::warn!("Unknown chat format '{}', using llama-2", tag);
            Self::Llama2
        })
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Llama2 => "llama-2",
            Self::Llama3 => "llama-3",
            Self::ChatMl => "chatml",
            Self::MistralInstruct => "mistral-instruct",
            Self::Zephyr => "zephyr",
            Self::Alpaca => "alpaca",
            Self::Gemma => "gemma",
        }
    }

    pub fn stop_sequences(&self) -> &'static [&'static str] {
        match self {
            Self::Llama2 => &["</s>", "[INST]"],
            Self::Llama3 => &["<|eot_id|>", "<|start_header_id|>"],
            Self::ChatMl => &["<|im_end|>", "<|im_start|>"],
            Self::MistralInstruct => &["</s>", "[INST]"],
            Self::Zephyr => &["</s>", "<|user|>"],
            Self::Alpaca => &["### Instruction:"],
            Self::Gemma => &["<end_of_turn>", "<start_of_turn>"],
        }
    }

    /// Render a message list into a prompt that ends where the assistant's
    /// reply should begin.
    pub fn render(&self, messages: &[ChatMessage]) -> String {
        match self {
            Self::ChatMl => render_tagged(messages, |role, content| {
                format!("<|im_start|>{}\n{}<|im_end|>\n", role.as_str(), content)
            }) + "<|im_start|>assistant\n",
            Self::Llama3 => render_tagged(messages, |role, content| {
                format!(
                    "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                    role.as_str(),
                    content
                )
            }) + "<|start_header_id|>assistant<|end_header_id|>\n\n",
            Self::Zephyr => render_tagged(messages, |role, content| {
                format!("<|{}|>\n{}</s>\n", role.as_str(), content)
            }) + "<|assistant|>\n",
            Self::Llama2 => render_inst(messages, |system| format!("<<SYS>>\n{}\n<</SYS>>\n\n", system), " </s>"),
            Self::MistralInstruct => render_inst(messages, |system| format!("{}\n\n", system), "</s>"),
            Self::Alpaca => render_alpaca(messages),
            Self::Gemma => render_gemma(messages),
        }
    }
}

impl fmt::Display for ChatFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

fn render_tagged(messages: &[ChatMessage], turn: impl Fn(Role, &str) -> String) -> String {
    messages.iter().map(|m| turn(m.role, &m.content)).collect()
}

/// `[INST]` families: system text is folded into the first user turn.
fn render_inst(messages: &[ChatMessage], system_block: impl Fn(&str) -> String, eos: &str) -> String {
    let system = joined_system(messages);
    let mut prompt = String::new();
    let mut first_user = true;
    for message in messages {
        match message.role {
            Role::System => {}
            Role::User => {
                prompt.push_str("[INST] ");
                if first_user && !system.is_empty() {
                    prompt.push_str(&system_block(&system));
                }
                first_user = false;
                prompt.push_str(&message.content);
                prompt.push_str(" [/INST]");
            }
            Role::Assistant => {
                prompt.push(' ');
                prompt.push_str(&message.content);
                prompt.push_str(eos);
            }
        }
    }
    prompt
}

fn render_alpaca(messages: &[ChatMessage]) -> String {
    let system = joined_system(messages);
    let mut prompt = String::new();
    if !system.is_empty() {
        prompt.push_str(&system);
        prompt.push_str("\n\n");
    }
    for message in messages {
        match message.role {
            Role::System => {}
            Role::User => {
                prompt.push_str("### Instruction:\n");
                prompt.push_str(&message.content);
                prompt.push_str("\n\n");
            }
            Role::Assistant => {
                prompt.push_str("### Response:\n");
                prompt.push_str(&message.content);
                prompt.push_str("\n\n");
            }
        }
    }
    prompt.push_str("### Response:\n");
    prompt
}

/// Gemma has no system role; instructions travel as a leading user turn.
fn render_gemma(messages: &[ChatMessage]) -> String {
    let system = joined_system(messages);
    let mut prompt = String::new();
    if !system.is_empty() {
        prompt.push_str(&format!("<start_of_turn>user\n{}<end_of_turn>\n", system));
    }
    for message in messages {
        let role = match message.role {
            Role::System => continue,
            Role::User => "user",
            Role::Assistant => "model",
        };
        prompt.push_str(&format!("<start_of_turn>{}\n{}<end_of_turn>\n", role, message.content));
    }
    prompt.push_str("<start_of_turn>model\n");
    prompt
}

fn joined_system(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Holds back streamed text that could be the start of a stop sequence, so
/// a marker split across tokens never reaches the consumer.
#[derive(Debug)]
pub struct StopFilter {
    stops: Vec<String>,
    held: String,
    stopped: bool,
}

impl StopFilter {
    pub fn new<S: AsRef<str>>(stops: &[S]) -> Self {
        Self {
            stops: stops
                .iter()
                .map(|s| s.as_ref().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            held: String::new(),
            stopped: false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Feed one piece; returns the text that is safe to emit now.
    pub fn push(&mut self, piece: &str) -> String {
        if self.stopped {
            return String::new();
        }
        self.held.push_str(piece);

        if let Some(pos) = self
            .stops
            .iter()
            .filter_map(|stop| self.held.find(stop.as_str()))
            .min()
        {
            self.stopped = true;
            let out = self.held[..pos].to_string();
            self.held.clear();
            return out;
        }

        let split = self.held.len() - self.partial_suffix_len();
        self.held.drain(..split).collect()
    }

    /// Release whatever is still held back at the end of generation.
    pub fn finish(&mut self) -> String {
        if self.stopped {
            String::new()
        } else {
            std::mem::take(&mut self.held)
        }
    }

    fn partial_suffix_len(&self) -> usize {
        let mut longest = 0;
        for stop in &self.stops {
            for len in (1..stop.len()).rev() {
                if len <= longest {
                    break;
                }
                if stop.is_char_boundary(len) && self.held.ends_with(&stop[..len]) {
                    longest = len;
                    break;
                }
            }
        }
        longest
    }
}
