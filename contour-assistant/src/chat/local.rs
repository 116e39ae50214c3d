// Local completion path - drives an in-process model handle directly

use std::sync::Arc;

use super::{with_context, ChatChunk, ChatConversation, ChatMessage, ChunkSink, Role};

/// An inference-capable model loaded into this process.
pub trait LocalModel: Send + Sync {
    /// Stream a chat completion for `messages`, producing at most
    /// `max_tokens` tokens. `on_delta` returns false once nobody is listening,
    /// and implementations should stop generating at that point.
    fn stream_chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        on_delta: &mut dyn FnMut(&str) -> bool,
    ) -> anyhow::Result<()>;
}

/// Role-tagged message list for the local model: instructions first, one
/// entry per conversation message, context prepended to a trailing user turn.
pub fn build_local_messages(conversation: &ChatConversation, instructions: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(conversation.messages.len() + 1);
    if !instructions.is_empty() {
        messages.push(ChatMessage::new(Role::System, instructions));
    }
    messages.extend(
        conversation
            .messages
            .iter()
            .map(|m| ChatMessage::new(Role::coerce(&m.role), m.content.as_str())),
    );

    if let Some(context) = conversation.context_text() {
        if let Some(last) = messages.last_mut().filter(|m| m.role == Role::User) {
            last.content = with_context(context, &last.content);
        }
    }
    messages
}

/// Blocking worker: run the completion and forward deltas into `sink`.
pub(crate) fn run_local(model: Arc<dyn LocalModel>, messages: Vec<ChatMessage>, max_tokens: u32, sink: ChunkSink) {
    let mut listening = true;
    let result = model.stream_chat(&messages, max_tokens, &mut |delta: &str| {
        if !delta.is_empty() && listening {
            listening = sink.blocking_send(ChatChunk::text(delta));
        }
        listening
    });

    let last = match result {
        Ok(()) => ChatChunk::done(),
        Err(e) => {
            log::error!("Local chat failed: {:#}", e);
            ChatChunk::error(format!("Error: {}. See frontend.log for details.", e))
        }
    };
    if !sink.blocking_send(last) {
        log::debug!("Local chat finished after the consumer went away");
    }
}
