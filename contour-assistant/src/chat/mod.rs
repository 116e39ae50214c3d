//! Chat types shared by the local and remote completion paths, and the
//! streaming contract both are normalized into.

pub mod bridge;
pub mod format;
pub mod local;
pub mod remote;

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use bridge::{ChatBridge, CredentialPrompt, NoPrompt};
pub use format::{ChatFormat, StopFilter};
pub use local::LocalModel;

/// Roles understood by the completion backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }

    /// Unrecognized roles are sent as user turns.
    pub fn coerce(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::User)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message as the host recorded it. The role is free-form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
}

impl ConversationMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A conversation plus optional supplementary context (e.g. repository status)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatConversation {
    pub messages: Vec<ConversationMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ChatConversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn push(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.messages.push(ConversationMessage::new(role, content));
    }

    /// Context text, if there is any worth sending
    pub fn context_text(&self) -> Option<&str> {
        self.context.as_deref().filter(|c| !c.trim().is_empty())
    }
}

/// Prefix `content` with the supplementary context block.
pub fn with_context(context: &str, content: &str) -> String {
    format!("Current git context:\n{}\n\n---\n\n{}", context, content)
}

/// A message as sent to a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One increment of a streamed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatChunk {
    pub text: String,
    pub is_final: bool,
    pub is_internal_error: bool,
}

impl ChatChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            is_internal_error: false,
        }
    }

    /// Empty terminal marker
    pub fn done() -> Self {
        Self {
            text: String::new(),
            is_final: true,
            is_internal_error: false,
        }
    }

    /// Terminal chunk carrying a user-facing error message
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            is_final: true,
            is_internal_error: true,
        }
    }
}

/// Capacity of the chunk channel between a worker and its consumer
const CHUNK_BUFFER: usize = 64;

/// Producer half handed to a completion worker.
#[derive(Debug, Clone)]
pub(crate) struct ChunkSink {
    tx: mpsc::Sender<ChatChunk>,
}

impl ChunkSink {
    /// Returns false once the consumer has gone away.
    pub async fn send(&self, chunk: ChatChunk) -> bool {
        self.tx.send(chunk).await.is_ok()
    }

    /// For blocking workers (local inference).
    pub fn blocking_send(&self, chunk: ChatChunk) -> bool {
        self.tx.blocking_send(chunk).is_ok()
    }
}

/// Result of a non-blocking poll on a [`ChatStream`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryNext {
    Chunk(ChatChunk),
    /// Nothing available yet
    Pending,
    /// The final chunk has been delivered
    Finished,
}

/// Finite, non-restartable sequence of chunks ending with exactly one final chunk.
///
/// Async consumers use it as a [`Stream`]; an event loop that must not block
/// polls it with [`ChatStream::try_next`].
#[derive(Debug)]
pub struct ChatStream {
    rx: mpsc::Receiver<ChatChunk>,
    finished: bool,
}

impl ChatStream {
    pub(crate) fn channel() -> (ChunkSink, ChatStream) {
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        (
            ChunkSink { tx },
            ChatStream {
                rx,
                finished: false,
            },
        )
    }

    /// A stream that yields a single final chunk.
    pub fn once(chunk: ChatChunk) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // capacity 1 and a fresh channel: cannot fail
        let _ = tx.try_send(chunk);
        Self {
            rx,
            finished: false,
        }
    }

    pub fn try_next(&mut self) -> TryNext {
        if self.finished {
            return TryNext::Finished;
        }
        match self.rx.try_recv() {
            Ok(chunk) => TryNext::Chunk(self.observe(chunk)),
            Err(mpsc::error::TryRecvError::Empty) => TryNext::Pending,
            Err(mpsc::error::TryRecvError::Disconnected) => TryNext::Chunk(self.observe(abandoned())),
        }
    }

    /// Drain the stream, returning every chunk including the final one.
    pub async fn collect_chunks(mut self) -> Vec<ChatChunk> {
        use futures_util::StreamExt;

        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await {
            chunks.push(chunk);
        }
        chunks
    }

    fn observe(&mut self, chunk: ChatChunk) -> ChatChunk {
        if chunk.is_final {
            self.finished = true;
            self.rx.close();
        }
        chunk
    }
}

/// Stand-in final chunk when a worker exits without finishing its stream
fn abandoned() -> ChatChunk {
    ChatChunk::error("Error: the response ended unexpectedly. See frontend.log for details.")
}

impl Stream for ChatStream {
    type Item = ChatChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(self.observe(chunk))),
            Poll::Ready(None) => {
                log::error!("Chat worker stopped without a final chunk");
                Poll::Ready(Some(self.observe(abandoned())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn roles_are_coerced_to_user() {
        assert_eq!(Role::coerce("assistant"), Role::Assistant);
        assert_eq!(Role::coerce("tool"), Role::User);
        assert_eq!(Role::coerce("System"), Role::User);
    }

    #[test]
    fn context_prefix_comes_first() {
        let text = with_context("Branch: main", "Why does this fail?");
        assert!(text.starts_with("Current git context:\nBranch: main"));
        assert!(text.ends_with("\n\n---\n\nWhy does this fail?"));
    }

    #[test]
    fn blank_context_is_ignored() {
        let conversation = ChatConversation::new().with_context("   ");
        assert_eq!(conversation.context_text(), None);
    }

    #[tokio::test]
    async fn stream_ends_after_final_chunk() {
        let (sink, stream) = ChatStream::channel();
        assert!(sink.send(ChatChunk::text("a")).await);
        assert!(sink.send(ChatChunk::done()).await);
        // anything after the final chunk is never delivered
        let _ = sink.send(ChatChunk::text("late")).await;

        let chunks = stream.collect_chunks().await;
        assert_eq!(chunks, vec![ChatChunk::text("a"), ChatChunk::done()]);
    }

    #[tokio::test]
    async fn dropped_worker_yields_error_chunk() {
        let (sink, mut stream) = ChatStream::channel();
        assert!(sink.send(ChatChunk::text("partial")).await);
        drop(sink);

        assert_eq!(stream.next().await, Some(ChatChunk::text("partial")));
        let last = stream.next().await.unwrap();
        assert!(last.is_final && last.is_internal_error);
        assert_eq!(stream.next().await, None);
    }

    #[test]
    fn try_next_polls_without_blocking() {
        let (sink, mut stream) = ChatStream::channel();
        assert_eq!(stream.try_next(), TryNext::Pending);
        assert!(sink.tx.try_send(ChatChunk::done()).is_ok());
        assert_eq!(stream.try_next(), TryNext::Chunk(ChatChunk::done()));
        assert_eq!(stream.try_next(), TryNext::Finished);
    }

    #[tokio::test]
    async fn once_yields_single_final_chunk() {
        let chunks = ChatStream::once(ChatChunk::error("nope")).collect_chunks().await;
        assert_eq!(chunks, vec![ChatChunk::error("nope")]);
    }
}
