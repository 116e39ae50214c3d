// Bridge between the model loader and the in-process llama engine

use std::sync::Arc;

use crate::loader::{LoadRequest, ModelFactory};

/// Factory used when nothing else is injected.
pub fn default_factory() -> Arc<dyn ModelFactory> {
    #[cfg(feature = "llama")]
    {
        Arc::new(llama::LlamaModelFactory)
    }
    #[cfg(not(feature = "llama"))]
    {
        Arc::new(UnavailableFactory)
    }
}

/// Stands in for the engine in builds without the `llama` feature.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableFactory;

impl ModelFactory for UnavailableFactory {
    fn load(&self, request: &LoadRequest) -> anyhow::Result<Arc<dyn crate::chat::LocalModel>> {
        anyhow::bail!(
            "local inference support is not compiled in; rebuild with the `llama` feature to load {}",
            request.path.display()
        )
    }
}

#[cfg(feature = "llama")]
pub use llama::{LlamaChatModel, LlamaModelFactory};

#[cfg(feature = "llama")]
mod llama {
    use std::sync::Arc;

    use llama_engine::{GenerateParams, LlamaEngine};

    use crate::chat::{ChatFormat, ChatMessage, LocalModel, StopFilter};
    use crate::loader::{LoadRequest, ModelFactory};

    /// A loaded GGUF model plus the prompt format it expects
    pub struct LlamaChatModel {
        engine: LlamaEngine,
        format: ChatFormat,
        params: GenerateParams,
    }

    impl LlamaChatModel {
        pub fn new(engine: LlamaEngine, format: ChatFormat) -> Self {
            Self {
                engine,
                format,
                params: GenerateParams::default(),
            }
        }
    }

    impl LocalModel for LlamaChatModel {
        fn stream_chat(
            &self,
            messages: &[ChatMessage],
            max_tokens: u32,
            on_delta: &mut dyn FnMut(&str) -> bool,
        ) -> anyhow::Result<()> {
            let prompt = self.format.render(messages);
            let mut filter = StopFilter::new(self.format.stop_sequences());
            let params = GenerateParams {
                max_tokens,
                ..self.params.clone()
            };

            let mut listening = true;
            self.engine.generate(&prompt, &params, |piece| {
                let out = filter.push(piece);
                if !out.is_empty() {
                    listening = on_delta(&out);
                }
                listening && !filter.is_stopped()
            })?;

            let tail = filter.finish();
            if listening && !tail.is_empty() {
                on_delta(&tail);
            }
            Ok(())
        }
    }

    /// Loads models through llama.cpp
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LlamaModelFactory;

    impl ModelFactory for LlamaModelFactory {
        fn load(&self, request: &LoadRequest) -> anyhow::Result<Arc<dyn LocalModel>> {
            let engine = LlamaEngine::load(&request.path, request.context_window)?;
            Ok(Arc::new(LlamaChatModel::new(engine, request.chat_format)))
        }
    }
}
