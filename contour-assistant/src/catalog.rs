// Curated GGUF models offered for one-click download
// Add new entries to downloadable_models() - the first entry is the recommended one

use serde::Serialize;

/// A model that can be fetched from Hugging Face
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    /// Name shown to the user, including quantization and rough size
    pub display_name: &'static str,
    /// Hugging Face repository, "owner/name"
    pub repo: &'static str,
    /// File inside the repository
    pub file: &'static str,
}

const DOWNLOADABLE_MODELS: &[CatalogEntry] = &[
    CatalogEntry {
        display_name: "TinyLlama 1.1B Chat (Q4_K_M, ~0.7 GB)",
        repo: "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF",
        file: "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
    },
    CatalogEntry {
        display_name: "Phi-2 (Q4_K_M, ~1.6 GB)",
        repo: "TheBloke/phi-2-GGUF",
        file: "phi-2.Q4_K_M.gguf",
    },
    CatalogEntry {
        display_name: "Qwen2 0.5B Instruct (Q4_K_M, ~0.4 GB)",
        repo: "Qwen/Qwen2-0.5B-Instruct-GGUF",
        file: "qwen2-0.5b-instruct-q4_k_m.gguf",
    },
    CatalogEntry {
        display_name: "SmolLM2 360M Instruct (Q4_K_M, ~0.3 GB)",
        repo: "HuggingFaceTB/SmolLM2-360M-Instruct-GGUF",
        file: "smollm2-360m-instruct-q4_k_m.gguf",
    },
    CatalogEntry {
        display_name: "Mistral 7B Instruct v0.2 (Q4_K_M, ~4.1 GB)",
        repo: "TheBloke/Mistral-7B-Instruct-v0.2-GGUF",
        file: "mistral-7b-instruct-v0.2.Q4_K_M.gguf",
    },
    CatalogEntry {
        display_name: "Llama 3.2 1B Instruct (Q4_K_M, ~0.8 GB)",
        repo: "bartowski/Llama-3.2-1B-Instruct-GGUF",
        file: "Llama-3.2-1B-Instruct-Q4_K_M.gguf",
    },
    CatalogEntry {
        display_name: "Llama 3.2 3B Instruct (Q4_K_M, ~2 GB)",
        repo: "bartowski/Llama-3.2-3B-Instruct-GGUF",
        file: "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
    },
];

pub fn downloadable_models() -> &'static [CatalogEntry] {
    DOWNLOADABLE_MODELS
}

/// Small model that runs on almost any machine
pub fn recommended_model() -> &'static CatalogEntry {
    &DOWNLOADABLE_MODELS[0]
}

pub fn find_model(display_name: &str) -> Option<&'static CatalogEntry> {
    DOWNLOADABLE_MODELS
        .iter()
        .find(|m| m.display_name == display_name)
}
