//! In-process GGUF inference on top of `llama-cpp-2`.
//!
//! One [`LlamaEngine`] owns one loaded model. Contexts are created per
//! generation, so a loaded engine can be shared between threads and reused
//! for any number of sequential requests.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use once_cell::sync::OnceCell;

// llama.cpp allows a single backend per process
static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn backend() -> Result<&'static LlamaBackend> {
    BACKEND.get_or_try_init(|| LlamaBackend::init().context("Failed to init LlamaBackend"))
}

// ============================================================================
// Generation parameters
// ============================================================================

/// Sampling parameters for one generation
#[derive(Debug, Clone)]
pub struct GenerateParams {
    /// Upper bound on generated tokens
    pub max_tokens: u32,
    /// 0.0 or below selects greedy sampling
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationStats {
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub prompt_time: Duration,
    pub total_time: Duration,
}

impl GenerationStats {
    pub fn tokens_per_sec(&self) -> f64 {
        let gen_time = self.total_time.saturating_sub(self.prompt_time);
        if gen_time.as_secs_f64() > 0.0 {
            self.output_tokens as f64 / gen_time.as_secs_f64()
        } else {
            0.0
        }
    }
}

// ============================================================================
// VRAM Detection and GPU Layer Calculation
// ============================================================================

/// Detect available VRAM in GB
fn detect_vram_gb() -> f32 {
    #[cfg(feature = "metal")]
    {
        if let Some(vram) = detect_metal_vram() {
            log::info!("Metal VRAM detected: {:.2} GB", vram);
            return vram;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Some(vram) = detect_cuda_vram() {
            log::info!("CUDA VRAM detected: {:.2} GB", vram);
            return vram;
        }
    }

    log::debug!("VRAM detection not available, using conservative estimate");
    4.0
}

#[cfg(feature = "metal")]
fn detect_metal_vram() -> Option<f32> {
    let output = std::process::Command::new("sysctl")
        .arg("hw.memsize")
        .output()
        .ok()?;
    let stdout = String::from_utf8(output.stdout).ok()?;
    let bytes = stdout.split(':').nth(1)?.trim().parse::<u64>().ok()?;
    let gb = bytes as f32 / (1024.0 * 1024.0 * 1024.0);
    // Unified memory: the GPU gets roughly 60% of system RAM
    Some(gb * 0.6)
}

#[cfg(feature = "cuda")]
fn detect_cuda_vram() -> Option<f32> {
    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    let stdout = String::from_utf8(output.stdout).ok()?;
    let mb = stdout.lines().next()?.trim().parse::<f32>().ok()?;
    Some(mb / 1024.0)
}

/// Number of layers that fit in `vram_gb` next to the KV cache for `context_size`.
fn calculate_gpu_layers(file_size_gb: f32, model_layers: u32, vram_gb: f32, context_size: u32) -> u32 {
    if file_size_gb <= 0.0 || model_layers == 0 {
        return 0;
    }

    // ~256MB per 1k context for 7B-class files, ~128MB for the small ones
    let kv_per_1k_gb = if file_size_gb > 2.5 { 0.25 } else { 0.12 };
    let total_kv_gb = (context_size as f32 / 1000.0) * kv_per_1k_gb;

    // 500MB left for the OS and display
    let safe_vram = vram_gb - 0.5;
    if safe_vram <= 0.0 {
        return 0;
    }

    let per_layer = (file_size_gb + total_kv_gb) / model_layers as f32;
    let layers = ((safe_vram / per_layer).floor() as u32).min(model_layers);

    log::info!(
        "GPU offload: {}/{} layers (weights {:.2} GB, KV {:.2} GB, VRAM {:.2} GB)",
        layers,
        model_layers,
        file_size_gb,
        total_kv_gb,
        vram_gb
    );
    layers
}

fn default_gpu_layers(model_path: &Path, context_size: u32) -> u32 {
    if cfg!(not(any(feature = "metal", feature = "cuda", feature = "vulkan"))) {
        return 0;
    }
    let file_size_gb = std::fs::metadata(model_path)
        .map(|m| m.len() as f32 / 1024.0 / 1024.0 / 1024.0)
        .unwrap_or(0.0);
    // Q4 7B files have ~33 layers, 1-3B files ~28
    let estimated_layers = if file_size_gb > 2.5 { 33 } else { 28 };
    calculate_gpu_layers(file_size_gb, estimated_layers, detect_vram_gb(), context_size)
}

// ============================================================================
// Engine
// ============================================================================

pub struct LlamaEngine {
    model: LlamaModel,
    model_path: PathBuf,
    context_size: u32,
}

impl LlamaEngine {
    /// Load a GGUF file. Blocks for as long as llama.cpp needs to map the weights.
    pub fn load(model_path: &Path, context_size: u32) -> Result<Self> {
        let backend = backend()?;
        let started = Instant::now();

        log::info!(
            "Loading model: {} (n_ctx={})",
            model_path.display(),
            context_size
        );

        let gpu_layers = default_gpu_layers(model_path, context_size);
        let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        let model_params = pin!(model_params);

        let model = LlamaModel::load_from_file(backend, model_path, &model_params)
            .with_context(|| format!("unable to load model at {}", model_path.display()))?;

        log::info!("Model loaded in {:.2}s", started.elapsed().as_secs_f64());

        Ok(Self {
            model,
            model_path: model_path.to_path_buf(),
            context_size,
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn context_size(&self) -> u32 {
        self.context_size
    }

    /// Run one completion over `prompt`, handing every decoded piece of text to
    /// `on_piece`. Returning `false` from `on_piece` ends the generation.
    pub fn generate<F>(&self, prompt: &str, params: &GenerateParams, mut on_piece: F) -> Result<GenerationStats>
    where
        F: FnMut(&str) -> bool,
    {
        let start_time = Instant::now();
        let backend = backend()?;

        // Leave the host some cores: max(1, cores / 2 + 2)
        let threads: i32 = std::thread::available_parallelism()
            .map(|n| ((n.get() as i32 / 2) + 2).max(1))
            .unwrap_or(2);

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(
                NonZeroU32::new(self.context_size).context("Invalid ctx size")?,
            ))
            .with_n_batch(self.context_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let mut ctx = self
            .model
            .new_context(backend, ctx_params)
            .context("unable to create the llama_context")?;

        let tokens_list = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .context("failed to tokenize prompt")?;

        if tokens_list.is_empty() {
            bail!("prompt produced no tokens");
        }
        if tokens_list.len() >= self.context_size as usize {
            bail!(
                "prompt is {} tokens but the context window is {}",
                tokens_list.len(),
                self.context_size
            );
        }

        let mut batch = LlamaBatch::new(self.context_size as usize, 1);
        let last_index = (tokens_list.len() - 1) as i32;
        for (i, token) in (0_i32..).zip(tokens_list.into_iter()) {
            batch
                .add(token, i, &[0], i == last_index)
                .context("Failed to add token to batch")?;
        }

        ctx.decode(&mut batch).context("llama_decode() failed")?;
        let prompt_time = start_time.elapsed();

        let n_prompt_tokens = batch.n_tokens();
        let mut n_cur = n_prompt_tokens;
        let max_tokens = params.max_tokens.min(i32::MAX as u32) as i32;
        let mut decoder = encoding_rs::UTF_8.new_decoder();

        let sampler = if params.temperature <= 0.0 {
            LlamaSampler::chain_simple([LlamaSampler::greedy()])
        } else {
            let seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u32;
            LlamaSampler::chain_simple([
                LlamaSampler::top_k(params.top_k),
                LlamaSampler::top_p(params.top_p, 1),
                LlamaSampler::temp(params.temperature),
                LlamaSampler::dist(seed),
            ])
        };
        let mut sampler = pin!(sampler);

        loop {
            if n_cur - n_prompt_tokens >= max_tokens {
                log::debug!("Reached max_tokens limit ({})", max_tokens);
                break;
            }
            if n_cur as u32 >= self.context_size {
                log::debug!("Context window full");
                break;
            }

            let token = sampler.as_mut().sample(&ctx, batch.n_tokens() - 1);
            sampler.as_mut().accept(token);

            if self.model.is_eog_token(token) {
                break;
            }

            let bytes = self
                .model
                .token_to_bytes(token, Special::Tokenize)
                .context("Failed to convert token to bytes")?;

            let mut piece = String::with_capacity(32);
            let _ = decoder.decode_to_string(&bytes, &mut piece, false);
            n_cur += 1;

            if !piece.is_empty() && !on_piece(&piece) {
                break;
            }

            batch.clear();
            batch
                .add(token, n_cur - 1, &[0], true)
                .context("Failed to add generated token to batch")?;
            ctx.decode(&mut batch).context("failed to eval")?;
        }

        let stats = GenerationStats {
            prompt_tokens: n_prompt_tokens as u64,
            output_tokens: (n_cur - n_prompt_tokens) as u64,
            prompt_time,
            total_time: start_time.elapsed(),
        };

        log::info!(
            "Generated {} tokens from a {} token prompt in {:.2}s ({:.2} tokens/sec)",
            stats.output_tokens,
            stats.prompt_tokens,
            stats.total_time.as_secs_f64(),
            stats.tokens_per_sec()
        );

        Ok(stats)
    }
}
