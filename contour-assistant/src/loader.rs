// Model loader - background loading of the local chat model
// One owned instance per assistant; readers never wait on a load in progress

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::chat::{ChatFormat, LocalModel};
use crate::config::normalize_context_window;
use crate::error::LoadError;

/// Everything needed to load a model file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub path: PathBuf,
    pub chat_format: ChatFormat,
    pub context_window: u32,
}

/// Turns a model file into a live handle. Called on the loader thread and
/// may block for as long as loading takes.
pub trait ModelFactory: Send + Sync {
    fn load(&self, request: &LoadRequest) -> anyhow::Result<Arc<dyn LocalModel>>;
}

/// Observable loader state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    Unloaded,
    Loading,
    Ready,
    Failed(String),
}

/// Returned when a background load was started or queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    pub generation: u64,
    /// Waiting for the load in flight to finish
    pub queued: bool,
}

#[derive(Default)]
struct LoadState {
    handle: Option<Arc<dyn LocalModel>>,
    loaded: Option<LoadRequest>,
    error: Option<String>,
    loading: bool,
    /// Started by the loader thread once the current load finishes
    pending: Option<LoadRequest>,
    /// Bumped by every accepted start and every unload; only the thread
    /// holding the current value may publish
    generation: u64,
}

impl LoadState {
    /// Mark a load as started and return its generation.
    fn begin(&mut self) -> u64 {
        self.loading = true;
        self.error = None;
        self.generation += 1;
        self.generation
    }
}

pub struct ModelLoader {
    factory: Arc<dyn ModelFactory>,
    state: Arc<Mutex<LoadState>>,
}

impl ModelLoader {
    pub fn new(factory: Arc<dyn ModelFactory>) -> Self {
        Self {
            factory,
            state: Arc::new(Mutex::new(LoadState::default())),
        }
    }

    /// Loader backed by the in-process llama engine, when compiled in.
    pub fn with_default_factory() -> Self {
        Self::new(crate::engine::default_factory())
    }

    fn lock(&self) -> MutexGuard<'_, LoadState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start loading `path` on a background thread.
    ///
    /// The context window is normalized first (non-numeric input becomes
    /// 4096, the rest is clamped to 512..=65536). An empty path or one that
    /// is not a regular file is a no-op, and so is a request made while
    /// another load is still running.
    pub fn start_background_load(
        &self,
        path: impl AsRef<Path>,
        chat_format: &str,
        context_window: &Value,
    ) -> Result<LoadTicket, LoadError> {
        self.start_load(load_request(path.as_ref(), chat_format, context_window)?)
    }

    pub fn start_load(&self, request: LoadRequest) -> Result<LoadTicket, LoadError> {
        let generation = {
            let mut state = self.lock();
            if state.loading {
                log::info!(
                    "Model load already in progress, ignoring request for {}",
                    request.path.display()
                );
                return Err(LoadError::AlreadyLoading);
            }
            state.begin()
        };
        self.spawn_load(request, generation)
    }

    /// Like [`start_background_load`](Self::start_background_load), but a
    /// request made during a load is queued instead of refused. The loader
    /// thread starts it when the current load finishes, discarding that
    /// result. Only the newest queued request is kept.
    pub fn queue_background_load(
        &self,
        path: impl AsRef<Path>,
        chat_format: &str,
        context_window: &Value,
    ) -> Result<LoadTicket, LoadError> {
        let request = load_request(path.as_ref(), chat_format, context_window)?;
        let generation = {
            let mut state = self.lock();
            if state.loading {
                log::info!("Queued model load: {}", request.path.display());
                state.pending = Some(request);
                return Ok(LoadTicket {
                    generation: state.generation + 1,
                    queued: true,
                });
            }
            state.begin()
        };
        self.spawn_load(request, generation)
    }

    fn spawn_load(&self, request: LoadRequest, generation: u64) -> Result<LoadTicket, LoadError> {
        let factory = self.factory.clone();
        let shared = self.state.clone();
        let spawned = std::thread::Builder::new()
            .name("model-load".to_string())
            .spawn(move || load_in_background(factory, shared, request, generation));

        if let Err(e) = spawned {
            log::error!("Failed to start model load thread: {}", e);
            let mut state = self.lock();
            if state.generation == generation {
                state.loading = false;
                state.pending = None;
                state.error = Some(format!("Failed to start loader thread: {}", e));
            }
            return Err(LoadError::Spawn(e.to_string()));
        }

        Ok(LoadTicket {
            generation,
            queued: false,
        })
    }

    /// The handle currently being served. During a reload this is still the
    /// previous model until the new one is ready.
    pub fn get_handle(&self) -> Option<Arc<dyn LocalModel>> {
        self.lock().handle.clone()
    }

    /// Message of the last failed load, cleared when a new load starts.
    pub fn get_error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn status(&self) -> LoadStatus {
        let state = self.lock();
        if state.loading {
            LoadStatus::Loading
        } else if let Some(error) = &state.error {
            LoadStatus::Failed(error.clone())
        } else if state.handle.is_some() {
            LoadStatus::Ready
        } else {
            LoadStatus::Unloaded
        }
    }

    pub fn is_loading(&self) -> bool {
        self.lock().loading
    }

    /// The request the served handle was loaded from
    pub fn loaded_request(&self) -> Option<LoadRequest> {
        self.lock().loaded.clone()
    }

    /// Drop the served model and discard the result of any load in flight,
    /// along with any queued request.
    pub fn unload(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.loading = false;
        state.pending = None;
        state.handle = None;
        state.loaded = None;
        state.error = None;
        log::info!("Local model unloaded");
    }

    /// Poll until no load is running or `timeout` passes.
    pub fn wait_until_settled(&self, timeout: Duration) -> LoadStatus {
        let deadline = Instant::now() + timeout;
        while self.is_loading() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.status()
    }
}

/// Validate a path and normalize the load options.
fn load_request(path: &Path, chat_format: &str, context_window: &Value) -> Result<LoadRequest, LoadError> {
    if path.as_os_str().is_empty() {
        return Err(LoadError::EmptyPath);
    }
    if !path.is_file() {
        return Err(LoadError::NotAFile(path.to_path_buf()));
    }
    Ok(LoadRequest {
        path: path.to_path_buf(),
        chat_format: ChatFormat::from_tag_or_default(chat_format),
        context_window: normalize_context_window(context_window),
    })
}

fn load_in_background(
    factory: Arc<dyn ModelFactory>,
    shared: Arc<Mutex<LoadState>>,
    mut request: LoadRequest,
    mut generation: u64,
) {
    loop {
        log::info!(
            "Preloading model: {} (n_ctx={}, format={})",
            request.path.display(),
            request.context_window,
            request.chat_format
        );
        let started = Instant::now();

        let result = match catch_unwind(AssertUnwindSafe(|| factory.load(&request))) {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("model loader panicked")),
        };

        let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
        if state.generation != generation {
            log::info!("Discarding superseded load of {}", request.path.display());
            return;
        }
        if let Some(next) = state.pending.take() {
            log::info!(
                "Discarding load of {}, {} was requested meanwhile",
                request.path.display(),
                next.path.display()
            );
            state.generation += 1;
            generation = state.generation;
            request = next;
            continue;
        }
        state.loading = false;

        match result {
            Ok(handle) => {
                log::info!(
                    "Model loaded and ready in {:.1}s: {}",
                    started.elapsed().as_secs_f64(),
                    request.path.display()
                );
                state.handle = Some(handle);
                state.loaded = Some(request);
                state.error = None;
            }
            Err(e) => {
                log::error!("Failed to load model {}: {:#}", request.path.display(), e);
                state.handle = None;
                state.loaded = None;
                state.error = Some(format!("{:#}", e));
            }
        }
        return;
    }
}
