//! llama.cpp runtime
//!
//! Implements [`ModelRuntime`] on top of llama-cpp-2.
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaModel`, `LlamaContext`) contain raw pointers that are
//! not `Send`, and a context borrows its model. Every handle therefore owns a
//! dedicated worker thread that loads the model, creates the context and then
//! serves commands over a channel until the handle is dropped.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use once_cell::sync::OnceCell;

use crate::inference::params::RuntimeSettings;
use crate::inference::runtime::{ModelRuntime, RuntimeError, RuntimeHandle};
use crate::inference::streaming::EOG_SENTINEL;
use crate::system::cpu;

static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

/// Process-wide llama.cpp backend, initialized on first use
fn backend() -> Result<&'static LlamaBackend, RuntimeError> {
    BACKEND.get_or_try_init(|| {
        let variant = cpu::runtime_variant();
        tracing::info!("Initializing llama.cpp backend (CPU variant: {})", variant.library_name());
        LlamaBackend::init().map_err(|e| RuntimeError::Backend(e.to_string()))
    })
}

/// Creates llama.cpp backed handles
#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaRuntime;

impl LlamaRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl ModelRuntime for LlamaRuntime {
    fn load(&self, path: &Path, settings: &RuntimeSettings) -> Result<Box<dyn RuntimeHandle>, RuntimeError> {
        let backend = backend()?;
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), RuntimeError>>();

        let path = path.to_path_buf();
        let settings = settings.clone();
        let worker = thread::Builder::new()
            .name("llama-worker".into())
            .spawn(move || worker_thread_main(backend, path, settings, command_rx, ready_tx))
            .map_err(|e| RuntimeError::WorkerGone(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(LlamaHandle {
                command_tx,
                worker: Some(worker),
            })),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(e) => {
                let _ = worker.join();
                Err(RuntimeError::WorkerGone(e.to_string()))
            }
        }
    }
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Start {
        prompt: String,
        reply: Sender<Result<(), RuntimeError>>,
    },
    Next {
        reply: Sender<Result<String, RuntimeError>>,
    },
    Stop {
        reply: Sender<()>,
    },
    Stats {
        reply: Sender<(f32, u64)>,
    },
    Shutdown,
}

/// Handle to a model loaded on its own worker thread
pub struct LlamaHandle {
    command_tx: Sender<WorkerCommand>,
    worker: Option<JoinHandle<()>>,
}

impl LlamaHandle {
    fn request<T>(&self, command: impl FnOnce(Sender<T>) -> WorkerCommand) -> Result<T, RuntimeError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.command_tx
            .send(command(reply_tx))
            .map_err(|e| RuntimeError::WorkerGone(e.to_string()))?;
        reply_rx.recv().map_err(|e| RuntimeError::WorkerGone(e.to_string()))
    }

    fn stats(&self) -> (f32, u64) {
        self.request(|reply| WorkerCommand::Stats { reply }).unwrap_or_default()
    }
}

impl RuntimeHandle for LlamaHandle {
    fn is_valid(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    fn start_completion(&mut self, prompt: &str) -> Result<(), RuntimeError> {
        let prompt = prompt.to_string();
        self.request(|reply| WorkerCommand::Start { prompt, reply })?
    }

    fn completion_loop(&mut self) -> Result<String, RuntimeError> {
        self.request(|reply| WorkerCommand::Next { reply })?
    }

    fn stop_completion(&mut self) {
        if let Err(e) = self.request(|reply| WorkerCommand::Stop { reply }) {
            tracing::warn!("Failed to stop completion: {}", e);
        }
    }

    fn generation_speed(&self) -> f32 {
        self.stats().0
    }

    fn context_size_used(&self) -> u64 {
        self.stats().1
    }
}

impl Drop for LlamaHandle {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the model and its context for the lifetime of the handle.
fn worker_thread_main(
    backend: &'static LlamaBackend,
    path: PathBuf,
    settings: RuntimeSettings,
    command_rx: Receiver<WorkerCommand>,
    ready_tx: Sender<Result<(), RuntimeError>>,
) {
    let model = match load_model(backend, &path, &settings) {
        Ok(model) => model,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let mut ctx = match create_context(backend, &model, &settings) {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    tracing::info!(
        "Model ready: {} ({} params, {} ctx)",
        path.display(),
        model.n_params(),
        ctx.n_ctx()
    );
    if ready_tx.send(Ok(())).is_err() {
        return;
    }

    let mut completion = Completion::new(&settings);
    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Start { prompt, reply }) => {
                let _ = reply.send(completion.start(&mut ctx, &model, &prompt));
            }
            Ok(WorkerCommand::Next { reply }) => {
                let _ = reply.send(completion.next_piece(&mut ctx, &model));
            }
            Ok(WorkerCommand::Stop { reply }) => {
                completion.stop();
                let _ = reply.send(());
            }
            Ok(WorkerCommand::Stats { reply }) => {
                let _ = reply.send((completion.tokens_per_second(), u64::try_from(completion.n_past).unwrap_or(0)));
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::debug!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

fn load_model(backend: &LlamaBackend, path: &Path, settings: &RuntimeSettings) -> Result<LlamaModel, RuntimeError> {
    let mut params = LlamaModelParams::default();
    if settings.use_mlock {
        params = params.with_use_mlock(true);
    }
    if !settings.use_mmap {
        tracing::warn!("Disabling mmap is not supported by this runtime, loading with mmap");
    }
    LlamaModel::load_from_file(backend, path, &params).map_err(|e| RuntimeError::ModelLoad(e.to_string()))
}

fn create_context<'a>(
    backend: &LlamaBackend,
    model: &'a LlamaModel,
    settings: &RuntimeSettings,
) -> Result<LlamaContext<'a>, RuntimeError> {
    let n_ctx = u32::try_from(settings.context_size)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or_else(|| RuntimeError::Context(format!("invalid context size {}", settings.context_size)))?;
    let threads = i32::try_from(settings.num_threads).unwrap_or(i32::MAX);

    let params = LlamaContextParams::default()
        .with_n_ctx(Some(n_ctx))
        .with_n_batch(n_ctx.get())
        .with_n_threads(threads)
        .with_n_threads_batch(threads);

    model
        .new_context(backend, params)
        .map_err(|e| RuntimeError::Context(e.to_string()))
}

/// Per-completion sampling state
struct Completion {
    min_p: f32,
    temperature: f32,
    sampler: Option<LlamaSampler>,
    /// Batch index whose logits the next sample reads
    logits_index: i32,
    /// Position of the next token in the context
    n_past: i32,
    generated: u32,
    started: Option<Instant>,
    elapsed_secs: f32,
    /// Bytes of a UTF-8 sequence split across tokens
    utf8_buffer: Vec<u8>,
    finished: bool,
}

impl Completion {
    fn new(settings: &RuntimeSettings) -> Self {
        Self {
            min_p: settings.min_p,
            temperature: settings.temperature,
            sampler: None,
            logits_index: 0,
            n_past: 0,
            generated: 0,
            started: None,
            elapsed_secs: 0.0,
            utf8_buffer: Vec::new(),
            finished: true,
        }
    }

    fn start(&mut self, ctx: &mut LlamaContext, model: &LlamaModel, prompt: &str) -> Result<(), RuntimeError> {
        self.stop();
        ctx.clear_kv_cache();
        self.n_past = 0;

        let tokens = model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| RuntimeError::Tokenization(e.to_string()))?;
        let capacity = ctx.n_ctx() as usize;
        if tokens.len() >= capacity {
            return Err(RuntimeError::ContextOverflow {
                needed: tokens.len(),
                capacity,
            });
        }
        tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

        let mut batch = LlamaBatch::new(capacity, 1);
        let last = tokens.len().saturating_sub(1);
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(*token, i as i32, &[0], i == last)
                .map_err(|e| RuntimeError::Decode(e.to_string()))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| RuntimeError::Decode(format!("failed to decode prompt: {e}")))?;

        self.n_past = tokens.len() as i32;
        self.logits_index = batch.n_tokens() - 1;
        self.sampler = Some(LlamaSampler::chain_simple([
            LlamaSampler::min_p(self.min_p, 1),
            LlamaSampler::temp(self.temperature),
            LlamaSampler::dist(rand_seed()),
        ]));
        self.generated = 0;
        self.started = Some(Instant::now());
        self.elapsed_secs = 0.0;
        self.utf8_buffer.clear();
        self.finished = false;
        Ok(())
    }

    /// Samples tokens until a non-empty piece of valid UTF-8 is available
    fn next_piece(&mut self, ctx: &mut LlamaContext, model: &LlamaModel) -> Result<String, RuntimeError> {
        loop {
            if self.finished {
                return Ok(EOG_SENTINEL.to_string());
            }
            let Some(sampler) = self.sampler.as_mut() else {
                self.finished = true;
                continue;
            };

            let token = sampler.sample(ctx, self.logits_index);
            sampler.accept(token);

            if model.is_eog_token(token) || self.n_past as u32 >= ctx.n_ctx() {
                tracing::debug!("End of generation after {} tokens", self.generated);
                self.end_timing();
                self.finished = true;
                let rest = self.take_remainder();
                if !rest.is_empty() {
                    return Ok(rest);
                }
                continue;
            }

            let bytes = model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|e| RuntimeError::Decode(format!("failed to convert token: {e}")))?;
            self.utf8_buffer.extend_from_slice(&bytes);

            let mut batch = LlamaBatch::new(1, 1);
            batch
                .add(token, self.n_past, &[0], true)
                .map_err(|e| RuntimeError::Decode(e.to_string()))?;
            ctx.decode(&mut batch).map_err(|e| RuntimeError::Decode(e.to_string()))?;
            self.logits_index = 0;
            self.n_past += 1;
            self.generated += 1;

            let piece = self.take_valid_utf8();
            if !piece.is_empty() {
                return Ok(piece);
            }
        }
    }

    /// Removes and returns the longest valid UTF-8 prefix of the buffer
    fn take_valid_utf8(&mut self) -> String {
        let valid = match std::str::from_utf8(&self.utf8_buffer) {
            Ok(_) => self.utf8_buffer.len(),
            Err(e) if e.error_len().is_some() => {
                // Not a split sequence: drop the invalid bytes
                let end = e.valid_up_to() + e.error_len().unwrap_or(0);
                let mut out = String::from_utf8_lossy(&self.utf8_buffer[..end]).into_owned();
                self.utf8_buffer.drain(..end);
                out.push_str(&self.take_valid_utf8());
                return out;
            }
            Err(e) => e.valid_up_to(),
        };
        let rest = self.utf8_buffer.split_off(valid);
        let piece = std::mem::replace(&mut self.utf8_buffer, rest);
        String::from_utf8(piece).unwrap_or_default()
    }

    /// Flushes an unfinished sequence left in the buffer, replacing it lossily
    fn take_remainder(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.utf8_buffer).into_owned();
        self.utf8_buffer.clear();
        rest
    }

    fn end_timing(&mut self) {
        if let Some(started) = self.started.take() {
            self.elapsed_secs = started.elapsed().as_secs_f32();
        }
    }

    fn stop(&mut self) {
        self.end_timing();
        self.sampler = None;
        self.utf8_buffer.clear();
        self.finished = true;
    }

    fn tokens_per_second(&self) -> f32 {
        let elapsed = match self.started {
            Some(started) => started.elapsed().as_secs_f32(),
            None => self.elapsed_secs,
        };
        if elapsed > 0.0 {
            self.generated as f32 / elapsed
        } else {
            0.0
        }
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
