//! Model session
//!
//! A [`ModelSession`] owns at most one runtime handle and serializes every use of
//! it. Lifecycle: `Unloaded -> Loading -> Loaded <-> Generating`, with `close`
//! returning to `Unloaded` and `terminate` ending in `Closed`.
//!
//! # Concurrency
//!
//! The handle lives behind an async mutex. A completion stream holds that mutex
//! for its whole lifetime, so `load` and other generations cannot touch the handle
//! while it streams; they are rejected with [`SessionError::Busy`] instead of
//! waiting. `close` never waits: it flags the running stream, which stops at its
//! next pull and releases the handle when it ends.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::inference::gguf::{self, GgufError};
use crate::inference::params::{InferenceParams, RuntimeSettings};
use crate::inference::runtime::{ModelRuntime, RuntimeError, RuntimeHandle};
use crate::inference::streaming::{Emission, StopWordFilter, StopWords, EOG_SENTINEL};
use crate::inference::template::ChatTemplate;
use crate::types::{ChatMessage, ChatRole};

/// Why a model could not be loaded
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Metadata(#[from] GgufError),

    #[error("Invalid chat template: {0}")]
    Template(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Session was closed while the model was loading")]
    Closed,

    #[error("Load task failed: {0}")]
    Task(String),
}

/// Errors returned by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to load {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: LoadError,
    },

    #[error("No model loaded")]
    NotLoaded,

    #[error("Session is busy with another generation or load")]
    Busy,

    #[error("Session is closed")]
    Closed,

    #[error("Failed to format prompt: {0}")]
    Template(String),

    #[error("Generation failed: {0}")]
    Runtime(String),
}

impl From<RuntimeError> for SessionError {
    fn from(e: RuntimeError) -> Self {
        SessionError::Runtime(e.to_string())
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loading,
    Loaded,
    Generating,
    Closed,
}

/// Measurements taken when the last completion ended
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationStats {
    pub tokens_per_second: f32,
    pub context_tokens_used: u64,
}

/// Text fragments of one completion, in generation order
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String, SessionError>> + Send>>;

struct LoadedModel {
    path: PathBuf,
    handle: Box<dyn RuntimeHandle>,
    template: ChatTemplate,
    settings: RuntimeSettings,
}

struct Status {
    state: SessionState,
    loaded_path: Option<PathBuf>,
    store_chats: bool,
    stats: GenerationStats,
    /// Cancellation flag of the in-flight load or generation
    cancel: Option<Arc<AtomicBool>>,
}

#[derive(Default)]
struct Conversation {
    history: Vec<ChatMessage>,
    /// Messages for the next completion only (when chats are not stored)
    pending: Vec<ChatMessage>,
}

struct Shared {
    status: Mutex<Status>,
    conversation: Mutex<Conversation>,
    stop_words: Mutex<StopWords>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A stateful inference session over one model at a time
pub struct ModelSession {
    runtime: Arc<dyn ModelRuntime>,
    shared: Arc<Shared>,
    slot: Arc<AsyncMutex<Option<LoadedModel>>>,
}

impl ModelSession {
    /// Creates an unloaded session that builds handles with `runtime`
    pub fn new(runtime: Arc<dyn ModelRuntime>) -> Self {
        Self {
            runtime,
            shared: Arc::new(Shared {
                status: Mutex::new(Status {
                    state: SessionState::Unloaded,
                    loaded_path: None,
                    store_chats: false,
                    stats: GenerationStats::default(),
                    cancel: None,
                }),
                conversation: Mutex::new(Conversation::default()),
                stop_words: Mutex::new(StopWords::default()),
            }),
            slot: Arc::new(AsyncMutex::new(None)),
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared.status).state
    }

    /// Path of the currently loaded model
    pub fn loaded_path(&self) -> Option<PathBuf> {
        lock(&self.shared.status).loaded_path.clone()
    }

    /// Loads a model, replacing any model already loaded.
    ///
    /// Reads the GGUF metadata, resolves the effective parameters and builds a
    /// runtime handle. On failure the session is left `Unloaded`.
    pub async fn load(&self, path: impl AsRef<Path>, params: InferenceParams) -> Result<(), SessionError> {
        let path = path.as_ref().to_path_buf();
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut status = lock(&self.shared.status);
            match status.state {
                SessionState::Closed => return Err(SessionError::Closed),
                SessionState::Loading | SessionState::Generating => return Err(SessionError::Busy),
                SessionState::Unloaded | SessionState::Loaded => {}
            }
            status.state = SessionState::Loading;
            status.cancel = Some(Arc::clone(&cancel));
        }
        let mut pending = PendingLoad {
            shared: &self.shared,
            cancel: &cancel,
            done: false,
        };

        let mut slot = self.slot.lock().await;
        let previous = slot.take();
        if let Some(previous) = &previous {
            tracing::info!("Replacing loaded model {}", previous.path.display());
        }

        tracing::info!("Loading model from {}", path.display());
        let started = Instant::now();
        let runtime = Arc::clone(&self.runtime);
        let task_path = path.clone();
        let result = tokio::task::spawn_blocking(move || {
            drop(previous);
            load_model(runtime.as_ref(), &task_path, &params)
        })
        .await
        .unwrap_or_else(|e| Err(LoadError::Task(e.to_string())));

        pending.done = true;
        let mut status = lock(&self.shared.status);
        let ours = status
            .cancel
            .as_ref()
            .is_some_and(|flag| Arc::ptr_eq(flag, &cancel));
        if ours {
            status.cancel = None;
        }

        let result = result.and_then(|model| {
            if cancel.load(Ordering::SeqCst) {
                Err(LoadError::Closed)
            } else {
                Ok(model)
            }
        });

        match result {
            Ok(model) => {
                tracing::info!(
                    "Model loaded in {} ms (context {} tokens, {} threads)",
                    started.elapsed().as_millis(),
                    model.settings.context_size,
                    model.settings.num_threads
                );
                status.state = SessionState::Loaded;
                status.loaded_path = Some(model.path.clone());
                status.store_chats = model.settings.store_chats;
                status.stats = GenerationStats::default();
                *lock(&self.shared.conversation) = Conversation::default();
                *slot = Some(model);
                Ok(())
            }
            Err(source) => {
                tracing::error!("Failed to load {}: {}", path.display(), source);
                // a close may have handed the session to a newer load
                if ours {
                    status.state = SessionState::Unloaded;
                    status.loaded_path = None;
                }
                Err(SessionError::Load { path, source })
            }
        }
    }

    /// Fails with [`SessionError::NotLoaded`] unless a valid handle is loaded.
    ///
    /// A handle torn down by the native layer is discarded here and the session
    /// becomes `Unloaded`.
    pub fn verify_loaded(&self) -> Result<(), SessionError> {
        let mut status = lock(&self.shared.status);
        match status.state {
            SessionState::Generating => Ok(()),
            SessionState::Loaded => {
                // A locked slot means an operation on a live handle is running.
                let Ok(mut slot) = self.slot.try_lock() else {
                    return Ok(());
                };
                if slot.as_ref().is_some_and(|model| model.handle.is_valid()) {
                    return Ok(());
                }
                tracing::warn!("Runtime handle is no longer valid, marking session unloaded");
                status.state = SessionState::Unloaded;
                status.loaded_path = None;
                drop(status);
                drop(slot.take());
                Err(SessionError::NotLoaded)
            }
            SessionState::Closed => Err(SessionError::Closed),
            SessionState::Unloaded | SessionState::Loading => Err(SessionError::NotLoaded),
        }
    }

    /// Loads `path` unless a valid handle is already loaded.
    ///
    /// Returns `true` if a load happened.
    pub async fn ensure_loaded_or_reload(
        &self,
        path: impl AsRef<Path>,
        params: InferenceParams,
    ) -> Result<bool, SessionError> {
        match self.verify_loaded() {
            Ok(()) => Ok(false),
            Err(SessionError::Closed) => Err(SessionError::Closed),
            Err(_) => {
                self.load(path, params).await?;
                Ok(true)
            }
        }
    }

    /// Adds a message to the conversation.
    ///
    /// With `store_chats` it joins the history; otherwise it applies to the next
    /// completion only.
    pub fn add_message(&self, role: ChatRole, content: impl Into<String>) -> Result<(), SessionError> {
        self.verify_loaded()?;
        let store_chats = lock(&self.shared.status).store_chats;
        let message = ChatMessage::new(role, content);
        let mut conversation = lock(&self.shared.conversation);
        if store_chats {
            conversation.history.push(message);
        } else {
            conversation.pending.push(message);
        }
        Ok(())
    }

    /// Replaces the stop words used by subsequent completions
    pub fn set_stop_words<I, S>(&self, words: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.verify_loaded()?;
        *lock(&self.shared.stop_words) = StopWords::new(words);
        Ok(())
    }

    pub fn stop_words(&self) -> StopWords {
        lock(&self.shared.stop_words).clone()
    }

    /// Stored conversation history (empty unless `store_chats` is enabled)
    pub fn history(&self) -> Vec<ChatMessage> {
        lock(&self.shared.conversation).history.clone()
    }

    /// Tokens per second of the last completion
    pub fn generation_speed(&self) -> Result<f32, SessionError> {
        self.verify_loaded()?;
        Ok(lock(&self.shared.status).stats.tokens_per_second)
    }

    /// Tokens held in the context window after the last completion
    pub fn context_tokens_used(&self) -> Result<u64, SessionError> {
        self.verify_loaded()?;
        Ok(lock(&self.shared.status).stats.context_tokens_used)
    }

    /// Effective settings of the loaded model. Waits for a running generation to end.
    pub async fn settings(&self) -> Option<RuntimeSettings> {
        self.slot.lock().await.as_ref().map(|model| model.settings.clone())
    }

    /// Starts a completion for `prompt` and returns its fragments as a stream.
    ///
    /// The prompt becomes a user turn rendered through the chat template. The
    /// stream ends at the end-of-generation sentinel or at a stop word; dropping
    /// it early stops the generation. Only one stream may be active at a time.
    pub async fn stream_completion(&self, prompt: &str) -> Result<CompletionStream, SessionError> {
        self.verify_loaded()?;
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut status = lock(&self.shared.status);
            match status.state {
                SessionState::Loaded => {}
                SessionState::Generating | SessionState::Loading => return Err(SessionError::Busy),
                SessionState::Closed => return Err(SessionError::Closed),
                SessionState::Unloaded => return Err(SessionError::NotLoaded),
            }
            status.state = SessionState::Generating;
            status.cancel = Some(Arc::clone(&cancel));
        }

        // From here on the run restores the session state on every exit path.
        let mut run = GenerationRun {
            shared: Arc::clone(&self.shared),
            slot: None,
            cancel,
            started: false,
            finished: false,
        };
        run.slot = Some(Arc::clone(&self.slot).lock_owned().await);

        if !run.handle_is_valid() {
            run.discard_model();
            return Err(SessionError::NotLoaded);
        }

        let stop_words = lock(&self.shared.stop_words).clone();
        let messages = {
            let mut conversation = lock(&self.shared.conversation);
            let mut messages = conversation.history.clone();
            messages.append(&mut conversation.pending);
            messages.push(ChatMessage::user(prompt));
            messages
        };
        let formatted = run.render(&messages)?;

        tracing::debug!(
            "Starting completion: {} messages, {} stop words",
            messages.len(),
            stop_words.len()
        );

        Ok(Box::pin(drive_completion(run, formatted, stop_words, prompt.to_string())))
    }

    /// Runs a completion to the end and returns the consumer-visible text
    pub async fn complete(&self, prompt: &str) -> Result<String, SessionError> {
        let mut stream = self.stream_completion(prompt).await?;
        let mut response = String::new();
        while let Some(piece) = stream.next().await {
            response.push_str(&piece?);
        }
        Ok(response)
    }

    /// Releases the loaded model. The session can load again afterwards.
    ///
    /// Never fails and never waits: a running generation is told to stop and
    /// releases the handle when its stream ends.
    pub fn close(&self) {
        let mut status = lock(&self.shared.status);
        if status.state == SessionState::Closed {
            return;
        }
        if let Some(flag) = status.cancel.take() {
            flag.store(true, Ordering::SeqCst);
        }
        status.state = SessionState::Unloaded;
        status.loaded_path = None;

        let released = match self.slot.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        drop(status);

        if let Some(model) = released {
            tracing::info!("Closed model {}", model.path.display());
        }
        *lock(&self.shared.conversation) = Conversation::default();
    }

    /// Closes the session for good; later loads fail with [`SessionError::Closed`]
    pub fn terminate(&self) {
        self.close();
        lock(&self.shared.status).state = SessionState::Closed;
    }
}

/// Resets a `Loading` session if the load future is dropped before it finishes
struct PendingLoad<'a> {
    shared: &'a Shared,
    cancel: &'a Arc<AtomicBool>,
    done: bool,
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut status = lock(&self.shared.status);
        let ours = status
            .cancel
            .as_ref()
            .is_some_and(|flag| Arc::ptr_eq(flag, self.cancel));
        if ours {
            status.cancel = None;
            status.state = SessionState::Unloaded;
            status.loaded_path = None;
        }
    }
}

fn load_model(runtime: &dyn ModelRuntime, path: &Path, params: &InferenceParams) -> Result<LoadedModel, LoadError> {
    let metadata = gguf::read_metadata(path)?;
    let settings = params.resolve(&metadata);
    let template = ChatTemplate::new(settings.chat_template.clone()).map_err(|e| LoadError::Template(e.to_string()))?;
    let handle = runtime.load(path, &settings)?;
    Ok(LoadedModel {
        path: path.to_path_buf(),
        handle,
        template,
        settings,
    })
}

/// Exclusive access to the handle for one completion.
///
/// Dropping it before [`finish`](Self::finish) calls the runtime's stop, and
/// dropping it always returns the session to `Loaded` (or `Unloaded` if the
/// session was closed meanwhile).
struct GenerationRun {
    shared: Arc<Shared>,
    slot: Option<OwnedMutexGuard<Option<LoadedModel>>>,
    cancel: Arc<AtomicBool>,
    started: bool,
    finished: bool,
}

impl GenerationRun {
    fn model(&mut self) -> Result<&mut LoadedModel, RuntimeError> {
        self.slot
            .as_mut()
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| RuntimeError::WorkerGone("model was released".into()))
    }

    fn handle_is_valid(&mut self) -> bool {
        self.model().is_ok_and(|model| model.handle.is_valid())
    }

    fn discard_model(&mut self) {
        if let Some(slot) = self.slot.as_mut() {
            drop(slot.take());
        }
        let mut status = lock(&self.shared.status);
        status.state = SessionState::Unloaded;
        status.loaded_path = None;
    }

    fn store_chats(&mut self) -> bool {
        self.model().is_ok_and(|model| model.settings.store_chats)
    }

    fn render(&mut self, messages: &[ChatMessage]) -> Result<String, SessionError> {
        let model = self.model()?;
        model
            .template
            .render(messages, true)
            .map_err(|e| SessionError::Template(e.to_string()))
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn start(&mut self, prompt: &str) -> Result<(), RuntimeError> {
        self.started = true;
        self.model()?.handle.start_completion(prompt)
    }

    fn next_piece(&mut self) -> Result<String, RuntimeError> {
        self.model()?.handle.completion_loop()
    }

    /// Calls the runtime's stop exactly once and records the run's statistics
    fn stop(&mut self) {
        if !self.started || self.finished {
            return;
        }
        self.finished = true;
        let Ok(model) = self.model() else {
            return;
        };
        model.handle.stop_completion();
        let stats = GenerationStats {
            tokens_per_second: model.handle.generation_speed(),
            context_tokens_used: model.handle.context_size_used(),
        };
        lock(&self.shared.status).stats = stats;
    }

    fn finish(&mut self) {
        self.stop();
    }
}

impl Drop for GenerationRun {
    fn drop(&mut self) {
        if self.started && !self.finished {
            tracing::debug!("Completion abandoned, stopping generation");
            self.stop();
        }

        let mut status = lock(&self.shared.status);
        if status
            .cancel
            .as_ref()
            .is_some_and(|flag| Arc::ptr_eq(flag, &self.cancel))
        {
            status.cancel = None;
        }

        let closed = self.cancelled();
        if status.state == SessionState::Generating {
            let has_model = self.slot.as_ref().is_some_and(|slot| slot.is_some());
            status.state = if has_model && !closed {
                SessionState::Loaded
            } else {
                SessionState::Unloaded
            };
        }
        drop(status);

        if closed {
            if let Some(model) = self.slot.as_mut().and_then(|slot| slot.take()) {
                tracing::info!("Closed model {} after generation", model.path.display());
            }
        }
    }
}

/// Moves the run onto the blocking pool for one runtime call and back
async fn on_runtime<T, F>(mut run: GenerationRun, call: F) -> Result<(GenerationRun, T), SessionError>
where
    T: Send + 'static,
    F: FnOnce(&mut GenerationRun) -> Result<T, RuntimeError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || call(&mut run).map(|value| (run, value)))
        .await
        .map_err(|e| SessionError::Runtime(format!("generation task failed: {e}")))?
        .map_err(SessionError::from)
}

fn drive_completion(
    run: GenerationRun,
    formatted: String,
    stop_words: StopWords,
    prompt: String,
) -> impl Stream<Item = Result<String, SessionError>> + Send {
    try_stream! {
        let mut run = run;
        let store_chats = run.store_chats();
        let shared = Arc::clone(&run.shared);
        let started = Instant::now();

        let (next, ()) = on_runtime(run, move |run| run.start(&formatted)).await?;
        run = next;

        let mut filter = StopWordFilter::new(stop_words);
        let mut fragments = 0usize;
        loop {
            if run.cancelled() {
                tracing::debug!("Session closed during completion");
                break;
            }
            let (next, piece) = on_runtime(run, |run| run.next_piece()).await?;
            run = next;
            if piece == EOG_SENTINEL {
                break;
            }
            fragments += 1;
            match filter.push(&piece) {
                Emission::Forward(text) => {
                    yield text;
                }
                Emission::Hold => {}
                Emission::Stop(text) => {
                    if !text.is_empty() {
                        yield text;
                    }
                    tracing::debug!("Stop word reached");
                    break;
                }
            }
        }

        run.finish();
        let response = filter.finish();
        tracing::debug!(
            "Completion finished: {} fragments, {} chars in {} ms",
            fragments,
            response.chars().count(),
            started.elapsed().as_millis()
        );

        if store_chats && !run.cancelled() {
            let mut conversation = lock(&shared.conversation);
            conversation.history.push(ChatMessage::user(prompt));
            conversation.history.push(ChatMessage::assistant(response));
        }
        drop(run);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::gguf::fixture;
    use crate::inference::runtime::stub::StubRuntime;
    use crate::inference::template::DEFAULT_CHAT_TEMPLATE;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio::task::JoinHandle;

    fn session(fragments: &[&str]) -> (ModelSession, Arc<StubRuntime>) {
        let runtime = Arc::new(StubRuntime::new(fragments));
        (ModelSession::new(runtime.clone()), runtime)
    }

    async fn loaded(fragments: &[&str]) -> (ModelSession, Arc<StubRuntime>, NamedTempFile) {
        let (session, runtime) = session(fragments);
        let file = fixture::model(Some(2048), None);
        session.load(file.path(), InferenceParams::default()).await.unwrap();
        (session, runtime, file)
    }

    fn spawn_load(session: &Arc<ModelSession>, path: &Path) -> JoinHandle<Result<(), SessionError>> {
        let session = Arc::clone(session);
        let path = path.to_path_buf();
        tokio::spawn(async move { session.load(path, InferenceParams::default()).await })
    }

    async fn wait_for(session: &ModelSession, state: SessionState) {
        while session.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn collect(stream: CompletionStream) -> Vec<String> {
        stream.map(|piece| piece.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_load_resolves_metadata_defaults() {
        let (session, runtime, file) = loaded(&[]).await;

        assert_eq!(session.state(), SessionState::Loaded);
        assert_eq!(session.loaded_path().as_deref(), Some(file.path()));

        let loads = runtime.log.loads.lock().unwrap();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].1.context_size, 2048);
        assert_eq!(loads[0].1.chat_template, DEFAULT_CHAT_TEMPLATE);
    }

    #[tokio::test]
    async fn test_load_missing_file_leaves_unloaded() {
        let (session, runtime) = session(&[]);
        let dir = tempfile::tempdir().unwrap();

        let err = session
            .load(dir.path().join("nope.gguf"), InferenceParams::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SessionError::Load { source: LoadError::Metadata(GgufError::NotFound(_)), .. }
        ));
        assert_eq!(session.state(), SessionState::Unloaded);
        assert_eq!(runtime.log.load_count(), 0);
    }

    #[tokio::test]
    async fn test_load_corrupt_file_is_format_error() {
        let (session, _runtime) = session(&[]);
        let file = fixture::write_bytes(b"definitely not a gguf container");

        let err = session.load(file.path(), InferenceParams::default()).await.unwrap_err();
        match err {
            SessionError::Load { source: LoadError::Metadata(e), .. } => assert!(e.is_format_error()),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Unloaded);
    }

    #[tokio::test]
    async fn test_runtime_failure_keeps_no_handle() {
        let (session, runtime) = session(&[]);
        *runtime.log.fail_load.lock().unwrap() = Some(RuntimeError::ModelLoad("unsupported architecture".into()));
        let file = fixture::model(Some(512), None);

        let err = session.load(file.path(), InferenceParams::default()).await.unwrap_err();
        assert!(err.to_string().contains("unsupported architecture"));
        assert_eq!(session.state(), SessionState::Unloaded);
        assert!(matches!(session.verify_loaded(), Err(SessionError::NotLoaded)));
    }

    #[tokio::test]
    async fn test_invalid_template_override_fails_load() {
        let (session, runtime) = session(&[]);
        let file = fixture::model(None, None);
        let params = InferenceParams {
            chat_template: Some("{% for m in messages %}".into()),
            ..Default::default()
        };

        let err = session.load(file.path(), params).await.unwrap_err();
        assert!(matches!(err, SessionError::Load { source: LoadError::Template(_), .. }));
        assert_eq!(runtime.log.load_count(), 0);
    }

    #[tokio::test]
    async fn test_reload_replaces_handle() {
        let (session, runtime, file) = loaded(&[]).await;
        session.load(file.path(), InferenceParams::default()).await.unwrap();

        assert_eq!(runtime.log.load_count(), 2);
        assert_eq!(runtime.log.released.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Loaded);
    }

    #[tokio::test]
    async fn test_close_then_generate_is_not_loaded() {
        let (session, runtime, _file) = loaded(&["hi", "[EOG]"]).await;
        session.close();

        assert_eq!(session.state(), SessionState::Unloaded);
        assert_eq!(runtime.log.released.load(Ordering::SeqCst), 1);
        assert!(matches!(session.stream_completion("x").await, Err(SessionError::NotLoaded)));
        assert!(matches!(session.add_message(ChatRole::User, "x"), Err(SessionError::NotLoaded)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _runtime, _file) = loaded(&[]).await;
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Unloaded);

        let (fresh, _) = self::session(&[]);
        fresh.close();
        assert_eq!(fresh.state(), SessionState::Unloaded);
    }

    #[tokio::test]
    async fn test_session_reusable_after_close() {
        let (session, _runtime, file) = loaded(&["ok", "[EOG]"]).await;
        session.close();
        session.load(file.path(), InferenceParams::default()).await.unwrap();
        assert_eq!(session.complete("again").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_terminate_is_final() {
        let (session, _runtime, file) = loaded(&[]).await;
        session.terminate();
        session.close();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.load(file.path(), InferenceParams::default()).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_during_load_discards_handle() {
        let (session, runtime) = session(&[]);
        runtime.log.set_load_delay(Duration::from_millis(200));
        let session = Arc::new(session);
        let file = fixture::model(Some(512), None);

        let loading = spawn_load(&session, file.path());
        wait_for(&session, SessionState::Loading).await;
        session.close();
        assert_eq!(session.state(), SessionState::Unloaded);

        let err = loading.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Load { source: LoadError::Closed, .. }), "got {err:?}");
        assert_eq!(session.state(), SessionState::Unloaded);
        assert_eq!(runtime.log.load_count(), 1);
        assert_eq!(runtime.log.released.load(Ordering::SeqCst), 1);
        assert!(matches!(session.verify_loaded(), Err(SessionError::NotLoaded)));
    }

    #[tokio::test]
    async fn test_overtaken_load_leaves_newer_load_in_charge() {
        let (session, runtime) = session(&[]);
        runtime.log.set_load_delay(Duration::from_millis(200));
        let session = Arc::new(session);
        let file = fixture::model(Some(512), None);

        let first = spawn_load(&session, file.path());
        wait_for(&session, SessionState::Loading).await;
        session.close();
        let second = spawn_load(&session, file.path());
        wait_for(&session, SessionState::Loading).await;

        // the second load is still building its model after the first gives up
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Load { source: LoadError::Closed, .. }), "got {err:?}");
        assert_eq!(session.state(), SessionState::Loading);
        assert!(matches!(
            session.load(file.path(), InferenceParams::default()).await,
            Err(SessionError::Busy)
        ));

        second.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Loaded);
        assert_eq!(session.loaded_path().as_deref(), Some(file.path()));
        assert_eq!(runtime.log.load_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_load_resets_state() {
        let (session, runtime) = session(&["ok", "[EOG]"]);
        runtime.log.set_load_delay(Duration::from_millis(200));
        let file = fixture::model(Some(512), None);

        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            session.load(file.path(), InferenceParams::default()),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(session.state(), SessionState::Unloaded);

        runtime.log.set_load_delay(Duration::ZERO);
        session.load(file.path(), InferenceParams::default()).await.unwrap();
        assert_eq!(session.state(), SessionState::Loaded);
        assert_eq!(session.complete("again").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_ensure_loaded_is_idempotent() {
        let (session, runtime) = session(&[]);
        let file = fixture::model(Some(1024), None);

        assert!(session.ensure_loaded_or_reload(file.path(), InferenceParams::default()).await.unwrap());
        assert!(!session.ensure_loaded_or_reload(file.path(), InferenceParams::default()).await.unwrap());
        assert_eq!(runtime.log.load_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_handle_is_reloaded() {
        let (session, runtime, file) = loaded(&["back", "[EOG]"]).await;
        runtime.log.invalidate();

        assert!(matches!(session.verify_loaded(), Err(SessionError::NotLoaded)));
        assert_eq!(session.state(), SessionState::Unloaded);

        assert!(session.ensure_loaded_or_reload(file.path(), InferenceParams::default()).await.unwrap());
        assert_eq!(runtime.log.load_count(), 2);
        assert_eq!(session.complete("p").await.unwrap(), "back");
    }

    #[tokio::test]
    async fn test_stream_stops_at_split_stop_word() {
        let (session, runtime, _file) = loaded(&["Str0ng!", "<|e", "nd|>", "[EOG]"]).await;
        session.set_stop_words(["<|end|>"]).unwrap();

        let pieces = collect(session.stream_completion("correcthorse").await.unwrap()).await;

        assert_eq!(pieces.concat(), "Str0ng!");
        assert_eq!(runtime.log.stop_count(), 1);
        assert_eq!(session.state(), SessionState::Loaded);
    }

    #[tokio::test]
    async fn test_immediate_eog_yields_nothing() {
        let (session, runtime, _file) = loaded(&["[EOG]", "never"]).await;

        let pieces = collect(session.stream_completion("").await.unwrap()).await;

        assert!(pieces.is_empty());
        assert_eq!(runtime.log.stop_count(), 1);
        assert_eq!(session.complete("").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_fragments_arrive_in_order() {
        let (session, _runtime, _file) = loaded(&["a", "b", "", "c", "[EOG]"]).await;
        let pieces = collect(session.stream_completion("go").await.unwrap()).await;
        assert_eq!(pieces, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_prompt_rendered_through_template() {
        let (session, runtime, _file) = loaded(&["[EOG]"]).await;
        session.add_message(ChatRole::System, "be terse").unwrap();
        session.complete("correcthorse").await.unwrap();

        let prompt = runtime.log.last_prompt().unwrap();
        assert_eq!(
            prompt,
            "<|im_start|>system\nbe terse<|im_end|>\n<|im_start|>user\ncorrecthorse<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[tokio::test]
    async fn test_unstored_messages_apply_to_next_completion_only() {
        let (session, runtime, _file) = loaded(&["[EOG]"]).await;
        session.add_message(ChatRole::System, "once").unwrap();
        session.complete("first").await.unwrap();
        session.complete("second").await.unwrap();

        let prompts = runtime.log.prompts.lock().unwrap();
        assert!(prompts[0].contains("once"));
        assert!(!prompts[1].contains("once"));
        assert!(!prompts[1].contains("first"));
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn test_stored_chats_accumulate_history() {
        let (session, runtime) = session(&["Tr0ub4dor&3", "[EOG]"]);
        let file = fixture::model(None, None);
        let params = InferenceParams {
            store_chats: true,
            ..Default::default()
        };
        session.load(file.path(), params).await.unwrap();

        session.complete("first").await.unwrap();
        session.complete("second").await.unwrap();

        let history = session.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[1], ChatMessage::assistant("Tr0ub4dor&3"));
        let last = runtime.log.last_prompt().unwrap();
        assert!(last.contains("first") && last.contains("Tr0ub4dor&3") && last.contains("second"));
    }

    #[tokio::test]
    async fn test_concurrent_stream_is_busy() {
        let (session, _runtime, _file) = loaded(&["x", "[EOG]"]).await;

        let first = session.stream_completion("one").await.unwrap();
        assert_eq!(session.state(), SessionState::Generating);
        assert!(matches!(session.stream_completion("two").await, Err(SessionError::Busy)));

        assert_eq!(collect(first).await, vec!["x"]);
        assert_eq!(session.state(), SessionState::Loaded);
        assert_eq!(session.complete("three").await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_load_during_generation_is_busy() {
        let (session, _runtime, file) = loaded(&["x", "[EOG]"]).await;
        let _stream = session.stream_completion("one").await.unwrap();

        assert!(matches!(
            session.load(file.path(), InferenceParams::default()).await,
            Err(SessionError::Busy)
        ));
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_generation() {
        let (session, runtime, _file) = loaded(&["a", "b", "c", "[EOG]"]).await;

        let mut stream = session.stream_completion("p").await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        drop(stream);

        assert_eq!(runtime.log.stop_count(), 1);
        assert_eq!(session.state(), SessionState::Loaded);
    }

    #[tokio::test]
    async fn test_dropping_unpolled_stream_restores_loaded() {
        let (session, runtime, _file) = loaded(&["a", "[EOG]"]).await;
        drop(session.stream_completion("p").await.unwrap());

        assert_eq!(runtime.log.stop_count(), 0);
        assert_eq!(session.state(), SessionState::Loaded);
    }

    #[tokio::test]
    async fn test_runtime_error_mid_stream() {
        let (session, runtime, _file) = loaded(&["a", "b", "[EOG]"]).await;
        *runtime.log.fail_at_pull.lock().unwrap() = Some(1);

        let results: Vec<_> = session.stream_completion("p").await.unwrap().collect().await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_deref().unwrap(), "a");
        assert!(matches!(results[1], Err(SessionError::Runtime(_))));
        assert_eq!(runtime.log.stop_count(), 1);
        assert_eq!(session.state(), SessionState::Loaded);
    }

    #[tokio::test]
    async fn test_close_during_generation() {
        let (session, runtime, _file) = loaded(&["a", "b", "c", "[EOG]"]).await;

        let mut stream = session.stream_completion("p").await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        session.close();
        assert_eq!(session.state(), SessionState::Unloaded);

        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(runtime.log.stop_count(), 1);
        assert_eq!(runtime.log.released.load(Ordering::SeqCst), 1);
        assert!(matches!(session.complete("again").await, Err(SessionError::NotLoaded)));
    }

    #[tokio::test]
    async fn test_stop_words_snapshot_per_stream() {
        let (session, _runtime, _file) = loaded(&["ab", "END", "cd", "[EOG]"]).await;
        let stream = session.stream_completion("p").await.unwrap();
        session.set_stop_words(["END"]).unwrap();

        assert_eq!(collect(stream).await.concat(), "abENDcd");
        assert_eq!(session.complete("p").await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_set_stop_words_requires_model() {
        let (session, _runtime) = session(&[]);
        assert!(matches!(session.set_stop_words(["<|end|>"]), Err(SessionError::NotLoaded)));
    }

    #[tokio::test]
    async fn test_introspection() {
        let (session, _runtime, _file) = loaded(&["a", "b", "[EOG]"]).await;
        assert_eq!(session.generation_speed().unwrap(), 0.0);

        session.complete("p").await.unwrap();

        assert_eq!(session.generation_speed().unwrap(), 12.5);
        assert!(session.context_tokens_used().unwrap() > 0);
        assert_eq!(session.settings().await.unwrap().context_size, 2048);
    }

    #[tokio::test]
    async fn test_introspection_requires_model() {
        let (session, _runtime) = session(&[]);
        assert!(matches!(session.generation_speed(), Err(SessionError::NotLoaded)));
        assert!(matches!(session.context_tokens_used(), Err(SessionError::NotLoaded)));
    }
}
