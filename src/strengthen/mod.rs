//! Password strengthening
//!
//! Drives a [`ModelSession`] to propose stronger versions of weak passwords,
//! scores every original and candidate, and tracks per-row progress in a
//! [`CandidateStore`].

pub mod candidates;
pub mod scoring;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::inference::{InferenceParams, ModelSession, SessionError};
use crate::types::ChatRole;

pub use candidates::{Candidate, CandidateStore, PasswordRow, RowState};
pub use scoring::{PasswordScorer, ZxcvbnScorer, MAX_SCORE};

/// Instructions given to the model before every password
pub const PASSWORD_STRENGTH_SYSTEM_PROMPT: &str = "\
You are a password-strengthening assistant. Given a weak password, output a significantly stronger password that preserves the recognizable intent of the original. Follow strictly:
- Output only the strengthened password, nothing else.
- At least 12 characters (extend if needed), include upper and lower case, digits, and symbols.
- Avoid dictionary words, common patterns, trivial suffixes (e.g., 123, !), or simple substitutions only. Be creative and unpredictable while still memorable.
";

/// Turn markers that end a reply
pub const DEFAULT_STOP_WORDS: [&str; 3] = ["<|end|>", "<|user|>", "<|system|>"];

/// How long a row shows `Success` before returning to `Idle`
pub const SUCCESS_LINGER: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum StrengthenError {
    #[error("No model selected")]
    NoModel,

    #[error("Unknown password row: {0}")]
    UnknownRow(Uuid),

    #[error("Already improving all passwords")]
    AlreadyRunning,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Where the model to load comes from
pub trait ModelPathSource: Send + Sync {
    /// Persisted model path, if one was chosen
    fn model_path(&self) -> Option<PathBuf>;
}

impl ModelPathSource for Option<PathBuf> {
    fn model_path(&self) -> Option<PathBuf> {
        self.clone()
    }
}

/// Clears the improve-all flag when dropped
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Orchestrates scoring and improvement of password rows
pub struct Strengthener {
    session: Arc<ModelSession>,
    scorer: Arc<dyn PasswordScorer>,
    paths: Arc<dyn ModelPathSource>,
    store: Arc<CandidateStore>,
    params: InferenceParams,
    stop_words: Vec<String>,
    success_linger: Duration,
    improving_all: AtomicBool,
}

impl Strengthener {
    pub fn new(
        session: Arc<ModelSession>,
        scorer: Arc<dyn PasswordScorer>,
        paths: Arc<dyn ModelPathSource>,
        store: Arc<CandidateStore>,
    ) -> Self {
        Self {
            session,
            scorer,
            paths,
            store,
            params: InferenceParams::default(),
            stop_words: DEFAULT_STOP_WORDS.iter().map(|w| w.to_string()).collect(),
            success_linger: SUCCESS_LINGER,
            improving_all: AtomicBool::new(false),
        }
    }

    /// Parameters used whenever the model has to be (re)loaded
    pub fn with_params(mut self, params: InferenceParams) -> Self {
        self.params = params;
        self
    }

    /// Replaces [`DEFAULT_STOP_WORDS`]
    pub fn with_stop_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_words = words.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_success_linger(mut self, linger: Duration) -> Self {
        self.success_linger = linger;
        self
    }

    pub fn store(&self) -> &Arc<CandidateStore> {
        &self.store
    }

    pub fn is_improving_all(&self) -> bool {
        self.improving_all.load(Ordering::SeqCst)
    }

    /// Scores every original password, one at a time
    pub async fn score_all(&self) {
        for row in self.store.rows() {
            let score = self.scorer.score(&row.original).await;
            self.store.set_score(row.id, score);
        }
    }

    /// Generates, scores and selects a new candidate for one row
    pub async fn improve_one(&self, id: Uuid) -> Result<String, StrengthenError> {
        let row = self.store.get(id).ok_or(StrengthenError::UnknownRow(id))?;
        self.store.set_state(id, RowState::Generating);

        match self.generate(&row.original).await {
            Ok(value) => {
                let score = self.scorer.score(&value).await;
                self.store.add_candidate_and_select(id, value.clone(), score);
                self.mark_success(id);
                Ok(value)
            }
            Err(e) => {
                tracing::warn!("Improving password row {} failed: {}", id, e);
                self.store.set_state(id, RowState::Idle);
                Err(e)
            }
        }
    }

    /// Improves every row in order. Returns how many rows got a new candidate.
    ///
    /// Stops early if no model is available; other per-row failures are skipped.
    pub async fn improve_all(&self) -> Result<usize, StrengthenError> {
        if self.improving_all.swap(true, Ordering::SeqCst) {
            return Err(StrengthenError::AlreadyRunning);
        }
        let _running = RunningFlag(&self.improving_all);

        let rows = self.store.rows();
        for row in &rows {
            self.store.set_state(row.id, RowState::Waiting);
        }

        let mut improved = 0;
        for (i, row) in rows.iter().enumerate() {
            match self.improve_one(row.id).await {
                Ok(_) => improved += 1,
                Err(e @ (StrengthenError::NoModel | StrengthenError::Session(SessionError::Closed))) => {
                    for rest in &rows[i + 1..] {
                        self.store.set_state(rest.id, RowState::Idle);
                    }
                    return Err(e);
                }
                Err(_) => {}
            }
        }
        Ok(improved)
    }

    pub fn select_candidate(&self, row_id: Uuid, candidate_id: Uuid) -> bool {
        self.store.select_candidate(row_id, candidate_id)
    }

    /// Loads the persisted model unless a valid one is already loaded
    async fn ensure_model_ready(&self) -> Result<(), StrengthenError> {
        let path = self
            .paths
            .model_path()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(StrengthenError::NoModel)?;
        if self.session.ensure_loaded_or_reload(&path, self.params.clone()).await? {
            tracing::info!("Model loaded for strengthening: {}", path.display());
        }
        Ok(())
    }

    async fn generate(&self, original: &str) -> Result<String, StrengthenError> {
        self.ensure_model_ready().await?;
        self.session.set_stop_words(self.stop_words.iter().cloned())?;
        if self.session.history().is_empty() {
            self.session
                .add_message(ChatRole::System, PASSWORD_STRENGTH_SYSTEM_PROMPT)?;
        }
        let reply = self.session.complete(original).await?;
        Ok(reply.trim().to_string())
    }

    fn mark_success(&self, id: Uuid) {
        let at = Utc::now();
        self.store.set_state(id, RowState::Success(at));

        let store = Arc::clone(&self.store);
        let linger = self.success_linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            // a newer run may own the row by now
            if store.get(id).is_some_and(|row| row.state == RowState::Success(at)) {
                store.set_state(id, RowState::Idle);
            }
        });
    }
}
