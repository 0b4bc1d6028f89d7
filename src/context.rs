//! Per-conversation prompt state.
//!
//! A [`PromptContext`] is created once per conversation, handed to every generation call by
//! `&mut`, and carries the token history plus the logits row produced after each token.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::model::Token;
use crate::sampler::SamplingParams;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a prompt context, used by a model handle to know whose state its backend holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

#[derive(Debug)]
pub struct PromptContext {
    id: ContextId,
    tokens: Vec<Token>,
    logits: Vec<Vec<f32>>,
    /// Fixed window size.
    pub n_ctx: usize,
    /// Tokens to generate per call, 0 for no limit.
    pub n_predict: usize,
    pub top_k: usize,
    pub top_p: f32,
    pub temp: f32,
    /// Prompt tokens fed to the backend per evaluation.
    pub n_batch: usize,
    pub repeat_penalty: f32,
    /// Trailing tokens subject to the repetition penalty.
    pub repeat_last_n: usize,
    /// Fraction of the window dropped when it fills up.
    pub context_erase: f32,
}

impl Default for PromptContext {
    fn default() -> Self {
        Self {
            id: ContextId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            tokens: Vec::new(),
            logits: Vec::new(),
            n_ctx: 1024,
            n_predict: 128,
            top_k: 40,
            top_p: 0.9,
            temp: 0.1,
            n_batch: 8,
            repeat_penalty: 1.2,
            repeat_last_n: 10,
            context_erase: 0.5,
        }
    }
}

impl PromptContext {
    pub fn new(n_ctx: usize) -> Self {
        Self { n_ctx, ..Self::default() }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Tokens already folded into model state.
    pub fn n_past(&self) -> usize {
        self.tokens.len()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// One row per token: the logits the backend produced after evaluating that token.
    pub fn logits(&self) -> &[Vec<f32>] {
        &self.logits
    }

    pub fn last_logits(&self) -> Option<&[f32]> {
        self.logits.last().map(Vec::as_slice)
    }

    pub fn is_full(&self) -> bool {
        self.n_past() >= self.n_ctx
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            top_k: self.top_k,
            top_p: self.top_p,
            temp: self.temp,
            repeat_penalty: self.repeat_penalty,
        }
    }

    /// The trailing `repeat_last_n` tokens.
    pub fn recent_tokens(&self) -> &[Token] {
        let start = self.tokens.len().saturating_sub(self.repeat_last_n);
        &self.tokens[start..]
    }

    /// Number of tokens the erase drops: `floor(n_ctx * context_erase)` clamped to `[1, n_past]`.
    pub fn erase_count(&self) -> usize {
        let n_past = self.n_past();
        if n_past == 0 {
            return 0;
        }
        let wanted = (self.n_ctx as f64 * f64::from(self.context_erase)).floor() as usize;
        wanted.clamp(1, n_past)
    }

    /// Drop the oldest entries when the window is full. Returns how many were dropped; below
    /// capacity this does nothing.
    pub fn erase_window(&mut self) -> usize {
        if !self.is_full() {
            return 0;
        }
        let erased = self.erase_count();
        self.tokens.drain(..erased);
        self.logits.drain(..erased);
        erased
    }

    /// Forget the conversation; parameters are kept.
    pub fn reset(&mut self) {
        self.truncate(0);
    }

    /// Rewind the history to its first `n_past` entries.
    pub fn truncate(&mut self, n_past: usize) {
        self.tokens.truncate(n_past);
        self.logits.truncate(n_past);
    }

    pub(crate) fn push(&mut self, tokens: &[Token], rows: Vec<Vec<f32>>) {
        debug_assert_eq!(tokens.len(), rows.len());
        self.tokens.extend_from_slice(tokens);
        self.logits.extend(rows);
    }

    pub(crate) fn replace_logits(&mut self, rows: Vec<Vec<f32>>) {
        debug_assert_eq!(rows.len(), self.tokens.len());
        self.logits = rows;
    }

    /// Check the parameter ranges and the history invariant.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidContext(msg));
        if self.n_ctx == 0 {
            return invalid("n_ctx must be positive".into());
        }
        if self.n_batch == 0 {
            return invalid("n_batch must be positive".into());
        }
        if self.top_k == 0 {
            return invalid("top_k must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return invalid(format!("top_p {} outside [0, 1]", self.top_p));
        }
        if self.temp.is_nan() || self.temp < 0.0 {
            return invalid(format!("temp {} is negative", self.temp));
        }
        if self.repeat_penalty.is_nan() || self.repeat_penalty < 0.0 {
            return invalid(format!("repeat_penalty {} is negative", self.repeat_penalty));
        }
        if !(0.0..=1.0).contains(&self.context_erase) {
            return invalid(format!("context_erase {} outside [0, 1]", self.context_erase));
        }
        if self.tokens.len() != self.logits.len() {
            return invalid(format!(
                "{} tokens but {} logits rows",
                self.tokens.len(),
                self.logits.len()
            ));
        }
        if self.n_past() > self.n_ctx {
            return invalid(format!("n_past {} exceeds n_ctx {}", self.n_past(), self.n_ctx));
        }
        Ok(())
    }
}
