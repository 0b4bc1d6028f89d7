//! The generation loop.
//!
//! [`Generation`] is a pull-based iterator: every `next()` advances the state machine until one
//! token is produced or a terminal state is reached. [`Model::prompt`] drives it with the
//! caller's response callback and is what the C ABI calls.

use std::iter::FusedIterator;
use std::time::Instant;

use encoding_rs::{CoderResult, Decoder, UTF_8};
use metrics::{counter, histogram};
use rand::RngCore;
use serde::Serialize;
use tracing::{debug, error};

use crate::context::PromptContext;
use crate::error::{BackendError, Error, Result};
use crate::model::{Backend, Binding, Model, Token};
use crate::sampler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Idle,
    Prompting,
    Generating,
    Recalculating,
    Done,
    Cancelled,
    Failed,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndOfSequence,
    /// `n_predict` tokens were produced.
    Budget,
    /// Nothing to condition on: empty prompt and empty history.
    EmptyContext,
}

/// How a generation call ended. Failures are reported as [`Error`]s instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Done(StopReason),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedToken {
    pub token: Token,
    /// Decoded text; empty while a multi-byte character is still incomplete. The token that
    /// uses up `n_predict` flushes such a character as U+FFFD. A character left open when the
    /// model ends the sequence or the caller cancels is dropped.
    pub text: String,
    pub probability: f32,
}

pub struct Generation<'a, B: Backend, F: FnMut(bool) -> bool> {
    model: &'a mut Model<B>,
    ctx: &'a mut PromptContext,
    recalculate: F,
    rng: Option<&'a mut dyn RngCore>,
    prompt: Vec<Token>,
    fed: usize,
    produced: usize,
    state: GenerationState,
    stop: Option<StopReason>,
    decoder: Decoder,
    variant: &'static str,
}

impl<'a, B: Backend, F: FnMut(bool) -> bool> Generation<'a, B, F> {
    /// Draw from `rng` instead of the process-wide source.
    pub fn with_rng(mut self, rng: &'a mut dyn RngCore) -> Self {
        self.rng = Some(rng);
        self
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    /// Tokens emitted so far.
    pub fn produced(&self) -> usize {
        self.produced
    }

    pub fn prompt_tokens(&self) -> &[Token] {
        &self.prompt
    }

    /// `None` until the generation reaches `Done` or `Cancelled`.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.state {
            GenerationState::Done => self.stop.map(Outcome::Done),
            GenerationState::Cancelled => Some(Outcome::Cancelled),
            _ => None,
        }
    }

    /// Stop without producing further tokens. Everything emitted so far stays in the context.
    pub fn cancel(&mut self) {
        self.finish(GenerationState::Cancelled);
    }

    fn step(&mut self) -> Result<Option<GeneratedToken>> {
        loop {
            match self.state {
                GenerationState::Idle => {
                    self.state = GenerationState::Prompting;
                    if !self.rebind()? {
                        self.cancel();
                        return Ok(None);
                    }
                }
                GenerationState::Prompting => {
                    if !self.feed_prompt()? {
                        self.cancel();
                        return Ok(None);
                    }
                    self.state = GenerationState::Generating;
                }
                GenerationState::Generating | GenerationState::Recalculating => {
                    return self.next_token();
                }
                GenerationState::Done | GenerationState::Cancelled | GenerationState::Failed => {
                    return Ok(None);
                }
            }
        }
    }

    /// Rebuild the backend state if it holds another context's history (or a stale copy of
    /// this one).
    fn rebind(&mut self) -> Result<bool> {
        let n_past = self.ctx.n_past();
        let current = Binding { context: self.ctx.id(), n_past };
        if n_past == 0 || self.model.binding == Some(current) {
            return Ok(true);
        }
        debug!(n_past, "backend state does not match context, recalculating");
        if !(self.recalculate)(true) {
            return Ok(false);
        }
        self.recalculate_window()?;
        Ok((self.recalculate)(false))
    }

    fn feed_prompt(&mut self) -> Result<bool> {
        while self.fed < self.prompt.len() {
            if !self.make_room()? {
                return Ok(false);
            }
            // a batch never crosses the window edge, so the erase only fires between batches
            let room = self.ctx.n_ctx - self.ctx.n_past();
            let end = self.prompt.len().min(self.fed + self.ctx.n_batch.min(room));
            append(&mut *self.model, &mut *self.ctx, &self.prompt[self.fed..end])?;
            debug!(fed = end, total = self.prompt.len(), n_past = self.ctx.n_past(), "prompt batch");
            self.fed = end;
        }
        counter!("llmodel_prompt_tokens_total", "variant" => self.variant)
            .increment(self.prompt.len() as u64);
        Ok(true)
    }

    fn next_token(&mut self) -> Result<Option<GeneratedToken>> {
        if self.ctx.n_predict != 0 && self.produced >= self.ctx.n_predict {
            return Ok(self.stop(StopReason::Budget));
        }
        if self.ctx.last_logits().is_none() {
            return Ok(self.stop(StopReason::EmptyContext));
        }

        let started = Instant::now();
        let params = self.ctx.sampling();
        let logits = self.ctx.last_logits().unwrap_or(&[]);
        let recent = self.ctx.recent_tokens();
        let sampled = match self.rng.as_deref_mut() {
            Some(rng) => sampler::sample(logits, recent, &params, rng),
            None => sampler::sample_shared(logits, recent, &params),
        }?;
        let token = sampled.token;

        if self.model.backend.is_end_of_sequence(token) {
            return Ok(self.stop(StopReason::EndOfSequence));
        }
        let bytes = self.model.backend.token_to_bytes(token)?;

        if !self.make_room()? {
            self.cancel();
            return Ok(None);
        }
        append(&mut *self.model, &mut *self.ctx, &[token])?;
        self.produced += 1;

        // the budget is spent, so an unfinished character cannot be completed any more
        let last = self.ctx.n_predict != 0 && self.produced >= self.ctx.n_predict;
        let text = self.decode(&bytes, last);
        counter!("llmodel_generated_tokens_total", "variant" => self.variant).increment(1);
        histogram!("llmodel_token_seconds", "variant" => self.variant)
            .record(started.elapsed().as_secs_f64());
        Ok(Some(GeneratedToken { token, text, probability: sampled.probability }))
    }

    /// Run the context erase if the window is full. `false` means the recalculation callback
    /// asked to stop.
    fn make_room(&mut self) -> Result<bool> {
        if !self.ctx.is_full() {
            return Ok(true);
        }
        if !(self.recalculate)(true) {
            return Ok(false);
        }
        let erased = self.ctx.erase_window();
        counter!("llmodel_context_erase_total", "variant" => self.variant).increment(1);
        debug!(erased, n_past = self.ctx.n_past(), n_ctx = self.ctx.n_ctx, "context window full");
        self.recalculate_window()?;
        Ok((self.recalculate)(false))
    }

    /// Re-evaluate the whole history from position 0, refreshing its logits rows.
    fn recalculate_window(&mut self) -> Result<()> {
        let resume = self.state;
        self.state = GenerationState::Recalculating;
        self.model.binding = None;

        let tokens = self.ctx.tokens().to_vec();
        let mut rows = Vec::with_capacity(tokens.len());
        for chunk in tokens.chunks(self.ctx.n_batch) {
            let out = self.model.backend.evaluate(rows.len(), chunk)?;
            check_rows(&out, chunk.len())?;
            rows.extend(out);
        }
        self.ctx.replace_logits(rows);
        self.model.binding = Some(Binding { context: self.ctx.id(), n_past: self.ctx.n_past() });

        self.state = resume;
        Ok(())
    }

    /// With `last` set, bytes still waiting for the rest of a character come out as U+FFFD.
    fn decode(&mut self, bytes: &[u8], last: bool) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len() * 3 + 4);
        let mut text = String::with_capacity(capacity);
        let (result, _, _) = self.decoder.decode_to_string(bytes, &mut text, last);
        debug_assert_eq!(result, CoderResult::InputEmpty);
        text
    }

    fn stop(&mut self, reason: StopReason) -> Option<GeneratedToken> {
        self.stop = Some(reason);
        self.finish(GenerationState::Done);
        None
    }

    fn finish(&mut self, state: GenerationState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = state;
        let outcome = match state {
            GenerationState::Done => "done",
            GenerationState::Cancelled => "cancelled",
            _ => "failed",
        };
        counter!("llmodel_generation_outcome_total", "variant" => self.variant, "outcome" => outcome)
            .increment(1);
        debug!(outcome, produced = self.produced, n_past = self.ctx.n_past(), "generation finished");
    }
}

impl<B: Backend, F: FnMut(bool) -> bool> Iterator for Generation<'_, B, F> {
    type Item = Result<GeneratedToken>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(token) => token.map(Ok),
            Err(e) => {
                error!(error = %e, state = ?self.state, "generation failed");
                self.finish(GenerationState::Failed);
                Some(Err(e))
            }
        }
    }
}

impl<B: Backend, F: FnMut(bool) -> bool> FusedIterator for Generation<'_, B, F> {}

fn append<B: Backend>(model: &mut Model<B>, ctx: &mut PromptContext, tokens: &[Token]) -> Result<()> {
    let n_past = ctx.n_past();
    model.binding = None;
    let rows = model.backend.evaluate(n_past, tokens)?;
    check_rows(&rows, tokens.len())?;
    ctx.push(tokens, rows);
    model.binding = Some(Binding { context: ctx.id(), n_past: ctx.n_past() });
    Ok(())
}

fn check_rows(rows: &[Vec<f32>], expected: usize) -> Result<()> {
    if rows.len() != expected {
        return Err(Error::Backend(BackendError::Inference(format!(
            "backend returned {} logits rows for {expected} tokens",
            rows.len()
        ))));
    }
    Ok(())
}

impl<B: Backend> Model<B> {
    /// Start a generation for `prompt` on `ctx`.
    ///
    /// Nothing is evaluated until the returned iterator is polled. `recalculate` is told when
    /// the window is being rebuilt (`true`) and when that is finished (`false`); returning
    /// `false` from it cancels the generation.
    pub fn generate<'a, F>(
        &'a mut self,
        prompt: &str,
        ctx: &'a mut PromptContext,
        recalculate: F,
    ) -> Result<Generation<'a, B, F>>
    where
        F: FnMut(bool) -> bool,
    {
        if !self.is_loaded() {
            return Err(Error::ModelNotLoaded);
        }
        ctx.validate()?;
        if let Some(limit) = self.backend.context_length() {
            if ctx.n_ctx > limit {
                return Err(Error::InvalidContext(format!(
                    "n_ctx {} exceeds the model's window of {limit}",
                    ctx.n_ctx
                )));
            }
        }
        let prompt = self.backend.tokenize(prompt, ctx.n_past() == 0)?;
        let variant = self.variant().as_str();

        Ok(Generation {
            model: self,
            ctx,
            recalculate,
            rng: None,
            prompt,
            fed: 0,
            produced: 0,
            state: GenerationState::Idle,
            stop: None,
            decoder: UTF_8.new_decoder_without_bom_handling(),
            variant,
        })
    }

    /// Run a generation to completion, handing every token to `response`.
    ///
    /// Returning `false` from either callback ends the call with [`Outcome::Cancelled`];
    /// the token passed to the vetoing `response` call is already part of `ctx`.
    pub fn prompt<R, F>(
        &mut self,
        prompt: &str,
        ctx: &mut PromptContext,
        response: R,
        recalculate: F,
    ) -> Result<Outcome>
    where
        R: FnMut(Token, &str) -> bool,
        F: FnMut(bool) -> bool,
    {
        drive(self.generate(prompt, ctx, recalculate)?, response)
    }

    /// [`Model::prompt`] drawing from `rng`.
    pub fn prompt_with_rng<R, F>(
        &mut self,
        prompt: &str,
        ctx: &mut PromptContext,
        response: R,
        recalculate: F,
        rng: &mut dyn RngCore,
    ) -> Result<Outcome>
    where
        R: FnMut(Token, &str) -> bool,
        F: FnMut(bool) -> bool,
    {
        drive(self.generate(prompt, ctx, recalculate)?.with_rng(rng), response)
    }

    /// Generate a whole response and return its text.
    pub fn prompt_to_string(&mut self, prompt: &str, ctx: &mut PromptContext) -> Result<String> {
        let mut out = String::new();
        for token in self.generate(prompt, ctx, |_| true)? {
            out.push_str(&token?.text);
        }
        Ok(out)
    }
}

fn drive<B, F, R>(mut generation: Generation<'_, B, F>, mut response: R) -> Result<Outcome>
where
    B: Backend,
    F: FnMut(bool) -> bool,
    R: FnMut(Token, &str) -> bool,
{
    while let Some(token) = generation.next() {
        let token = token?;
        if !response(token.token, &token.text) {
            generation.cancel();
            return Ok(Outcome::Cancelled);
        }
    }
    Ok(generation.outcome().unwrap_or(Outcome::Cancelled))
}
