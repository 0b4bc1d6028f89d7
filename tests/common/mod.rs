#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use llmodel::{Backend, BackendError, Model, PromptContext, Token, Variant};

pub const VOCAB: usize = 16;

/// Deterministic backend: after token `t` the next token is `(t + 1) % VOCAB` with a clear
/// margin. Prompts are whitespace-separated token ids.
pub struct ScriptedBackend {
    pub loaded: bool,
    pub eos: Option<Token>,
    pub window: Option<usize>,
    pub threads: usize,
    /// Fail every evaluation from this call on (0-based).
    pub fail_from: Option<usize>,
    pub bytes: HashMap<Token, Vec<u8>>,
    /// `(n_past, tokens)` for every evaluation.
    pub evaluations: Vec<(usize, Vec<Token>)>,
    state: Vec<Token>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            loaded: false,
            eos: Some(15),
            window: None,
            threads: 0,
            fail_from: None,
            bytes: HashMap::new(),
            evaluations: Vec::new(),
            state: Vec::new(),
        }
    }

    pub fn without_eos(mut self) -> Self {
        self.eos = None;
        self
    }

    fn row(token: Token) -> Vec<f32> {
        let mut row = vec![0.0; VOCAB];
        row[(token as usize + 1) % VOCAB] = 10.0;
        row
    }
}

impl Backend for ScriptedBackend {
    fn variant(&self) -> Variant {
        Variant::Llama
    }

    fn load(&mut self, path: &Path) -> Result<(), BackendError> {
        if path.to_str() == Some("missing") {
            return Err(BackendError::Load("no such file".into()));
        }
        self.loaded = true;
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn unload(&mut self) {
        self.loaded = false;
        self.state.clear();
    }

    fn set_thread_count(&mut self, n_threads: usize) {
        self.threads = n_threads;
    }

    fn context_length(&self) -> Option<usize> {
        self.window
    }

    fn tokenize(&self, text: &str, _add_bos: bool) -> Result<Vec<Token>, BackendError> {
        text.split_whitespace()
            .map(|w| w.parse::<Token>().map_err(|e| BackendError::Tokenizer(format!("{w}: {e}"))))
            .collect()
    }

    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, BackendError> {
        Ok(self
            .bytes
            .get(&token)
            .cloned()
            .unwrap_or_else(|| format!("<{token}>").into_bytes()))
    }

    fn is_end_of_sequence(&self, token: Token) -> bool {
        self.eos == Some(token)
    }

    fn evaluate(&mut self, n_past: usize, tokens: &[Token]) -> Result<Vec<Vec<f32>>, BackendError> {
        if self.fail_from.is_some_and(|n| self.evaluations.len() >= n) {
            return Err(BackendError::Inference("scripted failure".into()));
        }
        if n_past != 0 && n_past != self.state.len() {
            return Err(BackendError::Inference(format!(
                "resume at {n_past} but state ends at {}",
                self.state.len()
            )));
        }
        self.evaluations.push((n_past, tokens.to_vec()));
        self.state.truncate(n_past);
        self.state.extend_from_slice(tokens);
        Ok(tokens.iter().map(|&t| Self::row(t)).collect())
    }
}

pub fn loaded_model(backend: ScriptedBackend) -> Model<ScriptedBackend> {
    let mut model = Model::from_backend(backend);
    assert!(model.load("scripted"));
    model
}

/// Greedy context without repetition penalty.
pub fn greedy_context(n_ctx: usize) -> PromptContext {
    let mut ctx = PromptContext::new(n_ctx);
    ctx.temp = 0.0;
    ctx.repeat_penalty = 1.0;
    ctx.n_predict = 0;
    ctx
}

/// Run a prompt, collecting emitted tokens and recalculation notifications.
pub fn run(
    model: &mut Model<ScriptedBackend>,
    ctx: &mut PromptContext,
    prompt: &str,
) -> (llmodel::Result<llmodel::Outcome>, Vec<Token>, Vec<bool>) {
    let mut emitted = Vec::new();
    let mut recalcs = Vec::new();
    let outcome = model.prompt(
        prompt,
        ctx,
        |token, _| {
            emitted.push(token);
            true
        },
        |r| {
            recalcs.push(r);
            true
        },
    );
    (outcome, emitted, recalcs)
}
