use std::path::Path;

use super::gguf::GgufModel;
use super::{Backend, Token, Variant};
use crate::error::BackendError;

/// GPT-J's `<|endoftext|>`.
const END_OF_TEXT: Token = 50256;

/// GPT-J family models. The tokenizer has no BOS token.
pub struct GptJBackend {
    inner: GgufModel,
}

impl GptJBackend {
    pub fn new() -> Self {
        Self { inner: GgufModel::new("gptj") }
    }
}

impl Default for GptJBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for GptJBackend {
    fn variant(&self) -> Variant {
        Variant::GptJ
    }

    fn load(&mut self, path: &Path) -> Result<(), BackendError> {
        self.inner.load(path)
    }

    fn is_loaded(&self) -> bool {
        self.inner.is_loaded()
    }

    fn unload(&mut self) {
        self.inner.unload()
    }

    fn set_thread_count(&mut self, n_threads: usize) {
        self.inner.set_thread_count(n_threads)
    }

    fn context_length(&self) -> Option<usize> {
        self.inner.context_length()
    }

    fn tokenize(&self, text: &str, _add_bos: bool) -> Result<Vec<Token>, BackendError> {
        self.inner.tokenize(text, false)
    }

    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, BackendError> {
        self.inner.token_to_bytes(token)
    }

    fn is_end_of_sequence(&self, token: Token) -> bool {
        token == END_OF_TEXT || self.inner.is_end_of_generation(token)
    }

    fn evaluate(&mut self, n_past: usize, tokens: &[Token]) -> Result<Vec<Vec<f32>>, BackendError> {
        self.inner.evaluate(n_past, tokens)
    }
}
