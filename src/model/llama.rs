use std::path::Path;

use super::gguf::GgufModel;
use super::{Backend, Token, Variant};
use crate::error::BackendError;

/// LLaMA family models. A BOS token opens every conversation.
pub struct LlamaBackend {
    inner: GgufModel,
}

impl LlamaBackend {
    pub fn new() -> Self {
        Self { inner: GgufModel::new("llama") }
    }
}

impl Default for LlamaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for LlamaBackend {
    fn variant(&self) -> Variant {
        Variant::Llama
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

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, BackendError> {
        self.inner.tokenize(text, add_bos)
    }

    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, BackendError> {
        self.inner.token_to_bytes(token)
    }

    fn is_end_of_sequence(&self, token: Token) -> bool {
        self.inner.is_end_of_generation(token)
    }

    fn evaluate(&mut self, n_past: usize, tokens: &[Token]) -> Result<Vec<Vec<f32>>, BackendError> {
        self.inner.evaluate(n_past, tokens)
    }
}
