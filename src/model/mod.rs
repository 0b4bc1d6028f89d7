use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tracing::{info, warn};

use crate::context::ContextId;
use crate::error::{BackendError, Error, Result};

pub mod gguf;
pub mod gptj;
pub mod llama;

pub use gptj::GptJBackend;
pub use llama::LlamaBackend;

/// Token id. Kept as `i32` to match the C ABI.
pub type Token = i32;

/// Model families the runtime knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    GptJ,
    Llama,
}

impl Variant {
    pub fn all() -> &'static [Variant] {
        &[Variant::GptJ, Variant::Llama]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::GptJ => "gptj",
            Variant::Llama => "llama",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gptj" | "gpt-j" => Ok(Variant::GptJ),
            "llama" => Ok(Variant::Llama),
            _ => Err(Error::UnsupportedVariant(s.to_string())),
        }
    }
}

/// The compute capability behind a model handle.
///
/// `evaluate` is the only stateful call: the backend keeps model state for positions
/// `0..n_past` and appends `tokens` after them, discarding anything it held beyond `n_past`.
/// A backend may refuse to resume from a position other than `0` or the end of what it last
/// evaluated; the generation loop only ever asks for those two.
pub trait Backend {
    fn variant(&self) -> Variant;

    fn load(&mut self, path: &Path) -> std::result::Result<(), BackendError>;

    fn is_loaded(&self) -> bool;

    fn unload(&mut self);

    /// Parallelism hint. Backends free to ignore it.
    fn set_thread_count(&mut self, _n_threads: usize) {}

    /// Largest window the loaded model can hold, if it has one.
    fn context_length(&self) -> Option<usize> {
        None
    }

    /// `add_bos` is set when the text opens a conversation.
    fn tokenize(&self, text: &str, add_bos: bool) -> std::result::Result<Vec<Token>, BackendError>;

    /// Raw bytes for one token; a multi-byte character may span several tokens.
    fn token_to_bytes(&self, token: Token) -> std::result::Result<Vec<u8>, BackendError>;

    fn is_end_of_sequence(&self, token: Token) -> bool;

    /// Returns one logits row per input token.
    fn evaluate(
        &mut self,
        n_past: usize,
        tokens: &[Token],
    ) -> std::result::Result<Vec<Vec<f32>>, BackendError>;
}

/// The closed set of built-in backends, selected by [`Variant`].
pub enum AnyBackend {
    GptJ(GptJBackend),
    Llama(LlamaBackend),
}

impl AnyBackend {
    pub fn new(variant: Variant) -> Self {
        match variant {
            Variant::GptJ => AnyBackend::GptJ(GptJBackend::new()),
            Variant::Llama => AnyBackend::Llama(LlamaBackend::new()),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $call:expr) => {
        match $self {
            AnyBackend::GptJ($b) => $call,
            AnyBackend::Llama($b) => $call,
        }
    };
}

impl Backend for AnyBackend {
    fn variant(&self) -> Variant {
        dispatch!(self, b => b.variant())
    }

    fn load(&mut self, path: &Path) -> std::result::Result<(), BackendError> {
        dispatch!(self, b => b.load(path))
    }

    fn is_loaded(&self) -> bool {
        dispatch!(self, b => b.is_loaded())
    }

    fn unload(&mut self) {
        dispatch!(self, b => b.unload())
    }

    fn set_thread_count(&mut self, n_threads: usize) {
        dispatch!(self, b => b.set_thread_count(n_threads))
    }

    fn context_length(&self) -> Option<usize> {
        dispatch!(self, b => b.context_length())
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> std::result::Result<Vec<Token>, BackendError> {
        dispatch!(self, b => b.tokenize(text, add_bos))
    }

    fn token_to_bytes(&self, token: Token) -> std::result::Result<Vec<u8>, BackendError> {
        dispatch!(self, b => b.token_to_bytes(token))
    }

    fn is_end_of_sequence(&self, token: Token) -> bool {
        dispatch!(self, b => b.is_end_of_sequence(token))
    }

    fn evaluate(
        &mut self,
        n_past: usize,
        tokens: &[Token],
    ) -> std::result::Result<Vec<Vec<f32>>, BackendError> {
        dispatch!(self, b => b.evaluate(n_past, tokens))
    }
}

/// Which context the backend state currently belongs to, and how far it reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Binding {
    pub context: ContextId,
    pub n_past: usize,
}

/// A handle owning one backend instance.
pub struct Model<B: Backend = AnyBackend> {
    pub(crate) backend: B,
    n_threads: usize,
    loaded: bool,
    pub(crate) binding: Option<Binding>,
}

impl Model<AnyBackend> {
    pub fn new(variant: Variant) -> Self {
        Self::from_backend(AnyBackend::new(variant))
    }

    /// Create a handle from a variant name such as `"gptj"` or `"llama"`.
    pub fn create(name: &str) -> Result<Self> {
        Ok(Self::new(name.parse()?))
    }
}

impl<B: Backend> Model<B> {
    pub fn from_backend(mut backend: B) -> Self {
        let n_threads = num_cpus::get().max(1);
        backend.set_thread_count(n_threads);
        Self { backend, n_threads, loaded: false, binding: None }
    }

    pub fn variant(&self) -> Variant {
        self.backend.variant()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Load model weights. Failures are logged and reported as `false`.
    pub fn load(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        self.binding = None;
        match self.backend.load(path) {
            Ok(()) => {
                self.loaded = self.backend.is_loaded();
                info!(variant = %self.variant(), path = %path.display(), loaded = self.loaded, "model load");
            }
            Err(e) => {
                self.loaded = false;
                warn!(variant = %self.variant(), path = %path.display(), error = %e, "model load failed");
            }
        }
        self.loaded
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn unload(&mut self) {
        self.backend.unload();
        self.loaded = false;
        self.binding = None;
    }

    /// Values below 1 are raised to 1.
    pub fn set_thread_count(&mut self, n_threads: usize) {
        self.n_threads = n_threads.max(1);
        self.backend.set_thread_count(self.n_threads);
    }

    pub fn thread_count(&self) -> usize {
        self.n_threads
    }

    pub fn tokenize(&self, text: &str) -> Result<Vec<Token>> {
        if !self.loaded {
            return Err(Error::ModelNotLoaded);
        }
        Ok(self.backend.tokenize(text, false)?)
    }

    /// Lossy for byte sequences that are not valid UTF-8.
    pub fn detokenize(&self, tokens: &[Token]) -> Result<String> {
        if !self.loaded {
            return Err(Error::ModelNotLoaded);
        }
        let mut bytes = Vec::new();
        for &token in tokens {
            bytes.extend(self.backend.token_to_bytes(token)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
