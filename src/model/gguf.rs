//! GGUF models run through llama.cpp (feature `llama`).
//!
//! Both built-in variants load through here and differ only in the architecture they accept
//! and their tokenizer conventions. Without the feature, loading always fails.

use std::path::Path;

use crate::error::BackendError;
use crate::model::Token;

/// Windows larger than this are not allocated even if the model was trained for them.
pub const MAX_CONTEXT: u32 = 4096;

pub struct GgufModel {
    architecture: &'static str,
    n_threads: usize,
    session: Option<imp::Session>,
}

impl GgufModel {
    pub fn new(architecture: &'static str) -> Self {
        Self { architecture, n_threads: num_cpus::get().max(1), session: None }
    }

    pub fn load(&mut self, path: &Path) -> Result<(), BackendError> {
        // release the old weights before mapping new ones
        self.session = None;
        if !path.is_file() {
            return Err(BackendError::Load(format!("no model file at {}", path.display())));
        }
        self.session = Some(imp::Session::load(path, self.architecture, self.n_threads)?);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.session.is_some()
    }

    pub fn unload(&mut self) {
        self.session = None;
    }

    /// Applied when the next model is loaded; llama.cpp fixes it per context.
    pub fn set_thread_count(&mut self, n_threads: usize) {
        self.n_threads = n_threads;
    }

    pub fn context_length(&self) -> Option<usize> {
        self.session.as_ref().map(imp::Session::context_length)
    }

    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, BackendError> {
        self.session()?.tokenize(text, add_bos)
    }

    pub fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, BackendError> {
        self.session()?.token_to_bytes(token)
    }

    pub fn is_end_of_generation(&self, token: Token) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_end_of_generation(token))
    }

    pub fn evaluate(&mut self, n_past: usize, tokens: &[Token]) -> Result<Vec<Vec<f32>>, BackendError> {
        let session = self.session.as_mut().ok_or(BackendError::NotLoaded)?;
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        session.evaluate(n_past, tokens)
    }

    fn session(&self) -> Result<&imp::Session, BackendError> {
        self.session.as_ref().ok_or(BackendError::NotLoaded)
    }
}

#[cfg(feature = "llama")]
mod imp {
    use std::mem::ManuallyDrop;
    use std::num::NonZeroU32;
    use std::path::Path;

    use llama_cpp_2::context::params::LlamaContextParams;
    use llama_cpp_2::context::LlamaContext;
    use llama_cpp_2::llama_backend::LlamaBackend as LLBackend;
    use llama_cpp_2::llama_batch::LlamaBatch;
    use llama_cpp_2::model::params::LlamaModelParams;
    use llama_cpp_2::model::{AddBos, LlamaModel, Special};
    use llama_cpp_2::token::LlamaToken;
    use llama_cpp_2::{send_logs_to_tracing, LogOptions};
    use once_cell::sync::OnceCell;
    use tracing::{debug, warn};

    use super::MAX_CONTEXT;
    use crate::error::BackendError;
    use crate::model::Token;

    // llama.cpp may only be initialised once per process.
    static LLAMA: OnceCell<LLBackend> = OnceCell::new();

    fn llama() -> Result<&'static LLBackend, BackendError> {
        LLAMA.get_or_try_init(|| {
            // route llama.cpp logs to tracing so they appear in our logs when RUST_LOG is set
            send_logs_to_tracing(LogOptions::default());
            LLBackend::init().map_err(|e| BackendError::Load(format!("init llama backend: {e}")))
        })
    }

    pub struct Session {
        // Borrows `model`; dropped by hand before the model is freed.
        ctx: ManuallyDrop<LlamaContext<'static>>,
        model: *mut LlamaModel,
        n_ctx: usize,
        n_evaluated: usize,
    }

    impl Session {
        pub fn load(path: &Path, architecture: &str, n_threads: usize) -> Result<Self, BackendError> {
            let backend = llama()?;
            let model = LlamaModel::load_from_file(backend, path, &LlamaModelParams::default())
                .map_err(|e| BackendError::Load(format!("load GGUF model: {e}")))?;

            match model.meta_val_str("general.architecture") {
                Ok(arch) if arch != architecture => {
                    return Err(BackendError::Load(format!(
                        "model architecture is {arch}, expected {architecture}"
                    )));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "model has no architecture metadata"),
            }

            let n_ctx = model.n_ctx_train().clamp(1, MAX_CONTEXT);
            let threads = i32::try_from(n_threads).unwrap_or(i32::MAX);
            let params = LlamaContextParams::default()
                .with_n_ctx(NonZeroU32::new(n_ctx))
                .with_n_batch(n_ctx)
                .with_n_threads(threads)
                .with_n_threads_batch(threads);

            let model: &'static LlamaModel = Box::leak(Box::new(model));
            let ctx = match model.new_context(backend, params) {
                Ok(ctx) => ctx,
                Err(e) => {
                    // SAFETY: `model` came from `Box::leak` above and nothing borrows it.
                    unsafe { drop(Box::from_raw(model as *const LlamaModel as *mut LlamaModel)) };
                    return Err(BackendError::Load(format!("create llama context: {e}")));
                }
            };
            debug!(n_ctx, n_threads, "llama context ready");

            Ok(Self {
                ctx: ManuallyDrop::new(ctx),
                model: model as *const LlamaModel as *mut LlamaModel,
                n_ctx: n_ctx as usize,
                n_evaluated: 0,
            })
        }

        fn model(&self) -> &LlamaModel {
            // SAFETY: the pointer stays valid until `drop`.
            unsafe { &*self.model }
        }

        pub fn context_length(&self) -> usize {
            self.n_ctx
        }

        pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, BackendError> {
            let bos = if add_bos { AddBos::Always } else { AddBos::Never };
            let tokens = self
                .model()
                .str_to_token(text, bos)
                .map_err(|e| BackendError::Tokenizer(e.to_string()))?;
            Ok(tokens.into_iter().map(|t| t.0).collect())
        }

        pub fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, BackendError> {
            self.model()
                .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
                .map_err(|e| BackendError::Tokenizer(e.to_string()))
        }

        pub fn is_end_of_generation(&self, token: Token) -> bool {
            self.model().is_eog_token(LlamaToken::new(token))
        }

        pub fn evaluate(&mut self, n_past: usize, tokens: &[Token]) -> Result<Vec<Vec<f32>>, BackendError> {
            if n_past == 0 {
                self.ctx.clear_kv_cache();
            } else if n_past != self.n_evaluated {
                return Err(BackendError::Inference(format!(
                    "cannot resume at position {n_past}, state ends at {}",
                    self.n_evaluated
                )));
            }
            self.n_evaluated = 0;

            let mut batch = LlamaBatch::new(tokens.len(), 1);
            for (offset, &token) in tokens.iter().enumerate() {
                let pos = i32::try_from(n_past + offset)
                    .map_err(|_| BackendError::Inference("position overflow".into()))?;
                batch
                    .add(LlamaToken::new(token), pos, &[0], true)
                    .map_err(|e| BackendError::Inference(e.to_string()))?;
            }
            self.ctx
                .decode(&mut batch)
                .map_err(|e| BackendError::Inference(format!("decode: {e}")))?;
            self.n_evaluated = n_past + tokens.len();

            Ok((0..tokens.len())
                .map(|i| self.ctx.get_logits_ith(i as i32).to_vec())
                .collect())
        }
    }

    impl Drop for Session {
        fn drop(&mut self) {
            // SAFETY: the context is dropped exactly once, before the model it borrows, and
            // `model` was produced by `Box::leak` in `load`.
            unsafe {
                ManuallyDrop::drop(&mut self.ctx);
                drop(Box::from_raw(self.model));
            }
        }
    }
}

#[cfg(not(feature = "llama"))]
mod imp {
    use std::path::Path;

    use crate::error::BackendError;
    use crate::model::Token;

    const REASON: &str = "built without the `llama` feature";

    // Never constructed: `load` always fails.
    pub enum Session {}

    impl Session {
        pub fn load(_path: &Path, _architecture: &str, _n_threads: usize) -> Result<Self, BackendError> {
            Err(BackendError::Unavailable(REASON))
        }

        pub fn context_length(&self) -> usize {
            match *self {}
        }

        pub fn tokenize(&self, _text: &str, _add_bos: bool) -> Result<Vec<Token>, BackendError> {
            match *self {}
        }

        pub fn token_to_bytes(&self, _token: Token) -> Result<Vec<u8>, BackendError> {
            match *self {}
        }

        pub fn is_end_of_generation(&self, _token: Token) -> bool {
            match *self {}
        }

        pub fn evaluate(&mut self, _n_past: usize, _tokens: &[Token]) -> Result<Vec<Vec<f32>>, BackendError> {
            match *self {}
        }
    }
}
