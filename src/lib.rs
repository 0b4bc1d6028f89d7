//! A uniform inference runtime for autoregressive language models.
//!
//! A [`Model`] owns one backend, a caller-held [`PromptContext`] carries the conversation,
//! and [`Model::prompt`] (or the [`Generation`] iterator behind it) streams sampled tokens
//! while keeping the history inside a fixed window. The same surface is exported to C by
//! [`ffi`].

pub mod context;
pub mod error;
pub mod ffi;
pub mod generate;
pub mod model;
pub mod sampler;

pub use context::{ContextId, PromptContext};
pub use error::{BackendError, Error, Result};
pub use generate::{GeneratedToken, Generation, GenerationState, Outcome, StopReason};
pub use model::{AnyBackend, Backend, Model, Token, Variant};
pub use sampler::{Sampled, SamplingError, SamplingParams};
