use thiserror::Error;

use crate::sampler::SamplingError;

/// Errors reported by a [`Backend`](crate::model::Backend) implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("backend unavailable: {0}")]
    Unavailable(&'static str),

    #[error("no model loaded")]
    NotLoaded,

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("inference error: {0}")]
    Inference(String),
}

/// Errors surfaced by the model handle and the generation loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported model variant: {0:?}")]
    UnsupportedVariant(String),

    #[error("model is not loaded")]
    ModelNotLoaded,

    #[error("invalid prompt context: {0}")]
    InvalidContext(String),

    #[error(transparent)]
    Sampling(#[from] SamplingError),

    #[error("backend fault: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, Error>;
