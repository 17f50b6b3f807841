use segmark_core::error::CoreError;
use segmark_inference::channel::InferenceError;
use segmark_persistence::PersistenceError;

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Session is closed")]
    Closed,
}
