//! Typed errors for engine resolution.

/// Errors surfaced by the engine factory.
///
/// Construction-time failures (`EngineNotFound`, `EngineDisabled`,
/// `ConstructionFailed`) are recoverable through the fallback chain;
/// `NoEngineAvailable` is the one variant a fallback-requesting caller can
/// still see.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("unknown engine '{requested}', available engines: {available:?}")]
    EngineNotFound {
        requested: String,
        available: Vec<String>,
    },

    #[error("engine '{0}' is disabled in configuration")]
    EngineDisabled(String),

    #[error("failed to construct engine '{id}': {message}")]
    ConstructionFailed { id: String, message: String },

    #[error("no OCR engine available, fallback chain exhausted: [{}]", .attempts.join("; "))]
    NoEngineAvailable { attempts: Vec<String> },
}
