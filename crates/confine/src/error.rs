use crate::engine::{BoxError, EngineError};
use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid construction options or lifecycle misuse. Never reaches `run`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A `require`/`import` specifier could not be resolved to a real or
    /// polyfilled module.
    #[error("could not resolve \"{specifier}\" from \"{from}\"")]
    Resolution {
        specifier: String,
        from: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Uncaught guest exception during compilation or execution.
    #[error("{0}")]
    Execution(String),

    /// An RPC path that does not resolve to a callable export.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Engine-internal failure (context creation, marshaling, disposal).
    #[error("engine error: {0}")]
    Engine(#[source] anyhow::Error),
}

impl Error {
    pub(crate) fn resolution(specifier: impl Into<String>, from: impl Into<String>) -> Self {
        Self::Resolution {
            specifier: specifier.into(),
            from: from.into(),
            source: None,
        }
    }

    pub(crate) fn resolution_with(
        specifier: impl Into<String>,
        from: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Resolution {
            specifier: specifier.into(),
            from: from.into(),
            source: Some(source.into()),
        }
    }
}

impl From<EngineError> for Error {
    fn from(value: EngineError) -> Self {
        match value {
            // `run` recognizes intentional termination before converting; any
            // other path treats a disposed context as an execution failure.
            EngineError::Terminated | EngineError::Disposed => Self::Execution(value.to_string()),
            EngineError::Guest(message) => Self::Execution(message),
            EngineError::Internal(err) => Self::Engine(err),
        }
    }
}
