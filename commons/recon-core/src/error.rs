use crate::graph::GraphError;
use crate::model::ObjectKey;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the control loop should treat an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resource is gone; nothing to do.
    NotFound,
    /// Stored revision moved underneath us; retry from a fresh fetch.
    Conflict,
    /// Transient; retry with backoff.
    Retryable,
    /// Will not heal by retrying; surfaced as a terminal failure.
    Critical,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(ObjectKey),
    #[error(
        "conflict on {key}: expected revision {expected}, found {found}"
    )]
    Conflict {
        key: ObjectKey,
        expected: u64,
        found: u64,
    },
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),
    #[error("transient failure: {0}")]
    Retryable(String),
    #[error("{0}")]
    Critical(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Step(#[from] Box<StepError>),
    #[error("reconcile cancelled")]
    Cancelled,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    pub fn critical(reason: impl Into<String>) -> Self {
        Self::Critical(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict { .. } | Error::AlreadyExists(_) => {
                ErrorKind::Conflict
            }
            Error::Retryable(_) | Error::Cancelled => ErrorKind::Retryable,
            // A cyclic or dangling dependency graph won't fix itself.
            Error::Critical(_)
            | Error::Graph(_)
            | Error::Serialization(_) => ErrorKind::Critical,
            Error::Step(step) => step.source.kind(),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.kind() == ErrorKind::Critical
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

/// An ensure step failed. The step's own error is kept as-is in `source`.
#[derive(thiserror::Error, Debug)]
#[error("ensure step `{step}` failed: {source}")]
pub struct StepError {
    pub step: String,
    #[source]
    pub source: Error,
}

impl StepError {
    pub fn new(step: impl Into<String>, source: Error) -> Self {
        Self {
            step: step.into(),
            source,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.source.is_critical()
    }
}

impl From<StepError> for Error {
    fn from(value: StepError) -> Self {
        Error::Step(Box::new(value))
    }
}
