//! The worker error family.
//!
//! Everything a task can fail with is one of four kinds. `Transport`
//! covers network and HTTP failures and is retried where the call site
//! documents it. `Run` means the current task cannot be completed and
//! is reported back to the coordinator. `Build` is a source build
//! failure, handled by callers like `Run`. `Fatal` means the worker
//! itself must stop; it is never retried, and [`WorkerError::wrap`]
//! guarantees that no catch-and-wrap can downgrade it.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Run,
    Build,
    Fatal,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("run error: {0}")]
    Run(String),
    #[error("build error: {0}")]
    Build(String),
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl WorkerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Transport => Self::Transport(message),
            ErrorKind::Run => Self::Run(message),
            ErrorKind::Build => Self::Build(message),
            ErrorKind::Fatal => Self::Fatal(message),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn run(message: impl Into<String>) -> Self {
        Self::Run(message.into())
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::Build(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Run(_) => ErrorKind::Run,
            Self::Build(_) => ErrorKind::Build,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transport(m) | Self::Run(m) | Self::Build(m) | Self::Fatal(m) => m,
        }
    }

    /// Re-wrap `inner` under a new kind and message. A fatal inner error
    /// passes through unchanged.
    pub fn wrap(kind: ErrorKind, message: impl Into<String>, inner: WorkerError) -> Self {
        if inner.is_fatal() {
            return inner;
        }
        Self::new(kind, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_replaces_non_fatal_errors() {
        let inner = WorkerError::transport("connection reset");
        let wrapped = WorkerError::wrap(ErrorKind::Run, "unable to download book", inner);
        assert_eq!(wrapped.kind(), ErrorKind::Run);
        assert_eq!(wrapped.message(), "unable to download book");
    }

    #[test]
    fn wrap_preserves_fatal_errors() {
        let inner = WorkerError::fatal("another worker is running in the same directory!");
        let wrapped = WorkerError::wrap(ErrorKind::Transport, "get request failed", inner);
        assert!(wrapped.is_fatal());
        assert_eq!(
            wrapped.message(),
            "another worker is running in the same directory!"
        );
    }

    #[test]
    fn wrap_is_idempotent_over_repeated_wrapping() {
        let mut err = WorkerError::fatal("too slow");
        for kind in [ErrorKind::Transport, ErrorKind::Run, ErrorKind::Build] {
            err = WorkerError::wrap(kind, "outer", err);
        }
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(err.message(), "too slow");
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = WorkerError::run("wrong bench");
        assert_eq!(err.to_string(), "run error: wrong bench");
    }
}
