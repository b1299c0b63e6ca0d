//! Error kinds shared by every stage of the pipeline.
//!
//! Parse and compile errors stop a program before a `Context` exists.
//! Runtime errors are isolated to the step that raised them and are handed
//! to the host through the runner's error callback. Internal errors mean
//! the interpreter itself is inconsistent and are never swallowed.

use crate::parser::Span;
use thiserror::Error;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    Compile,
    Runtime,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("parse error: {message}")]
    Parse { message: String, span: Span },
    #[error("compile error: {message}")]
    Compile { message: String, span: Span },
    #[error("runtime error: {message}")]
    Runtime { message: String, span: Option<Span> },
    #[error("internal consistency error: {message}")]
    Internal { message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn parse(message: impl Into<String>, span: Span) -> Self {
        Self::Parse {
            message: message.into(),
            span,
        }
    }

    pub fn compile(message: impl Into<String>, span: Span) -> Self {
        Self::Compile {
            message: message.into(),
            span,
        }
    }

    pub fn runtime(message: impl Into<String>, span: Span) -> Self {
        Self::Runtime {
            message: message.into(),
            span: Some(span),
        }
    }

    /// Runtime error raised outside any instruction (e.g. no program loaded).
    pub fn runtime_unlocated(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            span: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Compile { .. } => ErrorKind::Compile,
            Self::Runtime { .. } => ErrorKind::Runtime,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Parse { message, .. }
            | Self::Compile { message, .. }
            | Self::Runtime { message, .. }
            | Self::Internal { message } => message,
        }
    }

    /// Source location of the offending AST node, when known.
    pub fn span(&self) -> Option<Span> {
        match self {
            Self::Parse { span, .. } | Self::Compile { span, .. } => Some(*span),
            Self::Runtime { span, .. } => *span,
            Self::Internal { .. } => None,
        }
    }

    /// Internal errors indicate an interpreter bug and must abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Attach a span to a runtime error that does not have one yet.
    pub fn located(self, origin: Span) -> Self {
        match self {
            Self::Runtime {
                message,
                span: None,
            } => Self::Runtime {
                message,
                span: Some(origin),
            },
            other => other,
        }
    }
}
