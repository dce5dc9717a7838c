//! Run errors

use std::fmt;
use std::path::PathBuf;

/// The kind of run error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad invocation or environment, detected before any test runs
    Setup,
    /// The shell session itself could not be started
    Shell,
    /// IO error
    Io,
}

/// A fatal runner error with optional path context.
///
/// Per-test pass/fail/skip verdicts are not errors; they travel in
/// [`Outcome`](crate::Outcome) values. This type covers the conditions that
/// abort the run.
#[derive(Debug)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    pub path: Option<PathBuf>,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn setup(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Setup, msg)
    }

    pub fn shell(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Shell, msg)
    }

    pub fn is_setup(&self) -> bool {
        self.kind == ErrorKind::Setup
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref path) = self.path {
            write!(f, "{}: ", path.display())?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RunError {}

impl From<std::io::Error> for RunError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, e.to_string())
    }
}
