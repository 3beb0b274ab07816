//! Error model for parsing and running job scripts.
//!
//! Parsing failures (`Syntax`, `Structure`) are raised before any step runs.
//! Runtime failures (`Dependency`, `Execution`) abort the run at the failing
//! step and carry the step's line so an operator can find it.

use std::fmt;

use serde::Serialize;

use crate::job::StepDescriptor;

/// Which backend a step was dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Local,
    Remote(Endpoint),
}

/// One of the two remote orgs a script talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Src,
    Dst,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Src => write!(f, "src"),
            Endpoint::Dst => write!(f, "dst"),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local => write!(f, "local"),
            Backend::Remote(endpoint) => write!(f, "remote:{}", endpoint),
        }
    }
}

/// Location of a step in the script, attached to runtime errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRef {
    pub line: usize,
    pub text: String,
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: `{}`", self.line, self.text)
    }
}

impl From<&StepDescriptor> for StepRef {
    fn from(step: &StepDescriptor) -> Self {
        Self {
            line: step.line,
            text: step.raw_line.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Malformed line or unrecognized sink kind.
    #[error("syntax error at line {line}: {message} (`{text}`)")]
    Syntax {
        line: usize,
        text: String,
        message: String,
    },

    /// Unmatched or crossed batch markers.
    #[error("structure error at line {line}: {message}")]
    Structure { line: usize, message: String },

    /// A step reads a local table that no earlier step produced.
    #[error("dependency error at {step}: local table '{table}' has not been produced")]
    Dependency { table: String, step: StepRef },

    /// Backend failure that is not a retryable session expiry.
    #[error("{backend} execution failed{}: {message}", at(.step))]
    Execution {
        backend: Backend,
        message: String,
        step: Option<StepRef>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

fn at(step: &Option<StepRef>) -> String {
    match step {
        Some(step) => format!(" at {}", step),
        None => String::new(),
    }
}

impl JobError {
    pub fn syntax(line: usize, text: impl Into<String>, message: impl Into<String>) -> Self {
        JobError::Syntax {
            line,
            text: text.into(),
            message: message.into(),
        }
    }

    pub fn structure(line: usize, message: impl Into<String>) -> Self {
        JobError::Structure {
            line,
            message: message.into(),
        }
    }

    pub fn execution(backend: Backend, message: impl Into<String>) -> Self {
        JobError::Execution {
            backend,
            message: message.into(),
            step: None,
        }
    }

    /// Attach the failing step to an execution error that has none yet.
    pub fn at_step(self, step: &StepDescriptor) -> Self {
        match self {
            JobError::Execution {
                backend,
                message,
                step: None,
            } => JobError::Execution {
                backend,
                message,
                step: Some(step.into()),
            },
            other => other,
        }
    }

    /// Line number of the offending step, when known.
    pub fn line(&self) -> Option<usize> {
        match self {
            JobError::Syntax { line, .. } | JobError::Structure { line, .. } => Some(*line),
            JobError::Dependency { step, .. } => Some(step.line),
            JobError::Execution { step, .. } => step.as_ref().map(|s| s.line),
            JobError::Config(_) | JobError::Io(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
