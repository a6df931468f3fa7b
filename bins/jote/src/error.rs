//! Error types for loading definitions and running tests.
//!
//! `LoadError` is fatal to the whole invocation: if any definition is
//! untrustworthy the number of tests to run is unknown. `TestError` only
//! ever fails the test that raised it.

use crate::engine::BackendError;
use crate::evaluator::CheckFailure;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("expected {what} \"{}\" but it is not here", .path.display())]
    Missing { what: &'static str, path: PathBuf },

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not valid YAML: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("\"{}\" does not comply with the {schema} schema", .path.display())]
    Schema {
        path: PathBuf,
        schema: &'static str,
        violations: Vec<String>,
    },

    #[error("\"{}\" fails lint", .path.display())]
    Lint { path: PathBuf, problems: Vec<String> },

    #[error("lint policy \"{}\" is invalid: {message}", .path.display())]
    LintPolicy { path: PathBuf, message: String },

    #[error("embedded {schema} schema is invalid: {message}")]
    SchemaSetup {
        schema: &'static str,
        message: String,
    },
}

impl LoadError {
    /// Every individual violation behind the error, for reporting.
    pub fn details(&self) -> &[String] {
        match self {
            LoadError::Schema { violations, .. } => violations,
            LoadError::Lint { problems, .. } => problems,
            _ => &[],
        }
    }
}

#[derive(Debug, Error)]
pub enum TestError {
    #[error("test variable ({name}) not declared as input or option")]
    UndeclaredVariable { name: String },

    #[error("test variable ({name}) is not declared as multiple but the test provides a list")]
    InputArity { name: String },

    #[error("failed to render command \"{template}\": {message}")]
    Render { template: String, message: String },

    #[error("\"{collection}.{job}.{test}\" is not a usable test directory name")]
    UnsafeName {
        collection: String,
        job: String,
        test: String,
    },

    #[error("input file {path} must start with \"{prefix}/\"")]
    MisrootedInput { path: String, prefix: &'static str },

    #[error("missing input file {path}")]
    MissingInput { path: String },

    #[error("test environment \"{}\": {source}", .path.display())]
    Environment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("exit_code={actual} expected_exit_code={expected}")]
    ExitCodeMismatch {
        actual: i64,
        expected: i64,
        stdout: String,
        stderr: String,
    },

    #[error(transparent)]
    Check(#[from] CheckFailure),
}

impl TestError {
    pub(crate) fn environment(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Environment {
            path: path.into(),
            source,
        }
    }

    /// Container output worth showing alongside the failure, if any.
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            TestError::ExitCodeMismatch { stdout, stderr, .. } => Some((stdout, stderr)),
            TestError::Backend(BackendError::Timeout { stdout, stderr, .. }) => Some((stdout, stderr)),
            _ => None,
        }
    }
}
