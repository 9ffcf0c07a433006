use std::path::{Path, PathBuf};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of an analysis run, one variant per stage that can fail.
#[derive(Debug, Error)]
pub enum AbError {
    #[error("could not read input '{}': {source}", path.display())]
    InputRead {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("data contract violation: {0}")]
    DataContractViolation(String),

    #[error("invalid model specification: {0}")]
    InvalidModel(String),

    #[error("invalid sampler configuration: {0}")]
    InvalidConfig(String),

    #[error("sampling failed: {0}")]
    SamplingFailure(String),

    #[error("could not write output '{}': {source}", path.display())]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

impl AbError {
    pub fn input_read<E>(path: &Path, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        AbError::InputRead {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }

    pub fn output_write<E>(path: &Path, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        AbError::OutputWrite {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }

    pub fn contract(msg: impl Into<String>) -> Self {
        AbError::DataContractViolation(msg.into())
    }

    /// Prefix a contract violation with the input line it came from.
    pub fn at_line(self, line: u64) -> Self {
        match self {
            AbError::DataContractViolation(msg) => {
                AbError::DataContractViolation(format!("line {}: {}", line, msg))
            }
            other => other,
        }
    }

    /// Short name of the pipeline stage the error belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            AbError::InputRead { .. } => "input",
            AbError::DataContractViolation(_) => "validation",
            AbError::InvalidModel(_) => "model",
            AbError::InvalidConfig(_) => "configuration",
            AbError::SamplingFailure(_) => "sampling",
            AbError::OutputWrite { .. } => "output",
        }
    }
}

pub type Result<T, E = AbError> = std::result::Result<T, E>;
