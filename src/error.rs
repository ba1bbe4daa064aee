//! Error kinds reported by the sandbox engine

use thiserror::Error;

use crate::container::Role;
use crate::runtime::RuntimeError;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The OS entropy source failed; the session must not start
    #[error("random source unavailable: {0}")]
    RandomSource(String),

    /// Truncated or inconsistent archive data, or an invalid entry name
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    #[error("container runtime unavailable: {context}")]
    RuntimeUnavailable {
        context: String,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to create {role} container")]
    ContainerCreation {
        role: Role,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to upload archive to {container}:{path}")]
    ArchiveUpload {
        container: String,
        path: String,
        #[source]
        source: RuntimeError,
    },

    #[error("no address for container {container} on network {network}: {reason}")]
    AddressResolution {
        network: String,
        container: String,
        reason: String,
    },

    /// `line` is 1-based and only set for line-oriented files
    #[error("failed to parse {file}{}: {reason}", line_suffix(.line))]
    ResultParse {
        file: String,
        line: Option<usize>,
        reason: String,
    },

    #[error("invalid sandbox request: {0}")]
    InvalidRequest(String),

    #[error("sandbox session cancelled")]
    Cancelled,
}

fn line_suffix(line: &Option<usize>) -> String {
    line.map(|l| format!(" line {}", l)).unwrap_or_default()
}

impl SandboxError {
    pub(crate) fn runtime(context: impl Into<String>, source: RuntimeError) -> Self {
        SandboxError::RuntimeUnavailable {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn parse(file: &str, line: Option<usize>, reason: impl ToString) -> Self {
        SandboxError::ResultParse {
            file: file.to_string(),
            line,
            reason: reason.to_string(),
        }
    }
}
