use nodeward_exec::{FactsError, PackageError, PrivilegeError};
use thiserror::Error;

/// Failure of a plugin command.
///
/// Anything except [`PluginError::NotDefined`] maps to the "error running
/// command" exit code.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("command not defined ({0})")]
    NotDefined(String),

    #[error("missing required argument '{0}'")]
    MissingArgument(&'static str),

    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("invalid argument payload: {0}")]
    Payload(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Facts(#[from] FactsError),

    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    #[error("serializing result: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PluginError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}
