use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures reported by the external provisioning tool.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The tool binary could not be started.
    #[error("Failed to spawn '{executable}' for {operation}: {source}")]
    Spawn {
        executable: String,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran but exited unsuccessfully.
    #[error("{operation} of machine '{name}' failed: {detail}")]
    CommandFailed {
        operation: &'static str,
        name: String,
        detail: String,
    },

    #[error("{operation} of machine '{name}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        name: String,
        timeout: Duration,
    },

    #[error("{operation} of machine '{name}' returned no output")]
    EmptyOutput { operation: &'static str, name: String },

    /// Connectivity check failed; credentials are never handed out in this case.
    #[error("Can't connect to machine '{name}'")]
    CannotConnect { name: String },

    #[error("Failed to list machines in {}: {source}", path.display())]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for provisioning tool calls
pub type ToolResult<T> = Result<T, ToolError>;

/// Errors surfaced by the machine pool to job-dispatch workers
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Missing Machine options")]
    MissingMachineOptions,

    #[error("Couldn't load machine names: {0}")]
    ListMachines(#[source] ToolError),

    /// Capacity exhausted: callers should back off and retry.
    #[error("No free idle machines that can process builds")]
    NoFreeMachines,

    #[error("Couldn't create machine '{name}': {source}")]
    CreationFailed {
        name: String,
        #[source]
        source: ToolError,
    },

    #[error("Couldn't find free or create a new machine: {0}")]
    FindOrCreate(#[source] Box<PoolError>),

    #[error("Couldn't get credentials for machine '{name}': {source}")]
    Credentials {
        name: String,
        #[source]
        source: ToolError,
    },

    #[error("Machine '{0}' not found")]
    MachineNotFound(String),

    #[error("Machine creation of '{0}' was abandoned before completing")]
    CreationAbandoned(String),

    #[error("Machine pool is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    /// Whether this error only means "no capacity right now".
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, PoolError::NoFreeMachines)
    }

    pub fn is_shutting_down(&self) -> bool {
        match self {
            PoolError::ShuttingDown => true,
            PoolError::FindOrCreate(inner) => inner.is_shutting_down(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::ConfigurationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for PoolError {
    fn from(err: serde_yaml::Error) -> Self {
        PoolError::ConfigurationError(format!("Failed to parse config: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PoolError::CreationFailed {
            name: "runner-abc-machine-1".to_string(),
            source: ToolError::CommandFailed {
                operation: "create",
                name: "runner-abc-machine-1".to_string(),
                detail: "exit status: 1".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "Couldn't create machine 'runner-abc-machine-1': create of machine 'runner-abc-machine-1' failed: exit status: 1"
        );
    }

    #[test]
    fn test_capacity_classification() {
        assert!(PoolError::NoFreeMachines.is_capacity_exhausted());
        assert!(!PoolError::MissingMachineOptions.is_capacity_exhausted());

        let wrapped = PoolError::FindOrCreate(Box::new(PoolError::ShuttingDown));
        assert!(wrapped.is_shutting_down());
        assert!(!wrapped.is_capacity_exhausted());
    }
}
