//! Autoscaling pool of docker-machine hosts for CI job executors.

pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod naming;
pub mod provider;
pub mod record;
pub mod registry;
pub mod state;
pub mod testing;
pub mod tracing;

pub use command::{DockerMachineCommand, MachineCommand};
pub use config::{Config, JobConfig, RunnerConfig};
pub use error::{PoolError, PoolResult, ToolError, ToolResult};
pub use provider::{MachineLease, MachinePoolManager};
pub use state::MachineState;
