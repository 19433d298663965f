use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle stage of a managed machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    /// Provisioned and waiting for work.
    Idle,
    /// Pre-claimed by a worker, not yet bound to a job.
    Acquired,
    /// Being provisioned by the external tool.
    Creating,
    /// Running a job.
    Used,
    /// Scheduled for destruction. Terminal.
    Removing,
}

impl MachineState {
    pub fn as_str(self) -> &'static str {
        match self {
            MachineState::Idle => "Idle",
            MachineState::Acquired => "Acquired",
            MachineState::Creating => "Creating",
            MachineState::Used => "Used",
            MachineState::Removing => "Removing",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(MachineState::Idle.to_string(), "Idle");
        assert_eq!(MachineState::Removing.to_string(), "Removing");
        assert_eq!(
            serde_yaml::to_string(&MachineState::Creating).unwrap().trim(),
            "Creating"
        );
    }
}
