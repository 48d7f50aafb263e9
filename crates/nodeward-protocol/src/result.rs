//! Execution result triple.

use serde::{Deserialize, Serialize};

/// Exit code reserved for failures inside the agent before or while launching.
pub const EXIT_LAUNCH_FAILURE: i32 = 255;

/// Exit code reported when a run was killed after exceeding its timeout.
pub const EXIT_TIMEOUT: i32 = 124;

/// "Changes were applied" status of convergence tools (`--detailed-exitcodes`).
pub const EXIT_CONVERGE_CHANGED: i32 = 2;

/// Outcome of one process run.
///
/// Serialized as `{"out": .., "stdout": .., "stderr": ..}`, which is what
/// plugin handlers hand back to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Process exit code.
    #[serde(rename = "out")]
    pub code: i32,
    /// Captured standard output, ANSI color codes removed.
    pub stdout: String,
    /// Captured standard error, ANSI color codes removed.
    pub stderr: String,
}

impl ExecutionResult {
    pub fn new(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Result for a process that could not be started at all.
    pub fn launch_failure(reason: impl std::fmt::Display) -> Self {
        Self::new(EXIT_LAUNCH_FAILURE, String::new(), reason.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Treat a convergence tool's "changes applied" status as success.
    ///
    /// Any other code is passed through unchanged.
    pub fn converged(mut self) -> Self {
        if self.code == EXIT_CONVERGE_CHANGED {
            self.code = 0;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let result = ExecutionResult::new(0, "hello\n", "");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, json!({"out": 0, "stdout": "hello\n", "stderr": ""}));
    }

    #[test]
    fn test_launch_failure() {
        let result = ExecutionResult::launch_failure("No such file or directory");
        assert_eq!(result.code, EXIT_LAUNCH_FAILURE);
        assert!(result.stdout.is_empty());
        assert_eq!(result.stderr, "No such file or directory");
    }

    #[test]
    fn test_converged_remaps_only_two() {
        assert_eq!(ExecutionResult::new(2, "", "").converged().code, 0);
        assert_eq!(ExecutionResult::new(0, "", "").converged().code, 0);
        assert_eq!(ExecutionResult::new(1, "", "").converged().code, 1);
        assert_eq!(ExecutionResult::new(4, "", "").converged().code, 4);
        assert_eq!(ExecutionResult::new(6, "", "").converged().code, 6);
    }
}
