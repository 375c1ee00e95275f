//! Instance lifecycle status

use std::fmt;

use serde::Serialize;

/// Lifecycle status of an instance
///
/// `Created -> Running -> Stopped -> Running ...`; a failed start or restart
/// moves the instance to `Error`, from which it can be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Built, never started
    Created,
    /// Accepting connections
    Running,
    /// Stopped by request
    Stopped,
    /// Last start or restart failed
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(Status::Running.to_string(), "running");
        assert_eq!(serde_json::to_string(&Status::Error).unwrap(), "\"error\"");
    }
}
