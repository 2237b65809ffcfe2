//! Operator-visible event stream.

use core_pipeline::{PipelineFault, TimeoutKind};

/// Failure categories surfaced to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Config,
    Disconnected,
    Hardware,
    Timeout(TimeoutKind),
    WrongThread,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Config => f.write_str("Config"),
            FailureKind::Disconnected => f.write_str("Disconnected"),
            FailureKind::Hardware => f.write_str("Hardware"),
            FailureKind::Timeout(kind) => write!(f, "Timeout({kind})"),
            FailureKind::WrongThread => f.write_str("WrongThread"),
            FailureKind::Internal => f.write_str("Internal"),
        }
    }
}

impl From<&PipelineFault> for FailureKind {
    fn from(fault: &PipelineFault) -> Self {
        match fault {
            PipelineFault::Config { .. } => FailureKind::Config,
            PipelineFault::Disconnected => FailureKind::Disconnected,
            PipelineFault::Hardware { .. } => FailureKind::Hardware,
            PipelineFault::Timeout { what } => FailureKind::Timeout(*what),
            PipelineFault::WrongThread => FailureKind::WrongThread,
            PipelineFault::Internal { .. } => FailureKind::Internal,
        }
    }
}

/// Everything the operator UI consumes. `Finished`, `Stopped`,
/// `EmergencyStopped` and `Failed` are terminal for one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Status(String),
    Progress { current: u32, total: u32 },
    LayerCompleted { index: u32 },
    ConnectionLost,
    Finished,
    Stopped,
    EmergencyStopped,
    Failed { kind: FailureKind, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kinds_from_faults() {
        assert_eq!(
            FailureKind::from(&PipelineFault::Disconnected),
            FailureKind::Disconnected
        );
        assert_eq!(
            FailureKind::from(&PipelineFault::Timeout {
                what: TimeoutKind::Prep
            }),
            FailureKind::Timeout(TimeoutKind::Prep)
        );
    }

    #[test]
    fn timeout_kind_renders_inside_failure() {
        let kind = FailureKind::Timeout(TimeoutKind::Idle);
        assert_eq!(kind.to_string(), "Timeout(IdleTimeout)");
    }
}
