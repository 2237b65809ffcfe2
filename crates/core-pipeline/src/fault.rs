//! Terminal fault taxonomy for a running job.

use core_geometry::EncodeError;
use core_link::LinkError;
use core_scanner::ScanError;
use thiserror::Error;

/// Which named ceiling was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The PLC never reported the surface prepared.
    Prep,
    /// Streaming one layer's commands exceeded the execution ceiling.
    Exec,
    /// The card never went idle after execute.
    Idle,
    /// Orderly shutdown overran its ceiling (warning, not fatal).
    Shutdown,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeoutKind::Prep => "PrepTimeout",
            TimeoutKind::Exec => "ExecTimeout",
            TimeoutKind::Idle => "IdleTimeout",
            TimeoutKind::Shutdown => "ShutdownTimeout",
        };
        f.write_str(name)
    }
}

/// Why a job died. Produced by producer or consumer, consumed by the
/// supervisor, which decides the terminal state and the operator message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineFault {
    #[error("configuration error: {detail}")]
    Config { detail: String },
    #[error("machine link lost")]
    Disconnected,
    #[error("scanner hardware error {code} during {op}")]
    Hardware { code: i32, op: &'static str },
    #[error("{what} exceeded")]
    Timeout { what: TimeoutKind },
    #[error("scanner used from a non-owner thread")]
    WrongThread,
    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl From<ScanError> for PipelineFault {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::WrongThread => PipelineFault::WrongThread,
            ScanError::Overflow => PipelineFault::Hardware {
                code: core_device::codes::LIST_OVERFLOW,
                op: "queue command",
            },
            ScanError::Hardware { code, op } => PipelineFault::Hardware { code, op },
            ScanError::Timeout { .. } => PipelineFault::Timeout {
                what: TimeoutKind::Idle,
            },
            ScanError::NotInitialised
            | ScanError::AlreadyInitialised
            | ScanError::BadState { .. } => PipelineFault::Internal {
                detail: e.to_string(),
            },
        }
    }
}

impl From<LinkError> for PipelineFault {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Disconnected => PipelineFault::Disconnected,
            other => PipelineFault::Config {
                detail: other.to_string(),
            },
        }
    }
}

impl From<EncodeError> for PipelineFault {
    fn from(e: EncodeError) -> Self {
        PipelineFault::Config {
            detail: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_timeouts_map_to_idle() {
        let fault: PipelineFault = ScanError::Timeout { what: "list idle" }.into();
        assert_eq!(
            fault,
            PipelineFault::Timeout {
                what: TimeoutKind::Idle
            }
        );
    }

    #[test]
    fn wrong_thread_is_preserved() {
        let fault: PipelineFault = ScanError::WrongThread.into();
        assert_eq!(fault, PipelineFault::WrongThread);
    }

    #[test]
    fn link_loss_maps_to_disconnected() {
        let fault: PipelineFault = LinkError::Disconnected.into();
        assert_eq!(fault, PipelineFault::Disconnected);
    }

    #[test]
    fn timeout_kinds_render_their_spec_names() {
        assert_eq!(TimeoutKind::Prep.to_string(), "PrepTimeout");
        assert_eq!(TimeoutKind::Shutdown.to_string(), "ShutdownTimeout");
    }
}
