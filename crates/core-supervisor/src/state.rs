//! The job state machine.

/// Lifecycle of one job. Transitions are performed only by the supervisor
/// thread, so observers always see a consistent, totally ordered sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    EmergencyStopped,
    Failed,
}

impl JobState {
    /// A fresh `start` is accepted from these states.
    pub fn accepts_start(self) -> bool {
        matches!(
            self,
            JobState::Idle | JobState::Stopped | JobState::EmergencyStopped | JobState::Failed
        )
    }

    /// No further transitions happen without a new `start`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Stopped | JobState::EmergencyStopped | JobState::Failed
        )
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Starting | JobState::Running | JobState::Paused | JobState::Stopping
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Stopping => "stopping",
            JobState::Stopped => "stopped",
            JobState::EmergencyStopped => "emergency-stopped",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_start() {
        for state in [JobState::Stopped, JobState::EmergencyStopped, JobState::Failed] {
            assert!(state.is_terminal());
            assert!(state.accepts_start());
        }
    }

    #[test]
    fn active_states_reject_start() {
        for state in [
            JobState::Starting,
            JobState::Running,
            JobState::Paused,
            JobState::Stopping,
        ] {
            assert!(state.is_active());
            assert!(!state.accepts_start());
        }
    }
}
