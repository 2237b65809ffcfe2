//! Job supervision: the state machine that owns pipeline and link.
//!
//! The supervisor runs on its own thread, consumes operator commands,
//! translates them into pipeline signals, forwards progress and failure
//! events, and guarantees that every terminal state leaves the hardware
//! quiet: laser off, scanner shut down, device refcount back to zero. State
//! transitions are totally ordered because only this thread performs them.

mod command;
mod events;
mod state;
mod supervisor;

pub use command::OperatorCommand;
pub use events::{FailureKind, JobEvent};
pub use state::JobState;
pub use supervisor::{Supervisor, SupervisorDeps, SupervisorHandle};
