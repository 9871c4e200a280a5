//! Container transition table.
//!
//! Maps a container's (known, desired) status pair to the next thing the
//! manager has to do. The table is pure; gating on dependencies, in-flight
//! operations and retry timers happens in the engine.

use crate::task::status::ContainerStatus;
use std::fmt;

/// Runtime operation that moves a container one step along its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeAction {
    Pull,
    Create,
    Start,
    Stop,
    Remove,
}

impl RuntimeAction {
    /// Status the container reaches when the operation succeeds
    pub fn target(self) -> ContainerStatus {
        match self {
            RuntimeAction::Pull => ContainerStatus::Pulled,
            RuntimeAction::Create => ContainerStatus::Created,
            RuntimeAction::Start => ContainerStatus::Running,
            RuntimeAction::Stop => ContainerStatus::Stopped,
            RuntimeAction::Remove => ContainerStatus::Removed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeAction::Pull => "pull",
            RuntimeAction::Create => "create",
            RuntimeAction::Start => "start",
            RuntimeAction::Stop => "stop",
            RuntimeAction::Remove => "remove",
        }
    }
}

impl fmt::Display for RuntimeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the transition lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Invoke the runtime
    Apply(RuntimeAction),
    /// Container never got a process; record STOPPED without a runtime call
    MarkStopped,
    /// Known status already satisfies the desired status
    Satisfied,
}

/// Next step for a container, given its known and desired statuses.
pub fn next_step(known: ContainerStatus, desired: ContainerStatus) -> Step {
    use ContainerStatus::*;

    if desired == Removed {
        return match known {
            Removed => Step::Satisfied,
            Stopped => Step::Apply(RuntimeAction::Remove),
            Created | Running => Step::Apply(RuntimeAction::Stop),
            None | Pulled => Step::MarkStopped,
        };
    }

    if known >= desired {
        return Step::Satisfied;
    }

    if desired == Stopped {
        return match known {
            Created | Running => Step::Apply(RuntimeAction::Stop),
            _ => Step::MarkStopped,
        };
    }

    match known {
        None => Step::Apply(RuntimeAction::Pull),
        Pulled => Step::Apply(RuntimeAction::Create),
        Created => Step::Apply(RuntimeAction::Start),
        // known < desired <= Running leaves nothing else
        Running | Stopped | Removed => Step::Satisfied,
    }
}
