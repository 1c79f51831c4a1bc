//! Session state machine.

/// Lifecycle of one remote command session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No operation has started yet.
    #[default]
    Idle,
    /// Dialing the transport and opening the command channel.
    Connecting,
    /// The remote command is running.
    Running,
    /// The remote command exited successfully.
    Completed,
    /// Connecting, opening the channel or the command itself failed.
    Failed,
    /// Cancelled by a stop request.
    Stopped,
}

impl SessionState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Idle -> Connecting
    /// - Connecting -> Running | Failed | Stopped
    /// - Running -> Completed | Failed | Stopped
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, target),
            (Idle, Connecting)
                | (Connecting, Running)
                | (Connecting, Failed)
                | (Connecting, Stopped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
        )
    }

    /// Attempt to transition to a new state.
    ///
    /// Returns `Ok(())` if the transition is valid, or an error otherwise.
    pub fn transition_to(&mut self, target: SessionState) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(crate::error::KataTunnelError::InvalidStateTransition {
                from: *self,
                to: target,
            })
        }
    }

    /// Check if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Stopped
        )
    }

    /// Whether a stop request has anything to cancel.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Running)
    }
}
