use haven_store::sessions::SessionState;

/// What happened to a chat, as seen by the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionTrigger {
    /// The deduplicator accepted a new update for the chat.
    UpdateAccepted,
    /// The scheduler's tick found the inactivity window elapsed.
    InactivityElapsed,
    /// The scheduler's tick found the dormancy window elapsed.
    DormancyElapsed,
    /// An explicit close request (user command or operator).
    CloseRequested,
}

impl std::fmt::Display for SessionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpdateAccepted => f.write_str("update_accepted"),
            Self::InactivityElapsed => f.write_str("inactivity_elapsed"),
            Self::DormancyElapsed => f.write_str("dormancy_elapsed"),
            Self::CloseRequested => f.write_str("close_requested"),
        }
    }
}

/// A trigger that does not apply to the current state. This is a
/// scheduler or logic defect, not a user error; callers log it and leave
/// the session untouched.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("no transition from {state} on {trigger}")]
pub struct InvalidTransition {
    pub state: SessionState,
    pub trigger: SessionTrigger,
}

/// The session lifecycle as a total function over recognized
/// (state, trigger) pairs. Closed is terminal: a closed session never
/// reopens; a later accepted update allocates a fresh session instead.
pub fn transition(
    state: SessionState,
    trigger: SessionTrigger,
) -> Result<SessionState, InvalidTransition> {
    use SessionState::*;
    use SessionTrigger::*;

    match (state, trigger) {
        (Active, UpdateAccepted) => Ok(Active),
        (Idle, UpdateAccepted) => Ok(Active),
        (Active, InactivityElapsed) => Ok(Idle),
        // Timer refire while already idle is a recognized no-op.
        (Idle, InactivityElapsed) => Ok(Idle),
        (Active | Idle, DormancyElapsed) => Ok(Closed),
        (Active | Idle, CloseRequested) => Ok(Closed),
        (Closed, trigger) => Err(InvalidTransition { state, trigger }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;
    use SessionTrigger::*;

    #[test]
    fn active_stays_active_on_update() {
        assert_eq!(transition(Active, UpdateAccepted).unwrap(), Active);
    }

    #[test]
    fn idle_reactivates_on_update() {
        assert_eq!(transition(Idle, UpdateAccepted).unwrap(), Active);
    }

    #[test]
    fn active_idles_on_inactivity() {
        assert_eq!(transition(Active, InactivityElapsed).unwrap(), Idle);
    }

    #[test]
    fn idle_timer_refire_is_noop() {
        assert_eq!(transition(Idle, InactivityElapsed).unwrap(), Idle);
    }

    #[test]
    fn dormancy_closes_from_either_open_state() {
        assert_eq!(transition(Active, DormancyElapsed).unwrap(), Closed);
        assert_eq!(transition(Idle, DormancyElapsed).unwrap(), Closed);
    }

    #[test]
    fn close_request_closes_from_either_open_state() {
        assert_eq!(transition(Active, CloseRequested).unwrap(), Closed);
        assert_eq!(transition(Idle, CloseRequested).unwrap(), Closed);
    }

    #[test]
    fn closed_is_terminal() {
        for trigger in [UpdateAccepted, InactivityElapsed, DormancyElapsed, CloseRequested] {
            let err = transition(Closed, trigger).unwrap_err();
            assert_eq!(err.state, Closed);
            assert_eq!(err.trigger, trigger);
        }
    }

    #[test]
    fn invalid_transition_message_names_both_parts() {
        let err = transition(Closed, UpdateAccepted).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("closed"), "got: {msg}");
        assert!(msg.contains("update_accepted"), "got: {msg}");
    }
}
