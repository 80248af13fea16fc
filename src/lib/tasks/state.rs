use super::types::TaskState;

/// Task states only move forward: pending -> running -> success | error.
pub fn valid_state_transition(src: &TaskState, dst: &TaskState) -> bool {
    match src {
        TaskState::Pending => matches!(dst, TaskState::Running),
        TaskState::Running => matches!(dst, TaskState::Success | TaskState::Error),
        TaskState::Success | TaskState::Error => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskState::*;

    #[test]
    fn forward_transitions_are_valid() {
        assert!(valid_state_transition(&Pending, &Running));
        assert!(valid_state_transition(&Running, &Success));
        assert!(valid_state_transition(&Running, &Error));
    }

    #[test]
    fn terminal_states_are_immutable() {
        for terminal in [Success, Error] {
            for dst in [Pending, Running, Success, Error] {
                assert!(!valid_state_transition(&terminal, &dst));
            }
        }
    }

    #[test]
    fn backward_and_skip_transitions_are_rejected() {
        assert!(!valid_state_transition(&Running, &Pending));
        assert!(!valid_state_transition(&Pending, &Success));
        assert!(!valid_state_transition(&Pending, &Error));
    }
}
