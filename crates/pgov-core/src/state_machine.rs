use crate::error::StateMachineError;
use crate::types::PipelineState;

/// Validates a state transition.
///
/// Stages advance one step in fixed order; any stage may end in Rejected or
/// Terminated; terminal states have no exits.
pub fn validate_transition(from: PipelineState, to: PipelineState) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

pub fn allowed_transitions(from: PipelineState) -> Vec<PipelineState> {
    use PipelineState::*;
    match from {
        Ideator => vec![Drafter, Rejected, Terminated],
        Drafter => vec![Critic, Rejected, Terminated],
        Critic => vec![Revisor, Rejected, Terminated],
        Revisor => vec![Summarizer, Rejected, Terminated],
        Summarizer => vec![Completed, Rejected, Terminated],
        Completed => vec![],
        Rejected => vec![],
        Terminated => vec![],
    }
}

fn allowed(from: PipelineState, to: PipelineState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_state() -> impl Strategy<Value = PipelineState> {
        prop_oneof![
            Just(PipelineState::Ideator),
            Just(PipelineState::Drafter),
            Just(PipelineState::Critic),
            Just(PipelineState::Revisor),
            Just(PipelineState::Summarizer),
            Just(PipelineState::Completed),
            Just(PipelineState::Rejected),
            Just(PipelineState::Terminated),
        ]
    }

    #[test]
    fn happy_path_is_linear() {
        let path = [
            PipelineState::Ideator,
            PipelineState::Drafter,
            PipelineState::Critic,
            PipelineState::Revisor,
            PipelineState::Summarizer,
            PipelineState::Completed,
        ];
        for pair in path.windows(2) {
            validate_transition(pair[0], pair[1]).unwrap();
        }
    }

    #[test]
    fn critic_cannot_skip_to_summarizer() {
        assert!(validate_transition(PipelineState::Critic, PipelineState::Summarizer).is_err());
        assert!(validate_transition(PipelineState::Critic, PipelineState::Completed).is_err());
    }

    proptest! {
        #[test]
        fn terminal_states_have_no_exits(from in any_state(), to in any_state()) {
            if from.is_terminal() {
                prop_assert!(validate_transition(from, to).is_err());
            }
        }

        #[test]
        fn transitions_never_go_backwards(from in any_state(), to in any_state()) {
            if validate_transition(from, to).is_ok() {
                prop_assert!(to > from);
            }
        }

        #[test]
        fn no_state_is_reentered(from in any_state()) {
            prop_assert!(validate_transition(from, from).is_err());
        }
    }
}
